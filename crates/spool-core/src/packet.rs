//! Reassembled trace packets as delivered to consumers.

/// One trace packet, possibly reassembled from several chunk fragments.
///
/// The slices are kept separate to preserve the zero-copy read path inside
/// the service; a packet only becomes owned bytes at the consumer boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracePacket {
    pub slices: Vec<Vec<u8>>,
}

impl TracePacket {
    pub fn from_slices<'a>(slices: impl IntoIterator<Item = &'a [u8]>) -> Self {
        Self {
            slices: slices.into_iter().map(<[u8]>::to_vec).collect(),
        }
    }

    /// Total payload size in bytes.
    pub fn len(&self) -> usize {
        self.slices.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joins the fragments into one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for slice in &self.slices {
            out.extend_from_slice(slice);
        }
        out
    }
}
