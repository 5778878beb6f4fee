//! spool-testkit: shared fixtures for testing the tracing stack.
//!
//! The star of the show is [`FakeChunk`], a builder that fabricates chunk
//! payloads byte-for-byte the way a writer would (varint-prefixed packets
//! with a recognizable content pattern) so log-buffer tests can assert on
//! exact sizes and contents without running a real producer.

pub mod doubles;
pub mod fake;

pub use doubles::{CollectSink, ConsumerEvent, ProducerEvent, TestConsumer, TestProducer};
pub use fake::{fake_packet_bytes, read_packet, FakeChunk, FakePacketFragment};
