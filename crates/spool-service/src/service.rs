//! The tracing service core.
//!
//! `TracingService` owns every endpoint and every session. Producers and
//! consumers never hold references into the service; they hold numeric ids
//! and call back through it, and the service reaches them only through their
//! callback traits, always via a posted task so no callback ever runs under
//! the state lock.
//!
//! Session lifecycle:
//!
//! ```text
//!   (configure) Configured ──(enable)──▶ Enabling ──acks/deadline──▶ Enabled
//!                                                                     │  ▲
//!                                                   (flush pending) Flushing
//!                                                                     │
//!                                      (disable) Disabling ──drain──▶ Disabled
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use spool_core::config::{DataSourceConfig, DataSourceDescriptor, TraceConfig};
use spool_core::ids::{
    BufferId, ConsumerId, DataSourceId, DataSourceInstanceId, FlushId, ProducerId, SessionId,
};
use spool_core::{
    BufferStats, Consumer, Producer, ServiceError, TaskRunner, TimerReason, TracePacket,
    TraceStats, Watchdog,
};
use spool_shm::{
    ChunkState, CommitBatch, CommitSink, Doorbell, PatchRequest, SharedMemory, SharedMemoryAbi,
    SharedMemoryFactory, DEFAULT_PAGE_SIZE, DEFAULT_SHM_SIZE,
};

use crate::log_buffer::{LogBuffer, PATCH_LEN, RECORD_ALIGNMENT, RECORD_HEADER_SIZE};

/// How long Enabling waits for start acks before promoting anyway.
const START_DEADLINE: Duration = Duration::from_secs(5);

/// How long Disabling waits for stop acks before forcing Disabled.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Upper bound on one `read_buffers` packet batch.
const MAX_READ_BATCH_BYTES: usize = 64 * 1024;

/// Ceiling on one buffer drain before the watchdog calls it a wedge.
const READ_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configured,
    Enabling,
    Enabled,
    Flushing,
    Disabling,
    Disabled,
}

/// Everything a producer needs to drive its side of the shared memory: the
/// in-process analogue of the InitializeConnection response, with the mapped
/// region standing in for an fd.
pub struct ProducerConnection {
    pub producer_id: ProducerId,
    pub shmem: Arc<dyn SharedMemory>,
    pub page_size: usize,
    pub doorbell: Arc<Doorbell>,
    pub sink: Arc<dyn CommitSink>,
}

struct RegisteredDataSource {
    producer_id: ProducerId,
    data_source_id: DataSourceId,
    descriptor: DataSourceDescriptor,
}

struct ProducerEntry {
    producer: Arc<dyn Producer>,
    name: String,
    /// Keeps the mapping alive while ABI views over it exist.
    _shmem: Arc<dyn SharedMemory>,
    abi: SharedMemoryAbi,
    doorbell: Arc<Doorbell>,
}

struct ConsumerEntry {
    consumer: Arc<dyn Consumer>,
    session: Option<SessionId>,
}

struct DataSourceInstance {
    instance_id: DataSourceInstanceId,
    producer_id: ProducerId,
    will_notify_on_stop: bool,
}

struct PendingFlush {
    pending_producers: HashSet<ProducerId>,
    /// Set when the deadline expired or a producer vanished mid-flush.
    partial: bool,
}

struct Session {
    id: SessionId,
    consumer: ConsumerId,
    state: SessionState,
    config: TraceConfig,
    /// Global ids of this session's buffers, in config order.
    buffers: Vec<BufferId>,
    instances: Vec<DataSourceInstance>,
    pending_start_acks: HashSet<DataSourceInstanceId>,
    pending_stop_acks: HashSet<DataSourceInstanceId>,
    pending_flushes: HashMap<FlushId, PendingFlush>,
}

impl Session {
    fn overlay_state(&self) -> SessionState {
        if self.state == SessionState::Enabled && !self.pending_flushes.is_empty() {
            SessionState::Flushing
        } else {
            self.state
        }
    }
}

#[derive(Default)]
struct ServiceState {
    last_producer_id: ProducerId,
    last_consumer_id: ConsumerId,
    last_session_id: SessionId,
    last_data_source_id: DataSourceId,
    last_instance_id: DataSourceInstanceId,
    last_flush_id: FlushId,
    last_buffer_id: BufferId,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    sessions: HashMap<SessionId, Session>,
    data_sources: Vec<RegisteredDataSource>,
    /// Stable id → buffer table shared by every session, so the
    /// target-buffer field of a chunk header resolves without knowing which
    /// session the chunk belongs to.
    buffers: HashMap<BufferId, LogBuffer>,
    stats: TraceStats,
}

struct Inner {
    state: Mutex<ServiceState>,
    runner: TaskRunner,
    watchdog: Watchdog,
    shm_factory: Box<dyn SharedMemoryFactory>,
}

/// Handle to the service. Clones share one instance.
#[derive(Clone)]
pub struct TracingService {
    inner: Arc<Inner>,
}

/// Per-producer commit sink handed out by `connect_producer`.
struct ProducerCommitSink {
    service: TracingService,
    producer_id: ProducerId,
}

impl CommitSink for ProducerCommitSink {
    fn commit(&self, batch: CommitBatch) {
        let service = self.service.clone();
        let producer_id = self.producer_id;
        // Hop onto the service runner: arbiters call this from writer
        // threads.
        self.service.inner.runner.post(move || {
            service.notify_shared_memory_update(producer_id, batch);
        });
    }
}

impl TracingService {
    pub fn new(shm_factory: Box<dyn SharedMemoryFactory>, runner: TaskRunner) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ServiceState::default()),
                runner,
                watchdog: Watchdog::new(),
                shm_factory,
            }),
        }
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.inner.watchdog
    }

    pub fn stats(&self) -> TraceStats {
        self.inner.state.lock().stats
    }

    // -------------------------------------------------------------------
    // Producer endpoint
    // -------------------------------------------------------------------

    pub fn connect_producer(
        &self,
        producer: Arc<dyn Producer>,
        name: &str,
        shm_size_hint: usize,
    ) -> Result<ProducerConnection, ServiceError> {
        let page_size = DEFAULT_PAGE_SIZE;
        let size = effective_shm_size(shm_size_hint, page_size);
        let shmem = self.inner.shm_factory.create_region(size);
        // SAFETY: the region Arc is stored in the producer entry and cloned
        // into the connection; it outlives both ABI views built over it.
        let abi = unsafe { SharedMemoryAbi::from_raw(shmem.as_ptr(), shmem.size(), page_size) }
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        let doorbell = Arc::new(Doorbell::new());

        let producer_id = {
            let mut state = self.inner.state.lock();
            state.last_producer_id = state.last_producer_id.wrapping_add(1).max(1);
            let producer_id = state.last_producer_id;
            state.producers.insert(
                producer_id,
                ProducerEntry {
                    producer: producer.clone(),
                    name: name.to_string(),
                    _shmem: shmem.clone(),
                    abi,
                    doorbell: doorbell.clone(),
                },
            );
            state.stats.producers_connected += 1;
            state.stats.producers_seen += 1;
            producer_id
        };

        tracing::debug!(producer_id, name, size, "producer connected");
        self.inner.runner.post(move || producer.on_connect());
        Ok(ProducerConnection {
            producer_id,
            shmem,
            page_size,
            doorbell,
            sink: Arc::new(ProducerCommitSink {
                service: self.clone(),
                producer_id,
            }),
        })
    }

    /// Tears down a producer: its registrations and session instances go
    /// away immediately; sessions it participated in stay up.
    pub fn disconnect_producer(&self, producer_id: ProducerId) {
        let mut completed_flushes = Vec::new();
        let producer = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.producers.remove(&producer_id) else {
                return;
            };
            state.stats.producers_connected = state.stats.producers_connected.saturating_sub(1);
            state.data_sources.retain(|ds| ds.producer_id != producer_id);

            for session in state.sessions.values_mut() {
                let removed: Vec<DataSourceInstanceId> = session
                    .instances
                    .iter()
                    .filter(|i| i.producer_id == producer_id)
                    .map(|i| i.instance_id)
                    .collect();
                session.instances.retain(|i| i.producer_id != producer_id);
                for id in &removed {
                    session.pending_start_acks.remove(id);
                    session.pending_stop_acks.remove(id);
                }
                for (&flush_id, flush) in session.pending_flushes.iter_mut() {
                    if flush.pending_producers.remove(&producer_id) {
                        flush.partial = true;
                        if flush.pending_producers.is_empty() {
                            completed_flushes.push((session.id, flush_id));
                        }
                    }
                }
            }
            entry.producer
        };
        for (session_id, flush_id) in completed_flushes {
            self.finish_flush(session_id, flush_id);
        }
        self.maybe_finish_lifecycle_transitions();
        self.inner.runner.post(move || producer.on_disconnect());
        tracing::debug!(producer_id, "producer disconnected");
    }

    pub fn register_data_source(
        &self,
        producer_id: ProducerId,
        descriptor: DataSourceDescriptor,
    ) -> Result<DataSourceId, ServiceError> {
        let mut state = self.inner.state.lock();
        if !state.producers.contains_key(&producer_id) {
            return Err(ServiceError::NoSuchProducer);
        }
        state.last_data_source_id += 1;
        let data_source_id = state.last_data_source_id;
        tracing::debug!(producer_id, name = %descriptor.name, data_source_id, "data source registered");
        state.data_sources.push(RegisteredDataSource {
            producer_id,
            data_source_id,
            descriptor,
        });
        state.stats.data_sources_registered += 1;
        Ok(data_source_id)
    }

    pub fn unregister_data_source(
        &self,
        producer_id: ProducerId,
        data_source_id: DataSourceId,
    ) -> Result<(), ServiceError> {
        let mut state = self.inner.state.lock();
        if !state.producers.contains_key(&producer_id) {
            return Err(ServiceError::NoSuchProducer);
        }
        state
            .data_sources
            .retain(|ds| !(ds.producer_id == producer_id && ds.data_source_id == data_source_id));
        Ok(())
    }

    /// Drains the pages a producer flagged as changed, moving every
    /// committed chunk into its target log buffer and freeing it in shared
    /// memory, then applies the batch's deferred patches.
    pub fn notify_shared_memory_update(&self, producer_id: ProducerId, batch: CommitBatch) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.producers.get(&producer_id) else {
            return;
        };
        let doorbell = entry.doorbell.clone();
        let mut freed_any = false;
        for &(page, mask) in &batch.pages {
            if page >= entry.abi.num_pages() {
                tracing::warn!(producer_id, page, "commit batch names a page out of range");
                continue;
            }
            for chunk_index in 0..16 {
                if mask & (1 << chunk_index) == 0 {
                    continue;
                }
                // The bitmap is a hint; the state word is the truth.
                if entry.abi.chunk_state(page, chunk_index) != Some(ChunkState::Complete) {
                    continue;
                }
                let chunk = match entry.abi.try_acquire_for_read(page, chunk_index) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::warn!(producer_id, page, chunk_index, %err, "chunk skipped");
                        continue;
                    }
                };
                let header = chunk.header();
                // SAFETY: the chunk is held in BeingRead; the producer
                // cannot touch the payload until it is released.
                let payload = unsafe { chunk.payload() };
                match state.buffers.get_mut(&header.target_buffer) {
                    Some(buffer) => {
                        buffer.copy_chunk_in(
                            producer_id,
                            header.writer_id,
                            header.chunk_id,
                            header.flags,
                            header.packet_count,
                            payload,
                        );
                        state.stats.chunks_committed += 1;
                    }
                    None => {
                        tracing::warn!(
                            producer_id,
                            target_buffer = header.target_buffer,
                            "chunk targets an unknown buffer, dropping"
                        );
                    }
                }
                if let Err(err) = entry.abi.release_chunk_as_free(page, chunk_index) {
                    tracing::warn!(producer_id, page, chunk_index, %err, "chunk release failed");
                }
                freed_any = true;
            }
        }
        for patch in &batch.patches {
            apply_patch(state, producer_id, patch);
        }
        if freed_any {
            doorbell.signal();
        }
    }

    pub fn notify_data_source_started(
        &self,
        producer_id: ProducerId,
        instance_id: DataSourceInstanceId,
    ) {
        let mut state = self.inner.state.lock();
        for session in state.sessions.values_mut() {
            if session
                .instances
                .iter()
                .any(|i| i.instance_id == instance_id && i.producer_id == producer_id)
            {
                // Late acks (after the start deadline) land here too and are
                // accepted silently.
                session.pending_start_acks.remove(&instance_id);
                if session.state == SessionState::Enabling && session.pending_start_acks.is_empty()
                {
                    session.state = SessionState::Enabled;
                    tracing::debug!(session_id = session.id, "session enabled (all start acks)");
                }
            }
        }
    }

    pub fn notify_data_source_stopped(
        &self,
        producer_id: ProducerId,
        instance_id: DataSourceInstanceId,
    ) {
        let mut finished = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for session in state.sessions.values_mut() {
                if session
                    .instances
                    .iter()
                    .any(|i| i.instance_id == instance_id && i.producer_id == producer_id)
                {
                    session.pending_stop_acks.remove(&instance_id);
                    if session.state == SessionState::Disabling
                        && session.pending_stop_acks.is_empty()
                    {
                        finished.push(session.id);
                    }
                }
            }
        }
        for session_id in finished {
            self.finish_disable(session_id);
        }
    }

    pub fn notify_flush_complete(&self, producer_id: ProducerId, flush_id: FlushId) {
        let finished = {
            let mut state = self.inner.state.lock();
            let mut finished = None;
            for session in state.sessions.values_mut() {
                if let Some(flush) = session.pending_flushes.get_mut(&flush_id) {
                    flush.pending_producers.remove(&producer_id);
                    if flush.pending_producers.is_empty() {
                        finished = Some(session.id);
                    }
                }
            }
            finished
        };
        if let Some(session_id) = finished {
            self.finish_flush(session_id, flush_id);
        }
    }

    // -------------------------------------------------------------------
    // Consumer endpoint
    // -------------------------------------------------------------------

    pub fn connect_consumer(&self, consumer: Arc<dyn Consumer>) -> ConsumerId {
        let consumer_id = {
            let mut state = self.inner.state.lock();
            state.last_consumer_id += 1;
            let consumer_id = state.last_consumer_id;
            state.consumers.insert(
                consumer_id,
                ConsumerEntry {
                    consumer: consumer.clone(),
                    session: None,
                },
            );
            consumer_id
        };
        self.inner.runner.post(move || consumer.on_connect());
        consumer_id
    }

    /// Consumer gone: its session is torn down with it.
    pub fn disconnect_consumer(&self, consumer_id: ConsumerId) {
        let session_id = {
            let mut state = self.inner.state.lock();
            match state.consumers.get_mut(&consumer_id) {
                Some(entry) => entry.session.take(),
                None => return,
            }
        };
        if let Some(session_id) = session_id {
            self.teardown_session(session_id);
        }
        let consumer = {
            let mut state = self.inner.state.lock();
            state.consumers.remove(&consumer_id).map(|e| e.consumer)
        };
        if let Some(consumer) = consumer {
            self.inner.runner.post(move || consumer.on_disconnect());
        }
    }

    /// Validates a trace config and creates the session in Configured.
    pub fn configure_session(
        &self,
        consumer_id: ConsumerId,
        config: TraceConfig,
    ) -> Result<SessionId, ServiceError> {
        validate_config(&config)?;
        let mut state = self.inner.state.lock();
        let entry = state
            .consumers
            .get(&consumer_id)
            .ok_or(ServiceError::NoSuchConsumer)?;
        if entry.session.is_some() {
            return Err(ServiceError::InvalidState("consumer already has a session"));
        }
        state.last_session_id += 1;
        let session_id = state.last_session_id;
        state.sessions.insert(
            session_id,
            Session {
                id: session_id,
                consumer: consumer_id,
                state: SessionState::Configured,
                config,
                buffers: Vec::new(),
                instances: Vec::new(),
                pending_start_acks: HashSet::new(),
                pending_stop_acks: HashSet::new(),
                pending_flushes: HashMap::new(),
            },
        );
        if let Some(entry) = state.consumers.get_mut(&consumer_id) {
            entry.session = Some(session_id);
        }
        tracing::debug!(session_id, consumer_id, "session configured");
        Ok(session_id)
    }

    /// Allocates the session's buffers and fans SetupDataSource /
    /// StartDataSource out to every producer with a matching registration.
    pub fn enable_session(&self, consumer_id: ConsumerId) -> Result<(), ServiceError> {
        type Start = (Arc<dyn Producer>, DataSourceInstanceId, DataSourceConfig);
        let (session_id, starts, duration_ms, flush_interval_ms) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let session_id = consumer_session(state, consumer_id)?;
            let session = state.sessions.get_mut(&session_id).expect("session exists");
            if session.state != SessionState::Configured {
                return Err(ServiceError::InvalidState("enable requires Configured"));
            }
            session.state = SessionState::Enabling;

            for buffer_config in &session.config.buffers {
                let buffer = LogBuffer::new(buffer_config.size_bytes, buffer_config.fill_policy)
                    .map_err(|_| ServiceError::InvalidConfig("buffer size"))?;
                state.last_buffer_id = state.last_buffer_id.wrapping_add(1).max(1);
                let buffer_id = state.last_buffer_id;
                state.buffers.insert(buffer_id, buffer);
                session.buffers.push(buffer_id);
                state.stats.buffers_created += 1;
            }

            let mut starts: Vec<Start> = Vec::new();
            for spec in &session.config.data_sources {
                for reg in state.data_sources.iter().filter(|r| r.descriptor.name == spec.name) {
                    let Some(producer_entry) = state.producers.get(&reg.producer_id) else {
                        continue;
                    };
                    if !spec.producer_name_filter.is_empty()
                        && !spec.producer_name_filter.contains(&producer_entry.name)
                    {
                        continue;
                    }
                    state.last_instance_id += 1;
                    let instance_id = state.last_instance_id;
                    let mut ds_config = spec.config.clone();
                    ds_config.name = spec.name.clone();
                    ds_config.target_buffer = session.buffers[spec.target_buffer as usize];
                    session.instances.push(DataSourceInstance {
                        instance_id,
                        producer_id: reg.producer_id,
                        will_notify_on_stop: reg.descriptor.will_notify_on_stop,
                    });
                    session.pending_start_acks.insert(instance_id);
                    starts.push((producer_entry.producer.clone(), instance_id, ds_config));
                }
            }
            if session.pending_start_acks.is_empty() {
                session.state = SessionState::Enabled;
            }
            (
                session_id,
                starts,
                session.config.duration_ms,
                session.config.flush_interval_ms,
            )
        };

        for (producer, instance_id, config) in starts {
            self.inner.runner.post(move || {
                producer.setup_data_source(instance_id, &config);
                producer.start_data_source(instance_id, &config);
            });
        }

        // Deadline that promotes Enabling → Enabled even without every ack.
        let service = self.clone();
        self.inner.runner.post_delayed(START_DEADLINE, move || {
            service.on_start_deadline(session_id);
        });
        if duration_ms > 0 {
            let service = self.clone();
            self.inner
                .runner
                .post_delayed(Duration::from_millis(u64::from(duration_ms)), move || {
                    let _ = service.disable_session_by_id(session_id);
                });
        }
        if flush_interval_ms > 0 {
            self.schedule_periodic_flush(
                session_id,
                Duration::from_millis(u64::from(flush_interval_ms)),
            );
        }
        tracing::debug!(session_id, "session enabling");
        Ok(())
    }

    pub fn disable_session(&self, consumer_id: ConsumerId) -> Result<(), ServiceError> {
        let session_id = {
            let state = self.inner.state.lock();
            consumer_session(&state, consumer_id)?
        };
        self.disable_session_by_id(session_id)
    }

    fn disable_session_by_id(&self, session_id: SessionId) -> Result<(), ServiceError> {
        let (stops, done) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(session) = state.sessions.get_mut(&session_id) else {
                return Err(ServiceError::NoSuchSession);
            };
            match session.state {
                SessionState::Enabling | SessionState::Enabled => {}
                SessionState::Disabling | SessionState::Disabled => return Ok(()),
                _ => return Err(ServiceError::InvalidState("disable requires an active session")),
            }
            session.state = SessionState::Disabling;
            let mut stops: Vec<(Arc<dyn Producer>, DataSourceInstanceId)> = Vec::new();
            for instance in &session.instances {
                if let Some(entry) = state.producers.get(&instance.producer_id) {
                    stops.push((entry.producer.clone(), instance.instance_id));
                }
            }
            // Only sources that promised a stop ack gate the drain.
            session.pending_stop_acks = session
                .instances
                .iter()
                .filter(|i| i.will_notify_on_stop)
                .map(|i| i.instance_id)
                .collect();
            (stops, session.pending_stop_acks.is_empty())
        };

        for (producer, instance_id) in stops {
            self.inner.runner.post(move || producer.stop_data_source(instance_id));
        }
        if done {
            self.finish_disable(session_id);
        } else {
            let service = self.clone();
            self.inner.runner.post_delayed(STOP_DEADLINE, move || {
                service.on_stop_deadline(session_id);
            });
        }
        Ok(())
    }

    /// Broadcasts a flush to every producer with instances in the session.
    /// Completion (or deadline expiry, with the partial flag) is reported
    /// through `Consumer::on_flush_complete`.
    pub fn flush_session(
        &self,
        consumer_id: ConsumerId,
        timeout: Duration,
    ) -> Result<FlushId, ServiceError> {
        let (session_id, flush_id, requests) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let session_id = consumer_session(state, consumer_id)?;
            let session = state.sessions.get_mut(&session_id).expect("session exists");
            if !matches!(session.state, SessionState::Enabling | SessionState::Enabled) {
                return Err(ServiceError::InvalidState("flush requires an enabled session"));
            }
            state.last_flush_id += 1;
            let flush_id = state.last_flush_id;

            let mut per_producer: HashMap<ProducerId, Vec<DataSourceInstanceId>> = HashMap::new();
            for instance in &session.instances {
                per_producer
                    .entry(instance.producer_id)
                    .or_default()
                    .push(instance.instance_id);
            }
            session.pending_flushes.insert(
                flush_id,
                PendingFlush {
                    pending_producers: per_producer.keys().copied().collect(),
                    partial: false,
                },
            );
            let mut requests: Vec<(Arc<dyn Producer>, Vec<DataSourceInstanceId>)> = Vec::new();
            for (producer_id, instances) in per_producer {
                if let Some(entry) = state.producers.get(&producer_id) {
                    requests.push((entry.producer.clone(), instances));
                }
            }
            (session_id, flush_id, requests)
        };

        let no_producers = requests.is_empty();
        for (producer, instances) in requests {
            self.inner.runner.post(move || producer.flush(flush_id, &instances));
        }
        if no_producers {
            self.finish_flush(session_id, flush_id);
        } else {
            let service = self.clone();
            self.inner.runner.post_delayed(timeout, move || {
                service.on_flush_timeout(session_id, flush_id);
            });
        }
        Ok(flush_id)
    }

    /// Drains every buffer of the consumer's session into bounded packet
    /// batches delivered through `Consumer::on_trace_packets`.
    pub fn read_buffers(&self, consumer_id: ConsumerId) -> Result<(), ServiceError> {
        let _wedge_guard = self
            .inner
            .watchdog
            .create_fatal_timer(READ_WATCHDOG_TIMEOUT, TimerReason::TraceDeadline);

        let (consumer, batches) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let session_id = consumer_session(state, consumer_id)?;
            let consumer = state
                .consumers
                .get(&consumer_id)
                .expect("consumer checked")
                .consumer
                .clone();
            let session = state.sessions.get(&session_id).expect("session exists");

            let mut batches: Vec<Vec<TracePacket>> = Vec::new();
            let mut current: Vec<TracePacket> = Vec::new();
            let mut current_bytes = 0usize;
            for &buffer_id in &session.buffers {
                let Some(buffer) = state.buffers.get_mut(&buffer_id) else {
                    continue;
                };
                buffer.begin_read();
                while let Some(slices) = buffer.read_next_packet() {
                    let packet = slices.to_packet();
                    current_bytes += packet.len();
                    current.push(packet);
                    if current_bytes >= MAX_READ_BATCH_BYTES {
                        batches.push(std::mem::take(&mut current));
                        current_bytes = 0;
                    }
                }
            }
            if !current.is_empty() {
                batches.push(current);
            }
            (consumer, batches)
        };

        if batches.is_empty() {
            self.inner
                .runner
                .post(move || consumer.on_trace_packets(Vec::new(), false));
            return Ok(());
        }
        let total = batches.len();
        for (i, batch) in batches.into_iter().enumerate() {
            let consumer = consumer.clone();
            let has_more = i + 1 < total;
            self.inner
                .runner
                .post(move || consumer.on_trace_packets(batch, has_more));
        }
        Ok(())
    }

    /// Destroys the session and its buffers. The session is disabled first
    /// if it was still running.
    pub fn free_buffers(&self, consumer_id: ConsumerId) -> Result<(), ServiceError> {
        let session_id = {
            let state = self.inner.state.lock();
            consumer_session(&state, consumer_id)?
        };
        self.teardown_session(session_id);
        Ok(())
    }

    pub fn session_state(&self, consumer_id: ConsumerId) -> Option<SessionState> {
        let state = self.inner.state.lock();
        let session_id = consumer_session(&state, consumer_id).ok()?;
        state.sessions.get(&session_id).map(Session::overlay_state)
    }

    /// Per-buffer stats of the consumer's session, in config order.
    pub fn buffer_stats(&self, consumer_id: ConsumerId) -> Vec<BufferStats> {
        let state = self.inner.state.lock();
        let Ok(session_id) = consumer_session(&state, consumer_id) else {
            return Vec::new();
        };
        let Some(session) = state.sessions.get(&session_id) else {
            return Vec::new();
        };
        session
            .buffers
            .iter()
            .filter_map(|id| state.buffers.get(id).map(|b| *b.stats()))
            .collect()
    }

    // -------------------------------------------------------------------
    // Deadlines and teardown
    // -------------------------------------------------------------------

    fn on_start_deadline(&self, session_id: SessionId) {
        let mut state = self.inner.state.lock();
        if let Some(session) = state.sessions.get_mut(&session_id) {
            if session.state == SessionState::Enabling {
                tracing::debug!(session_id, "start deadline hit, enabling with missing acks");
                session.pending_start_acks.clear();
                session.state = SessionState::Enabled;
            }
        }
    }

    fn on_stop_deadline(&self, session_id: SessionId) {
        let pending = {
            let state = self.inner.state.lock();
            state
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.state == SessionState::Disabling)
        };
        if pending {
            tracing::debug!(session_id, "stop deadline hit, forcing Disabled");
            self.finish_disable(session_id);
        }
    }

    fn on_flush_timeout(&self, session_id: SessionId, flush_id: FlushId) {
        let expired = {
            let mut state = self.inner.state.lock();
            match state.sessions.get_mut(&session_id) {
                Some(session) => match session.pending_flushes.get_mut(&flush_id) {
                    Some(flush) if !flush.pending_producers.is_empty() => {
                        flush.partial = true;
                        true
                    }
                    _ => false,
                },
                None => false,
            }
        };
        if expired {
            self.finish_flush(session_id, flush_id);
        }
    }

    fn finish_flush(&self, session_id: SessionId, flush_id: FlushId) {
        let notify = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(session) = state.sessions.get_mut(&session_id) else {
                return;
            };
            let Some(flush) = session.pending_flushes.remove(&flush_id) else {
                return;
            };
            state
                .consumers
                .get(&session.consumer)
                .map(|e| (e.consumer.clone(), flush.partial))
        };
        if let Some((consumer, partial)) = notify {
            self.inner
                .runner
                .post(move || consumer.on_flush_complete(flush_id, partial));
        }
    }

    fn finish_disable(&self, session_id: SessionId) {
        let consumer = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(session) = state.sessions.get_mut(&session_id) else {
                return;
            };
            if session.state == SessionState::Disabled {
                return;
            }
            session.state = SessionState::Disabled;
            session.pending_stop_acks.clear();
            state.consumers.get(&session.consumer).map(|e| e.consumer.clone())
        };
        tracing::debug!(session_id, "session disabled");
        if let Some(consumer) = consumer {
            self.inner.runner.post(move || consumer.on_tracing_disabled());
        }
    }

    fn teardown_session(&self, session_id: SessionId) {
        // Stop data sources first if the session was still live.
        let _ = self.disable_session_by_id(session_id);
        let mut state = self.inner.state.lock();
        let Some(session) = state.sessions.remove(&session_id) else {
            return;
        };
        for buffer_id in &session.buffers {
            state.buffers.remove(buffer_id);
        }
        if let Some(entry) = state.consumers.get_mut(&session.consumer) {
            if entry.session == Some(session_id) {
                entry.session = None;
            }
        }
        tracing::debug!(session_id, "session destroyed");
    }

    fn schedule_periodic_flush(&self, session_id: SessionId, interval: Duration) {
        let service = self.clone();
        self.inner.runner.post_delayed(interval, move || {
            let consumer_id = {
                let state = service.inner.state.lock();
                match state.sessions.get(&session_id) {
                    Some(s) if s.state == SessionState::Enabled => Some(s.consumer),
                    _ => None,
                }
            };
            if let Some(consumer_id) = consumer_id {
                let _ = service.flush_session(consumer_id, Duration::from_secs(5));
                service.schedule_periodic_flush(session_id, interval);
            }
        });
    }

    /// Re-checks transitions that producer churn may have unblocked.
    fn maybe_finish_lifecycle_transitions(&self) {
        let disabled = {
            let mut state = self.inner.state.lock();
            let mut disabled = Vec::new();
            for session in state.sessions.values_mut() {
                match session.state {
                    SessionState::Enabling if session.pending_start_acks.is_empty() => {
                        session.state = SessionState::Enabled;
                        tracing::debug!(session_id = session.id, "session enabled");
                    }
                    SessionState::Disabling if session.pending_stop_acks.is_empty() => {
                        disabled.push(session.id);
                    }
                    _ => {}
                }
            }
            disabled
        };
        for session_id in disabled {
            self.finish_disable(session_id);
        }
    }
}

fn apply_patch(state: &mut ServiceState, producer_id: ProducerId, patch: &PatchRequest) {
    let Some(buffer) = state.buffers.get_mut(&patch.target_buffer) else {
        tracing::warn!(
            producer_id,
            target_buffer = patch.target_buffer,
            "patch targets an unknown buffer"
        );
        return;
    };
    let mut data = [0u8; PATCH_LEN];
    data.copy_from_slice(&patch.data);
    buffer.try_patch(producer_id, patch.writer_id, patch.chunk_id, patch.offset, data);
    state.stats.patches_routed += 1;
}

fn consumer_session(
    state: &ServiceState,
    consumer_id: ConsumerId,
) -> Result<SessionId, ServiceError> {
    state
        .consumers
        .get(&consumer_id)
        .ok_or(ServiceError::NoSuchConsumer)?
        .session
        .ok_or(ServiceError::NoSuchSession)
}

fn validate_config(config: &TraceConfig) -> Result<(), ServiceError> {
    if config.buffers.is_empty() {
        return Err(ServiceError::InvalidConfig("no buffers"));
    }
    for buffer in &config.buffers {
        if buffer.size_bytes < RECORD_HEADER_SIZE || buffer.size_bytes % RECORD_ALIGNMENT != 0 {
            return Err(ServiceError::InvalidConfig("buffer size"));
        }
    }
    for spec in &config.data_sources {
        if spec.name.is_empty() {
            return Err(ServiceError::InvalidConfig("data source name"));
        }
        if spec.target_buffer as usize >= config.buffers.len() {
            return Err(ServiceError::InvalidConfig("target buffer out of range"));
        }
    }
    Ok(())
}

fn effective_shm_size(hint: usize, page_size: usize) -> usize {
    if hint == 0 {
        return DEFAULT_SHM_SIZE;
    }
    let clamped = hint.clamp(page_size, 16 * 1024 * 1024);
    clamped - clamped % page_size
}
