//! Recording doubles for the endpoint traits.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use spool_core::config::DataSourceConfig;
use spool_core::ids::{BufferId, DataSourceInstanceId, FlushId, ProducerId};
use spool_core::{Consumer, Producer, TracePacket};
use spool_service::TracingService;
use spool_shm::{CommitBatch, CommitSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
    Connected,
    Disconnected,
    Setup {
        instance: DataSourceInstanceId,
        target_buffer: BufferId,
    },
    Start {
        instance: DataSourceInstanceId,
        target_buffer: BufferId,
    },
    Stop {
        instance: DataSourceInstanceId,
    },
    Flush {
        flush_id: FlushId,
        instances: Vec<DataSourceInstanceId>,
    },
}

/// A producer that records every callback and can ack automatically.
///
/// Bind it to the service after connecting so the auto-acks know where to
/// call back.
#[derive(Default)]
pub struct TestProducer {
    pub events: Mutex<Vec<ProducerEvent>>,
    binding: Mutex<Option<(TracingService, ProducerId)>>,
    auto_ack_start: AtomicBool,
    auto_ack_stop: AtomicBool,
    auto_ack_flush: AtomicBool,
}

impl TestProducer {
    pub fn new() -> Self {
        let producer = Self::default();
        producer.auto_ack_start.store(true, Ordering::Relaxed);
        producer.auto_ack_stop.store(true, Ordering::Relaxed);
        producer.auto_ack_flush.store(true, Ordering::Relaxed);
        producer
    }

    pub fn bind(&self, service: TracingService, producer_id: ProducerId) {
        *self.binding.lock() = Some((service, producer_id));
    }

    pub fn set_auto_ack_start(&self, on: bool) {
        self.auto_ack_start.store(on, Ordering::Relaxed);
    }

    pub fn set_auto_ack_stop(&self, on: bool) {
        self.auto_ack_stop.store(on, Ordering::Relaxed);
    }

    pub fn set_auto_ack_flush(&self, on: bool) {
        self.auto_ack_flush.store(on, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<ProducerEvent> {
        self.events.lock().clone()
    }

    fn binding(&self) -> Option<(TracingService, ProducerId)> {
        self.binding.lock().clone()
    }
}

impl Producer for TestProducer {
    fn on_connect(&self) {
        self.events.lock().push(ProducerEvent::Connected);
    }

    fn on_disconnect(&self) {
        self.events.lock().push(ProducerEvent::Disconnected);
    }

    fn setup_data_source(&self, instance: DataSourceInstanceId, config: &DataSourceConfig) {
        self.events.lock().push(ProducerEvent::Setup {
            instance,
            target_buffer: config.target_buffer,
        });
    }

    fn start_data_source(&self, instance: DataSourceInstanceId, config: &DataSourceConfig) {
        self.events.lock().push(ProducerEvent::Start {
            instance,
            target_buffer: config.target_buffer,
        });
        if self.auto_ack_start.load(Ordering::Relaxed) {
            if let Some((service, producer_id)) = self.binding() {
                service.notify_data_source_started(producer_id, instance);
            }
        }
    }

    fn stop_data_source(&self, instance: DataSourceInstanceId) {
        self.events.lock().push(ProducerEvent::Stop { instance });
        if self.auto_ack_stop.load(Ordering::Relaxed) {
            if let Some((service, producer_id)) = self.binding() {
                service.notify_data_source_stopped(producer_id, instance);
            }
        }
    }

    fn flush(&self, flush_id: FlushId, instances: &[DataSourceInstanceId]) {
        self.events.lock().push(ProducerEvent::Flush {
            flush_id,
            instances: instances.to_vec(),
        });
        if self.auto_ack_flush.load(Ordering::Relaxed) {
            if let Some((service, producer_id)) = self.binding() {
                service.notify_flush_complete(producer_id, flush_id);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Connected,
    Disconnected,
    TracingDisabled,
    FlushComplete { flush_id: FlushId, partial: bool },
}

/// A consumer that records callbacks and accumulates delivered packets.
#[derive(Default)]
pub struct TestConsumer {
    pub events: Mutex<Vec<ConsumerEvent>>,
    pub packets: Mutex<Vec<TracePacket>>,
    /// (batch size, has_more) per on_trace_packets call.
    pub batches: Mutex<Vec<(usize, bool)>>,
}

impl TestConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ConsumerEvent> {
        self.events.lock().clone()
    }

    pub fn packet_bytes(&self) -> Vec<Vec<u8>> {
        self.packets.lock().iter().map(TracePacket::to_bytes).collect()
    }
}

impl Consumer for TestConsumer {
    fn on_connect(&self) {
        self.events.lock().push(ConsumerEvent::Connected);
    }

    fn on_disconnect(&self) {
        self.events.lock().push(ConsumerEvent::Disconnected);
    }

    fn on_tracing_disabled(&self) {
        self.events.lock().push(ConsumerEvent::TracingDisabled);
    }

    fn on_trace_packets(&self, packets: Vec<TracePacket>, has_more: bool) {
        self.batches.lock().push((packets.len(), has_more));
        self.packets.lock().extend(packets);
    }

    fn on_flush_complete(&self, flush_id: FlushId, partial: bool) {
        self.events.lock().push(ConsumerEvent::FlushComplete { flush_id, partial });
    }
}

/// A commit sink that stores batches instead of delivering them.
#[derive(Default)]
pub struct CollectSink {
    pub batches: Mutex<Vec<CommitBatch>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<CommitBatch> {
        std::mem::take(&mut self.batches.lock())
    }
}

impl CommitSink for CollectSink {
    fn commit(&self, batch: CommitBatch) {
        self.batches.lock().push(batch);
    }
}
