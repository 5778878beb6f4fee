//! In-process tracing session, end to end.
//!
//! This example shows:
//! - Standing up the tracing service on a tokio-backed task runner
//! - Connecting a producer and registering a data source
//! - A consumer configuring, enabling, flushing and reading a session
//! - A writer framing packets into shared memory through the arbiter
//!
//! Run with: `cargo run --example inprocess_trace -p spool-service`

use std::sync::Arc;
use std::time::Duration;

use spool_core::config::{
    BufferConfig, DataSourceConfig, DataSourceDescriptor, DataSourceSpec, TraceConfig,
};
use spool_core::ids::{DataSourceInstanceId, FlushId};
use spool_core::{Consumer, Producer, TaskRunner, TracePacket};
use spool_producer::{SharedMemoryArbiter, StallPolicy};
use spool_service::TracingService;
use spool_shm::HeapShmFactory;

/// A producer that remembers which buffer its data source must target.
#[derive(Default)]
struct DemoProducer {
    target_buffer: parking_lot::Mutex<Option<u16>>,
}

impl Producer for DemoProducer {
    fn on_connect(&self) {
        println!("producer: connected");
    }

    fn on_disconnect(&self) {
        println!("producer: disconnected");
    }

    fn setup_data_source(&self, instance: DataSourceInstanceId, config: &DataSourceConfig) {
        println!("producer: setup instance {} -> buffer {}", instance, config.target_buffer);
        *self.target_buffer.lock() = Some(config.target_buffer);
    }

    fn start_data_source(&self, instance: DataSourceInstanceId, _config: &DataSourceConfig) {
        println!("producer: start instance {}", instance);
    }

    fn stop_data_source(&self, instance: DataSourceInstanceId) {
        println!("producer: stop instance {}", instance);
    }

    fn flush(&self, flush_id: FlushId, _instances: &[DataSourceInstanceId]) {
        println!("producer: flush {}", flush_id);
    }
}

struct DemoConsumer {
    done: tokio::sync::mpsc::UnboundedSender<()>,
}

impl Consumer for DemoConsumer {
    fn on_connect(&self) {}

    fn on_disconnect(&self) {}

    fn on_tracing_disabled(&self) {
        println!("consumer: tracing disabled");
    }

    fn on_trace_packets(&self, packets: Vec<TracePacket>, has_more: bool) {
        for packet in &packets {
            println!(
                "consumer: packet ({} bytes): {:?}",
                packet.len(),
                String::from_utf8_lossy(&packet.to_bytes())
            );
        }
        if !has_more {
            let _ = self.done.send(());
        }
    }

    fn on_flush_complete(&self, flush_id: FlushId, partial: bool) {
        println!("consumer: flush {} complete (partial: {})", flush_id, partial);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let runner = TaskRunner::spawn();
    let service = TracingService::new(Box::new(HeapShmFactory::new()), runner.clone());

    // Producer side: connect and register a data source.
    let producer = Arc::new(DemoProducer::default());
    let conn = service.connect_producer(producer.clone(), "demo-producer", 0)?;
    service.register_data_source(
        conn.producer_id,
        DataSourceDescriptor {
            name: "demo.counters".into(),
            will_notify_on_stop: false,
        },
    )?;

    // Consumer side: configure and enable a session.
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let consumer = Arc::new(DemoConsumer { done: done_tx });
    let consumer_id = service.connect_consumer(consumer);
    service.configure_session(
        consumer_id,
        TraceConfig {
            buffers: vec![BufferConfig {
                size_bytes: 64 * 1024,
                fill_policy: Default::default(),
            }],
            data_sources: vec![DataSourceSpec {
                name: "demo.counters".into(),
                producer_name_filter: Vec::new(),
                target_buffer: 0,
                config: Default::default(),
            }],
            ..Default::default()
        },
    )?;
    service.enable_session(consumer_id)?;

    // Give the start fan-out a moment to reach the producer.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let target_buffer = (*producer.target_buffer.lock()).expect("data source was set up");

    // Write a few packets through the shared-memory path.
    let arbiter = SharedMemoryArbiter::new(
        conn.shmem.clone(),
        conn.page_size,
        conn.sink.clone(),
        conn.doorbell.clone(),
        runner.clone(),
    );
    let mut writer = arbiter.create_trace_writer(target_buffer, StallPolicy::Block);
    for i in 0..5 {
        let mut packet = writer.new_trace_packet();
        packet.write_bytes(format!("demo packet #{i}").as_bytes());
    }
    writer.flush();

    // Let the service drain the commits, then read everything back.
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.read_buffers(consumer_id)?;
    done_rx.recv().await;

    service.disable_session(consumer_id)?;
    service.free_buffers(consumer_id)?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("done");
    Ok(())
}
