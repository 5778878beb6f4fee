//! Session state machine and endpoint lifecycle tests.
//!
//! Everything runs on a manual task runner pumped explicitly, so callback
//! ordering and deadline expiry are fully deterministic.

use std::sync::Arc;
use std::time::Duration;

use spool_core::config::{BufferConfig, DataSourceDescriptor, DataSourceSpec, TraceConfig};
use spool_core::{ServiceError, TaskRunner};
use spool_service::{SessionState, TracingService};
use spool_shm::HeapShmFactory;
use spool_testkit::{ConsumerEvent, ProducerEvent, TestConsumer, TestProducer};

fn service_with_runner() -> (TracingService, TaskRunner) {
    let runner = TaskRunner::new_manual();
    let service = TracingService::new(Box::new(HeapShmFactory::new()), runner.clone());
    service.watchdog().set_suppressed_for_testing(true);
    (service, runner)
}

fn simple_config() -> TraceConfig {
    TraceConfig {
        buffers: vec![BufferConfig {
            size_bytes: 64 * 1024,
            fill_policy: Default::default(),
        }],
        data_sources: vec![DataSourceSpec {
            name: "test.source".into(),
            producer_name_filter: Vec::new(),
            target_buffer: 0,
            config: Default::default(),
        }],
        duration_ms: 0,
        flush_interval_ms: 0,
        max_shm_size_bytes: 0,
    }
}

fn descriptor(name: &str, will_notify_on_stop: bool) -> DataSourceDescriptor {
    DataSourceDescriptor {
        name: name.into(),
        will_notify_on_stop,
    }
}

/// Connects a TestProducer, binds it for auto-acks, registers a source.
fn connect_producer(
    service: &TracingService,
    runner: &TaskRunner,
    name: &str,
    descriptor: DataSourceDescriptor,
) -> Arc<TestProducer> {
    let producer = Arc::new(TestProducer::new());
    let conn = service
        .connect_producer(producer.clone(), name, 0)
        .expect("connect");
    producer.bind(service.clone(), conn.producer_id);
    service
        .register_data_source(conn.producer_id, descriptor)
        .expect("register");
    runner.run_until_idle();
    assert_eq!(producer.events()[0], ProducerEvent::Connected);
    producer
}

#[test]
fn config_validation() {
    let (service, _runner) = service_with_runner();
    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer);

    let empty = TraceConfig::default();
    assert!(matches!(
        service.configure_session(consumer_id, empty),
        Err(ServiceError::InvalidConfig("no buffers"))
    ));

    let mut bad_size = simple_config();
    bad_size.buffers[0].size_bytes = 1000; // not 16-aligned
    assert!(matches!(
        service.configure_session(consumer_id, bad_size),
        Err(ServiceError::InvalidConfig("buffer size"))
    ));

    let mut bad_target = simple_config();
    bad_target.data_sources[0].target_buffer = 3;
    assert!(matches!(
        service.configure_session(consumer_id, bad_target),
        Err(ServiceError::InvalidConfig("target buffer out of range"))
    ));

    let mut bad_name = simple_config();
    bad_name.data_sources[0].name = String::new();
    assert!(matches!(
        service.configure_session(consumer_id, bad_name),
        Err(ServiceError::InvalidConfig("data source name"))
    ));

    // And a valid one goes through.
    assert!(service.configure_session(consumer_id, simple_config()).is_ok());
}

#[test]
fn session_enable_fans_out_and_reaches_enabled() {
    let (service, runner) = service_with_runner();
    let producer = connect_producer(&service, &runner, "p1", descriptor("test.source", false));

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer.clone());
    service.configure_session(consumer_id, simple_config()).unwrap();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Configured));

    service.enable_session(consumer_id).unwrap();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabling));

    // Pump: setup + start reach the producer; its auto-ack enables.
    runner.run_until_idle();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabled));

    let events = producer.events();
    let setup = events.iter().find(|e| matches!(e, ProducerEvent::Setup { .. }));
    let start = events.iter().find(|e| matches!(e, ProducerEvent::Start { .. }));
    assert!(setup.is_some() && start.is_some());
    // Setup and Start name the same instance and a real buffer id.
    if let (
        Some(ProducerEvent::Setup { instance: si, target_buffer: sb }),
        Some(ProducerEvent::Start { instance, target_buffer }),
    ) = (setup, start)
    {
        assert_eq!(si, instance);
        assert_eq!(sb, target_buffer);
        assert!(*target_buffer >= 1, "buffer ids start at 1");
    }
}

#[test]
fn enable_without_matching_producers_is_enabled_immediately() {
    let (service, runner) = service_with_runner();
    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer);
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabled));
    runner.run_until_idle();
}

#[test]
fn start_deadline_promotes_with_missing_acks() {
    let (service, runner) = service_with_runner();
    let producer = connect_producer(&service, &runner, "p1", descriptor("test.source", false));
    producer.set_auto_ack_start(false);

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer);
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabling));

    runner.advance(Duration::from_secs(6));
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabled));
}

#[test]
fn disable_waits_for_stop_acks_only_when_promised() {
    let (service, runner) = service_with_runner();
    let _producer = connect_producer(&service, &runner, "p1", descriptor("test.source", true));

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer.clone());
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();

    service.disable_session(consumer_id).unwrap();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Disabling));
    // The TestProducer acks the stop when the callback lands.
    runner.run_until_idle();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Disabled));
    assert!(consumer.events().contains(&ConsumerEvent::TracingDisabled));

    // Disabling twice is a no-op, not an error.
    assert!(service.disable_session(consumer_id).is_ok());
}

#[test]
fn stop_deadline_forces_disabled() {
    let (service, runner) = service_with_runner();
    let producer = connect_producer(&service, &runner, "p1", descriptor("test.source", true));
    producer.set_auto_ack_stop(false);

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer);
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();

    service.disable_session(consumer_id).unwrap();
    runner.run_until_idle();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Disabling));

    runner.advance(Duration::from_secs(6));
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Disabled));
}

#[test]
fn flush_completes_when_all_producers_ack() {
    let (service, runner) = service_with_runner();
    let _p1 = connect_producer(&service, &runner, "p1", descriptor("test.source", false));
    let _p2 = connect_producer(&service, &runner, "p2", descriptor("test.source", false));

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer.clone());
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();

    let flush_id = service.flush_session(consumer_id, Duration::from_secs(5)).unwrap();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Flushing));
    runner.run_until_idle();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabled));
    assert!(consumer
        .events()
        .contains(&ConsumerEvent::FlushComplete { flush_id, partial: false }));
}

#[test]
fn flush_deadline_reports_partial() {
    let (service, runner) = service_with_runner();
    let producer = connect_producer(&service, &runner, "p1", descriptor("test.source", false));
    producer.set_auto_ack_flush(false);

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer.clone());
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();

    let flush_id = service.flush_session(consumer_id, Duration::from_millis(100)).unwrap();
    runner.run_until_idle();
    assert!(consumer.events().iter().all(|e| !matches!(e, ConsumerEvent::FlushComplete { .. })));

    runner.advance(Duration::from_millis(200));
    assert!(consumer
        .events()
        .contains(&ConsumerEvent::FlushComplete { flush_id, partial: true }));
    // The session survives a partial flush.
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabled));
}

#[test]
fn producer_disconnect_detaches_only_its_instances() {
    let (service, runner) = service_with_runner();
    let p1 = Arc::new(TestProducer::new());
    let conn1 = service.connect_producer(p1.clone(), "p1", 0).unwrap();
    p1.bind(service.clone(), conn1.producer_id);
    service
        .register_data_source(conn1.producer_id, descriptor("test.source", false))
        .unwrap();
    let _p2 = connect_producer(&service, &runner, "p2", descriptor("test.source", false));
    runner.run_until_idle();

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer.clone());
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabled));

    service.disconnect_producer(conn1.producer_id);
    runner.run_until_idle();
    // The session stays enabled; p1's registration is gone.
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabled));
    assert!(p1.events().contains(&ProducerEvent::Disconnected));
    assert!(matches!(
        service.register_data_source(conn1.producer_id, descriptor("x", false)),
        Err(ServiceError::NoSuchProducer)
    ));
}

#[test]
fn producer_disconnect_mid_flush_completes_partial() {
    let (service, runner) = service_with_runner();
    let p1 = Arc::new(TestProducer::new());
    let conn1 = service.connect_producer(p1.clone(), "p1", 0).unwrap();
    p1.bind(service.clone(), conn1.producer_id);
    p1.set_auto_ack_flush(false);
    service
        .register_data_source(conn1.producer_id, descriptor("test.source", false))
        .unwrap();

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer.clone());
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();

    let flush_id = service.flush_session(consumer_id, Duration::from_secs(60)).unwrap();
    runner.run_until_idle();
    service.disconnect_producer(conn1.producer_id);
    runner.run_until_idle();
    assert!(consumer
        .events()
        .contains(&ConsumerEvent::FlushComplete { flush_id, partial: true }));
}

#[test]
fn consumer_disconnect_tears_down_session() {
    let (service, runner) = service_with_runner();
    let producer = connect_producer(&service, &runner, "p1", descriptor("test.source", false));

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer.clone());
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();

    service.disconnect_consumer(consumer_id);
    runner.run_until_idle();
    assert!(producer.events().iter().any(|e| matches!(e, ProducerEvent::Stop { .. })));
    assert!(consumer.events().contains(&ConsumerEvent::Disconnected));
    assert_eq!(service.session_state(consumer_id), None);
}

#[test]
fn read_buffers_on_empty_session_delivers_one_empty_batch() {
    let (service, runner) = service_with_runner();
    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer.clone());
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();

    service.read_buffers(consumer_id).unwrap();
    runner.run_until_idle();
    assert_eq!(*consumer.batches.lock(), vec![(0, false)]);
}

#[test]
fn duration_expiry_disables_the_session() {
    let (service, runner) = service_with_runner();
    let _producer = connect_producer(&service, &runner, "p1", descriptor("test.source", false));

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer.clone());
    let mut config = simple_config();
    config.duration_ms = 1_000;
    service.configure_session(consumer_id, config).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Enabled));

    runner.advance(Duration::from_secs(2));
    assert_eq!(service.session_state(consumer_id), Some(SessionState::Disabled));
    assert!(consumer.events().contains(&ConsumerEvent::TracingDisabled));
}

#[test]
fn free_buffers_allows_a_new_session() {
    let (service, runner) = service_with_runner();
    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer);
    service.configure_session(consumer_id, simple_config()).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();

    // A second session while one exists is refused.
    assert!(matches!(
        service.configure_session(consumer_id, simple_config()),
        Err(ServiceError::InvalidState(_))
    ));

    service.free_buffers(consumer_id).unwrap();
    runner.run_until_idle();
    assert_eq!(service.session_state(consumer_id), None);
    assert!(service.configure_session(consumer_id, simple_config()).is_ok());
}

#[test]
fn producer_name_filter_limits_fanout() {
    let (service, runner) = service_with_runner();
    let p1 = connect_producer(&service, &runner, "wanted", descriptor("test.source", false));
    let p2 = connect_producer(&service, &runner, "unwanted", descriptor("test.source", false));

    let consumer = Arc::new(TestConsumer::new());
    let consumer_id = service.connect_consumer(consumer);
    let mut config = simple_config();
    config.data_sources[0].producer_name_filter = vec!["wanted".into()];
    service.configure_session(consumer_id, config).unwrap();
    service.enable_session(consumer_id).unwrap();
    runner.run_until_idle();

    assert!(p1.events().iter().any(|e| matches!(e, ProducerEvent::Start { .. })));
    assert!(p2.events().iter().all(|e| !matches!(e, ProducerEvent::Start { .. })));
}
