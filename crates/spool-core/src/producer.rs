//! The callback interface a producer exposes to the service.

use std::sync::Arc;

use crate::config::DataSourceConfig;
use crate::ids::{DataSourceInstanceId, FlushId};

/// Implemented by producer processes (or their in-process stand-ins).
///
/// All callbacks are invoked on the service task runner; implementations
/// must not block it. A producer reacts by calling back into the service
/// (`notify_data_source_started`, `notify_flush_complete`, ...) using the
/// ids it was handed, never by holding a reference to service internals.
pub trait Producer: Send + Sync {
    /// The connection is established and shared memory is mapped.
    fn on_connect(&self);

    /// The connection is gone. No further callbacks will arrive.
    fn on_disconnect(&self);

    /// A session referencing one of this producer's registered data sources
    /// reached Enabling. Instances are created before they are started.
    fn setup_data_source(&self, instance: DataSourceInstanceId, config: &DataSourceConfig);

    /// The instance must begin emitting data.
    fn start_data_source(&self, instance: DataSourceInstanceId, config: &DataSourceConfig);

    /// The instance must stop emitting data and commit outstanding chunks.
    fn stop_data_source(&self, instance: DataSourceInstanceId);

    /// The producer must commit all in-flight data for the listed instances
    /// and then ack via `notify_flush_complete(flush_id)`.
    fn flush(&self, flush_id: FlushId, instances: &[DataSourceInstanceId]);
}

/// Producers are shared between the service and the caller's own plumbing.
pub type ProducerRef = Arc<dyn Producer>;
