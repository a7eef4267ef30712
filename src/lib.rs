//! Energy meter logger library
//!
//! Polls Eastron SDM meters over Modbus on a fixed wall-clock schedule, derives
//! consumption figures from the raw readings, stores every batch in InfluxDB and
//! republishes the latest one over MQTT.

pub mod aggregator;
pub mod config;
pub mod eastron_sdm;
pub mod error;
pub mod influxdb;
pub mod meter_client;
pub mod pipeline;
pub mod publisher;
pub mod retry_policy;
pub mod samples;
pub mod scheduler;
pub mod shutdown;
pub mod storage_writer;

// Re-export commonly used types for easier access
pub use aggregator::{Aggregator, DerivedRule};
pub use config::{Args, MeterConfig, PipelineConfig};
pub use influxdb::{InfluxDbClient, TimeSeriesSink};
pub use meter_client::{MeterClient, ModbusReader, RegisterReader};
pub use publisher::{MqttBus, PubSubBus, Publisher};
pub use retry_policy::RetryPolicy;
pub use samples::{Batch, DerivedSample, MeterRole, RawSample};
pub use scheduler::Scheduler;
pub use shutdown::ShutdownCoordinator;
pub use storage_writer::StorageWriter;
