use crate::config::{FieldBusConfig, MeterConfig, Parity};
use crate::eastron_sdm::words_to_f32;
use crate::error::TransportError;
use crate::retry_policy::RetryPolicy;
use crate::samples::{Fields, RawSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::{sleep, timeout, timeout_at};
use tokio_modbus::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reads single float values off the field bus.
#[async_trait]
pub trait RegisterReader: Send {
    /// Reads the float stored at `register` and `register + 1` of meter `unit`.
    async fn read_f32(&mut self, unit: u8, register: u16) -> Result<f32, TransportError>;
}

/// Modbus RTU or TCP connection shared by all meters on the bus.
pub struct ModbusReader {
    bus: FieldBusConfig,
    request_timeout: Duration,
    connection: Option<client::Context>,
}

impl ModbusReader {
    /// Opens the bus. Failing here is fatal for the caller, later failures only
    /// drop the connection so the next read reconnects.
    pub async fn connect(
        bus: FieldBusConfig,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let connection = open(&bus, request_timeout).await?;
        Ok(Self {
            bus,
            request_timeout,
            connection: Some(connection),
        })
    }
}

async fn open(
    bus: &FieldBusConfig,
    request_timeout: Duration,
) -> Result<client::Context, TransportError> {
    match bus {
        FieldBusConfig::Rtu {
            device,
            baud_rate,
            parity,
            stop_bits,
        } => {
            info!(%device, baud_rate, "opening Modbus RTU serial port");
            let builder = tokio_serial::new(device.as_str(), *baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(match parity {
                    Parity::None => tokio_serial::Parity::None,
                    Parity::Even => tokio_serial::Parity::Even,
                    Parity::Odd => tokio_serial::Parity::Odd,
                })
                .stop_bits(if *stop_bits == 2 {
                    tokio_serial::StopBits::Two
                } else {
                    tokio_serial::StopBits::One
                });
            let port = tokio_serial::SerialStream::open(&builder)
                .map_err(|e| TransportError::Connection(format!("{device}: {e}")))?;
            Ok(rtu::attach(port))
        }
        FieldBusConfig::Tcp { address } => {
            info!(%address, "connecting to Modbus TCP gateway");
            let socket_addr = tokio::net::lookup_host(address.as_str())
                .await
                .map_err(|e| TransportError::Connection(format!("{address}: {e}")))?
                .next()
                .ok_or_else(|| {
                    TransportError::Connection(format!("{address}: no address resolved"))
                })?;
            match timeout(request_timeout * 4, tcp::connect(socket_addr)).await {
                Ok(Ok(ctx)) => Ok(ctx),
                Ok(Err(e)) => Err(TransportError::Connection(format!("{address}: {e}"))),
                Err(_) => Err(TransportError::Timeout(request_timeout * 4)),
            }
        }
    }
}

#[async_trait]
impl RegisterReader for ModbusReader {
    async fn read_f32(&mut self, unit: u8, register: u16) -> Result<f32, TransportError> {
        // Taken out for the duration of the request: if this future is dropped
        // mid-transaction the half used connection goes with it.
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => open(&self.bus, self.request_timeout).await?,
        };
        connection.set_slave(Slave(unit));

        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        let result = match timeout(
            self.request_timeout,
            connection.read_input_registers(register, 2),
        )
        .await
        {
            Ok(Ok(Ok(words))) if words.len() >= 2 => Ok(words_to_f32(words[0], words[1])),
            Ok(Ok(Ok(words))) => Err(TransportError::ShortResponse {
                expected: 2,
                got: words.len(),
            }),
            Ok(Ok(Err(exception))) => Err(TransportError::Exception(format!("{exception:?}"))),
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        };

        // A timed out or broken transport may still hold half a frame.
        if !matches!(
            result,
            Err(TransportError::Io(_)) | Err(TransportError::Timeout(_))
        ) {
            self.connection = Some(connection);
        }
        result
    }
}

/// Reads whole meters, retrying each one within its own time budget.
pub struct MeterClient {
    reader: Box<dyn RegisterReader>,
    retry: RetryPolicy,
    inter_read_gap: Duration,
}

impl MeterClient {
    pub fn new(reader: Box<dyn RegisterReader>, retry: RetryPolicy, inter_read_gap: Duration) -> Self {
        Self {
            reader,
            retry,
            inter_read_gap,
        }
    }

    /// Reads one meter. Never fails: after the retries are spent the sample
    /// carries an error status and no fields.
    pub async fn read(
        &mut self,
        meter: &MeterConfig,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> RawSample {
        let mut state = self.retry.begin();
        let last_error = loop {
            let attempt = state.attempt();
            let error = match timeout_at(state.deadline(), self.read_registers(meter)).await {
                Ok(Ok(fields)) => {
                    debug!(meter = %meter.name, attempt, ?fields, "meter read");
                    return RawSample::ok(&meter.name, meter.role, timestamp, fields);
                }
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout(self.retry.ceiling),
            };
            warn!(meter = %meter.name, unit = meter.unit, attempt, error = %error, "meter read failed");
            if !state.wait(cancel).await {
                break error;
            }
        };

        warn!(
            meter = %meter.name,
            unit = meter.unit,
            attempts = state.attempt(),
            error = %last_error,
            "skipping meter for this tick"
        );
        RawSample::failed(&meter.name, meter.role, timestamp, last_error.to_string())
    }

    /// Reads every meter in order, pausing between meters so the bus settles.
    pub async fn read_all(
        &mut self,
        meters: &[MeterConfig],
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Vec<RawSample> {
        let mut samples = Vec::with_capacity(meters.len());
        for (index, meter) in meters.iter().enumerate() {
            if index > 0 && !self.inter_read_gap.is_zero() {
                sleep(self.inter_read_gap).await;
            }
            samples.push(self.read(meter, timestamp, cancel).await);
        }
        samples
    }

    async fn read_registers(&mut self, meter: &MeterConfig) -> Result<Fields, TransportError> {
        let mut fields = Fields::new();
        for register in meter.registers.registers() {
            let value = self.reader.read_f32(meter.unit, register.address).await?;
            fields.insert(register.field_name(), value as f64);
        }
        Ok(fields)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeBus;
    use super::*;
    use crate::eastron_sdm::RegisterSet;
    use crate::samples::{MeterRole, ReadStatus, ACTIVE_POWER, IMPORT_ACTIVE_ENERGY};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            multiplier: 2.0,
            ceiling: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_energy_registers() {
        let bus = FakeBus::default();
        bus.set(2, 12, -300.0);
        bus.set(2, 72, 12.5);
        let mut client = MeterClient::new(bus.reader(), policy(), Duration::ZERO);
        let meter = MeterConfig::new("pv", MeterRole::Production, 2, RegisterSet::Energy);

        let sample = client.read(&meter, Utc::now(), &CancellationToken::new()).await;

        assert!(sample.is_ok());
        assert_eq!(sample.fields.len(), 3);
        assert_eq!(sample.field(ACTIVE_POWER), Some(-300.0));
        assert_eq!(sample.field(IMPORT_ACTIVE_ENERGY), Some(12.5));
        assert_eq!(*bus.reads.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let bus = FakeBus::default();
        bus.set(1, 12, 1000.0);
        bus.fail(1, 2);
        let mut client = MeterClient::new(bus.reader(), policy(), Duration::ZERO);
        let meter = MeterConfig::new("mains", MeterRole::Grid, 1, RegisterSet::Energy);

        let sample = client.read(&meter, Utc::now(), &CancellationToken::new()).await;

        assert!(sample.is_ok());
        assert_eq!(sample.field(ACTIVE_POWER), Some(1000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_yield_error_sample() {
        let bus = FakeBus::default();
        bus.fail(2, 100);
        let mut client = MeterClient::new(bus.reader(), policy(), Duration::ZERO);
        let meter = MeterConfig::new("pv", MeterRole::Production, 2, RegisterSet::Energy);

        let started = tokio::time::Instant::now();
        let sample = client.read(&meter, Utc::now(), &CancellationToken::new()).await;

        assert!(matches!(sample.status, ReadStatus::Error(_)));
        assert!(sample.fields.is_empty());
        assert_eq!(*bus.reads.lock().unwrap(), 3);
        assert!(started.elapsed() <= policy().ceiling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_bad_meter_does_not_affect_others() {
        let bus = FakeBus::default();
        bus.set(1, 12, 1000.0);
        bus.set(3, 12, 50.0);
        bus.fail(2, 100);
        let mut client = MeterClient::new(bus.reader(), policy(), Duration::from_millis(50));
        let meters = vec![
            MeterConfig::new("mains", MeterRole::Grid, 1, RegisterSet::Energy),
            MeterConfig::new("pv", MeterRole::Production, 2, RegisterSet::Energy),
            MeterConfig::new("battery", MeterRole::Storage, 3, RegisterSet::Energy),
        ];

        let samples = client
            .read_all(&meters, Utc::now(), &CancellationToken::new())
            .await;

        let statuses: Vec<bool> = samples.iter().map(RawSample::is_ok).collect();
        assert_eq!(statuses, vec![true, false, true]);
        assert_eq!(samples[2].field(ACTIVE_POWER), Some(50.0));
    }
}
