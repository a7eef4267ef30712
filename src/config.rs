use crate::aggregator::{self, DerivedRule};
use crate::eastron_sdm::RegisterSet;
use crate::error::ConfigError;
use crate::retry_policy::RetryPolicy;
use crate::samples::MeterRole;
use clap::Parser;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

/// Logs Eastron SDM energy meters to InfluxDB and optionally republishes the
/// latest readings over MQTT.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Args {
    /// Enable debug logging
    #[arg(short = 'D', long, env = "METER_DEBUG")]
    pub debug: bool,

    /// Modbus RTU serial device
    #[arg(short, long, value_name = "DEV", env = "SERIAL_DEVICE", default_value = "/dev/ttyUSB0")]
    pub serial: String,

    #[arg(long, env = "SERIAL_BAUDRATE", default_value_t = 2400)]
    pub baudrate: u32,

    /// Serial parity: N, E or O
    #[arg(long, env = "SERIAL_PARITY", default_value = "N")]
    pub parity: Parity,

    #[arg(long, env = "SERIAL_STOP_BITS", default_value_t = 1)]
    pub stop_bits: u8,

    /// Talk Modbus TCP to an RS485 gateway instead of the serial device
    #[arg(long, value_name = "HOST:PORT", env = "MODBUS_TCP")]
    pub modbus_tcp: Option<String>,

    /// Modbus request timeout in seconds
    #[arg(short, long, value_name = "SECS", env = "MODBUS_TIMEOUT", default_value = "0.5", value_parser = parse_seconds)]
    pub timeout: Duration,

    /// Meter definition `name=mains,role=grid,unit=1[,registers=full|energy][,enabled=false]`.
    /// Repeat for every meter. Without any, a grid meter `mains` on unit 1 is used.
    #[arg(long = "meter", value_name = "METER", env = "METERS", value_delimiter = ';')]
    pub meters: Vec<MeterConfig>,

    /// Add the production meter on unit 2 (only without --meter)
    #[arg(short, long, env = "METER_PRODUCTION")]
    pub production: bool,

    /// Add the storage meter on unit 3 (only without --meter)
    #[arg(short = 'S', long, env = "METER_STORAGE")]
    pub storage: bool,

    /// Also derive total generation from production plus storage
    #[arg(long, env = "COMBINED_GENERATION")]
    pub combined_generation: bool,

    /// Poll interval in seconds, ticks are aligned to multiples of it
    #[arg(long, value_name = "SECS", env = "POLL_INTERVAL", default_value = "60", value_parser = parse_seconds)]
    pub interval: Duration,

    /// Interval in seconds for energy-only reads between full polls. They only
    /// refresh the published snapshot and are never stored. 0 disables them.
    #[arg(long, value_name = "SECS", env = "QUICK_INTERVAL", default_value = "10", value_parser = parse_seconds)]
    pub quick_interval: Duration,

    /// Pause between reads of different meters on the bus
    #[arg(long, value_name = "SECS", env = "INTER_READ_GAP", default_value = "0.05", value_parser = parse_seconds)]
    pub inter_read_gap: Duration,

    #[arg(long, env = "METER_RETRIES", default_value_t = 3)]
    pub meter_retries: u32,

    #[arg(long, value_name = "SECS", env = "METER_BACKOFF", default_value = "0.1", value_parser = parse_seconds)]
    pub meter_backoff: Duration,

    /// Upper bound on the time spent reading one meter, retries included
    #[arg(long, value_name = "SECS", env = "METER_RETRY_CEILING", default_value = "5", value_parser = parse_seconds)]
    pub meter_retry_ceiling: Duration,

    /// InfluxDB base url (empty string disables writing to InfluxDB)
    #[arg(short, long = "influxdb-url", value_name = "URL", env = "INFLUXDB_URL", default_value = "http://127.0.0.1:8086")]
    pub influxdb_url: String,

    /// InfluxDB database name
    #[arg(short, long, value_name = "DB", env = "INFLUXDB_DATABASE", default_value = "energymeters")]
    pub database: String,

    #[arg(long, env = "INFLUXDB_USERNAME")]
    pub influxdb_username: Option<String>,

    #[arg(long, env = "INFLUXDB_PASSWORD", hide_env_values = true)]
    pub influxdb_password: Option<String>,

    #[arg(long, env = "STORAGE_RETRIES", default_value_t = 5)]
    pub storage_retries: u32,

    #[arg(long, value_name = "SECS", env = "STORAGE_BACKOFF", default_value = "0.1", value_parser = parse_seconds)]
    pub storage_backoff: Duration,

    #[arg(long, value_name = "SECS", env = "STORAGE_RETRY_CEILING", default_value = "2", value_parser = parse_seconds)]
    pub storage_retry_ceiling: Duration,

    /// Batches kept while InfluxDB is unreachable, the oldest are dropped beyond this
    #[arg(long, env = "RETRY_BUFFER", default_value_t = 1440)]
    pub retry_buffer: usize,

    /// Batches queued between the poller and the storage writer
    #[arg(long, env = "QUEUE_DEPTH", default_value_t = 16)]
    pub queue_depth: usize,

    /// Time the storage writer may spend flushing on shutdown
    #[arg(long, value_name = "SECS", env = "DRAIN_GRACE", default_value = "5", value_parser = parse_seconds)]
    pub drain_grace: Duration,

    /// MQTT broker host, enables publishing
    #[arg(short = 'z', long, value_name = "HOST", env = "MQTT_HOST")]
    pub mqtt_host: Option<String>,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "meter_logger")]
    pub mqtt_client_id: String,

    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "energymeters")]
    pub mqtt_topic_prefix: String,

    #[arg(long, value_name = "SECS", env = "PUBLISH_INTERVAL", default_value = "10", value_parser = parse_seconds)]
    pub publish_interval: Duration,

    /// Time allowed for all workers to stop after a termination signal
    #[arg(long, value_name = "SECS", env = "SHUTDOWN_TIMEOUT", default_value = "10", value_parser = parse_seconds)]
    pub shutdown_timeout: Duration,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("`{value}` is not a number of seconds: {e}"))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| format!("`{value}` is not a valid duration: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(Parity::None),
            "E" | "EVEN" => Ok(Parity::Even),
            "O" | "ODD" => Ok(Parity::Odd),
            other => Err(format!("unknown parity `{other}`")),
        }
    }
}

/// One physical meter on the field bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterConfig {
    pub name: String,
    pub role: MeterRole,
    pub unit: u8,
    pub registers: RegisterSet,
    pub enabled: bool,
}

impl MeterConfig {
    pub fn new(name: &str, role: MeterRole, unit: u8, registers: RegisterSet) -> Self {
        Self {
            name: name.to_string(),
            role,
            unit,
            registers,
            enabled: true,
        }
    }
}

impl FromStr for MeterConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut name = None;
        let mut role = None;
        let mut unit = None;
        let mut registers = None;
        let mut enabled = true;

        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("`{pair}` is not a key=value pair"))?;
            let value = value.trim();
            match key.trim() {
                "name" => name = Some(value.to_string()),
                "role" => role = Some(value.parse::<MeterRole>()?),
                "unit" => {
                    unit = Some(
                        value
                            .parse::<u8>()
                            .map_err(|e| format!("bad unit id `{value}`: {e}"))?,
                    )
                }
                "registers" => registers = Some(value.parse::<RegisterSet>()?),
                "enabled" => {
                    enabled = value
                        .to_ascii_lowercase()
                        .parse()
                        .map_err(|_| format!("bad enabled flag `{value}`"))?
                }
                other => return Err(format!("unknown meter key `{other}`")),
            }
        }

        let name = name.filter(|n| !n.is_empty()).ok_or("missing name")?;
        let role = role.ok_or("missing role")?;
        let unit = unit.ok_or("missing unit")?;
        if unit == 0 || unit > 247 {
            return Err(format!("unit id {unit} outside 1..=247"));
        }
        // Grid meters feed the detailed measurement, the others only energy.
        let registers = registers.unwrap_or(match role {
            MeterRole::Grid => RegisterSet::Full,
            MeterRole::Production | MeterRole::Storage => RegisterSet::Energy,
        });
        Ok(Self {
            name,
            role,
            unit,
            registers,
            enabled,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldBusConfig {
    Rtu {
        device: String,
        baud_rate: u32,
        parity: Parity,
        stop_bits: u8,
    },
    Tcp {
        address: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub interval: Duration,
}

/// Validated, immutable settings for a whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub field_bus: FieldBusConfig,
    pub request_timeout: Duration,
    /// Enabled meters only, in polling order.
    pub meters: Vec<MeterConfig>,
    pub rules: Vec<DerivedRule>,
    pub poll_interval: Duration,
    /// Energy-only reads between full polls, `None` when disabled.
    pub quick_interval: Option<Duration>,
    pub inter_read_gap: Duration,
    pub meter_retry: RetryPolicy,
    pub storage: Option<StorageConfig>,
    pub storage_retry: RetryPolicy,
    pub retry_buffer_capacity: usize,
    pub queue_depth: usize,
    pub drain_grace: Duration,
    pub publisher: Option<PublisherConfig>,
    pub shutdown_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let field_bus = match &args.modbus_tcp {
            Some(address) if !address.is_empty() => FieldBusConfig::Tcp {
                address: address.clone(),
            },
            _ => {
                if args.serial.is_empty() {
                    return Err(ConfigError::FieldBus("empty serial device".to_string()));
                }
                if !matches!(args.stop_bits, 1 | 2) {
                    return Err(ConfigError::FieldBus(format!(
                        "stop bits must be 1 or 2, got {}",
                        args.stop_bits
                    )));
                }
                FieldBusConfig::Rtu {
                    device: args.serial.clone(),
                    baud_rate: args.baudrate,
                    parity: args.parity,
                    stop_bits: args.stop_bits,
                }
            }
        };

        let meters = if args.meters.is_empty() {
            default_meters(args.production, args.storage)
        } else {
            args.meters.clone()
        };
        let meters = validate_meters(meters)?;
        let rules = aggregator::rules_for(&meters, args.combined_generation)?;

        for (name, value) in [
            ("interval", args.interval),
            ("timeout", args.timeout),
            ("meter retry ceiling", args.meter_retry_ceiling),
            ("storage retry ceiling", args.storage_retry_ceiling),
            ("publish interval", args.publish_interval),
            ("shutdown timeout", args.shutdown_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero { name });
            }
        }
        for (name, value) in [
            ("meter retries", args.meter_retries as usize),
            ("storage retries", args.storage_retries as usize),
            ("retry buffer", args.retry_buffer),
            ("queue depth", args.queue_depth),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        // Every meter may use its whole ceiling and the bus gap sits between them.
        let gaps = args.inter_read_gap * (meters.len() as u32 - 1);
        let tick_budget = args.meter_retry_ceiling * meters.len() as u32 + gaps;
        if tick_budget >= args.interval {
            return Err(ConfigError::TickBudgetTooLong {
                meters: meters.len(),
                budget: tick_budget,
                interval: args.interval,
            });
        }
        let quick_interval = (!args.quick_interval.is_zero()).then_some(args.quick_interval);
        if let Some(quick) = quick_interval {
            if quick >= args.interval || args.interval.as_millis() % quick.as_millis().max(1) != 0 {
                return Err(ConfigError::QuickInterval {
                    quick,
                    interval: args.interval,
                });
            }
        }
        if args.drain_grace >= args.shutdown_timeout {
            return Err(ConfigError::DrainGraceTooLong {
                grace: args.drain_grace,
                timeout: args.shutdown_timeout,
            });
        }

        let storage = (!args.influxdb_url.is_empty()).then(|| StorageConfig {
            url: args.influxdb_url.trim_end_matches('/').to_string(),
            database: args.database.clone(),
            username: args.influxdb_username.clone(),
            password: args.influxdb_password.clone(),
        });
        let publisher = args
            .mqtt_host
            .as_ref()
            .filter(|h| !h.is_empty())
            .map(|host| PublisherConfig {
                host: host.clone(),
                port: args.mqtt_port,
                client_id: args.mqtt_client_id.clone(),
                topic_prefix: args.mqtt_topic_prefix.trim_end_matches('/').to_string(),
                interval: args.publish_interval,
            });

        Ok(Self {
            field_bus,
            request_timeout: args.timeout,
            meters,
            rules,
            poll_interval: args.interval,
            quick_interval,
            inter_read_gap: args.inter_read_gap,
            meter_retry: RetryPolicy {
                max_attempts: args.meter_retries,
                initial_backoff: args.meter_backoff,
                ceiling: args.meter_retry_ceiling,
                ..RetryPolicy::default()
            },
            storage,
            storage_retry: RetryPolicy {
                max_attempts: args.storage_retries,
                initial_backoff: args.storage_backoff,
                ceiling: args.storage_retry_ceiling,
                ..RetryPolicy::default()
            },
            retry_buffer_capacity: args.retry_buffer,
            queue_depth: args.queue_depth,
            drain_grace: args.drain_grace,
            publisher,
            shutdown_timeout: args.shutdown_timeout,
        })
    }
}

fn default_meters(production: bool, storage: bool) -> Vec<MeterConfig> {
    let mut meters = vec![MeterConfig::new("mains", MeterRole::Grid, 1, RegisterSet::Full)];
    if production {
        meters.push(MeterConfig::new(
            "production",
            MeterRole::Production,
            2,
            RegisterSet::Energy,
        ));
    }
    if storage {
        meters.push(MeterConfig::new(
            "storage",
            MeterRole::Storage,
            3,
            RegisterSet::Energy,
        ));
    }
    meters
}

/// Drops disabled meters and checks names and unit ids are unique.
fn validate_meters(meters: Vec<MeterConfig>) -> Result<Vec<MeterConfig>, ConfigError> {
    let mut names = HashSet::new();
    let mut units = HashSet::new();
    for meter in &meters {
        if !names.insert(meter.name.as_str()) {
            return Err(ConfigError::DuplicateName(meter.name.clone()));
        }
        if !units.insert(meter.unit) {
            return Err(ConfigError::DuplicateUnit(meter.unit));
        }
    }
    let enabled: Vec<MeterConfig> = meters.into_iter().filter(|m| m.enabled).collect();
    if enabled.is_empty() {
        return Err(ConfigError::NoMeters);
    }
    Ok(enabled)
}
