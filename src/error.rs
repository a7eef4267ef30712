use std::time::Duration;

/// Failure talking to a meter over the field bus.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("field bus not connected: {0}")]
    Connection(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("modbus exception: {0}")]
    Exception(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("short response, expected {expected} registers got {got}")]
    ShortResponse { expected: usize, got: usize },
}

/// Failure committing points to the time-series store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// 5xx, the store may accept the same write later.
    #[error("store failed with status {status}: {body}")]
    Server { status: u16, body: String },

    /// 4xx, the write itself is bad and will never be accepted.
    #[error("store rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StorageError::Rejected { .. })
    }
}

/// Failure handing a message to the pub/sub bus.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("broker did not acknowledge the connection within {0:?}")]
    ConnectTimeout(Duration),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Invalid startup configuration. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid meter definition `{definition}`: {reason}")]
    InvalidMeter { definition: String, reason: String },

    #[error("no enabled meters configured")]
    NoMeters,

    #[error("meter name `{0}` is used more than once")]
    DuplicateName(String),

    #[error("unit id {0} is used by more than one meter")]
    DuplicateUnit(u8),

    #[error("only one grid meter is supported, found {0}")]
    MultipleGridMeters(usize),

    #[error("combined generation needs at least one enabled production or storage meter")]
    GenerationWithoutSources,

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("reading {meters} meters may take {budget:?}, which must be below the poll interval {interval:?}")]
    TickBudgetTooLong {
        meters: usize,
        budget: Duration,
        interval: Duration,
    },

    #[error("quick interval {quick:?} must be shorter than the poll interval {interval:?} and divide it")]
    QuickInterval { quick: Duration, interval: Duration },

    #[error("drain grace {grace:?} must be below the shutdown timeout {timeout:?}")]
    DrainGraceTooLong { grace: Duration, timeout: Duration },

    #[error("invalid field bus settings: {0}")]
    FieldBus(String),
}
