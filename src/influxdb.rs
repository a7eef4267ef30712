use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::samples::Fields;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One time-series point, every field a float.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: Fields,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Line protocol with a millisecond timestamp. `None` when no field is finite,
    /// InfluxDB refuses lines without fields.
    pub fn to_line(&self) -> Option<String> {
        let fields: Vec<String> = self
            .fields
            .iter()
            .filter(|(_, value)| value.is_finite())
            .map(|(key, value)| format!("{}={}", escape_key(key), value))
            .collect();
        if fields.is_empty() {
            return None;
        }

        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
        }
        let _ = write!(
            line,
            " {} {}",
            fields.join(","),
            self.timestamp.timestamp_millis()
        );
        Some(line)
    }
}

fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Where finished batches end up.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write(&self, points: &[Point]) -> Result<(), StorageError>;
}

/// InfluxDB 1.x HTTP API client.
pub struct InfluxDbClient {
    config: StorageConfig,
    client: reqwest::Client,
}

impl InfluxDbClient {
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { config, client })
    }

    /// Checks the server answers at all, used once at startup.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let response = self
            .client
            .get(format!("{}/ping", self.config.url))
            .send()
            .await?;
        check_status(response).await?;
        info!(url = %self.config.url, database = %self.config.database, "InfluxDB reachable");
        Ok(())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_deref()),
            None => request,
        }
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxDbClient {
    async fn write(&self, points: &[Point]) -> Result<(), StorageError> {
        let body = points
            .iter()
            .filter_map(Point::to_line)
            .collect::<Vec<_>>()
            .join("\n");
        if body.is_empty() {
            debug!("nothing to write");
            return Ok(());
        }

        let request = self
            .client
            .post(format!("{}/write", self.config.url))
            .query(&[("db", self.config.database.as_str()), ("precision", "ms")])
            .body(body);
        let response = self.authorize(request).send().await?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        Err(StorageError::Rejected {
            status: status.as_u16(),
            body,
        })
    } else {
        Err(StorageError::Server {
            status: status.as_u16(),
            body,
        })
    }
}

/// Used when storage is disabled, drops everything.
pub struct DiscardSink;

#[async_trait]
impl TimeSeriesSink for DiscardSink {
    async fn write(&self, points: &[Point]) -> Result<(), StorageError> {
        warn!(points = points.len(), "InfluxDB writing disabled, discarding data");
        Ok(())
    }
}
