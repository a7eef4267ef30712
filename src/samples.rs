use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Named numeric readings, e.g. `active_power -> 1234.5`.
pub type Fields = BTreeMap<String, f64>;

pub const ACTIVE_POWER: &str = "active_power";
pub const IMPORT_ACTIVE_ENERGY: &str = "import_active_energy";
pub const EXPORT_ACTIVE_ENERGY: &str = "export_active_energy";

/// Functional position of a meter in the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterRole {
    Grid,
    Production,
    Storage,
}

impl MeterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterRole::Grid => "grid",
            MeterRole::Production => "production",
            MeterRole::Storage => "storage",
        }
    }
}

impl fmt::Display for MeterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeterRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grid" | "mains" => Ok(MeterRole::Grid),
            "production" => Ok(MeterRole::Production),
            "storage" => Ok(MeterRole::Storage),
            other => Err(format!(
                "unknown role `{other}`, expected grid, production or storage"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadStatus {
    Ok,
    Error(String),
}

/// One meter's reading for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub meter: String,
    pub role: MeterRole,
    pub timestamp: DateTime<Utc>,
    pub fields: Fields,
    pub status: ReadStatus,
}

impl RawSample {
    pub fn ok(meter: &str, role: MeterRole, timestamp: DateTime<Utc>, fields: Fields) -> Self {
        Self {
            meter: meter.to_string(),
            role,
            timestamp,
            fields,
            status: ReadStatus::Ok,
        }
    }

    /// A failed read never carries numbers.
    pub fn failed(meter: &str, role: MeterRole, timestamp: DateTime<Utc>, reason: String) -> Self {
        Self {
            meter: meter.to_string(),
            role,
            timestamp,
            fields: Fields::new(),
            status: ReadStatus::Error(reason),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReadStatus::Ok
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}

/// A value computed from several meters' readings.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSample {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub fields: Fields,
}

/// Everything produced by one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub timestamp: DateTime<Utc>,
    pub raw: Vec<RawSample>,
    pub derived: Vec<DerivedSample>,
    /// Meters whose read failed this tick; their samples are not in `raw`.
    pub failed_meters: Vec<String>,
}

impl Batch {
    pub fn raw_sample(&self, meter: &str) -> Option<&RawSample> {
        self.raw.iter().find(|s| s.meter == meter)
    }

    pub fn derived_sample(&self, name: &str) -> Option<&DerivedSample> {
        self.derived.iter().find(|s| s.name == name)
    }
}
