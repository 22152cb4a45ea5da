//! Record and result types shared by every store backend.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Reserved slot that backs simple counters.
pub const SIMPLE_COUNTER_SLOT: &str = "defaultSlot";

/// Suffix appended to operator-defined metric names so they never collide
/// with built-in metric names.
pub const CUSTOM_METRIC_SUFFIX: &str = "__customized";

/// Slot values for one date.
pub type SlotCounter = HashMap<String, f64>;

/// Slot values keyed by date.
pub type SlotSpan = BTreeMap<i64, SlotCounter>;

/// Scalar values keyed by date.
pub type DateSeries = BTreeMap<i64, f64>;

/// Per-dimension, per-date, per-value sums.
pub type CpvBreakdown = BTreeMap<CpvDimension, BTreeMap<i64, HashMap<String, f64>>>;

/// Channel, platform and version of the client that produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpvKey {
    pub channel: String,
    pub platform: String,
    pub version: String,
}

impl CpvKey {
    pub fn new(
        channel: impl Into<String>,
        platform: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self { channel: channel.into(), platform: platform.into(), version: version.into() }
    }

    /// Value of one dimension of the key.
    pub fn get(&self, dimension: CpvDimension) -> &str {
        match dimension {
            CpvDimension::Channel => &self.channel,
            CpvDimension::Platform => &self.platform,
            CpvDimension::Version => &self.version,
        }
    }
}

/// One axis of a CPV counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpvDimension {
    Channel,
    Platform,
    Version,
}

impl CpvDimension {
    pub const ALL: [CpvDimension; 3] =
        [CpvDimension::Channel, CpvDimension::Platform, CpvDimension::Version];

    pub fn as_str(&self) -> &'static str {
        match self {
            CpvDimension::Channel => "channel",
            CpvDimension::Platform => "platform",
            CpvDimension::Version => "version",
        }
    }
}

/// Storage shape of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Simple,
    Slot,
    Cpv,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Simple => "simple",
            MetricKind::Slot => "slot",
            MetricKind::Cpv => "cpv",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(MetricKind::Simple),
            "slot" => Ok(MetricKind::Slot),
            "cpv" => Ok(MetricKind::Cpv),
            other => Err(format!("unknown metric kind: {other}")),
        }
    }
}

/// Outcome of an insert-if-absent write.
///
/// Exactly one concurrent caller observes `already_existed == false` for a
/// given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub already_existed: bool,
}

impl UpsertOutcome {
    pub fn inserted() -> Self {
        Self { already_existed: false }
    }

    pub fn existed() -> Self {
        Self { already_existed: true }
    }

    /// True when this call created the record.
    pub fn was_inserted(&self) -> bool {
        !self.already_existed
    }
}

/// One row of the append-only open-app log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAppLogEntry {
    pub device_id: String,
    pub timestamp: i64,
    pub channel: String,
    pub platform: String,
    pub version: String,
    pub user_id: String,
}

/// Last-known attribution of a device. `created_at` is fixed at first sighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttribution {
    pub device_id: String,
    pub channel: String,
    pub platform: String,
    pub version: String,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Operator-declared metric that tenant clients may write to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomMetricDefinition {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default)]
    pub slots: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub versions: Vec<String>,
}

impl CustomMetricDefinition {
    /// Name under which the metric's counters are stored.
    pub fn storage_name(&self) -> String {
        custom_storage_name(&self.name)
    }
}

/// Maps an operator-facing metric name to its internal counter name.
pub fn custom_storage_name(name: &str) -> String {
    format!("{name}{CUSTOM_METRIC_SUFFIX}")
}
