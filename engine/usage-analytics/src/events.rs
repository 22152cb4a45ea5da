//! # Event Definitions
//!
//! Typed events accepted by the ingestion pipeline. Each variant carries its
//! own payload shape; the serde tag is the event-type name used on the wire.

use crate::error::{AnalyticsError, Result};
use chrono::FixedOffset;
use counter_store::date::date_floor;
use counter_store::{CpvKey, MetricKind};
use serde::{Deserialize, Serialize};

pub const PLATFORM_IOS: &str = "ios";
pub const PLATFORM_ANDROID: &str = "android";

/// Client and device context attached to every client-originated event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub app_id: String,
    pub device_id: String,
    pub channel: String,
    pub platform: String,
    pub version: String,
    #[serde(default)]
    pub user_id: String,
    /// Event time, epoch seconds
    pub timestamp: i64,
    /// Day boundary of `timestamp`, filled in by [`EventMetadata::resolve`]
    #[serde(default)]
    pub date_timestamp: i64,
}

impl EventMetadata {
    /// Validate the metadata and normalise it for counting.
    ///
    /// The platform is lower-cased and must be `ios` or `android`;
    /// `date_timestamp` is always recomputed from `timestamp`.
    pub fn resolve(mut self, zone: FixedOffset) -> Result<Self> {
        for (field, value) in [
            ("appId", &self.app_id),
            ("deviceId", &self.device_id),
            ("channel", &self.channel),
            ("version", &self.version),
        ] {
            if value.trim().is_empty() {
                return Err(AnalyticsError::validation(format!("{field} must not be empty")));
            }
        }

        self.platform = self.platform.trim().to_lowercase();
        if self.platform != PLATFORM_IOS && self.platform != PLATFORM_ANDROID {
            return Err(AnalyticsError::validation(format!(
                "unsupported platform: {}",
                self.platform
            )));
        }

        self.date_timestamp = date_floor(self.timestamp, zone);
        Ok(self)
    }

    pub fn cpv_key(&self) -> CpvKey {
        CpvKey::new(self.channel.clone(), self.platform.clone(), self.version.clone())
    }
}

/// Reported foreground time of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageTimeData {
    pub metadata: EventMetadata,
    pub seconds: f64,
}

/// Client write to an operator-defined metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCounterData {
    pub metadata: EventMetadata,
    /// Operator-facing metric name, without the storage suffix
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default)]
    pub slot: Option<String>,
    pub amount: f64,
}

/// Scheduler trigger for the daily derived-metric job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyScheduleData {
    pub app_id: String,
    /// Date to compute, usually yesterday
    pub timestamp: i64,
}

/// Operator request to purge a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropTenantData {
    pub app_id: String,
}

/// Every event the pipeline handles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "EventUserOpenApp")]
    OpenApp(EventMetadata),
    #[serde(rename = "EventUsageTime")]
    UsageTime(UsageTimeData),
    #[serde(rename = "EventCustomCounter")]
    CustomCounter(CustomCounterData),
    #[serde(rename = "DailyScheduleEvent")]
    DailySchedule(DailyScheduleData),
    #[serde(rename = "GlobalEventDropData")]
    DropTenant(DropTenantData),
}

impl Event {
    /// Wire name of the event type
    pub fn name(&self) -> &'static str {
        match self {
            Event::OpenApp(_) => "EventUserOpenApp",
            Event::UsageTime(_) => "EventUsageTime",
            Event::CustomCounter(_) => "EventCustomCounter",
            Event::DailySchedule(_) => "DailyScheduleEvent",
            Event::DropTenant(_) => "GlobalEventDropData",
        }
    }

    /// Tenant the event belongs to
    pub fn tenant(&self) -> &str {
        match self {
            Event::OpenApp(metadata) => &metadata.app_id,
            Event::UsageTime(data) => &data.metadata.app_id,
            Event::CustomCounter(data) => &data.metadata.app_id,
            Event::DailySchedule(data) => &data.app_id,
            Event::DropTenant(data) => &data.app_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn metadata() -> EventMetadata {
        EventMetadata {
            app_id: "app".into(),
            device_id: "d1".into(),
            channel: "appstore".into(),
            platform: " iOS ".into(),
            version: "1.0.0".into(),
            user_id: String::new(),
            timestamp: 1_710_090_000,
            date_timestamp: 0,
        }
    }

    #[test]
    fn test_resolve_normalises_platform_and_date() {
        let resolved = metadata().resolve(zone()).unwrap();
        assert_eq!(resolved.platform, "ios");
        assert_eq!(resolved.date_timestamp, date_floor(1_710_090_000, zone()));
    }

    #[test]
    fn test_resolve_rejects_bad_metadata() {
        let mut bad = metadata();
        bad.device_id = String::new();
        assert!(matches!(bad.resolve(zone()), Err(AnalyticsError::Validation(_))));

        let mut bad = metadata();
        bad.platform = "windows".into();
        assert!(matches!(bad.resolve(zone()), Err(AnalyticsError::Validation(_))));
    }

    #[test]
    fn test_event_wire_format() {
        let json = r#"{
            "event": "EventUsageTime",
            "data": {
                "metadata": {
                    "appId": "app", "deviceId": "d1", "channel": "c",
                    "platform": "android", "version": "2", "timestamp": 100
                },
                "seconds": 12.5
            }
        }"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.name(), "EventUsageTime");
        assert_eq!(event.tenant(), "app");
        match event {
            Event::UsageTime(data) => assert_eq!(data.seconds, 12.5),
            other => panic!("unexpected event {other:?}"),
        }

        let drop: Event =
            serde_json::from_str(r#"{"event":"GlobalEventDropData","data":{"appId":"gone"}}"#)
                .unwrap();
        assert_eq!(drop, Event::DropTenant(DropTenantData { app_id: "gone".into() }));
    }
}
