//! Usage-time pipeline.

use super::StepLog;
use crate::error::{AnalyticsError, Result};
use crate::events::UsageTimeData;
use crate::metrics::{
    usage_time_slot, EACH_USAGE_TIME_DISTRIBUTION, MIN_USAGE_SECONDS, USAGE_COUNT,
    USAGE_TIME_TOTAL,
};
use counter_store::AnalyticsStore;
use std::sync::Arc;

/// Translates usage-time reports into counter writes
#[derive(Clone)]
pub struct UsagePipeline {
    store: Arc<dyn AnalyticsStore>,
}

impl UsagePipeline {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    /// Handle one resolved usage report. Returns `false` when the report was
    /// dropped as noise.
    pub async fn handle(&self, data: &UsageTimeData) -> Result<bool> {
        let metadata = &data.metadata;
        let tenant = metadata.app_id.as_str();
        let date = metadata.date_timestamp;
        let seconds = data.seconds;

        if seconds.is_infinite() {
            return Err(AnalyticsError::validation("usage seconds must be finite"));
        }
        // NaN fails the comparison and is dropped too
        if !(seconds >= MIN_USAGE_SECONDS) {
            tracing::debug!(tenant, device_id = %metadata.device_id, seconds, "Dropping short usage report");
            return Ok(false);
        }

        let mut steps = StepLog::new("usage_time", tenant, &metadata.device_id);
        let store = &self.store;

        steps.record(
            "device_usage",
            store.add_device_usage(tenant, &metadata.device_id, date, seconds).await,
        );
        steps.record(USAGE_COUNT, store.add_simple(tenant, USAGE_COUNT, date, 1.0).await);
        steps.record(USAGE_TIME_TOTAL, store.add_simple(tenant, USAGE_TIME_TOTAL, date, seconds).await);
        steps.record(
            EACH_USAGE_TIME_DISTRIBUTION,
            store
                .add_slot(tenant, EACH_USAGE_TIME_DISTRIBUTION, usage_time_slot(seconds), date, 1.0)
                .await,
        );

        steps.finish()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventMetadata;
    use counter_store::{ActivityStore, CounterStore, MemoryStore};

    const DATE: i64 = 1_710_000_000;

    fn report(device_id: &str, seconds: f64) -> UsageTimeData {
        UsageTimeData {
            metadata: EventMetadata {
                app_id: "app".into(),
                device_id: device_id.into(),
                channel: "c".into(),
                platform: "android".into(),
                version: "1".into(),
                user_id: String::new(),
                timestamp: DATE + 60,
                date_timestamp: DATE,
            },
            seconds,
        }
    }

    #[tokio::test]
    async fn test_usage_report_updates_counters() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = UsagePipeline::new(store.clone());

        assert!(pipeline.handle(&report("d1", 3.0)).await.unwrap());
        assert!(pipeline.handle(&report("d1", 1801.0)).await.unwrap());

        assert_eq!(store.sum_simple("app", USAGE_COUNT, DATE, DATE).await.unwrap(), 2.0);
        assert_eq!(store.sum_simple("app", USAGE_TIME_TOTAL, DATE, DATE).await.unwrap(), 1804.0);
        let span = store.span_slot("app", EACH_USAGE_TIME_DISTRIBUTION, DATE, DATE).await.unwrap();
        assert_eq!(span[&DATE]["1-3"], 1.0);
        assert_eq!(span[&DATE]["1800+"], 1.0);
        assert_eq!(store.device_usage("app", DATE).await.unwrap(), vec![1804.0]);
    }

    #[tokio::test]
    async fn test_short_reports_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = UsagePipeline::new(store.clone());

        assert!(!pipeline.handle(&report("d1", 0.09)).await.unwrap());
        assert!(!pipeline.handle(&report("d1", f64::NAN)).await.unwrap());
        assert!(pipeline.handle(&report("d1", f64::INFINITY)).await.is_err());

        assert_eq!(store.sum_simple("app", USAGE_COUNT, DATE, DATE).await.unwrap(), 0.0);
        assert!(store.device_usage("app", DATE).await.unwrap().is_empty());
    }
}
