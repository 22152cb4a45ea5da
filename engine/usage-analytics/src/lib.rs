//! # Usage Analytics
//!
//! Ingests mobile-app usage events into the counter store and serves the
//! aggregated analytics behind the admin dashboard: active users, retention,
//! usage-time distributions, channel/platform/version breakdowns and
//! tenant-defined custom metrics.

pub mod cli;
pub mod config;
pub mod daily;
pub mod error;
pub mod events;
pub mod ingestion;
pub mod metrics;
pub mod query;
pub mod registry;
pub mod trend;

// Re-export main types for easy usage
pub use config::AnalyticsConfig;
pub use daily::{DailyJob, DailyReport};
pub use error::{AnalyticsError, Result};
pub use events::{Event, EventMetadata};
pub use ingestion::{Dispatcher, EventHandler, EventProcessor};
pub use query::{QueryDescriptor, QueryEngine, QueryValue};
pub use registry::{CustomMetricSummary, MetricRegistry};
pub use trend::TrendSummary;

use chrono::FixedOffset;
use counter_store::date::today;
use counter_store::AnalyticsStore;
use std::sync::Arc;

/// Initialize the engine with the given configuration
pub async fn init_analytics(config: AnalyticsConfig) -> Result<AnalyticsEngine> {
    config.validate()?;
    tracing::info!(
        backend = ?config.storage.backend,
        utc_offset_secs = config.time.utc_offset_secs,
        "Initializing usage analytics engine"
    );

    let store = counter_store::connect(&config.storage).await?;
    AnalyticsEngine::with_store(config, store)
}

/// Wiring of every analytics component over one shared store
#[derive(Clone)]
pub struct AnalyticsEngine {
    pub config: AnalyticsConfig,
    pub store: Arc<dyn AnalyticsStore>,
    pub zone: FixedOffset,
    pub query_engine: QueryEngine,
    pub registry: MetricRegistry,
    pub processor: Arc<EventProcessor>,
    pub daily: DailyJob,
}

impl AnalyticsEngine {
    /// Build the engine over an already opened store
    pub fn with_store(config: AnalyticsConfig, store: Arc<dyn AnalyticsStore>) -> Result<Self> {
        let zone = config.zone()?;
        Ok(Self {
            query_engine: QueryEngine::new(store.clone()),
            registry: MetricRegistry::new(store.clone()),
            processor: Arc::new(EventProcessor::new(store.clone(), zone)),
            daily: DailyJob::new(store.clone()),
            store,
            zone,
            config,
        })
    }

    /// Start a local dispatcher feeding this engine's processor
    pub fn start_dispatcher(&self) -> Result<Dispatcher> {
        Dispatcher::spawn(self.processor.clone(), &self.config.ingestion)
    }

    /// Handle one event inline, bypassing the dispatcher
    pub async fn ingest(&self, event: Event) -> Result<()> {
        self.processor.handle(event).await
    }

    /// Trend summary relative to `today`, or the current day when `None`
    pub async fn trend(&self, tenant: &str, today: Option<i64>) -> Result<TrendSummary> {
        let today = today.unwrap_or_else(|| self.today());
        trend::trend_summary(self.store.as_ref(), tenant, today).await
    }

    /// Current day boundary in the configured zone
    pub fn today(&self) -> i64 {
        today(self.zone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DailyScheduleData, EventMetadata};
    use counter_store::date::SECONDS_PER_DAY;
    use counter_store::MetricKind;

    // 2024-03-10T00:00:00+08:00
    const DAY0: i64 = 1_710_000_000;

    fn open(device_id: &str, timestamp: i64) -> Event {
        Event::OpenApp(EventMetadata {
            app_id: "app".into(),
            device_id: device_id.into(),
            channel: "huawei".into(),
            platform: "android".into(),
            version: "3.1".into(),
            user_id: String::new(),
            timestamp,
            date_timestamp: 0,
        })
    }

    #[tokio::test]
    async fn test_engine_end_to_end() {
        let engine = init_analytics(AnalyticsConfig::default()).await.unwrap();

        engine.ingest(open("d1", DAY0 + 3600)).await.unwrap();
        engine.ingest(open("d2", DAY0 + 7200)).await.unwrap();
        engine.ingest(open("d1", DAY0 + SECONDS_PER_DAY + 3600)).await.unwrap();
        engine
            .ingest(Event::DailySchedule(DailyScheduleData { app_id: "app".into(), timestamp: DAY0 }))
            .await
            .unwrap();

        let today = DAY0 + 2 * SECONDS_PER_DAY;
        let summary = engine.trend("app", Some(today)).await.unwrap();
        assert_eq!(summary.new_user7, 2.0);
        assert_eq!(summary.active_user7, 3.0);
        assert_eq!(summary.total_user, 2.0);

        let descriptors = vec![QueryDescriptor {
            kind: MetricKind::Cpv,
            name: metrics::DAILY_ACTIVE_CPV.to_string(),
            operator: "channelDateSum_huawei".to_string(),
            start: DAY0,
            end: today,
            slots: Vec::new(),
            customized: false,
        }];
        let results = engine.query_engine.execute_batch("app", &descriptors).await.unwrap();
        match &results[metrics::DAILY_ACTIVE_CPV] {
            QueryValue::Series(series) => {
                assert_eq!(series[&DAY0], 2.0);
                assert_eq!(series[&(DAY0 + SECONDS_PER_DAY)], 1.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatcher_from_engine() {
        let engine = init_analytics(AnalyticsConfig::default()).await.unwrap();
        let dispatcher = engine.start_dispatcher().unwrap();
        dispatcher.publish(open("d1", DAY0 + 60)).await.unwrap();
        dispatcher.shutdown().await;

        let summary = engine.trend("app", Some(DAY0 + SECONDS_PER_DAY)).await.unwrap();
        assert_eq!(summary.active_user7, 1.0);
    }
}
