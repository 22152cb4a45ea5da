//! Open-app pipeline: device/user dedupe bookkeeping and every counter that
//! hangs off an app launch.

use super::StepLog;
use crate::error::Result;
use crate::events::EventMetadata;
use crate::metrics::{
    channel_active_user_retention, channel_new_user_retention, ACTIVE_USER_RETENTION,
    ACTIVE_USER_TIME_DISTRIBUTION, DAILY_ACTIVE_CPV, DAILY_ACTIVE_USER_FRESHNESS,
    FRESHNESS_CLAMP, NEW_REGISTERED_USER_CPV, NEW_USER_CPV, NEW_USER_RETENTION,
    NEW_USER_TIME_DISTRIBUTION, OPEN_APP_CPV, OPEN_APP_TIME_DISTRIBUTION, RETENTION_HORIZONS,
};
use chrono::FixedOffset;
use counter_store::date::{date_floor, days_before, days_between, hour_of_day};
use counter_store::{AnalyticsStore, DeviceAttribution, OpenAppLogEntry};
use std::sync::Arc;

/// Translates open-app events into counter writes
#[derive(Clone)]
pub struct OpenAppPipeline {
    store: Arc<dyn AnalyticsStore>,
    zone: FixedOffset,
}

impl OpenAppPipeline {
    pub fn new(store: Arc<dyn AnalyticsStore>, zone: FixedOffset) -> Self {
        Self { store, zone }
    }

    /// Handle one resolved open-app event.
    ///
    /// Counter failures are logged and the remaining steps still run; the
    /// attribution and activity upserts gate later steps, so their failures
    /// end the event early. The first failure is returned.
    pub async fn handle(&self, metadata: &EventMetadata) -> Result<()> {
        let tenant = metadata.app_id.as_str();
        let device_id = metadata.device_id.as_str();
        let date = metadata.date_timestamp;
        let hour = hour_of_day(metadata.timestamp, self.zone).to_string();
        let key = metadata.cpv_key();
        let store = &self.store;
        let mut steps = StepLog::new("open_app", tenant, device_id);

        tracing::debug!(tenant, device_id, date, "Handling open app event");

        let entry = OpenAppLogEntry {
            device_id: device_id.to_string(),
            timestamp: metadata.timestamp,
            channel: metadata.channel.clone(),
            platform: metadata.platform.clone(),
            version: metadata.version.clone(),
            user_id: metadata.user_id.clone(),
        };
        steps.record("append_open_app", store.append_open_app(tenant, &entry).await);
        steps.record(
            OPEN_APP_TIME_DISTRIBUTION,
            store.add_slot(tenant, OPEN_APP_TIME_DISTRIBUTION, &hour, date, 1.0).await,
        );
        steps.record(OPEN_APP_CPV, store.add_cpv(tenant, OPEN_APP_CPV, &key, date, 1.0).await);

        if !metadata.user_id.is_empty() {
            let registered = store.register_user_id(tenant, &metadata.user_id).await;
            if let Some(outcome) = steps.record("register_user_id", registered) {
                if outcome.was_inserted() {
                    tracing::debug!(tenant, user_id = %metadata.user_id, "Newly registered user");
                    steps.record(
                        NEW_REGISTERED_USER_CPV,
                        store.add_cpv(tenant, NEW_REGISTERED_USER_CPV, &key, date, 1.0).await,
                    );
                }
            }
        }

        let attribution = DeviceAttribution {
            device_id: device_id.to_string(),
            channel: metadata.channel.clone(),
            platform: metadata.platform.clone(),
            version: metadata.version.clone(),
            user_id: metadata.user_id.clone(),
            created_at: metadata.timestamp,
            updated_at: metadata.timestamp,
        };
        let attributed = store.upsert_attribution(tenant, &attribution).await;
        let Some(device) = steps.gate("upsert_attribution", attributed) else {
            return steps.finish();
        };
        if device.was_inserted() {
            tracing::debug!(tenant, device_id, "New device");
            steps.record(
                NEW_USER_TIME_DISTRIBUTION,
                store.add_slot(tenant, NEW_USER_TIME_DISTRIBUTION, &hour, date, 1.0).await,
            );
            steps.record(NEW_USER_CPV, store.add_cpv(tenant, NEW_USER_CPV, &key, date, 1.0).await);
        }

        let marked = store.mark_device_active(tenant, device_id, date).await;
        let Some(activity) = steps.gate("mark_device_active", marked) else {
            return steps.finish();
        };
        if activity.already_existed {
            return steps.finish();
        }

        tracing::debug!(tenant, device_id, "First open today");
        steps.record(DAILY_ACTIVE_CPV, store.add_cpv(tenant, DAILY_ACTIVE_CPV, &key, date, 1.0).await);
        steps.record(
            ACTIVE_USER_TIME_DISTRIBUTION,
            store.add_slot(tenant, ACTIVE_USER_TIME_DISTRIBUTION, &hour, date, 1.0).await,
        );

        let created_at = if device.was_inserted() {
            Some(metadata.timestamp)
        } else {
            steps
                .record("attribution", store.attribution(tenant, device_id).await)
                .map(|found| found.map_or(metadata.timestamp, |record| record.created_at))
        };
        if let Some(created_at) = created_at {
            let created_date = date_floor(created_at, self.zone);
            let delta = days_between(created_date, date);
            self.update_new_user_retention(&mut steps, metadata, created_date, delta).await;
            self.update_active_user_freshness(&mut steps, tenant, date, delta).await;
        }
        self.update_active_user_retention(&mut steps, metadata).await;

        steps.finish()
    }

    /// Credit the device's creation-date cohort when today is one of the
    /// tracked horizons after it.
    async fn update_new_user_retention(
        &self,
        steps: &mut StepLog<'_>,
        metadata: &EventMetadata,
        created_date: i64,
        delta: i64,
    ) {
        if !RETENTION_HORIZONS.contains(&delta) {
            return;
        }
        let tenant = metadata.app_id.as_str();
        let slot = delta.to_string();
        let channel_metric = channel_new_user_retention(&metadata.channel);

        steps.record(
            NEW_USER_RETENTION,
            self.store.add_slot(tenant, NEW_USER_RETENTION, &slot, created_date, 1.0).await,
        );
        steps.record(
            "channel_new_user_retention",
            self.store.add_slot(tenant, &channel_metric, &slot, created_date, 1.0).await,
        );
    }

    /// Backfill every horizon date on which this device was also active.
    async fn update_active_user_retention(
        &self,
        steps: &mut StepLog<'_>,
        metadata: &EventMetadata,
    ) {
        let tenant = metadata.app_id.as_str();
        let channel_metric = channel_active_user_retention(&metadata.channel);

        for horizon in RETENTION_HORIZONS {
            let past = days_before(metadata.date_timestamp, horizon);
            let active = self.store.was_device_active(tenant, &metadata.device_id, past).await;
            if steps.record("was_device_active", active) != Some(true) {
                continue;
            }
            let slot = horizon.to_string();
            steps.record(
                ACTIVE_USER_RETENTION,
                self.store.add_slot(tenant, ACTIVE_USER_RETENTION, &slot, past, 1.0).await,
            );
            steps.record(
                "channel_active_user_retention",
                self.store.add_slot(tenant, &channel_metric, &slot, past, 1.0).await,
            );
        }
    }

    /// Age of the device in days, anything past the last horizon in one slot.
    async fn update_active_user_freshness(
        &self,
        steps: &mut StepLog<'_>,
        tenant: &str,
        date: i64,
        delta: i64,
    ) {
        let slot = delta.clamp(0, FRESHNESS_CLAMP).to_string();
        steps.record(
            DAILY_ACTIVE_USER_FRESHNESS,
            self.store.add_slot(tenant, DAILY_ACTIVE_USER_FRESHNESS, &slot, date, 1.0).await,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::*;
    use counter_store::date::SECONDS_PER_DAY;
    use counter_store::{ActivityStore, CounterStore, MemoryStore};

    const TENANT: &str = "app";
    // 2024-03-10T00:00:00+08:00
    const DAY0: i64 = 1_710_000_000;

    fn zone() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn open(device_id: &str, timestamp: i64) -> EventMetadata {
        EventMetadata {
            app_id: TENANT.into(),
            device_id: device_id.into(),
            channel: "appstore".into(),
            platform: "ios".into(),
            version: "1.0".into(),
            user_id: format!("user-{device_id}"),
            timestamp,
            date_timestamp: 0,
        }
        .resolve(zone())
        .unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, OpenAppPipeline) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = OpenAppPipeline::new(store.clone(), zone());
        (store, pipeline)
    }

    async fn cpv_total(store: &MemoryStore, metric: &str, date: i64) -> f64 {
        store.sum_cpv_total(TENANT, metric, date, date).await.unwrap()
    }

    async fn slot(store: &MemoryStore, metric: &str, slot: &str, date: i64) -> Option<f64> {
        let span = store.span_slot(TENANT, metric, date, date).await.unwrap();
        span.get(&date).and_then(|slots| slots.get(slot)).copied()
    }

    #[test]
    fn test_day0_is_local_midnight() {
        assert_eq!(date_floor(DAY0, zone()), DAY0);
        assert_eq!(hour_of_day(DAY0 + 9 * 3600, zone()), 9);
    }

    #[tokio::test]
    async fn test_first_open_end_to_end() {
        let (store, pipeline) = setup();
        let event = open("D1", DAY0 + 9 * 3600);
        let date = event.date_timestamp;
        let hour = hour_of_day(event.timestamp, zone()).to_string();

        pipeline.handle(&event).await.unwrap();

        let log_rows = store.open_counts_by_device(TENANT, date, date + SECONDS_PER_DAY).await.unwrap();
        assert_eq!(log_rows, vec![1]);
        assert_eq!(slot(&store, OPEN_APP_TIME_DISTRIBUTION, &hour, date).await, Some(1.0));
        assert_eq!(cpv_total(&store, OPEN_APP_CPV, date).await, 1.0);
        assert_eq!(cpv_total(&store, NEW_REGISTERED_USER_CPV, date).await, 1.0);
        assert_eq!(cpv_total(&store, NEW_USER_CPV, date).await, 1.0);
        assert_eq!(cpv_total(&store, DAILY_ACTIVE_CPV, date).await, 1.0);
        assert_eq!(slot(&store, NEW_USER_TIME_DISTRIBUTION, &hour, date).await, Some(1.0));
        assert_eq!(slot(&store, ACTIVE_USER_TIME_DISTRIBUTION, &hour, date).await, Some(1.0));
        assert_eq!(slot(&store, NEW_USER_RETENTION, "0", date).await, None);
        assert_eq!(slot(&store, DAILY_ACTIVE_USER_FRESHNESS, "0", date).await, Some(1.0));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent_for_gated_counters() {
        let (store, pipeline) = setup();
        let event = open("D1", DAY0 + 9 * 3600);
        let date = event.date_timestamp;
        let hour = hour_of_day(event.timestamp, zone()).to_string();

        pipeline.handle(&event).await.unwrap();
        pipeline.handle(&event).await.unwrap();

        let log_rows = store.open_counts_by_device(TENANT, date, date + SECONDS_PER_DAY).await.unwrap();
        assert_eq!(log_rows, vec![2]);
        assert_eq!(slot(&store, OPEN_APP_TIME_DISTRIBUTION, &hour, date).await, Some(2.0));
        assert_eq!(cpv_total(&store, OPEN_APP_CPV, date).await, 2.0);
        assert_eq!(cpv_total(&store, NEW_REGISTERED_USER_CPV, date).await, 1.0);
        assert_eq!(cpv_total(&store, NEW_USER_CPV, date).await, 1.0);
        assert_eq!(cpv_total(&store, DAILY_ACTIVE_CPV, date).await, 1.0);
        assert_eq!(slot(&store, ACTIVE_USER_TIME_DISTRIBUTION, &hour, date).await, Some(1.0));
        assert_eq!(slot(&store, DAILY_ACTIVE_USER_FRESHNESS, "0", date).await, Some(1.0));
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_count_once() {
        let (store, pipeline) = setup();
        let event = open("D1", DAY0 + 3600);
        let date = event.date_timestamp;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pipeline = pipeline.clone();
                let event = event.clone();
                tokio::spawn(async move { pipeline.handle(&event).await })
            })
            .collect();
        for handle in futures::future::join_all(handles).await {
            handle.unwrap().unwrap();
        }

        assert_eq!(cpv_total(&store, OPEN_APP_CPV, date).await, 16.0);
        assert_eq!(cpv_total(&store, NEW_USER_CPV, date).await, 1.0);
        assert_eq!(cpv_total(&store, DAILY_ACTIVE_CPV, date).await, 1.0);
    }

    #[tokio::test]
    async fn test_retention_on_horizon_day() {
        let (store, pipeline) = setup();
        let first = open("D1", DAY0 + 3600);
        let cohort = first.date_timestamp;
        pipeline.handle(&first).await.unwrap();

        let week_later = open("D1", DAY0 + 7 * SECONDS_PER_DAY + 3600);
        pipeline.handle(&week_later).await.unwrap();

        assert_eq!(slot(&store, NEW_USER_RETENTION, "7", cohort).await, Some(1.0));
        assert_eq!(
            slot(&store, &channel_new_user_retention("appstore"), "7", cohort).await,
            Some(1.0)
        );
        // active seven days ago, so that day is confirmed retained
        assert_eq!(slot(&store, ACTIVE_USER_RETENTION, "7", cohort).await, Some(1.0));
        assert_eq!(
            slot(&store, &channel_active_user_retention("appstore"), "7", cohort).await,
            Some(1.0)
        );
        assert_eq!(
            slot(&store, DAILY_ACTIVE_USER_FRESHNESS, "7", week_later.date_timestamp).await,
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_day_31_skips_retention_and_clamps_freshness() {
        let (store, pipeline) = setup();
        let first = open("D1", DAY0 + 3600);
        let cohort = first.date_timestamp;
        pipeline.handle(&first).await.unwrap();

        let later = open("D1", DAY0 + 31 * SECONDS_PER_DAY + 3600);
        pipeline.handle(&later).await.unwrap();

        let span = store
            .span_slot(TENANT, NEW_USER_RETENTION, cohort, later.date_timestamp)
            .await
            .unwrap();
        assert!(span.is_empty());
        assert_eq!(slot(&store, DAILY_ACTIVE_USER_FRESHNESS, "31", later.date_timestamp).await, Some(1.0));
    }

    #[tokio::test]
    async fn test_day_between_horizons_writes_nothing() {
        let (store, pipeline) = setup();
        let first = open("D1", DAY0 + 3600);
        pipeline.handle(&first).await.unwrap();
        let later = open("D1", DAY0 + 10 * SECONDS_PER_DAY + 3600);
        pipeline.handle(&later).await.unwrap();

        let span = store
            .span_slot(TENANT, NEW_USER_RETENTION, first.date_timestamp, later.date_timestamp)
            .await
            .unwrap();
        assert!(span.is_empty());
        assert_eq!(slot(&store, DAILY_ACTIVE_USER_FRESHNESS, "10", later.date_timestamp).await, Some(1.0));
    }

    #[tokio::test]
    async fn test_empty_user_id_is_not_registered() {
        let (store, pipeline) = setup();
        let mut event = open("D1", DAY0 + 3600);
        event.user_id = String::new();
        pipeline.handle(&event).await.unwrap();
        assert_eq!(cpv_total(&store, NEW_REGISTERED_USER_CPV, event.date_timestamp).await, 0.0);
        assert_eq!(cpv_total(&store, NEW_USER_CPV, event.date_timestamp).await, 1.0);
    }

    #[tokio::test]
    async fn test_known_user_on_new_device() {
        let (store, pipeline) = setup();
        let first = open("D1", DAY0 + 3600);
        pipeline.handle(&first).await.unwrap();

        let mut second = open("D2", DAY0 + 7200);
        second.user_id = first.user_id.clone();
        pipeline.handle(&second).await.unwrap();

        let date = first.date_timestamp;
        assert_eq!(cpv_total(&store, NEW_REGISTERED_USER_CPV, date).await, 1.0);
        assert_eq!(cpv_total(&store, NEW_USER_CPV, date).await, 2.0);
        assert_eq!(cpv_total(&store, DAILY_ACTIVE_CPV, date).await, 2.0);
    }
}
