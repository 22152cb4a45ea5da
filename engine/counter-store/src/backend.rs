//! Store traits implemented by every backend.
//!
//! All operations take the tenant id first. Date arguments are day-boundary
//! keys produced by [`crate::date::date_floor`]; ranges are inclusive on both
//! ends unless stated otherwise. Missing data is never an error: reads return
//! zero or empty maps.

use crate::error::Result;
use crate::types::{
    CpvBreakdown, CpvKey, CustomMetricDefinition, DateSeries, DeviceAttribution, MetricKind,
    OpenAppLogEntry, SlotCounter, SlotSpan, UpsertOutcome, SIMPLE_COUNTER_SLOT,
};
use async_trait::async_trait;

/// Durable, atomically incrementable accumulators.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `amount` to one slot, creating it if absent.
    async fn add_slot(
        &self,
        tenant: &str,
        metric: &str,
        slot: &str,
        date: i64,
        amount: f64,
    ) -> Result<()>;

    /// Overwrite one slot. Reserved for idempotent batch recomputation.
    async fn set_slot(
        &self,
        tenant: &str,
        metric: &str,
        slot: &str,
        date: i64,
        value: f64,
    ) -> Result<()>;

    /// Every slot of every date in `[start, end]`.
    async fn span_slot(&self, tenant: &str, metric: &str, start: i64, end: i64)
        -> Result<SlotSpan>;

    /// Per-slot totals over `[start, end]` for the requested slots. Slots with
    /// no data in the range are absent from the result.
    async fn sum_slot(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
        slots: &[String],
    ) -> Result<SlotCounter>;

    /// Sum of a subset of slots on a single date.
    async fn partial_slot_sum(
        &self,
        tenant: &str,
        metric: &str,
        date: i64,
        slots: &[String],
    ) -> Result<f64> {
        let span = self.span_slot(tenant, metric, date, date).await?;
        Ok(span
            .get(&date)
            .map(|counter| slots.iter().filter_map(|slot| counter.get(slot)).sum())
            .unwrap_or(0.0))
    }

    async fn add_simple(&self, tenant: &str, metric: &str, date: i64, amount: f64) -> Result<()> {
        self.add_slot(tenant, metric, SIMPLE_COUNTER_SLOT, date, amount).await
    }

    async fn set_simple(&self, tenant: &str, metric: &str, date: i64, value: f64) -> Result<()> {
        self.set_slot(tenant, metric, SIMPLE_COUNTER_SLOT, date, value).await
    }

    /// Scalar total over `[start, end]`.
    async fn sum_simple(&self, tenant: &str, metric: &str, start: i64, end: i64) -> Result<f64> {
        let slots = [SIMPLE_COUNTER_SLOT.to_string()];
        let sums = self.sum_slot(tenant, metric, start, end, &slots).await?;
        Ok(sums.get(SIMPLE_COUNTER_SLOT).copied().unwrap_or(0.0))
    }

    /// Per-date values over `[start, end]`.
    async fn span_simple(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<DateSeries> {
        let span = self.span_slot(tenant, metric, start, end).await?;
        Ok(span
            .into_iter()
            .filter_map(|(date, counter)| {
                counter.get(SIMPLE_COUNTER_SLOT).map(|value| (date, *value))
            })
            .collect())
    }

    /// Atomically add `amount` to one channel/platform/version cell.
    async fn add_cpv(
        &self,
        tenant: &str,
        metric: &str,
        key: &CpvKey,
        date: i64,
        amount: f64,
    ) -> Result<()>;

    /// Overwrite one channel/platform/version cell.
    async fn set_cpv(
        &self,
        tenant: &str,
        metric: &str,
        key: &CpvKey,
        date: i64,
        value: f64,
    ) -> Result<()>;

    /// Everything summed to one scalar.
    async fn sum_cpv_total(&self, tenant: &str, metric: &str, start: i64, end: i64)
        -> Result<f64>;

    /// Per-date sums over all channels, platforms and versions.
    async fn sum_cpv_by_date(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<DateSeries>;

    /// Per-date sums restricted to one channel.
    async fn sum_cpv_by_date_and_channel(
        &self,
        tenant: &str,
        metric: &str,
        channel: &str,
        start: i64,
        end: i64,
    ) -> Result<DateSeries>;

    /// Three independent group-bys, one per dimension, each summing over the
    /// other two.
    async fn breakdown_cpv(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<CpvBreakdown>;

    /// Deletes every counter of one metric.
    async fn delete_metric(&self, tenant: &str, metric: &str, kind: MetricKind) -> Result<()>;

    /// Deletes every counter of the tenant.
    async fn drop_counters(&self, tenant: &str) -> Result<()>;
}

/// Raw logs and presence records written by the ingestion pipeline.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Appends one open-app log row.
    async fn append_open_app(&self, tenant: &str, entry: &OpenAppLogEntry) -> Result<()>;

    /// Records a user id; the outcome tells whether it was seen before.
    async fn register_user_id(&self, tenant: &str, user_id: &str) -> Result<UpsertOutcome>;

    /// Upserts the device attribution. `created_at` is only written on insert;
    /// every other field is last-write-wins.
    async fn upsert_attribution(
        &self,
        tenant: &str,
        attribution: &DeviceAttribution,
    ) -> Result<UpsertOutcome>;

    async fn attribution(&self, tenant: &str, device_id: &str)
        -> Result<Option<DeviceAttribution>>;

    /// Insert-if-absent of the `(device, date)` presence marker.
    async fn mark_device_active(
        &self,
        tenant: &str,
        device_id: &str,
        date: i64,
    ) -> Result<UpsertOutcome>;

    async fn was_device_active(&self, tenant: &str, device_id: &str, date: i64) -> Result<bool>;

    /// Distinct devices with an activity marker dated in `[start, end]`.
    async fn unique_active_devices(&self, tenant: &str, start: i64, end: i64) -> Result<u64>;

    /// Open-app log rows per device with `start <= timestamp < end`.
    async fn open_counts_by_device(&self, tenant: &str, start: i64, end: i64)
        -> Result<Vec<u64>>;

    /// Atomically adds to the per-device usage-time accumulator of one date.
    async fn add_device_usage(
        &self,
        tenant: &str,
        device_id: &str,
        date: i64,
        seconds: f64,
    ) -> Result<()>;

    /// Accumulated seconds of every device that reported usage on `date`.
    async fn device_usage(&self, tenant: &str, date: i64) -> Result<Vec<f64>>;

    /// Deletes every log and presence record of the tenant.
    async fn drop_activity(&self, tenant: &str) -> Result<()>;
}

/// Persistence of operator-declared custom metrics. Definitions are stored
/// under their suffixed storage name.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Fails with `AlreadyExists` when a definition with the same name and
    /// kind is present.
    async fn insert_definition(&self, tenant: &str, definition: &CustomMetricDefinition)
        -> Result<()>;

    async fn definitions(&self, tenant: &str) -> Result<Vec<CustomMetricDefinition>>;

    async fn definition(
        &self,
        tenant: &str,
        name: &str,
        kind: MetricKind,
    ) -> Result<Option<CustomMetricDefinition>>;

    /// Returns whether a definition was removed.
    async fn remove_definition(&self, tenant: &str, name: &str, kind: MetricKind)
        -> Result<bool>;

    async fn drop_definitions(&self, tenant: &str) -> Result<()>;
}

/// Everything the analytics engine needs from storage.
#[async_trait]
pub trait AnalyticsStore: CounterStore + ActivityStore + DefinitionStore {
    /// Irreversibly deletes all counters, logs, presence records and
    /// definitions of the tenant.
    async fn drop_tenant(&self, tenant: &str) -> Result<()> {
        self.drop_counters(tenant).await?;
        self.drop_activity(tenant).await?;
        self.drop_definitions(tenant).await?;
        tracing::info!(tenant, "Dropped all tenant data");
        Ok(())
    }
}

impl<T> AnalyticsStore for T where T: CounterStore + ActivityStore + DefinitionStore {}
