//! In-memory store backend (for testing and local runs).
//!
//! Each `(tenant, metric)` pair owns one dashmap entry; increments hold the
//! shard lock for the whole read-modify-write, which makes them atomic per key.

use crate::backend::{ActivityStore, CounterStore, DefinitionStore};
use crate::error::{Result, StoreError};
use crate::types::{
    CpvBreakdown, CpvDimension, CpvKey, CustomMetricDefinition, DateSeries, DeviceAttribution,
    MetricKind, OpenAppLogEntry, SlotCounter, SlotSpan, UpsertOutcome,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};

type TenantKey = (String, String);

/// Dashmap-backed implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot_counters: DashMap<TenantKey, BTreeMap<i64, SlotCounter>>,
    cpv_counters: DashMap<TenantKey, BTreeMap<i64, HashMap<CpvKey, f64>>>,
    open_app_log: DashMap<String, Vec<OpenAppLogEntry>>,
    registered_users: DashMap<TenantKey, ()>,
    attributions: DashMap<TenantKey, DeviceAttribution>,
    device_activity: DashMap<(String, String, i64), ()>,
    device_usage: DashMap<(String, i64), HashMap<String, f64>>,
    definitions: DashMap<(String, String, MetricKind), CustomMetricDefinition>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tenant: &str, name: &str) -> TenantKey {
        (tenant.to_string(), name.to_string())
    }

    fn cpv_fold<F>(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
        mut visit: F,
    ) where
        F: FnMut(i64, &CpvKey, f64),
    {
        if start > end {
            return;
        }
        if let Some(dates) = self.cpv_counters.get(&Self::key(tenant, metric)) {
            for (date, cells) in dates.range(start..=end) {
                for (key, value) in cells {
                    visit(*date, key, *value);
                }
            }
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn add_slot(
        &self,
        tenant: &str,
        metric: &str,
        slot: &str,
        date: i64,
        amount: f64,
    ) -> Result<()> {
        let mut dates = self.slot_counters.entry(Self::key(tenant, metric)).or_default();
        *dates.entry(date).or_default().entry(slot.to_string()).or_insert(0.0) += amount;
        Ok(())
    }

    async fn set_slot(
        &self,
        tenant: &str,
        metric: &str,
        slot: &str,
        date: i64,
        value: f64,
    ) -> Result<()> {
        let mut dates = self.slot_counters.entry(Self::key(tenant, metric)).or_default();
        dates.entry(date).or_default().insert(slot.to_string(), value);
        Ok(())
    }

    async fn span_slot(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<SlotSpan> {
        if start > end {
            return Ok(SlotSpan::new());
        }
        Ok(self
            .slot_counters
            .get(&Self::key(tenant, metric))
            .map(|dates| {
                dates.range(start..=end).map(|(date, counter)| (*date, counter.clone())).collect()
            })
            .unwrap_or_default())
    }

    async fn sum_slot(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
        slots: &[String],
    ) -> Result<SlotCounter> {
        let mut sums = SlotCounter::new();
        if start > end || slots.is_empty() {
            return Ok(sums);
        }
        if let Some(dates) = self.slot_counters.get(&Self::key(tenant, metric)) {
            for counter in dates.range(start..=end).map(|(_, counter)| counter) {
                for slot in slots {
                    if let Some(value) = counter.get(slot) {
                        *sums.entry(slot.clone()).or_insert(0.0) += value;
                    }
                }
            }
        }
        Ok(sums)
    }

    async fn add_cpv(
        &self,
        tenant: &str,
        metric: &str,
        key: &CpvKey,
        date: i64,
        amount: f64,
    ) -> Result<()> {
        let mut dates = self.cpv_counters.entry(Self::key(tenant, metric)).or_default();
        *dates.entry(date).or_default().entry(key.clone()).or_insert(0.0) += amount;
        Ok(())
    }

    async fn set_cpv(
        &self,
        tenant: &str,
        metric: &str,
        key: &CpvKey,
        date: i64,
        value: f64,
    ) -> Result<()> {
        let mut dates = self.cpv_counters.entry(Self::key(tenant, metric)).or_default();
        dates.entry(date).or_default().insert(key.clone(), value);
        Ok(())
    }

    async fn sum_cpv_total(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<f64> {
        let mut total = 0.0;
        self.cpv_fold(tenant, metric, start, end, |_, _, value| total += value);
        Ok(total)
    }

    async fn sum_cpv_by_date(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<DateSeries> {
        let mut series = DateSeries::new();
        self.cpv_fold(tenant, metric, start, end, |date, _, value| {
            *series.entry(date).or_insert(0.0) += value;
        });
        Ok(series)
    }

    async fn sum_cpv_by_date_and_channel(
        &self,
        tenant: &str,
        metric: &str,
        channel: &str,
        start: i64,
        end: i64,
    ) -> Result<DateSeries> {
        let mut series = DateSeries::new();
        self.cpv_fold(tenant, metric, start, end, |date, key, value| {
            if key.channel == channel {
                *series.entry(date).or_insert(0.0) += value;
            }
        });
        Ok(series)
    }

    async fn breakdown_cpv(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<CpvBreakdown> {
        let mut breakdown = CpvBreakdown::new();
        for dimension in CpvDimension::ALL {
            breakdown.insert(dimension, BTreeMap::new());
        }
        self.cpv_fold(tenant, metric, start, end, |date, key, value| {
            for dimension in CpvDimension::ALL {
                if let Some(per_date) = breakdown.get_mut(&dimension) {
                    *per_date
                        .entry(date)
                        .or_default()
                        .entry(key.get(dimension).to_string())
                        .or_insert(0.0) += value;
                }
            }
        });
        Ok(breakdown)
    }

    async fn delete_metric(&self, tenant: &str, metric: &str, kind: MetricKind) -> Result<()> {
        let key = Self::key(tenant, metric);
        match kind {
            MetricKind::Simple | MetricKind::Slot => {
                self.slot_counters.remove(&key);
            }
            MetricKind::Cpv => {
                self.cpv_counters.remove(&key);
            }
        }
        Ok(())
    }

    async fn drop_counters(&self, tenant: &str) -> Result<()> {
        self.slot_counters.retain(|(owner, _), _| owner != tenant);
        self.cpv_counters.retain(|(owner, _), _| owner != tenant);
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn append_open_app(&self, tenant: &str, entry: &OpenAppLogEntry) -> Result<()> {
        self.open_app_log.entry(tenant.to_string()).or_default().push(entry.clone());
        Ok(())
    }

    async fn register_user_id(&self, tenant: &str, user_id: &str) -> Result<UpsertOutcome> {
        Ok(match self.registered_users.entry(Self::key(tenant, user_id)) {
            Entry::Occupied(_) => UpsertOutcome::existed(),
            Entry::Vacant(slot) => {
                slot.insert(());
                UpsertOutcome::inserted()
            }
        })
    }

    async fn upsert_attribution(
        &self,
        tenant: &str,
        attribution: &DeviceAttribution,
    ) -> Result<UpsertOutcome> {
        Ok(match self.attributions.entry(Self::key(tenant, &attribution.device_id)) {
            Entry::Occupied(mut existing) => {
                let record = existing.get_mut();
                record.channel = attribution.channel.clone();
                record.platform = attribution.platform.clone();
                record.version = attribution.version.clone();
                record.user_id = attribution.user_id.clone();
                record.updated_at = attribution.updated_at;
                UpsertOutcome::existed()
            }
            Entry::Vacant(slot) => {
                slot.insert(attribution.clone());
                UpsertOutcome::inserted()
            }
        })
    }

    async fn attribution(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<DeviceAttribution>> {
        Ok(self.attributions.get(&Self::key(tenant, device_id)).map(|record| record.clone()))
    }

    async fn mark_device_active(
        &self,
        tenant: &str,
        device_id: &str,
        date: i64,
    ) -> Result<UpsertOutcome> {
        let key = (tenant.to_string(), device_id.to_string(), date);
        Ok(match self.device_activity.entry(key) {
            Entry::Occupied(_) => UpsertOutcome::existed(),
            Entry::Vacant(slot) => {
                slot.insert(());
                UpsertOutcome::inserted()
            }
        })
    }

    async fn was_device_active(&self, tenant: &str, device_id: &str, date: i64) -> Result<bool> {
        let key = (tenant.to_string(), device_id.to_string(), date);
        Ok(self.device_activity.contains_key(&key))
    }

    async fn unique_active_devices(&self, tenant: &str, start: i64, end: i64) -> Result<u64> {
        let devices: HashSet<String> = self
            .device_activity
            .iter()
            .filter(|record| {
                let (owner, _, date) = record.key();
                owner == tenant && *date >= start && *date <= end
            })
            .map(|record| record.key().1.clone())
            .collect();
        Ok(devices.len() as u64)
    }

    async fn open_counts_by_device(
        &self,
        tenant: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<u64>> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        if let Some(log) = self.open_app_log.get(tenant) {
            for entry in log.iter().filter(|e| e.timestamp >= start && e.timestamp < end) {
                *counts.entry(entry.device_id.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts.into_values().collect())
    }

    async fn add_device_usage(
        &self,
        tenant: &str,
        device_id: &str,
        date: i64,
        seconds: f64,
    ) -> Result<()> {
        let mut devices = self.device_usage.entry((tenant.to_string(), date)).or_default();
        *devices.entry(device_id.to_string()).or_insert(0.0) += seconds;
        Ok(())
    }

    async fn device_usage(&self, tenant: &str, date: i64) -> Result<Vec<f64>> {
        Ok(self
            .device_usage
            .get(&(tenant.to_string(), date))
            .map(|devices| devices.values().copied().collect())
            .unwrap_or_default())
    }

    async fn drop_activity(&self, tenant: &str) -> Result<()> {
        self.open_app_log.remove(tenant);
        self.registered_users.retain(|(owner, _), _| owner != tenant);
        self.attributions.retain(|(owner, _), _| owner != tenant);
        self.device_activity.retain(|(owner, _, _), _| owner != tenant);
        self.device_usage.retain(|(owner, _), _| owner != tenant);
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn insert_definition(
        &self,
        tenant: &str,
        definition: &CustomMetricDefinition,
    ) -> Result<()> {
        let key = (tenant.to_string(), definition.name.clone(), definition.kind);
        match self.definitions.entry(key) {
            Entry::Occupied(_) => Err(StoreError::already_exists(format!(
                "{} metric {}",
                definition.kind, definition.name
            ))),
            Entry::Vacant(slot) => {
                slot.insert(definition.clone());
                Ok(())
            }
        }
    }

    async fn definitions(&self, tenant: &str) -> Result<Vec<CustomMetricDefinition>> {
        let mut found: Vec<CustomMetricDefinition> = self
            .definitions
            .iter()
            .filter(|record| record.key().0 == tenant)
            .map(|record| record.value().clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn definition(
        &self,
        tenant: &str,
        name: &str,
        kind: MetricKind,
    ) -> Result<Option<CustomMetricDefinition>> {
        let key = (tenant.to_string(), name.to_string(), kind);
        Ok(self.definitions.get(&key).map(|record| record.clone()))
    }

    async fn remove_definition(
        &self,
        tenant: &str,
        name: &str,
        kind: MetricKind,
    ) -> Result<bool> {
        let key = (tenant.to_string(), name.to_string(), kind);
        Ok(self.definitions.remove(&key).is_some())
    }

    async fn drop_definitions(&self, tenant: &str) -> Result<()> {
        self.definitions.retain(|(owner, _, _), _| owner != tenant);
        Ok(())
    }
}
