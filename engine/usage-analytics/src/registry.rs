//! # Custom Metric Registry
//!
//! Operator-declared metrics that tenant clients may write to. A definition
//! fixes the metric's shape and, for slot and cpv metrics, the dimension
//! values clients are allowed to target.

use crate::error::{AnalyticsError, Result};
use crate::events::CustomCounterData;
use counter_store::date::days_before;
use counter_store::{
    custom_storage_name, AnalyticsStore, CustomMetricDefinition, MetricKind, StoreError,
    CUSTOM_METRIC_SUFFIX,
};
use serde::Serialize;
use std::sync::Arc;

/// A definition plus its counts for today and yesterday, computed on read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomMetricSummary {
    #[serde(flatten)]
    pub definition: CustomMetricDefinition,
    pub today_count: f64,
    pub yesterday_count: f64,
}

/// Check a definition against the rules of its kind
pub fn validate_definition(definition: &CustomMetricDefinition) -> Result<()> {
    if definition.name.trim().is_empty() || definition.display_name.trim().is_empty() {
        return Err(AnalyticsError::validation("name and displayName are required"));
    }
    match definition.kind {
        MetricKind::Simple => Ok(()),
        MetricKind::Slot if definition.slots.is_empty() => {
            Err(AnalyticsError::validation("slot metric must declare at least one slot"))
        }
        MetricKind::Cpv if definition.channels.is_empty() || definition.versions.is_empty() => {
            Err(AnalyticsError::validation(
                "cpv metric must declare at least one channel and one version",
            ))
        }
        MetricKind::Slot | MetricKind::Cpv => Ok(()),
    }
}

/// Simple and slot metrics live in the same slot counters.
fn slot_backed_sibling(kind: MetricKind) -> Option<MetricKind> {
    match kind {
        MetricKind::Simple => Some(MetricKind::Slot),
        MetricKind::Slot => Some(MetricKind::Simple),
        MetricKind::Cpv => None,
    }
}

/// Registry of custom metric definitions for every tenant
#[derive(Clone)]
pub struct MetricRegistry {
    store: Arc<dyn AnalyticsStore>,
}

impl MetricRegistry {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    /// Declare a new metric. Fails if one with the same name and kind exists,
    /// or if a simple and a slot metric would share the same counters.
    pub async fn define(&self, tenant: &str, definition: &CustomMetricDefinition) -> Result<()> {
        validate_definition(definition)?;

        let stored = CustomMetricDefinition {
            name: definition.storage_name(),
            ..definition.clone()
        };
        if let Some(sibling) = slot_backed_sibling(definition.kind) {
            if self.store.definition(tenant, &stored.name, sibling).await?.is_some() {
                return Err(AnalyticsError::validation(format!(
                    "{} metric {} already exists and shares its counters",
                    sibling, definition.name
                )));
            }
        }
        self.store.insert_definition(tenant, &stored).await.map_err(|err| match err {
            StoreError::AlreadyExists(_) => AnalyticsError::validation(format!(
                "{} metric {} already exists",
                definition.kind, definition.name
            )),
            other => other.into(),
        })?;

        tracing::info!(tenant, metric = %definition.name, kind = %definition.kind, "Defined custom metric");
        Ok(())
    }

    /// Look up one definition by operator-facing name
    pub async fn get(
        &self,
        tenant: &str,
        name: &str,
        kind: MetricKind,
    ) -> Result<CustomMetricDefinition> {
        self.store
            .definition(tenant, &custom_storage_name(name), kind)
            .await?
            .map(public_definition)
            .ok_or_else(|| AnalyticsError::not_found(format!("{kind} metric {name}")))
    }

    /// Every definition of the tenant with its counts for `today` and the day before
    pub async fn list(&self, tenant: &str, today: i64) -> Result<Vec<CustomMetricSummary>> {
        let yesterday = days_before(today, 1);
        let mut summaries = Vec::new();

        for stored in self.store.definitions(tenant).await? {
            let today_count = self.count(tenant, &stored, today).await?;
            let yesterday_count = self.count(tenant, &stored, yesterday).await?;
            summaries.push(CustomMetricSummary {
                definition: public_definition(stored),
                today_count,
                yesterday_count,
            });
        }
        Ok(summaries)
    }

    /// Remove a definition and every counter written under it
    pub async fn delete(&self, tenant: &str, name: &str, kind: MetricKind) -> Result<()> {
        let storage_name = custom_storage_name(name);
        if !self.store.remove_definition(tenant, &storage_name, kind).await? {
            return Err(AnalyticsError::not_found(format!("{kind} metric {name}")));
        }
        self.store.delete_metric(tenant, &storage_name, kind).await?;

        tracing::info!(tenant, metric = name, %kind, "Deleted custom metric and its counters");
        Ok(())
    }

    /// Apply a client write to a custom metric, enforcing its declaration.
    /// `data.metadata` must already be resolved.
    pub async fn record(&self, data: &CustomCounterData) -> Result<()> {
        let metadata = &data.metadata;
        let tenant = metadata.app_id.as_str();

        if !data.amount.is_finite() || data.amount < 0.0 {
            return Err(AnalyticsError::validation(format!(
                "custom counter amount must be a non-negative number, got {}",
                data.amount
            )));
        }

        let definition = self.get(tenant, &data.name, data.kind).await?;
        let metric = definition.storage_name();
        let date = metadata.date_timestamp;

        match data.kind {
            MetricKind::Simple => {
                self.store.add_simple(tenant, &metric, date, data.amount).await?;
            }
            MetricKind::Slot => {
                let declared = |slot: &&str| definition.slots.iter().any(|known| known == slot);
                let slot = data.slot.as_deref().filter(declared).ok_or_else(|| {
                    AnalyticsError::validation(format!(
                        "slot {:?} is not declared by metric {}",
                        data.slot, data.name
                    ))
                })?;
                self.store.add_slot(tenant, &metric, slot, date, data.amount).await?;
            }
            MetricKind::Cpv => {
                if !definition.channels.contains(&metadata.channel)
                    || !definition.versions.contains(&metadata.version)
                {
                    return Err(AnalyticsError::validation(format!(
                        "channel {} / version {} not declared by metric {}",
                        metadata.channel, metadata.version, data.name
                    )));
                }
                self.store
                    .add_cpv(tenant, &metric, &metadata.cpv_key(), date, data.amount)
                    .await?;
            }
        }

        tracing::debug!(tenant, metric = %data.name, amount = data.amount, "Recorded custom counter");
        Ok(())
    }

    async fn count(&self, tenant: &str, stored: &CustomMetricDefinition, date: i64) -> Result<f64> {
        let metric = &stored.name;
        let count = match stored.kind {
            MetricKind::Simple => self.store.sum_simple(tenant, metric, date, date).await?,
            MetricKind::Slot => {
                self.store.partial_slot_sum(tenant, metric, date, &stored.slots).await?
            }
            MetricKind::Cpv => self.store.sum_cpv_total(tenant, metric, date, date).await?,
        };
        Ok(count)
    }
}

fn public_definition(mut stored: CustomMetricDefinition) -> CustomMetricDefinition {
    if let Some(name) = stored.name.strip_suffix(CUSTOM_METRIC_SUFFIX) {
        stored.name = name.to_string();
    }
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventMetadata;
    use counter_store::date::SECONDS_PER_DAY;
    use counter_store::{CounterStore, DefinitionStore, MemoryStore};

    const TODAY: i64 = 1_710_028_800;

    fn definition(name: &str, kind: MetricKind) -> CustomMetricDefinition {
        CustomMetricDefinition {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            kind,
            slots: Vec::new(),
            channels: Vec::new(),
            versions: Vec::new(),
        }
    }

    fn write(name: &str, kind: MetricKind, slot: Option<&str>, date: i64) -> CustomCounterData {
        CustomCounterData {
            metadata: EventMetadata {
                app_id: "t".into(),
                device_id: "d1".into(),
                channel: "appstore".into(),
                platform: "ios".into(),
                version: "1.0".into(),
                user_id: String::new(),
                timestamp: date,
                date_timestamp: date,
            },
            name: name.to_string(),
            kind,
            slot: slot.map(str::to_string),
            amount: 1.0,
        }
    }

    fn setup() -> (Arc<MemoryStore>, MetricRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = MetricRegistry::new(store.clone());
        (store, registry)
    }

    #[test]
    fn test_definition_rules() {
        assert!(validate_definition(&definition("share", MetricKind::Simple)).is_ok());
        assert!(validate_definition(&definition("", MetricKind::Simple)).is_err());
        assert!(validate_definition(&definition("share", MetricKind::Slot)).is_err());

        let mut cpv = definition("pay", MetricKind::Cpv);
        cpv.channels = vec!["appstore".into()];
        assert!(validate_definition(&cpv).is_err());
        cpv.versions = vec!["1.0".into()];
        assert!(validate_definition(&cpv).is_ok());
    }

    #[tokio::test]
    async fn test_define_uses_suffixed_storage_name() {
        let (store, registry) = setup();
        registry.define("t", &definition("share", MetricKind::Simple)).await.unwrap();

        assert!(store
            .definition("t", "share__customized", MetricKind::Simple)
            .await
            .unwrap()
            .is_some());
        assert_eq!(registry.get("t", "share", MetricKind::Simple).await.unwrap().name, "share");

        let duplicate = registry.define("t", &definition("share", MetricKind::Simple)).await;
        assert!(matches!(duplicate, Err(AnalyticsError::Validation(_))));
    }

    #[tokio::test]
    async fn test_simple_and_slot_metrics_cannot_share_a_name() {
        let (store, registry) = setup();
        let mut share = definition("share", MetricKind::Slot);
        share.slots = vec!["qq".into()];
        registry.define("t", &share).await.unwrap();
        registry.record(&write("share", MetricKind::Slot, Some("qq"), TODAY)).await.unwrap();

        let clash = registry.define("t", &definition("share", MetricKind::Simple)).await;
        assert!(matches!(clash, Err(AnalyticsError::Validation(_))));
        assert!(matches!(
            registry.delete("t", "share", MetricKind::Simple).await,
            Err(AnalyticsError::NotFound(_))
        ));

        // the slot metric's counters survive
        let span = store.span_slot("t", "share__customized", TODAY, TODAY).await.unwrap();
        assert_eq!(span[&TODAY]["qq"], 1.0);

        // cpv counters are stored apart, so the name stays free for cpv
        let mut cpv = definition("share", MetricKind::Cpv);
        cpv.channels = vec!["appstore".into()];
        cpv.versions = vec!["1.0".into()];
        registry.define("t", &cpv).await.unwrap();
    }

    #[tokio::test]
    async fn test_slot_writes_are_gated_by_declared_slots() {
        let (store, registry) = setup();
        let mut share = definition("share", MetricKind::Slot);
        share.slots = vec!["wechat".into(), "qq".into()];
        registry.define("t", &share).await.unwrap();

        registry.record(&write("share", MetricKind::Slot, Some("qq"), TODAY)).await.unwrap();
        let undeclared = registry.record(&write("share", MetricKind::Slot, Some("sms"), TODAY)).await;
        assert!(matches!(undeclared, Err(AnalyticsError::Validation(_))));
        let missing = registry.record(&write("share", MetricKind::Slot, None, TODAY)).await;
        assert!(matches!(missing, Err(AnalyticsError::Validation(_))));

        let span = store.span_slot("t", "share__customized", TODAY, TODAY).await.unwrap();
        assert_eq!(span[&TODAY].len(), 1);
        assert_eq!(span[&TODAY]["qq"], 1.0);
    }

    #[tokio::test]
    async fn test_cpv_writes_are_gated_by_channel_and_version() {
        let (_store, registry) = setup();
        let mut pay = definition("pay", MetricKind::Cpv);
        pay.channels = vec!["appstore".into()];
        pay.versions = vec!["2.0".into()];
        registry.define("t", &pay).await.unwrap();

        let rejected = registry.record(&write("pay", MetricKind::Cpv, None, TODAY)).await;
        assert!(matches!(rejected, Err(AnalyticsError::Validation(_))));

        let mut accepted = write("pay", MetricKind::Cpv, None, TODAY);
        accepted.metadata.version = "2.0".into();
        registry.record(&accepted).await.unwrap();
    }

    #[tokio::test]
    async fn test_undefined_metric_is_not_found() {
        let (_store, registry) = setup();
        let result = registry.record(&write("ghost", MetricKind::Simple, None, TODAY)).await;
        assert!(matches!(result, Err(AnalyticsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_enriches_today_and_yesterday() {
        let (_store, registry) = setup();
        let yesterday = TODAY - SECONDS_PER_DAY;

        let mut share = definition("share", MetricKind::Slot);
        share.slots = vec!["qq".into()];
        registry.define("t", &share).await.unwrap();
        let mut pay = definition("pay", MetricKind::Cpv);
        pay.channels = vec!["appstore".into()];
        pay.versions = vec!["1.0".into()];
        registry.define("t", &pay).await.unwrap();

        registry.record(&write("share", MetricKind::Slot, Some("qq"), TODAY)).await.unwrap();
        registry.record(&write("share", MetricKind::Slot, Some("qq"), yesterday)).await.unwrap();
        registry.record(&write("share", MetricKind::Slot, Some("qq"), yesterday)).await.unwrap();
        registry.record(&write("pay", MetricKind::Cpv, None, TODAY)).await.unwrap();

        let summaries = registry.list("t", TODAY).await.unwrap();
        let by_name = |name: &str| {
            summaries.iter().find(|summary| summary.definition.name == name).cloned().unwrap()
        };
        assert_eq!(by_name("share").today_count, 1.0);
        assert_eq!(by_name("share").yesterday_count, 2.0);
        assert_eq!(by_name("pay").today_count, 1.0);
        assert_eq!(by_name("pay").yesterday_count, 0.0);
    }

    #[tokio::test]
    async fn test_delete_cascades_to_counters() {
        let (store, registry) = setup();
        registry.define("t", &definition("share", MetricKind::Simple)).await.unwrap();
        registry.record(&write("share", MetricKind::Simple, None, TODAY)).await.unwrap();

        registry.delete("t", "share", MetricKind::Simple).await.unwrap();
        assert_eq!(store.sum_simple("t", "share__customized", TODAY, TODAY).await.unwrap(), 0.0);
        assert!(matches!(
            registry.get("t", "share", MetricKind::Simple).await,
            Err(AnalyticsError::NotFound(_))
        ));
        assert!(matches!(
            registry.delete("t", "share", MetricKind::Simple).await,
            Err(AnalyticsError::NotFound(_))
        ));
    }
}
