//! # Query Engine
//!
//! Resolves dashboard query descriptors against the counter store. A request
//! is a batch of descriptors; every descriptor must resolve or the whole batch
//! fails.

use crate::error::{AnalyticsError, Result};
use counter_store::{
    custom_storage_name, AnalyticsStore, CpvBreakdown, DateSeries, MetricKind, SlotCounter,
    SlotSpan,
};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const CHANNEL_DATE_SUM: &str = "channelDateSum";

/// One counter read requested by the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub name: String,
    pub operator: String,
    pub start: i64,
    pub end: i64,
    /// Slots summed by the slot `sum` operator
    #[serde(default)]
    pub slots: Vec<String>,
    /// Read the operator-defined metric of this name instead of a built-in one
    #[serde(default)]
    pub customized: bool,
}

impl QueryDescriptor {
    fn storage_name(&self) -> String {
        if self.customized {
            custom_storage_name(&self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Parsed descriptor operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Sum,
    Span,
    DateCpv,
    DateSum,
    ChannelDateSum(String),
}

impl Operator {
    /// Parse an operator string for the given metric shape.
    ///
    /// `channelDateSum_<channel>` carries its channel after the first `_`.
    pub fn parse(kind: MetricKind, text: &str) -> Result<Self> {
        match kind {
            MetricKind::Simple | MetricKind::Slot => match text {
                "sum" => Ok(Operator::Sum),
                "span" => Ok(Operator::Span),
                _ => Err(AnalyticsError::bad_request(format!(
                    "{kind} counter only supports sum and span operators, got {text:?}"
                ))),
            },
            MetricKind::Cpv => match text.split_once('_') {
                Some((CHANNEL_DATE_SUM, channel)) if !channel.is_empty() => {
                    Ok(Operator::ChannelDateSum(channel.to_string()))
                }
                _ if text == CHANNEL_DATE_SUM || text.starts_with("channelDateSum_") => {
                    Err(AnalyticsError::bad_request("missing channel in channelDateSum operator"))
                }
                _ => match text {
                    "dateCPV" => Ok(Operator::DateCpv),
                    "dateSum" => Ok(Operator::DateSum),
                    _ => Err(AnalyticsError::bad_request(format!(
                        "cpv counter only supports dateCPV, dateSum and channelDateSum_<channel> \
                         operators, got {text:?}"
                    ))),
                },
            },
        }
    }
}

/// Result of one descriptor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryValue {
    Scalar(f64),
    Series(DateSeries),
    Slots(SlotCounter),
    Span(SlotSpan),
    Breakdown(CpvBreakdown),
}

/// Read-side dispatcher over the counter store
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn AnalyticsStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    /// Resolve a single descriptor
    pub async fn execute(&self, tenant: &str, descriptor: &QueryDescriptor) -> Result<QueryValue> {
        let operator = Operator::parse(descriptor.kind, &descriptor.operator)?;
        self.resolve(tenant, descriptor, operator).await
    }

    /// Resolve a batch keyed by descriptor name. Operators are checked before
    /// any read is issued; the first failure fails the batch.
    pub async fn execute_batch(
        &self,
        tenant: &str,
        descriptors: &[QueryDescriptor],
    ) -> Result<BTreeMap<String, QueryValue>> {
        let operators = descriptors
            .iter()
            .map(|descriptor| Operator::parse(descriptor.kind, &descriptor.operator))
            .collect::<Result<Vec<_>>>()?;

        let values = try_join_all(
            descriptors
                .iter()
                .zip(operators)
                .map(|(descriptor, operator)| self.resolve(tenant, descriptor, operator)),
        )
        .await?;

        tracing::debug!(tenant, descriptors = descriptors.len(), "Resolved query batch");
        Ok(descriptors.iter().map(|descriptor| descriptor.name.clone()).zip(values).collect())
    }

    async fn resolve(
        &self,
        tenant: &str,
        descriptor: &QueryDescriptor,
        operator: Operator,
    ) -> Result<QueryValue> {
        let metric = descriptor.storage_name();
        let (start, end) = (descriptor.start, descriptor.end);
        let store = &self.store;

        let value = match (descriptor.kind, operator) {
            (MetricKind::Simple, Operator::Sum) => {
                QueryValue::Scalar(store.sum_simple(tenant, &metric, start, end).await?)
            }
            (MetricKind::Simple, Operator::Span) => {
                QueryValue::Series(store.span_simple(tenant, &metric, start, end).await?)
            }
            (MetricKind::Slot, Operator::Span) => {
                QueryValue::Span(store.span_slot(tenant, &metric, start, end).await?)
            }
            (MetricKind::Slot, Operator::Sum) => QueryValue::Slots(
                store.sum_slot(tenant, &metric, start, end, &descriptor.slots).await?,
            ),
            (MetricKind::Cpv, Operator::DateCpv) => {
                QueryValue::Breakdown(store.breakdown_cpv(tenant, &metric, start, end).await?)
            }
            (MetricKind::Cpv, Operator::DateSum) => {
                QueryValue::Series(store.sum_cpv_by_date(tenant, &metric, start, end).await?)
            }
            (MetricKind::Cpv, Operator::ChannelDateSum(channel)) => QueryValue::Series(
                store.sum_cpv_by_date_and_channel(tenant, &metric, &channel, start, end).await?,
            ),
            (kind, operator) => {
                return Err(AnalyticsError::bad_request(format!(
                    "operator {operator:?} is not valid for {kind} counters"
                )))
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use counter_store::date::SECONDS_PER_DAY;
    use counter_store::{CounterStore, CpvDimension, CpvKey, MemoryStore};

    const DAY0: i64 = 1_710_028_800;
    const DAY1: i64 = DAY0 + SECONDS_PER_DAY;

    fn descriptor(kind: MetricKind, name: &str, operator: &str) -> QueryDescriptor {
        QueryDescriptor {
            kind,
            name: name.to_string(),
            operator: operator.to_string(),
            start: DAY0,
            end: DAY1,
            slots: Vec::new(),
            customized: false,
        }
    }

    async fn seeded() -> QueryEngine {
        let store = Arc::new(MemoryStore::new());
        store.add_simple("t", "dau", DAY0, 3.0).await.unwrap();
        store.add_simple("t", "dau", DAY1, 4.0).await.unwrap();
        store.add_slot("t", "hours", "9", DAY0, 2.0).await.unwrap();
        store.add_slot("t", "hours", "10", DAY1, 5.0).await.unwrap();
        let ios = CpvKey::new("appstore", "ios", "1.0");
        let android = CpvKey::new("xiaomi", "android", "1.0");
        store.add_cpv("t", "opens", &ios, DAY0, 1.0).await.unwrap();
        store.add_cpv("t", "opens", &android, DAY0, 2.0).await.unwrap();
        store.add_cpv("t", "opens", &android, DAY1, 3.0).await.unwrap();
        store.add_simple("t", "share__customized", DAY0, 9.0).await.unwrap();
        QueryEngine::new(store)
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!(Operator::parse(MetricKind::Simple, "sum").unwrap(), Operator::Sum);
        assert_eq!(Operator::parse(MetricKind::Cpv, "dateCPV").unwrap(), Operator::DateCpv);
        assert_eq!(
            Operator::parse(MetricKind::Cpv, "channelDateSum_huawei_cn").unwrap(),
            Operator::ChannelDateSum("huawei_cn".to_string())
        );
        assert!(Operator::parse(MetricKind::Cpv, "channelDateSum").is_err());
        assert!(Operator::parse(MetricKind::Cpv, "channelDateSum_").is_err());
        assert!(Operator::parse(MetricKind::Cpv, "sum").is_err());

        match Operator::parse(MetricKind::Simple, "dateCPV") {
            Err(AnalyticsError::BadRequest(msg)) => assert!(msg.contains("sum and span")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_resolves_every_shape() {
        let engine = seeded().await;
        let mut slot_sum = descriptor(MetricKind::Slot, "hours", "sum");
        slot_sum.slots = vec!["9".into(), "10".into()];
        let mut custom = descriptor(MetricKind::Simple, "share", "sum");
        custom.customized = true;

        let results = engine
            .execute_batch(
                "t",
                &[
                    descriptor(MetricKind::Simple, "dau", "sum"),
                    slot_sum,
                    descriptor(MetricKind::Cpv, "opens", "channelDateSum_xiaomi"),
                    custom,
                ],
            )
            .await
            .unwrap();

        assert_eq!(results["dau"], QueryValue::Scalar(7.0));
        match &results["hours"] {
            QueryValue::Slots(sums) => {
                assert_eq!(sums["9"], 2.0);
                assert_eq!(sums["10"], 5.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &results["opens"] {
            QueryValue::Series(series) => {
                assert_eq!(series[&DAY0], 2.0);
                assert_eq!(series[&DAY1], 3.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(results["share"], QueryValue::Scalar(9.0));
    }

    #[tokio::test]
    async fn test_breakdown_descriptor() {
        let engine = seeded().await;
        let value =
            engine.execute("t", &descriptor(MetricKind::Cpv, "opens", "dateCPV")).await.unwrap();
        match value {
            QueryValue::Breakdown(breakdown) => {
                assert_eq!(breakdown[&CpvDimension::Platform][&DAY0]["android"], 2.0);
                assert_eq!(breakdown[&CpvDimension::Channel][&DAY1]["xiaomi"], 3.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_descriptor_fails_whole_batch() {
        let engine = seeded().await;
        let result = engine
            .execute_batch(
                "t",
                &[
                    descriptor(MetricKind::Simple, "dau", "sum"),
                    descriptor(MetricKind::Cpv, "opens", "total"),
                ],
            )
            .await;
        assert!(matches!(result, Err(AnalyticsError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_missing_data_is_empty_not_error() {
        let engine = seeded().await;
        let value = engine
            .execute("other", &descriptor(MetricKind::Slot, "hours", "span"))
            .await
            .unwrap();
        assert_eq!(value, QueryValue::Span(SlotSpan::new()));
    }
}
