//! Dashboard trend summary, composed from primitive counter reads.

use crate::error::Result;
use crate::metrics::{
    ACTIVE_USER_RETENTION, DAILY_ACTIVE_CPV, NEW_REGISTERED_USER_CPV, NEW_USER_CPV,
    NEW_USER_RETENTION,
};
use counter_store::date::{days_before, days_between, SECONDS_PER_DAY};
use counter_store::AnalyticsStore;
use serde::Serialize;

/// Slot of the retention counters read by the averages.
const NEXT_DAY_SLOT: &str = "1";

/// Headline numbers for the dashboard landing page
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSummary {
    /// New devices over the last 7 days
    pub new_user7: f64,
    /// New devices over the 7 days before that
    pub new_user14: f64,
    pub active_user7: f64,
    pub active_user14: f64,
    pub active_user30: f64,
    pub active_user60: f64,
    pub retention7: f64,
    pub retention14: f64,
    pub active_retention7: f64,
    pub active_retention14: f64,
    pub total_user: f64,
    pub total_registered_user: f64,
}

/// Mean next-day retention of new-device cohorts over `[start, end]`
pub async fn average_new_user_retention(
    store: &dyn AnalyticsStore,
    tenant: &str,
    start: i64,
    end: i64,
) -> Result<f64> {
    average_retention(store, tenant, NEW_USER_RETENTION, NEW_USER_CPV, start, end).await
}

/// Mean next-day retention of daily-active devices over `[start, end]`
pub async fn average_active_user_retention(
    store: &dyn AnalyticsStore,
    tenant: &str,
    start: i64,
    end: i64,
) -> Result<f64> {
    average_retention(store, tenant, ACTIVE_USER_RETENTION, DAILY_ACTIVE_CPV, start, end).await
}

/// Sum of `retention[d]["1"] / cohort[d]` over every date of the window,
/// divided by `end - start` in whole days (one less than the number of
/// dates). Days missing either term contribute nothing but still count in
/// the divisor. A single-date or inverted window yields zero.
async fn average_retention(
    store: &dyn AnalyticsStore,
    tenant: &str,
    retention_metric: &str,
    cohort_metric: &str,
    start: i64,
    end: i64,
) -> Result<f64> {
    let days = days_between(start, end);
    if days <= 0 {
        return Ok(0.0);
    }

    let retention = store.span_slot(tenant, retention_metric, start, end).await?;
    let cohorts = store.sum_cpv_by_date(tenant, cohort_metric, start, end).await?;

    let mut total = 0.0;
    let mut date = start;
    while date <= end {
        let retained = retention.get(&date).and_then(|slots| slots.get(NEXT_DAY_SLOT));
        let cohort = cohorts.get(&date).copied().unwrap_or(0.0);
        if let Some(retained) = retained {
            if cohort > 0.0 {
                total += retained / cohort;
            }
        }
        date += SECONDS_PER_DAY;
    }

    Ok(total / days as f64)
}

/// Build the trend summary relative to `today`. Windows end yesterday:
/// last 7 = `[today-7, today-1]`, previous 7 = `[today-14, today-8]`,
/// last 30 = `[today-30, today-1]`, previous 30 = `[today-60, today-31]`.
pub async fn trend_summary(
    store: &dyn AnalyticsStore,
    tenant: &str,
    today: i64,
) -> Result<TrendSummary> {
    let yesterday = days_before(today, 1);
    let (d7, d8, d14) = (days_before(today, 7), days_before(today, 8), days_before(today, 14));
    let (d30, d31, d60) = (days_before(today, 30), days_before(today, 31), days_before(today, 60));

    let (new_user7, new_user14, active_user7, active_user14, active_user30, active_user60) = tokio::try_join!(
        store.sum_cpv_total(tenant, NEW_USER_CPV, d7, yesterday),
        store.sum_cpv_total(tenant, NEW_USER_CPV, d14, d8),
        store.sum_cpv_total(tenant, DAILY_ACTIVE_CPV, d7, yesterday),
        store.sum_cpv_total(tenant, DAILY_ACTIVE_CPV, d14, d8),
        store.sum_cpv_total(tenant, DAILY_ACTIVE_CPV, d30, yesterday),
        store.sum_cpv_total(tenant, DAILY_ACTIVE_CPV, d60, d31),
    )?;

    let (retention7, retention14, active_retention7, active_retention14) = tokio::try_join!(
        average_new_user_retention(store, tenant, d7, yesterday),
        average_new_user_retention(store, tenant, d14, d8),
        average_active_user_retention(store, tenant, d7, yesterday),
        average_active_user_retention(store, tenant, d14, d8),
    )?;

    let (total_user, total_registered_user) = tokio::try_join!(
        store.sum_cpv_total(tenant, NEW_USER_CPV, 0, today),
        store.sum_cpv_total(tenant, NEW_REGISTERED_USER_CPV, 0, today),
    )?;

    Ok(TrendSummary {
        new_user7,
        new_user14,
        active_user7,
        active_user14,
        active_user30,
        active_user60,
        retention7,
        retention14,
        active_retention7,
        active_retention14,
        total_user,
        total_registered_user,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use counter_store::{CounterStore, CpvKey, MemoryStore};

    const TODAY: i64 = 1_710_028_800 + 30 * SECONDS_PER_DAY;

    fn key() -> CpvKey {
        CpvKey::new("appstore", "ios", "1.0")
    }

    #[tokio::test]
    async fn test_retention_divides_by_window_length() {
        let store = MemoryStore::new();
        let start = days_before(TODAY, 7);
        let end = days_before(TODAY, 1);

        // day 1: 2 of 4 retained; day 2: 3 of 3 retained; other days empty
        store.add_cpv("t", NEW_USER_CPV, &key(), start, 4.0).await.unwrap();
        store.add_slot("t", NEW_USER_RETENTION, "1", start, 2.0).await.unwrap();
        let second = start + SECONDS_PER_DAY;
        store.add_cpv("t", NEW_USER_CPV, &key(), second, 3.0).await.unwrap();
        store.add_slot("t", NEW_USER_RETENTION, "1", second, 3.0).await.unwrap();
        // retained without a cohort is skipped
        store.add_slot("t", NEW_USER_RETENTION, "1", end, 5.0).await.unwrap();

        let average = average_new_user_retention(&store, "t", start, end).await.unwrap();
        assert!((average - 1.5 / 6.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_single_contributing_day_over_seven_dates() {
        let store = MemoryStore::new();
        let start = days_before(TODAY, 7);
        let end = days_before(TODAY, 1);
        store.add_cpv("t", DAILY_ACTIVE_CPV, &key(), start, 2.0).await.unwrap();
        store.add_slot("t", ACTIVE_USER_RETENTION, "1", start, 2.0).await.unwrap();

        let average = average_active_user_retention(&store, "t", start, end).await.unwrap();
        assert!((average - 1.0 / 6.0).abs() < 1e-12);

        // one date spans zero whole days
        assert_eq!(average_active_user_retention(&store, "t", start, start).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_retention_of_empty_or_inverted_window_is_zero() {
        let store = MemoryStore::new();
        assert_eq!(average_active_user_retention(&store, "t", TODAY, TODAY).await.unwrap(), 0.0);
        assert_eq!(
            average_active_user_retention(&store, "t", TODAY, days_before(TODAY, 1))
                .await
                .unwrap(),
            0.0
        );
    }

    #[tokio::test]
    async fn test_trend_windows() {
        let store = MemoryStore::new();
        store.add_cpv("t", NEW_USER_CPV, &key(), days_before(TODAY, 1), 2.0).await.unwrap();
        store.add_cpv("t", NEW_USER_CPV, &key(), days_before(TODAY, 8), 5.0).await.unwrap();
        store.add_cpv("t", NEW_USER_CPV, &key(), TODAY, 1.0).await.unwrap();
        store.add_cpv("t", DAILY_ACTIVE_CPV, &key(), days_before(TODAY, 30), 6.0).await.unwrap();
        store.add_cpv("t", DAILY_ACTIVE_CPV, &key(), days_before(TODAY, 31), 7.0).await.unwrap();
        store.add_cpv("t", NEW_REGISTERED_USER_CPV, &key(), TODAY, 1.0).await.unwrap();

        let summary = trend_summary(&store, "t", TODAY).await.unwrap();
        assert_eq!(summary.new_user7, 2.0);
        assert_eq!(summary.new_user14, 5.0);
        assert_eq!(summary.active_user7, 0.0);
        assert_eq!(summary.active_user30, 6.0);
        assert_eq!(summary.active_user60, 7.0);
        assert_eq!(summary.total_user, 8.0);
        assert_eq!(summary.total_registered_user, 1.0);

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("newUser7").is_some());
        assert!(json.get("activeRetention14").is_some());
    }
}
