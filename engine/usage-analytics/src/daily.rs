//! # Daily Derived-Metric Job
//!
//! Once per tenant per day, recompute the metrics that need a full day of raw
//! events. Every write overwrites, so re-running a date is safe. The
//! sub-computations are independent: one failing is logged and the rest
//! still run.

use crate::error::{AnalyticsError, Result};
use crate::metrics::{
    open_count_slot, usage_time_slot, AFFINITY_WINDOWS, DAILY_ACTIVE_CPV,
    DAILY_ACTIVE_NEW_USER_PERCENT, DAILY_ACTIVE_USER_AFFINITY, DAILY_USAGE_AVERAGE_TIME,
    DAILY_USAGE_TIME_DISTRIBUTION, EACH_USAGE_AVERAGE_TIME, NEW_USER_CPV,
    OPEN_APP_COUNT_DISTRIBUTION, OPEN_COUNT_SLOTS, USAGE_COUNT, USAGE_TIME_SLOTS,
    USAGE_TIME_TOTAL,
};
use counter_store::date::{days_before, SECONDS_PER_DAY};
use counter_store::AnalyticsStore;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What one sub-computation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Written,
    Skipped(&'static str),
}

/// Outcome of one job run
#[derive(Debug)]
pub struct DailyReport {
    pub tenant: String,
    pub date: i64,
    pub written: Vec<&'static str>,
    pub skipped: Vec<(&'static str, &'static str)>,
    pub failed: Vec<(&'static str, AnalyticsError)>,
}

impl DailyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// The report, or the first sub-computation error
    pub fn into_result(mut self) -> Result<Self> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(self.failed.remove(0).1)
        }
    }
}

/// Computes the derived daily metrics of a tenant
#[derive(Clone)]
pub struct DailyJob {
    store: Arc<dyn AnalyticsStore>,
}

impl DailyJob {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    /// Run every sub-computation for `date` (a day boundary)
    pub async fn run(&self, tenant: &str, date: i64) -> DailyReport {
        tracing::info!(tenant, date, "Running daily derived-metric job");

        let mut report = DailyReport {
            tenant: tenant.to_string(),
            date,
            written: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        };

        let steps = [
            ("new_user_percent", self.new_user_percent(tenant, date).await),
            ("active_user_affinity", self.active_user_affinity(tenant, date).await),
            ("open_count_distribution", self.open_count_distribution(tenant, date).await),
            ("each_usage_average_time", self.each_usage_average_time(tenant, date).await),
            ("daily_usage_average_time", self.daily_usage_average_time(tenant, date).await),
            ("daily_usage_distribution", self.daily_usage_distribution(tenant, date).await),
        ];

        for (name, outcome) in steps {
            match outcome {
                Ok(Step::Written) => report.written.push(name),
                Ok(Step::Skipped(reason)) => {
                    tracing::debug!(tenant, date, step = name, reason, "Skipped daily computation");
                    report.skipped.push((name, reason));
                }
                Err(err) => {
                    tracing::warn!(tenant, date, step = name, error = %err, "Daily computation failed");
                    report.failed.push((name, err));
                }
            }
        }

        tracing::info!(
            tenant,
            date,
            written = report.written.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Daily derived-metric job finished"
        );
        report
    }

    /// Run the job for many tenants in parallel
    pub async fn run_many(&self, requests: &[(String, i64)]) -> Vec<DailyReport> {
        join_all(requests.iter().map(|(tenant, date)| self.run(tenant, *date))).await
    }

    async fn new_user_percent(&self, tenant: &str, date: i64) -> Result<Step> {
        let active = self.store.sum_cpv_total(tenant, DAILY_ACTIVE_CPV, date, date).await?;
        let new_users = self.store.sum_cpv_total(tenant, NEW_USER_CPV, date, date).await?;
        let percent = if active == 0.0 { 0.0 } else { new_users / active };
        self.store.set_simple(tenant, DAILY_ACTIVE_NEW_USER_PERCENT, date, percent).await?;
        Ok(Step::Written)
    }

    async fn active_user_affinity(&self, tenant: &str, date: i64) -> Result<Step> {
        let mut uniques = Vec::with_capacity(AFFINITY_WINDOWS.len());
        for window in AFFINITY_WINDOWS {
            let start = days_before(date, window);
            let unique = self.store.unique_active_devices(tenant, start, date).await?;
            if unique == 0 {
                return Ok(Step::Skipped("no active devices in window"));
            }
            uniques.push((window, unique));
        }

        let active = self.store.sum_cpv_total(tenant, DAILY_ACTIVE_CPV, date, date).await?;
        for (window, unique) in uniques {
            let slot = window.to_string();
            let ratio = active / unique as f64;
            self.store.set_slot(tenant, DAILY_ACTIVE_USER_AFFINITY, &slot, date, ratio).await?;
        }
        Ok(Step::Written)
    }

    async fn open_count_distribution(&self, tenant: &str, date: i64) -> Result<Step> {
        let counts =
            self.store.open_counts_by_device(tenant, date, date + SECONDS_PER_DAY).await?;
        if counts.is_empty() {
            return Ok(Step::Skipped("no opens"));
        }

        // zero-filled: a re-run must clear buckets a device has left
        let mut buckets: BTreeMap<&str, f64> =
            OPEN_COUNT_SLOTS.iter().map(|slot| (*slot, 0.0)).collect();
        for count in counts {
            *buckets.entry(open_count_slot(count)).or_insert(0.0) += 1.0;
        }
        for (slot, devices) in buckets {
            self.store.set_slot(tenant, OPEN_APP_COUNT_DISTRIBUTION, slot, date, devices).await?;
        }
        Ok(Step::Written)
    }

    async fn each_usage_average_time(&self, tenant: &str, date: i64) -> Result<Step> {
        let total = self.store.sum_simple(tenant, USAGE_TIME_TOTAL, date, date).await?;
        let reports = self.store.sum_simple(tenant, USAGE_COUNT, date, date).await?;
        if reports == 0.0 {
            return Ok(Step::Skipped("no usage reports"));
        }
        self.store.set_simple(tenant, EACH_USAGE_AVERAGE_TIME, date, total / reports).await?;
        Ok(Step::Written)
    }

    async fn daily_usage_average_time(&self, tenant: &str, date: i64) -> Result<Step> {
        let per_device = self.store.device_usage(tenant, date).await?;
        if per_device.is_empty() {
            return Ok(Step::Skipped("no usage reports"));
        }
        let average = per_device.iter().sum::<f64>() / per_device.len() as f64;
        self.store.set_simple(tenant, DAILY_USAGE_AVERAGE_TIME, date, average).await?;
        Ok(Step::Written)
    }

    async fn daily_usage_distribution(&self, tenant: &str, date: i64) -> Result<Step> {
        let per_device = self.store.device_usage(tenant, date).await?;
        if per_device.is_empty() {
            return Ok(Step::Skipped("no usage reports"));
        }

        let mut buckets: BTreeMap<&str, f64> =
            USAGE_TIME_SLOTS.iter().map(|slot| (*slot, 0.0)).collect();
        for seconds in per_device {
            *buckets.entry(usage_time_slot(seconds)).or_insert(0.0) += 1.0;
        }
        for (slot, devices) in buckets {
            self.store.set_slot(tenant, DAILY_USAGE_TIME_DISTRIBUTION, slot, date, devices).await?;
        }
        Ok(Step::Written)
    }
}
