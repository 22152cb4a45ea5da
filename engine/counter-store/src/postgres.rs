//! PostgreSQL store backend.
//!
//! Increments are single `INSERT .. ON CONFLICT DO UPDATE` statements, so the
//! read-modify-write happens inside the database. Insert-if-absent signals
//! come from `ON CONFLICT DO NOTHING` row counts, or from `xmax = 0` when the
//! conflicting row must also be updated.

use crate::backend::{ActivityStore, CounterStore, DefinitionStore};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::types::{
    CpvBreakdown, CpvDimension, CpvKey, CustomMetricDefinition, DateSeries, DeviceAttribution,
    MetricKind, OpenAppLogEntry, SlotCounter, SlotSpan, UpsertOutcome,
};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS slot_counters (
        tenant TEXT NOT NULL,
        metric TEXT NOT NULL,
        date BIGINT NOT NULL,
        slot TEXT NOT NULL,
        value DOUBLE PRECISION NOT NULL DEFAULT 0,
        PRIMARY KEY (tenant, metric, date, slot)
    )",
    "CREATE TABLE IF NOT EXISTS cpv_counters (
        tenant TEXT NOT NULL,
        metric TEXT NOT NULL,
        date BIGINT NOT NULL,
        channel TEXT NOT NULL,
        platform TEXT NOT NULL,
        version TEXT NOT NULL,
        value DOUBLE PRECISION NOT NULL DEFAULT 0,
        PRIMARY KEY (tenant, metric, date, channel, platform, version)
    )",
    "CREATE TABLE IF NOT EXISTS open_app_log (
        id BIGSERIAL PRIMARY KEY,
        tenant TEXT NOT NULL,
        device_id TEXT NOT NULL,
        ts BIGINT NOT NULL,
        channel TEXT NOT NULL,
        platform TEXT NOT NULL,
        version TEXT NOT NULL,
        user_id TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS open_app_log_tenant_ts ON open_app_log (tenant, ts)",
    "CREATE TABLE IF NOT EXISTS registered_users (
        tenant TEXT NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (tenant, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS device_attribution (
        tenant TEXT NOT NULL,
        device_id TEXT NOT NULL,
        channel TEXT NOT NULL,
        platform TEXT NOT NULL,
        version TEXT NOT NULL,
        user_id TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        PRIMARY KEY (tenant, device_id)
    )",
    "CREATE TABLE IF NOT EXISTS device_activity (
        tenant TEXT NOT NULL,
        device_id TEXT NOT NULL,
        date BIGINT NOT NULL,
        PRIMARY KEY (tenant, device_id, date)
    )",
    "CREATE INDEX IF NOT EXISTS device_activity_tenant_date ON device_activity (tenant, date)",
    "CREATE TABLE IF NOT EXISTS device_usage_time (
        tenant TEXT NOT NULL,
        device_id TEXT NOT NULL,
        date BIGINT NOT NULL,
        seconds DOUBLE PRECISION NOT NULL DEFAULT 0,
        PRIMARY KEY (tenant, device_id, date)
    )",
    "CREATE TABLE IF NOT EXISTS custom_metrics (
        tenant TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        display_name TEXT NOT NULL,
        slots TEXT[] NOT NULL DEFAULT '{}',
        channels TEXT[] NOT NULL DEFAULT '{}',
        versions TEXT[] NOT NULL DEFAULT '{}',
        PRIMARY KEY (tenant, name, kind)
    )",
];

type DefinitionRow = (String, String, String, Vec<String>, Vec<String>, Vec<String>);

/// PostgreSQL-backed implementation of every store trait
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    /// Connect using the given configuration
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        config.validate().map_err(StoreError::invalid_operation)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.operation_timeout())
            .connect(&config.database_url)
            .await?;

        Ok(Self::with_pool(pool, config.operation_timeout()))
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Create tables and indexes if they are missing
    pub async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            self.bounded("initialize", sqlx::query(statement).execute(&self.pool)).await?;
        }
        tracing::info!("PostgreSQL counter store schema ready");
        Ok(())
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "Storage call timed out");
                Err(StoreError::timeout(operation))
            }
        }
    }

    fn definition_from_row(row: DefinitionRow) -> Result<CustomMetricDefinition> {
        let (name, kind, display_name, slots, channels, versions) = row;
        let kind = kind.parse::<MetricKind>().map_err(StoreError::invalid_operation)?;
        Ok(CustomMetricDefinition { name, display_name, kind, slots, channels, versions })
    }
}

#[async_trait]
impl CounterStore for PgStore {
    async fn add_slot(
        &self,
        tenant: &str,
        metric: &str,
        slot: &str,
        date: i64,
        amount: f64,
    ) -> Result<()> {
        let query = sqlx::query(
            "INSERT INTO slot_counters (tenant, metric, date, slot, value)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (tenant, metric, date, slot) DO UPDATE SET
                 value = slot_counters.value + EXCLUDED.value",
        )
        .bind(tenant)
        .bind(metric)
        .bind(date)
        .bind(slot)
        .bind(amount);
        self.bounded("add_slot", query.execute(&self.pool)).await?;
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
        let query = sqlx::query(
            "INSERT INTO slot_counters (tenant, metric, date, slot, value)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (tenant, metric, date, slot) DO UPDATE SET
                 value = EXCLUDED.value",
        )
        .bind(tenant)
        .bind(metric)
        .bind(date)
        .bind(slot)
        .bind(value);
        self.bounded("set_slot", query.execute(&self.pool)).await?;
        Ok(())
    }

    async fn span_slot(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<SlotSpan> {
        let query = sqlx::query_as::<_, (i64, String, f64)>(
            "SELECT date, slot, value FROM slot_counters
             WHERE tenant = $1 AND metric = $2 AND date BETWEEN $3 AND $4",
        )
        .bind(tenant)
        .bind(metric)
        .bind(start)
        .bind(end);
        let rows = self.bounded("span_slot", query.fetch_all(&self.pool)).await?;

        let mut span = SlotSpan::new();
        for (date, slot, value) in rows {
            span.entry(date).or_default().insert(slot, value);
        }
        Ok(span)
    }

    async fn sum_slot(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
        slots: &[String],
    ) -> Result<SlotCounter> {
        if slots.is_empty() {
            return Ok(SlotCounter::new());
        }
        let query = sqlx::query_as::<_, (String, f64)>(
            "SELECT slot, SUM(value) FROM slot_counters
             WHERE tenant = $1 AND metric = $2 AND date BETWEEN $3 AND $4 AND slot = ANY($5)
             GROUP BY slot",
        )
        .bind(tenant)
        .bind(metric)
        .bind(start)
        .bind(end)
        .bind(slots);
        let rows = self.bounded("sum_slot", query.fetch_all(&self.pool)).await?;
        Ok(rows.into_iter().collect())
    }

    async fn partial_slot_sum(
        &self,
        tenant: &str,
        metric: &str,
        date: i64,
        slots: &[String],
    ) -> Result<f64> {
        let query = sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(SUM(value), 0)::DOUBLE PRECISION FROM slot_counters
             WHERE tenant = $1 AND metric = $2 AND date = $3 AND slot = ANY($4)",
        )
        .bind(tenant)
        .bind(metric)
        .bind(date)
        .bind(slots);
        self.bounded("partial_slot_sum", query.fetch_one(&self.pool)).await
    }

    async fn add_cpv(
        &self,
        tenant: &str,
        metric: &str,
        key: &CpvKey,
        date: i64,
        amount: f64,
    ) -> Result<()> {
        let query = sqlx::query(
            "INSERT INTO cpv_counters (tenant, metric, date, channel, platform, version, value)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (tenant, metric, date, channel, platform, version) DO UPDATE SET
                 value = cpv_counters.value + EXCLUDED.value",
        )
        .bind(tenant)
        .bind(metric)
        .bind(date)
        .bind(&key.channel)
        .bind(&key.platform)
        .bind(&key.version)
        .bind(amount);
        self.bounded("add_cpv", query.execute(&self.pool)).await?;
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
        let query = sqlx::query(
            "INSERT INTO cpv_counters (tenant, metric, date, channel, platform, version, value)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (tenant, metric, date, channel, platform, version) DO UPDATE SET
                 value = EXCLUDED.value",
        )
        .bind(tenant)
        .bind(metric)
        .bind(date)
        .bind(&key.channel)
        .bind(&key.platform)
        .bind(&key.version)
        .bind(value);
        self.bounded("set_cpv", query.execute(&self.pool)).await?;
        Ok(())
    }

    async fn sum_cpv_total(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<f64> {
        let query = sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(SUM(value), 0)::DOUBLE PRECISION FROM cpv_counters
             WHERE tenant = $1 AND metric = $2 AND date BETWEEN $3 AND $4",
        )
        .bind(tenant)
        .bind(metric)
        .bind(start)
        .bind(end);
        self.bounded("sum_cpv_total", query.fetch_one(&self.pool)).await
    }

    async fn sum_cpv_by_date(
        &self,
        tenant: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<DateSeries> {
        let query = sqlx::query_as::<_, (i64, f64)>(
            "SELECT date, SUM(value) FROM cpv_counters
             WHERE tenant = $1 AND metric = $2 AND date BETWEEN $3 AND $4
             GROUP BY date",
        )
        .bind(tenant)
        .bind(metric)
        .bind(start)
        .bind(end);
        let rows = self.bounded("sum_cpv_by_date", query.fetch_all(&self.pool)).await?;
        Ok(rows.into_iter().collect())
    }

    async fn sum_cpv_by_date_and_channel(
        &self,
        tenant: &str,
        metric: &str,
        channel: &str,
        start: i64,
        end: i64,
    ) -> Result<DateSeries> {
        let query = sqlx::query_as::<_, (i64, f64)>(
            "SELECT date, SUM(value) FROM cpv_counters
             WHERE tenant = $1 AND metric = $2 AND channel = $3 AND date BETWEEN $4 AND $5
             GROUP BY date",
        )
        .bind(tenant)
        .bind(metric)
        .bind(channel)
        .bind(start)
        .bind(end);
        let rows =
            self.bounded("sum_cpv_by_date_and_channel", query.fetch_all(&self.pool)).await?;
        Ok(rows.into_iter().collect())
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
            // column names come from a closed enum, never from callers
            let sql = format!(
                "SELECT date, {column}, SUM(value) FROM cpv_counters
                 WHERE tenant = $1 AND metric = $2 AND date BETWEEN $3 AND $4
                 GROUP BY date, {column}",
                column = dimension.as_str()
            );
            let query = sqlx::query_as::<_, (i64, String, f64)>(&sql)
                .bind(tenant)
                .bind(metric)
                .bind(start)
                .bind(end);
            let rows = self.bounded("breakdown_cpv", query.fetch_all(&self.pool)).await?;

            let per_date = breakdown.entry(dimension).or_insert_with(BTreeMap::new);
            for (date, value_name, sum) in rows {
                per_date.entry(date).or_default().insert(value_name, sum);
            }
        }
        Ok(breakdown)
    }

    async fn delete_metric(&self, tenant: &str, metric: &str, kind: MetricKind) -> Result<()> {
        let sql = match kind {
            MetricKind::Simple | MetricKind::Slot => {
                "DELETE FROM slot_counters WHERE tenant = $1 AND metric = $2"
            }
            MetricKind::Cpv => "DELETE FROM cpv_counters WHERE tenant = $1 AND metric = $2",
        };
        let query = sqlx::query(sql).bind(tenant).bind(metric);
        self.bounded("delete_metric", query.execute(&self.pool)).await?;
        Ok(())
    }

    async fn drop_counters(&self, tenant: &str) -> Result<()> {
        for sql in [
            "DELETE FROM slot_counters WHERE tenant = $1",
            "DELETE FROM cpv_counters WHERE tenant = $1",
        ] {
            self.bounded("drop_counters", sqlx::query(sql).bind(tenant).execute(&self.pool))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn append_open_app(&self, tenant: &str, entry: &OpenAppLogEntry) -> Result<()> {
        let query = sqlx::query(
            "INSERT INTO open_app_log (tenant, device_id, ts, channel, platform, version, user_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(tenant)
        .bind(&entry.device_id)
        .bind(entry.timestamp)
        .bind(&entry.channel)
        .bind(&entry.platform)
        .bind(&entry.version)
        .bind(&entry.user_id);
        self.bounded("append_open_app", query.execute(&self.pool)).await?;
        Ok(())
    }

    async fn register_user_id(&self, tenant: &str, user_id: &str) -> Result<UpsertOutcome> {
        let query = sqlx::query(
            "INSERT INTO registered_users (tenant, user_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(tenant)
        .bind(user_id);
        let result = self.bounded("register_user_id", query.execute(&self.pool)).await?;
        Ok(UpsertOutcome { already_existed: result.rows_affected() == 0 })
    }

    async fn upsert_attribution(
        &self,
        tenant: &str,
        attribution: &DeviceAttribution,
    ) -> Result<UpsertOutcome> {
        let query = sqlx::query_scalar::<_, bool>(
            "INSERT INTO device_attribution
                 (tenant, device_id, channel, platform, version, user_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (tenant, device_id) DO UPDATE SET
                 channel = EXCLUDED.channel,
                 platform = EXCLUDED.platform,
                 version = EXCLUDED.version,
                 user_id = EXCLUDED.user_id,
                 updated_at = EXCLUDED.updated_at
             RETURNING (xmax = 0)",
        )
        .bind(tenant)
        .bind(&attribution.device_id)
        .bind(&attribution.channel)
        .bind(&attribution.platform)
        .bind(&attribution.version)
        .bind(&attribution.user_id)
        .bind(attribution.created_at)
        .bind(attribution.updated_at);
        let inserted = self.bounded("upsert_attribution", query.fetch_one(&self.pool)).await?;
        Ok(UpsertOutcome { already_existed: !inserted })
    }

    async fn attribution(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<DeviceAttribution>> {
        let query = sqlx::query_as::<_, (String, String, String, String, i64, i64)>(
            "SELECT channel, platform, version, user_id, created_at, updated_at
             FROM device_attribution WHERE tenant = $1 AND device_id = $2",
        )
        .bind(tenant)
        .bind(device_id);
        let row = self.bounded("attribution", query.fetch_optional(&self.pool)).await?;
        Ok(row.map(|(channel, platform, version, user_id, created_at, updated_at)| {
            DeviceAttribution {
                device_id: device_id.to_string(),
                channel,
                platform,
                version,
                user_id,
                created_at,
                updated_at,
            }
        }))
    }

    async fn mark_device_active(
        &self,
        tenant: &str,
        device_id: &str,
        date: i64,
    ) -> Result<UpsertOutcome> {
        let query = sqlx::query(
            "INSERT INTO device_activity (tenant, device_id, date) VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(tenant)
        .bind(device_id)
        .bind(date);
        let result = self.bounded("mark_device_active", query.execute(&self.pool)).await?;
        Ok(UpsertOutcome { already_existed: result.rows_affected() == 0 })
    }

    async fn was_device_active(&self, tenant: &str, device_id: &str, date: i64) -> Result<bool> {
        let query = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM device_activity
                            WHERE tenant = $1 AND device_id = $2 AND date = $3)",
        )
        .bind(tenant)
        .bind(device_id)
        .bind(date);
        self.bounded("was_device_active", query.fetch_one(&self.pool)).await
    }

    async fn unique_active_devices(&self, tenant: &str, start: i64, end: i64) -> Result<u64> {
        let query = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT device_id) FROM device_activity
             WHERE tenant = $1 AND date BETWEEN $2 AND $3",
        )
        .bind(tenant)
        .bind(start)
        .bind(end);
        let count = self.bounded("unique_active_devices", query.fetch_one(&self.pool)).await?;
        Ok(count.max(0) as u64)
    }

    async fn open_counts_by_device(
        &self,
        tenant: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<u64>> {
        let query = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM open_app_log
             WHERE tenant = $1 AND ts >= $2 AND ts < $3
             GROUP BY device_id",
        )
        .bind(tenant)
        .bind(start)
        .bind(end);
        let counts = self.bounded("open_counts_by_device", query.fetch_all(&self.pool)).await?;
        Ok(counts.into_iter().map(|count| count.max(0) as u64).collect())
    }

    async fn add_device_usage(
        &self,
        tenant: &str,
        device_id: &str,
        date: i64,
        seconds: f64,
    ) -> Result<()> {
        let query = sqlx::query(
            "INSERT INTO device_usage_time (tenant, device_id, date, seconds)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (tenant, device_id, date) DO UPDATE SET
                 seconds = device_usage_time.seconds + EXCLUDED.seconds",
        )
        .bind(tenant)
        .bind(device_id)
        .bind(date)
        .bind(seconds);
        self.bounded("add_device_usage", query.execute(&self.pool)).await?;
        Ok(())
    }

    async fn device_usage(&self, tenant: &str, date: i64) -> Result<Vec<f64>> {
        let query = sqlx::query_scalar::<_, f64>(
            "SELECT seconds FROM device_usage_time WHERE tenant = $1 AND date = $2",
        )
        .bind(tenant)
        .bind(date);
        self.bounded("device_usage", query.fetch_all(&self.pool)).await
    }

    async fn drop_activity(&self, tenant: &str) -> Result<()> {
        for sql in [
            "DELETE FROM open_app_log WHERE tenant = $1",
            "DELETE FROM registered_users WHERE tenant = $1",
            "DELETE FROM device_attribution WHERE tenant = $1",
            "DELETE FROM device_activity WHERE tenant = $1",
            "DELETE FROM device_usage_time WHERE tenant = $1",
        ] {
            self.bounded("drop_activity", sqlx::query(sql).bind(tenant).execute(&self.pool))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for PgStore {
    async fn insert_definition(
        &self,
        tenant: &str,
        definition: &CustomMetricDefinition,
    ) -> Result<()> {
        let query = sqlx::query(
            "INSERT INTO custom_metrics
                 (tenant, name, kind, display_name, slots, channels, versions)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT DO NOTHING",
        )
        .bind(tenant)
        .bind(&definition.name)
        .bind(definition.kind.as_str())
        .bind(&definition.display_name)
        .bind(&definition.slots)
        .bind(&definition.channels)
        .bind(&definition.versions);
        let result = self.bounded("insert_definition", query.execute(&self.pool)).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::already_exists(format!(
                "{} metric {}",
                definition.kind, definition.name
            )));
        }
        Ok(())
    }

    async fn definitions(&self, tenant: &str) -> Result<Vec<CustomMetricDefinition>> {
        let query = sqlx::query_as::<_, DefinitionRow>(
            "SELECT name, kind, display_name, slots, channels, versions
             FROM custom_metrics WHERE tenant = $1 ORDER BY name",
        )
        .bind(tenant);
        let rows = self.bounded("definitions", query.fetch_all(&self.pool)).await?;
        rows.into_iter().map(Self::definition_from_row).collect()
    }

    async fn definition(
        &self,
        tenant: &str,
        name: &str,
        kind: MetricKind,
    ) -> Result<Option<CustomMetricDefinition>> {
        let query = sqlx::query_as::<_, DefinitionRow>(
            "SELECT name, kind, display_name, slots, channels, versions
             FROM custom_metrics WHERE tenant = $1 AND name = $2 AND kind = $3",
        )
        .bind(tenant)
        .bind(name)
        .bind(kind.as_str());
        let row = self.bounded("definition", query.fetch_optional(&self.pool)).await?;
        row.map(Self::definition_from_row).transpose()
    }

    async fn remove_definition(
        &self,
        tenant: &str,
        name: &str,
        kind: MetricKind,
    ) -> Result<bool> {
        let query =
            sqlx::query("DELETE FROM custom_metrics WHERE tenant = $1 AND name = $2 AND kind = $3")
                .bind(tenant)
                .bind(name)
                .bind(kind.as_str());
        let result = self.bounded("remove_definition", query.execute(&self.pool)).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn drop_definitions(&self, tenant: &str) -> Result<()> {
        let query = sqlx::query("DELETE FROM custom_metrics WHERE tenant = $1").bind(tenant);
        self.bounded("drop_definitions", query.execute(&self.pool)).await?;
        Ok(())
    }
}
