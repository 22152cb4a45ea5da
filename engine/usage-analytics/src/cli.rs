//! # Command Line Interface
//!
//! Operator CLI for querying analytics, running the daily job by hand,
//! replaying captured events and managing custom metrics.

use crate::config::{AnalyticsConfig, LoggingConfig};
use crate::events::Event;
use crate::query::QueryDescriptor;
use crate::{init_analytics, AnalyticsEngine};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use counter_store::date::{days_before, format_date, parse_date};
use counter_store::{CustomMetricDefinition, MetricKind};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Usage analytics CLI
#[derive(Parser)]
#[command(name = "analytics-cli")]
#[command(about = "Usage analytics CLI for querying and maintaining app metrics")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a batch of query descriptors
    Query {
        /// Tenant (app id)
        tenant: String,
        /// JSON array of descriptors
        descriptors: Option<String>,
        /// Read the descriptors from a file instead
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show the dashboard trend summary
    Trend {
        tenant: String,
        /// Reference day (YYYY-MM-DD), defaults to today
        #[arg(long)]
        today: Option<String>,
    },
    /// Run the daily derived-metric job
    Daily {
        /// Tenants to process
        #[arg(required = true)]
        tenants: Vec<String>,
        /// Day to compute (YYYY-MM-DD), defaults to yesterday
        #[arg(long)]
        date: Option<String>,
    },
    /// Replay newline-delimited JSON events through the dispatcher
    Replay {
        /// Event file
        path: PathBuf,
    },
    /// Manage custom metrics
    Metrics {
        #[command(subcommand)]
        action: MetricsCommand,
    },
    /// Delete every record of a tenant
    DropTenant {
        tenant: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Write the default configuration to a file
    InitConfig {
        path: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum MetricsCommand {
    /// List definitions with today's and yesterday's counts
    List {
        tenant: String,
    },
    /// Register a definition given as JSON
    Define {
        tenant: String,
        definition: String,
    },
    /// Delete a definition and its counters
    Delete {
        tenant: String,
        name: String,
        /// simple, slot or cpv
        #[arg(long)]
        kind: MetricKind,
    },
}

impl Cli {
    /// Configuration from `--config`, or defaults plus environment overrides
    pub fn load_config(&self) -> Result<AnalyticsConfig> {
        let config = match &self.config {
            Some(path) => AnalyticsConfig::load_from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => {
                let mut config = AnalyticsConfig::default();
                config.apply_overrides(|key| std::env::var(key).ok())?;
                config.validate()?;
                config
            }
        };
        Ok(config)
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the config.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    if config.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// CLI handler
pub struct CliHandler {
    engine: AnalyticsEngine,
}

impl CliHandler {
    /// Create new CLI handler
    pub async fn new(config: AnalyticsConfig) -> Result<Self> {
        let engine = init_analytics(config).await?;
        Ok(Self { engine })
    }

    pub fn engine(&self) -> &AnalyticsEngine {
        &self.engine
    }

    /// Handle CLI commands
    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Query { tenant, descriptors, file } => {
                self.run_query(&tenant, descriptors, file).await?;
            }
            Commands::Trend { tenant, today } => {
                self.show_trend(&tenant, today.as_deref()).await?;
            }
            Commands::Daily { tenants, date } => {
                self.run_daily(&tenants, date.as_deref()).await?;
            }
            Commands::Replay { path } => {
                self.replay(&path).await?;
            }
            Commands::Metrics { action } => {
                self.handle_metrics(action).await?;
            }
            Commands::DropTenant { tenant, yes } => {
                if !yes {
                    bail!("refusing to drop tenant {tenant} without --yes");
                }
                self.engine.store.drop_tenant(&tenant).await?;
                println!("🗑️  Dropped all data of tenant {}", tenant);
            }
            Commands::InitConfig { path } => {
                self.engine.config.save_to_file(&path)?;
                println!("✅ Wrote configuration to {}", path.display());
            }
        }
        Ok(())
    }

    fn parse_day(&self, text: &str) -> Result<i64> {
        parse_date(text, self.engine.zone)
            .with_context(|| format!("invalid date {text:?}, expected YYYY-MM-DD"))
    }

    async fn run_query(
        &self,
        tenant: &str,
        descriptors: Option<String>,
        file: Option<PathBuf>,
    ) -> Result<()> {
        let text = match (descriptors, file) {
            (Some(text), None) => text,
            (None, Some(path)) => tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
            _ => bail!("pass either inline descriptors or --file"),
        };
        let descriptors: Vec<QueryDescriptor> =
            serde_json::from_str(&text).context("parsing query descriptors")?;

        println!("🔍 Query results for {}", tenant);
        println!("{}", "=".repeat(50));

        let results = self.engine.query_engine.execute_batch(tenant, &descriptors).await?;
        println!("{}", serde_json::to_string_pretty(&results)?);
        Ok(())
    }

    async fn show_trend(&self, tenant: &str, today: Option<&str>) -> Result<()> {
        let today = match today {
            Some(text) => self.parse_day(text)?,
            None => self.engine.today(),
        };

        println!("📈 Trend summary for {} as of {}", tenant, format_date(today, self.engine.zone));
        println!("{}", "=".repeat(50));

        let summary = self.engine.trend(tenant, Some(today)).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }

    async fn run_daily(&self, tenants: &[String], date: Option<&str>) -> Result<()> {
        let date = match date {
            Some(text) => self.parse_day(text)?,
            None => days_before(self.engine.today(), 1),
        };

        println!("🗓️  Daily job for {}", format_date(date, self.engine.zone));
        println!("{}", "=".repeat(50));

        let requests: Vec<(String, i64)> =
            tenants.iter().map(|tenant| (tenant.clone(), date)).collect();
        let reports = self.engine.daily.run_many(&requests).await;

        let mut failures = 0;
        for report in &reports {
            let status = if report.is_success() { "✅" } else { "❌" };
            println!(
                "{} {}: {} written, {} skipped, {} failed",
                status,
                report.tenant,
                report.written.len(),
                report.skipped.len(),
                report.failed.len()
            );
            for (step, reason) in &report.skipped {
                println!("   - {} skipped: {}", step, reason);
            }
            for (step, err) in &report.failed {
                println!("   - {} failed: {}", step, err);
            }
            failures += report.failed.len();
        }

        if failures > 0 {
            bail!("{failures} daily step(s) failed");
        }
        Ok(())
    }

    async fn replay(&self, path: &Path) -> Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();
        let dispatcher = self.engine.start_dispatcher()?;

        let (mut queued, mut rejected, mut number) = (0usize, 0usize, 0usize);
        while let Some(line) = lines.next_line().await? {
            number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => {
                    dispatcher.publish(event).await?;
                    queued += 1;
                }
                Err(err) => {
                    tracing::warn!(line = number, error = %err, "Skipping unparseable event");
                    rejected += 1;
                }
            }
        }
        dispatcher.shutdown().await;

        println!("📥 Replayed {} events from {}", queued, path.display());
        if rejected > 0 {
            println!("⚠️  Skipped {} unparseable lines", rejected);
        }
        Ok(())
    }

    async fn handle_metrics(&self, action: MetricsCommand) -> Result<()> {
        let registry = &self.engine.registry;
        match action {
            MetricsCommand::List { tenant } => {
                let summaries = registry.list(&tenant, self.engine.today()).await?;
                println!("📊 Custom metrics for {}", tenant);
                println!("{}", "=".repeat(50));
                if summaries.is_empty() {
                    println!("No custom metrics defined");
                } else {
                    println!("{}", serde_json::to_string_pretty(&summaries)?);
                }
            }
            MetricsCommand::Define { tenant, definition } => {
                let definition: CustomMetricDefinition =
                    serde_json::from_str(&definition).context("parsing metric definition")?;
                registry.define(&tenant, &definition).await?;
                println!("✅ Defined {} metric {}", definition.kind, definition.name);
            }
            MetricsCommand::Delete { tenant, name, kind } => {
                registry.delete(&tenant, &name, kind).await?;
                println!("🗑️  Deleted {} metric {}", kind, name);
            }
        }
        Ok(())
    }
}
