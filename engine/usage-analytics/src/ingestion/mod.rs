//! # Event Ingestion
//!
//! Maps each [`Event`] variant to its handler and runs delivered events
//! through a local dispatcher. Handlers never coordinate with each other;
//! all cross-event safety comes from the store's atomic primitives.

pub mod usage;
pub mod user;

use crate::config::IngestionConfig;
use crate::daily::DailyJob;
use crate::error::{AnalyticsError, Result};
use crate::events::Event;
use crate::registry::MetricRegistry;
use async_trait::async_trait;
use chrono::FixedOffset;
use counter_store::date::date_floor;
use counter_store::{AnalyticsStore, StoreError};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

pub use usage::UsagePipeline;
pub use user::OpenAppPipeline;

/// Handler contract offered to event transports
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one delivered event. Errors are reported back to the transport,
    /// which logs them and may redeliver when [`AnalyticsError::is_transient`].
    async fn handle(&self, event: Event) -> Result<()>;
}

/// Best-effort step tracker for one event: failures are logged and the first
/// one is kept for the caller.
pub(crate) struct StepLog<'a> {
    event: &'static str,
    tenant: &'a str,
    device_id: &'a str,
    first_error: Option<AnalyticsError>,
}

impl<'a> StepLog<'a> {
    pub(crate) fn new(event: &'static str, tenant: &'a str, device_id: &'a str) -> Self {
        Self { event, tenant, device_id, first_error: None }
    }

    /// Keep going on failure.
    pub(crate) fn record<T>(
        &mut self,
        step: &str,
        result: std::result::Result<T, StoreError>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(
                    event = self.event,
                    tenant = self.tenant,
                    device_id = self.device_id,
                    step,
                    error = %err,
                    "Ingestion step failed"
                );
                if self.first_error.is_none() {
                    self.first_error = Some(err.into());
                }
                None
            }
        }
    }

    /// A failure here means later steps must not run.
    pub(crate) fn gate<T>(
        &mut self,
        step: &str,
        result: std::result::Result<T, StoreError>,
    ) -> Option<T> {
        let value = self.record(step, result);
        if value.is_none() {
            tracing::warn!(event = self.event, tenant = self.tenant, step, "Abandoning event after failed gate");
        }
        value
    }

    pub(crate) fn finish(self) -> Result<()> {
        match self.first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Static dispatch table from event variant to pipeline
#[derive(Clone)]
pub struct EventProcessor {
    store: Arc<dyn AnalyticsStore>,
    zone: FixedOffset,
    open_app: OpenAppPipeline,
    usage: UsagePipeline,
    registry: MetricRegistry,
    daily: DailyJob,
}

impl EventProcessor {
    pub fn new(store: Arc<dyn AnalyticsStore>, zone: FixedOffset) -> Self {
        Self {
            open_app: OpenAppPipeline::new(store.clone(), zone),
            usage: UsagePipeline::new(store.clone()),
            registry: MetricRegistry::new(store.clone()),
            daily: DailyJob::new(store.clone()),
            store,
            zone,
        }
    }
}

#[async_trait]
impl EventHandler for EventProcessor {
    async fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::OpenApp(metadata) => {
                let metadata = metadata.resolve(self.zone)?;
                self.open_app.handle(&metadata).await
            }
            Event::UsageTime(mut data) => {
                data.metadata = data.metadata.resolve(self.zone)?;
                self.usage.handle(&data).await.map(|_| ())
            }
            Event::CustomCounter(mut data) => {
                data.metadata = data.metadata.resolve(self.zone)?;
                self.registry.record(&data).await
            }
            Event::DailySchedule(data) => {
                let date = date_floor(data.timestamp, self.zone);
                self.daily.run(&data.app_id, date).await.into_result().map(|_| ())
            }
            Event::DropTenant(data) => {
                if data.app_id.is_empty() {
                    return Err(AnalyticsError::validation("appId must not be empty"));
                }
                self.store.drop_tenant(&data.app_id).await?;
                Ok(())
            }
        }
    }
}

/// In-process event queue. A single worker pulls events and runs each in its
/// own task once the admission semaphore grants a permit.
pub struct Dispatcher {
    sender: mpsc::Sender<Event>,
    worker: JoinHandle<()>,
}

impl Dispatcher {
    /// Start the worker
    pub fn spawn(handler: Arc<dyn EventHandler>, config: &IngestionConfig) -> Result<Self> {
        let permits = u32::try_from(config.max_concurrent_events)
            .ok()
            .filter(|permits| *permits > 0 && (*permits as usize) <= Semaphore::MAX_PERMITS)
            .ok_or_else(|| {
                AnalyticsError::config(format!(
                    "max_concurrent_events out of range: {}",
                    config.max_concurrent_events
                ))
            })?;
        if config.queue_capacity == 0 {
            return Err(AnalyticsError::config("queue_capacity must be greater than 0"));
        }

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let worker = tokio::spawn(run_worker(receiver, handler, permits));
        tracing::info!(max_concurrent_events = permits, queue_capacity = config.queue_capacity, "Started event dispatcher");
        Ok(Self { sender, worker })
    }

    /// Queue one event, waiting for queue space
    pub async fn publish(&self, event: Event) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| AnalyticsError::DispatcherClosed)
    }

    /// Stop accepting events and wait for every queued and running event.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(err) = self.worker.await {
            tracing::error!(error = %err, "Event dispatcher worker panicked");
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<Event>,
    handler: Arc<dyn EventHandler>,
    permits: u32,
) {
    let semaphore = Arc::new(Semaphore::new(permits as usize));

    while let Some(event) = receiver.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            let name = event.name();
            let tenant = event.tenant().to_string();
            if let Err(err) = handler.handle(event).await {
                tracing::error!(
                    event = name,
                    tenant = %tenant,
                    transient = err.is_transient(),
                    error = %err,
                    "Event handler failed"
                );
            }
            drop(permit);
        });
    }

    // every permit back means every spawned handler has finished
    if semaphore.acquire_many(permits).await.is_ok() {
        tracing::info!("Event dispatcher drained");
    }
}
