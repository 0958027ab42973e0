//! Collection loop.
//!
//! One task owns the sampling and checkpoint timers and serves whichever fires
//! first, or stops when shutdown is requested. Devices are polled one after
//! another within a tick; a failing device is skipped until the next tick.

use crate::checkpoint::CheckpointStore;
use crate::client::DeviceClient;
use crate::clock::Clock;
use crate::config::CollectorConfig;
use crate::error::{AppError, Result};
use crate::monitor::{DeviceIdentity, InstantaneousReading};
use crate::registry::DeviceRegistry;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub sampled: usize,
    pub failed: usize,
}

pub struct CollectionScheduler {
    registry: Arc<DeviceRegistry>,
    clients: BTreeMap<String, Arc<dyn DeviceClient>>,
    store: CheckpointStore,
    clock: Arc<dyn Clock>,
    interval: Duration,
    checkpoint_interval: Duration,
    query_timeout: Option<Duration>,
    checkpoint_on_shutdown: bool,
}

impl CollectionScheduler {
    pub fn new(
        config: &CollectorConfig,
        registry: Arc<DeviceRegistry>,
        store: CheckpointStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            clients: BTreeMap::new(),
            store,
            clock,
            interval: config.interval(),
            checkpoint_interval: config.checkpoint_interval(),
            query_timeout: config.query_timeout(),
            checkpoint_on_shutdown: config.checkpoint_on_shutdown,
        }
    }

    pub fn with_client(mut self, addr: impl Into<String>, client: Arc<dyn DeviceClient>) -> Self {
        self.clients.insert(addr.into(), client);
        self
    }

    /// Serve sample and checkpoint ticks until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            interval = ?self.interval,
            checkpoint_interval = ?self.checkpoint_interval,
            devices = self.clients.len(),
            "collector started"
        );

        let start = Instant::now();
        let mut sample_timer = interval_at(start + self.interval, self.interval);
        sample_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut checkpoint_timer =
            interval_at(start + self.checkpoint_interval, self.checkpoint_interval);
        checkpoint_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("collector shutdown requested");
                    break;
                }
                _ = checkpoint_timer.tick() => {
                    debug!("checkpoint tick");
                    // Failures are logged; the next tick retries.
                    let _ = self.checkpoint_tick().await;
                }
                _ = sample_timer.tick() => {
                    debug!("sample tick");
                    self.sample_tick().await;
                }
            }
        }

        if self.checkpoint_on_shutdown {
            let _ = self.checkpoint_tick().await;
        }
        info!("collector stopped");
    }

    /// Poll every registered device once, in address order.
    pub async fn sample_tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        for addr in self.registry.addresses().await {
            let Some(client) = self.clients.get(&addr) else {
                warn!(addr = %addr, "no client registered for device, skipping");
                summary.failed += 1;
                continue;
            };
            match self.poll(&addr, client.as_ref()).await {
                Ok((identity, reading)) => {
                    let now = self.clock.now();
                    self.registry.sample(&addr, now, identity, reading).await;
                    summary.sampled += 1;
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "error collecting");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Write the current registry to the checkpoint file, if one is configured.
    pub async fn checkpoint_tick(&self) -> Result<()> {
        if !self.store.is_enabled() {
            return Ok(());
        }
        let snapshot = self.registry.snapshot().await;
        self.store.save(&snapshot).await.inspect_err(|e| {
            error!(error = %e, "error saving checkpoint, will retry next tick");
        })
    }

    async fn poll(
        &self,
        addr: &str,
        client: &dyn DeviceClient,
    ) -> Result<(DeviceIdentity, InstantaneousReading)> {
        let identity = self.bounded(addr, client.identity()).await?;
        let reading = self.bounded(addr, client.reading()).await?;
        Ok((identity, reading))
    }

    async fn bounded<T, F>(&self, addr: &str, query: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, query)
                .await
                .map_err(|_| AppError::device(addr, format!("query timed out after {limit:?}")))?,
            None => query.await,
        }
    }
}
