//! Shared map of device address to monitor.
//!
//! The scheduler is the only task that applies samples; the exporter and the
//! checkpoint writer read through the same lock.

use crate::monitor::{
    DeviceIdentity, DutyCycleMonitor, InstantaneousReading, MonitorState, Transition,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{info, warn};

pub type Snapshot = BTreeMap<String, MonitorState>;

#[derive(Debug)]
pub struct DeviceRegistry {
    monitors: RwLock<BTreeMap<String, DutyCycleMonitor>>,
}

impl DeviceRegistry {
    /// Build one monitor per target, restoring any state found in `restored`.
    pub fn new<I, S>(targets: I, threshold_watts: f64, mut restored: Snapshot) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut monitors = BTreeMap::new();
        for addr in targets {
            let addr = addr.into();
            let monitor = match restored.remove(&addr) {
                Some(state) => {
                    info!(addr = %addr, "restoring checkpointed state");
                    DutyCycleMonitor::restore(threshold_watts, state)
                }
                None => {
                    info!(addr = %addr, "no prior checkpointed state");
                    DutyCycleMonitor::new(threshold_watts)
                }
            };
            monitors.insert(addr, monitor);
        }
        for addr in restored.keys() {
            warn!(addr = %addr, "checkpointed device is no longer a target, ignoring");
        }
        Self {
            monitors: RwLock::new(monitors),
        }
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.monitors.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.monitors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.monitors.read().await.is_empty()
    }

    /// Number of devices that have contributed at least one sample.
    pub async fn online(&self) -> usize {
        self.monitors
            .read()
            .await
            .values()
            .filter(|m| m.state().has_data())
            .count()
    }

    /// Apply one reading. Returns `None` for an unknown address.
    pub async fn sample(
        &self,
        addr: &str,
        now: DateTime<Utc>,
        identity: DeviceIdentity,
        reading: InstantaneousReading,
    ) -> Option<Transition> {
        let mut monitors = self.monitors.write().await;
        let monitor = monitors.get_mut(addr)?;
        Some(monitor.sample(now, identity, reading))
    }

    pub async fn state(&self, addr: &str) -> Option<MonitorState> {
        self.monitors
            .read()
            .await
            .get(addr)
            .map(|m| m.state().clone())
    }

    /// Clone every state so callers can do I/O without holding the lock.
    pub async fn snapshot(&self) -> Snapshot {
        self.monitors
            .read()
            .await
            .iter()
            .map(|(addr, m)| (addr.clone(), m.state().clone()))
            .collect()
    }

    /// Exclusive access for the export path, which drains pending durations.
    pub async fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, DutyCycleMonitor>> {
        self.monitors.write().await
    }
}
