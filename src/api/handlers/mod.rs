pub mod health;
pub mod metrics;

use std::sync::Arc;

use crate::{metrics::Exporter, registry::DeviceRegistry};

#[derive(Clone)]
pub struct AppState {
    pub devices: Arc<DeviceRegistry>,
    pub exporter: Arc<Exporter>,
}
