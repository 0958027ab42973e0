use crate::error::Result;
use crate::monitor::{DeviceIdentity, InstantaneousReading};
use async_trait::async_trait;

/// A device that can be asked for its identity and current power reading.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn identity(&self) -> Result<DeviceIdentity>;

    async fn reading(&self) -> Result<InstantaneousReading>;
}
