use super::{ChangeFeed, ConfigField, ConfigStore, HistoryEntry};
use crate::errors::{Error, Result};
use crate::model::DeviceConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// A store whose backend is connected in the background.
///
/// Until [`DeferredStore::install`] is called every operation fails with
/// `StoreUnavailable`, so device sessions and the subscriber can start
/// before the database is reachable.
#[derive(Clone, Default)]
pub struct DeferredStore {
    backend: Arc<OnceCell<Arc<dyn ConfigStore>>>,
}

impl DeferredStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `backend` the target of every later call. Only the first install
    /// takes effect.
    pub fn install(&self, backend: Arc<dyn ConfigStore>) {
        if self.backend.set(backend).is_ok() {
            info!("Config store connected");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.backend.initialized()
    }

    fn backend(&self) -> Result<&Arc<dyn ConfigStore>> {
        self.backend.get().ok_or(Error::StoreUnavailable)
    }
}

#[async_trait]
impl ConfigStore for DeferredStore {
    async fn save_config(
        &self,
        mac: &str,
        config: &DeviceConfig,
        timestamp_ms: i64,
    ) -> Result<()> {
        self.backend()?.save_config(mac, config, timestamp_ms).await
    }

    async fn current_value(&self, mac: &str, field: ConfigField) -> Result<Option<String>> {
        self.backend()?.current_value(mac, field).await
    }

    async fn config_time(&self, mac: &str) -> Result<Option<i64>> {
        self.backend()?.config_time(mac).await
    }

    async fn configured_devices(&self) -> Result<Vec<String>> {
        self.backend()?.configured_devices().await
    }

    async fn field_history(&self, mac: &str, field: ConfigField) -> Result<Vec<HistoryEntry>> {
        self.backend()?.field_history(mac, field).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.backend()?.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeFeed>> {
        self.backend()?.subscribe(channel).await
    }
}
