//! Shared client handle with log-and-continue convenience operations

use crate::client::{CoordinationClient, CreateMode};
use crate::config::ZkConfig;
use crate::error::Result;
use std::sync::Arc;

/// Owns the process wide coordination client.
///
/// The convenience operations log failures and return a neutral value
/// instead of an error, for callers that treat the store as best effort.
#[derive(Clone)]
pub struct ClientFactory {
    client: Arc<dyn CoordinationClient>,
    config: ZkConfig,
}

impl ClientFactory {
    pub fn new(client: Arc<dyn CoordinationClient>, config: ZkConfig) -> Self {
        Self { client, config }
    }

    /// Start the client and wait up to `max_sleep * max_retries` for a session.
    ///
    /// A timeout is logged and the client closed; only a client that cannot
    /// be started at all is an error.
    pub async fn connect(client: Arc<dyn CoordinationClient>, config: ZkConfig) -> Result<Self> {
        client.start().await?;

        let wait = config.startup_wait();
        if !client.block_until_connected(wait).await {
            tracing::error!(
                "Could not connect to {} within {:?}, closing client",
                config.servers,
                wait
            );
            if let Err(e) = client.close().await {
                tracing::error!("Closing client failed: {}", e);
            }
        } else {
            tracing::info!("Connected to coordination service {}", config.servers);
        }

        Ok(Self { client, config })
    }

    pub fn get(&self) -> Arc<dyn CoordinationClient> {
        self.client.clone()
    }

    pub fn config(&self) -> &ZkConfig {
        &self.config
    }

    /// Read a node as UTF-8 text
    pub async fn get_value(&self, key: &str) -> Option<String> {
        match self.client.read(key).await {
            Ok(data) => Some(String::from_utf8_lossy(&data).into_owned()),
            Err(e) => {
                tracing::error!("Get key {} failed: {}", key, e);
                None
            }
        }
    }

    pub async fn is_existed(&self, key: &str) -> bool {
        match self.client.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::error!("Check key {} failed: {}", key, e);
                false
            }
        }
    }

    /// Create a persistent node or overwrite its value
    pub async fn persist(&self, key: &str, value: &str) {
        if self.is_existed(key).await {
            self.update(key, value).await;
            return;
        }
        if let Err(e) = self
            .client
            .create(key, value.as_bytes(), CreateMode::Persistent)
            .await
        {
            tracing::error!("Persist key {} value {} failed: {}", key, value, e);
        }
    }

    pub async fn update(&self, key: &str, value: &str) {
        if let Err(e) = self.client.write(key, value.as_bytes()).await {
            tracing::error!("Update key {} value {} failed: {}", key, value, e);
        }
    }

    /// Replace any existing node with an ephemeral one
    pub async fn persist_ephemeral(&self, key: &str, value: &str) {
        if self.is_existed(key).await {
            if let Err(e) = self.client.delete(key).await {
                tracing::error!("Persist ephemeral key {} failed: {}", key, e);
                return;
            }
        }
        if let Err(e) = self
            .client
            .create(key, value.as_bytes(), CreateMode::Ephemeral)
            .await
        {
            tracing::error!("Persist ephemeral key {} value {} failed: {}", key, value, e);
        }
    }

    /// Create a persistent sequential node, returning its actual path
    pub async fn persist_sequential(&self, key: &str, value: &str) -> Option<String> {
        match self
            .client
            .create(key, value.as_bytes(), CreateMode::PersistentSequential)
            .await
        {
            Ok(created) => Some(created),
            Err(e) => {
                tracing::error!("Persist sequential key {} value {} failed: {}", key, value, e);
                None
            }
        }
    }

    pub async fn persist_ephemeral_sequential(&self, key: &str) {
        if let Err(e) = self
            .client
            .create(key, &[], CreateMode::EphemeralSequential)
            .await
        {
            tracing::error!("Persist ephemeral sequential key {} failed: {}", key, e);
        }
    }

    /// Delete a node and its children
    pub async fn remove(&self, key: &str) {
        if let Err(e) = self.client.delete(key).await {
            tracing::error!("Remove key {} failed: {}", key, e);
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.client.close().await {
            tracing::error!("Close client failed: {}", e);
        }
    }
}
