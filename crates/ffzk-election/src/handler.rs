//! Application callbacks for role changes

use crate::error::{ElectionError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Invoked when this process becomes the leader
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaderHandler: Send + Sync {
    async fn leader_handle(&self) -> anyhow::Result<()>;
}

/// Invoked when this process becomes, or is confirmed as, a follower
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StandByHandler: Send + Sync {
    async fn standby_handle(&self) -> anyhow::Result<()>;
}

/// Registered handlers. Either may be absent, in which case the
/// corresponding transition is only logged.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub leader: Option<Arc<dyn LeaderHandler>>,
    pub standby: Option<Arc<dyn StandByHandler>>,
}

impl Handlers {
    /// Run the leader handler, logging any failure
    pub async fn on_leader(&self) {
        let Some(handler) = self.leader.clone() else {
            tracing::warn!("No leader handler registered");
            return;
        };
        let outcome = isolate("leader_handle", async move { handler.leader_handle().await }).await;
        if let Err(e) = outcome {
            tracing::error!("{}", e);
        }
    }

    /// Run the standby handler, logging any failure
    pub async fn on_standby(&self) {
        let Some(handler) = self.standby.clone() else {
            tracing::warn!("No standby handler registered");
            return;
        };
        let outcome = isolate("standby_handle", async move { handler.standby_handle().await }).await;
        if let Err(e) = outcome {
            tracing::error!("{}", e);
        }
    }
}

/// Run a handler on its own task so that an error or a panic is reported
/// instead of tearing down the caller
async fn isolate<F>(handler: &'static str, call: F) -> Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ElectionError::handler_failed(handler, format!("{:#}", e))),
        Err(join) if join.is_panic() => Err(ElectionError::handler_failed(handler, "panicked")),
        Err(join) => Err(ElectionError::handler_failed(handler, join)),
    }
}
