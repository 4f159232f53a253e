//! Leader election demonstration
//!
//! Starts three participants on an in-process ensemble, then expires the
//! leader's session and shows another participant taking over.

use async_trait::async_trait;
use ffzk_client::{CoordinationClient, MemoryClient, MemoryEnsemble, ZkConfig};
use ffzk_election::{ElectionEngine, LeaderHandler, StandByHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

struct Announcer {
    name: String,
}

#[async_trait]
impl LeaderHandler for Announcer {
    async fn leader_handle(&self) -> anyhow::Result<()> {
        println!("👑 {} is now the leader", self.name);
        Ok(())
    }
}

#[async_trait]
impl StandByHandler for Announcer {
    async fn standby_handle(&self) -> anyhow::Result<()> {
        println!("💤 {} is standing by", self.name);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("🚀 Starting leader election demo");

    let ensemble = MemoryEnsemble::new();
    let mut config = ZkConfig::from_toml_str(
        r#"
        servers = "memory:2181"
        base_sleep_time_milliseconds = 100
        max_sleep_time_milliseconds = 500

        [election]
        enable = true
        "#,
    )?;

    let mut nodes = Vec::new();
    for name in ["billing", "reports", "mailer"] {
        config.application_name = Some(name.to_string());
        let client = Arc::new(MemoryClient::new(ensemble.clone(), &config));
        client.start().await?;

        let announcer = Arc::new(Announcer {
            name: name.to_string(),
        });
        let Some(engine) = ElectionEngine::from_config(client.clone(), &config) else {
            continue;
        };
        let engine = engine
            .with_leader_handler(announcer.clone())
            .with_standby_handler(announcer);
        engine.init().await;
        nodes.push((client, engine));
    }

    sleep(Duration::from_secs(2)).await;
    print_status(&nodes);

    // Crash the leader's session
    if let Some((client, engine)) = nodes.iter().find(|(_, e)| e.is_leader()) {
        println!("\n💥 Expiring session of {}", engine.participant_id());
        if let Some(session) = client.session_id() {
            ensemble.expire_session(session);
        }
    }

    sleep(Duration::from_secs(2)).await;
    print_status(&nodes);

    println!("\n🛑 Shutting down");
    for (client, engine) in &nodes {
        engine.close().await;
        client.close().await?;
    }

    Ok(())
}

fn print_status(nodes: &[(Arc<MemoryClient>, ElectionEngine)]) {
    println!("\n📊 Election status:");
    for (_, engine) in nodes {
        println!(
            "  {} leader={} role={} sees leader {:?}",
            engine.participant_id(),
            engine.is_leader(),
            engine.role(),
            engine.current_leader_id()
        );
    }
}
