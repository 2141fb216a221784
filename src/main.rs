//! Phone Agent Hub - command-and-control server for Android devices
//!
//! Run with: cargo run --bin phone-agent-hub

use std::sync::Arc;

use anyhow::Context;
use phone_agent_hub::agent::{MemorySessionStore, SessionManager, SessionRunner};
use phone_agent_hub::ledger::ConnectionLedger;
use phone_agent_hub::model::ModelClient;
use phone_agent_hub::server::{self, AppState, StaticKeyAuthenticator};
use phone_agent_hub::skills::SkillDispatcher;
use phone_agent_hub::ServerSettings;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,phone_agent_hub=debug")),
        )
        .init();

    let settings = ServerSettings::load();
    let server_config = settings.server_config();

    println!("📱 Phone Agent Hub");
    println!("================================================");
    println!("Listening: {}", settings.bind_addr);
    println!("Model: {} @ {}", settings.model_name, settings.base_url);
    println!("Coordinate System: {:?}", settings.coordinates());
    println!(
        "Sessions: max {} steps, stuck after {} unchanged screens",
        settings.max_steps, settings.stuck_threshold
    );
    println!("================================================\n");

    let auth = StaticKeyAuthenticator::new(settings.api_keys.clone());
    if auth.is_empty() {
        warn!("No API keys configured (HUB_API_KEYS); every connection will be refused");
    }

    let ledger = Arc::new(ConnectionLedger::new(settings.ledger_config()));
    let runner = SessionRunner::new(
        settings.agent_config(),
        Arc::new(ModelClient::new(settings.model_config())),
        Arc::new(MemorySessionStore::new()),
        ledger.clone(),
        SkillDispatcher::default(),
    );
    let sessions = Arc::new(SessionManager::new(ledger.clone(), Arc::new(runner)));
    let state = AppState::new(ledger.clone(), sessions, Arc::new(auth), server_config.clone());

    let keepalive = server::spawn_keepalive(ledger, server_config.ping_interval);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "Hub listening");

    let served = axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await;
    keepalive.abort();
    served.context("Server error")
}
