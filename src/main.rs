//! notif-hub server binary

use clap::Parser;
use notif_hub::api::auth::hash_key;
use notif_hub::config::HubConfig;
use notif_hub::error::{HubError, Result};
use notif_hub::server::Hub;
use notif_hub::store::SqlStore;
use notif_hub::stream::{MemoryGateway, NatsGateway, StreamGateway};
use notif_hub::tenant::Tenant;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "notif-hub", about = "Managed publish/subscribe event hub")]
struct Args {
    /// Path to a JSON config file; defaults apply when omitted
    #[arg(long, env = "NOTIF_CONFIG")]
    config: Option<String>,

    /// Listen address override
    #[arg(long, env = "NOTIF_BIND")]
    bind: Option<String>,

    /// NATS URL override
    #[arg(long, env = "NOTIF_NATS_URL")]
    nats_url: Option<String>,

    /// Run against the in-process stream backend instead of NATS
    #[arg(long, env = "NOTIF_MEMORY_STREAM")]
    memory_stream: bool,

    /// Emit logs as JSON
    #[arg(long, env = "NOTIF_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(url) = args.nats_url {
        config.nats.url = url;
    }

    let gateway: Arc<dyn StreamGateway> = if args.memory_stream {
        tracing::warn!("Using the in-process stream backend; events do not survive restarts");
        Arc::new(MemoryGateway::new())
    } else {
        Arc::new(NatsGateway::connect(&config.nats, &config.stream).await?)
    };

    let store = Arc::new(SqlStore::connect(&config.database.url).await?);
    for key in &config.auth.static_keys {
        let tenant = Tenant::new(key.org.clone(), key.project.clone());
        store.insert_api_key(&hash_key(&key.key), &tenant).await?;
    }
    if !config.auth.static_keys.is_empty() {
        tracing::info!(count = config.auth.static_keys.len(), "Static API keys loaded");
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .map_err(|e| HubError::Connection(format!("{}: {}", config.server.bind, e)))?;

    let hub = Hub::build(config, gateway, store);
    let shutdown = hub.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    hub.serve(listener).await
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&str>) -> Result<HubConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| HubError::Config(format!("failed to read {path}: {e}")))?;
            serde_json::from_str(&raw)
                .map_err(|e| HubError::Config(format!("failed to parse {path}: {e}")))
        }
        None => Ok(HubConfig::default()),
    }
}
