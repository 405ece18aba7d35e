use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mocklm::config::SimConfig;
use mocklm::handlers;
use mocklm::state::AppState;

#[derive(Parser)]
#[command(name = "mocklm")]
#[command(about = "OpenAI-compatible LLM API simulator", long_about = None)]
struct Cli {
    /// Path to a JSON config file; flags below override its values.
    #[arg(short, long, env = "MOCKLM_CONFIG")]
    config: Option<String>,

    /// Server host.
    #[arg(long, env = "MOCKLM_HOST")]
    host: Option<String>,

    /// Server port.
    #[arg(short, long, env = "MOCKLM_PORT")]
    port: Option<u16>,

    /// Enable debug logging regardless of RUST_LOG.
    #[arg(long)]
    debug: bool,

    /// Enable per-key rate limiting.
    #[arg(long)]
    rate_limit: bool,

    /// Rate-limit tier (free, tier-1 .. tier-5).
    #[arg(long)]
    tier: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "mocklm=debug,tower_http=debug"
    } else {
        "mocklm=info,tower_http=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            let config = SimConfig::from_file(path)?;
            tracing::info!(path = %path, "loaded config file");
            config
        }
        None => SimConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.debug {
        config.debug = true;
    }
    if cli.rate_limit {
        config.rate_limit_enabled = true;
    }
    if let Some(tier) = cli.tier {
        config.rate_limit_tier = tier;
    }

    let state = AppState::from_config(config)?;
    tracing::info!(
        workers = state.pool.len(),
        block_size = state.router.block_size(),
        rate_limiting = state.limiter.is_some(),
        "simulation core ready"
    );

    tokio::spawn(state.streamer.clone().run());

    let addr = SocketAddr::new(state.config.host.parse()?, state.config.port);
    let app = handlers::build_router(state);

    tracing::info!("mocklm listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
