//! Process entry point: load configuration, wire the collaborators (§1),
//! spawn the health/metrics server, and run the cycle scheduler until a
//! shutdown signal arrives (§5).
//!
//! Grounded on the teacher's `main.rs` (color-eyre install, a multi-thread
//! tokio runtime, structured `tracing` init, signal-driven shutdown
//! channels feeding independently-run managers); generalized from three
//! independent managers (watchers/writers/confirmation tracker) racing in
//! a `tokio::select!` to this relay's single cooperative scheduler plus one
//! spawned health/metrics task, since §5 requires the six directions to run
//! strictly in order rather than concurrently.

use std::sync::Arc;

use ledger_chain_relay::chain_client;
use ledger_chain_relay::config::{self, Config};
use ledger_chain_relay::ledger_client::HttpLedgerApi;
use ledger_chain_relay::redact;
use ledger_chain_relay::scheduler::Scheduler;
use ledger_chain_relay::signer::Signer;
use ledger_chain_relay::state::DurableState;
use ledger_chain_relay::api;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;
    init_logging(&config);

    tracing::info!(
        environment = ?config.environment,
        chain_id = config.chain.chain_id,
        bridge = %redact::scrub_line(&config.chain.bridge_address),
        "starting ledger-chain relay"
    );

    let ledger = HttpLedgerApi::new(&config.ledger)?;
    let signer = Signer::from_config(&config.signer)?;
    let failover = chain_client::RpcFailover::new(&config.chain)?;
    let state = DurableState::load(&config.state_file)?;

    tracing::info!(
        processed_attestations = state.processed_attestations.len(),
        last_scanned_block = state.last_scanned_block,
        "durable state loaded"
    );

    let api_state = Arc::new(api::ApiState::new(config.observability.health_bearer_token.clone()));
    let metrics_bind_addr = config.observability.metrics_bind_addr;
    tokio::spawn(async move {
        if let Err(e) = api::serve(metrics_bind_addr, api_state).await {
            tracing::error!(error = %e, "health/metrics server exited");
        }
    });

    let mut scheduler = Scheduler::new(ledger, signer, config, state, failover);
    scheduler.run_until_shutdown().await?;

    tracing::info!("ledger-chain relay stopped");
    Ok(())
}

/// Structured logging init (§2A, §9): JSON in production so log shipping
/// can parse it, human-readable text otherwise. `RUST_LOG` still wins when
/// set, matching the teacher's `EnvFilter::try_from_default_env` precedence.
fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match config.observability.log_format {
        config::LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_target(true))
                .with(filter)
                .init();
        }
        config::LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true))
                .with(filter)
                .init();
        }
    }
}
