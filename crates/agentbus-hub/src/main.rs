use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agentbus_hub::{HubArgs, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = HubArgs::parse();
    let state = args.state().await?;

    info!(
        bind = %args.bind,
        log = %state.log.describe(),
        authenticated = state.token.is_some(),
        "agentbus-hub starting"
    );

    let hub = state.hub.clone();
    let listener = tokio::net::TcpListener::bind(args.bind).await?;

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            hub.close();
        })
        .await?;

    info!("agentbus-hub stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}
