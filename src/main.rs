//! Payment Watcher
//!
//! Watches wallet daemons for incoming on-chain transfers, matches them
//! against outstanding payment prompts, and reports settlement to the host
//! application. One payment listener and one summary publisher run per
//! configured network; networks missing daemon URIs are disabled at startup
//! with a warning.

mod api;
mod config;
mod listener;
mod pool;
mod reconciler;
mod rpc;
mod summary;
mod wallet;

use api::ApiState;
use config::Config;
use listener::PaymentListener;
use pool::WalletPool;
use reconciler::{PaymentEvent, PromptRegistry};
use summary::{SummaryMap, SummaryPublisher};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line args
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/payment-watcher/config.toml".to_string());

    // Load configuration
    let config = Config::load_with_env(&config_path)?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting payment watcher");

    // Build daemon clients; incompletely configured networks are disabled
    // here with a warning
    let pool = Arc::new(WalletPool::from_config(&config)?);
    let prompts = Arc::new(PromptRegistry::new());
    let summaries: SummaryMap = Arc::new(RwLock::new(HashMap::new()));

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Settlement events are the host integration point; drain and log them
    let (event_tx, mut event_rx) = mpsc::channel::<PaymentEvent>(256);
    let event_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            info!(
                network = %event.network,
                txid = %event.txid,
                address = %event.address,
                amount = event.amount,
                confirmations = event.confirmations,
                result = ?event.result,
                "payment event"
            );
        }
    });

    // Start API server
    let api_state = ApiState {
        pool: pool.clone(),
        prompts: prompts.clone(),
        summaries: summaries.clone(),
        api_token: config.api.token.clone(),
    };
    let api_router = api::create_router(api_state);
    let api_addr: SocketAddr = format!("{}:{}", config.api.listen, config.api.port)
        .parse()
        .expect("Invalid API address");

    let api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(async move {
        info!("API server listening on {}", api_addr);

        let listener = tokio::net::TcpListener::bind(api_addr)
            .await
            .expect("Failed to bind API server");

        axum::serve(listener, api_router)
            .with_graceful_shutdown(shutdown_signal(api_shutdown))
            .await
            .expect("API server error");
    });

    // Start per-network background tasks
    let mut handles = vec![];
    let poll_interval = Duration::from_secs(config.service.poll_interval_secs);
    let summary_interval = Duration::from_secs(config.service.summary_interval_secs);

    for network in pool.handles() {
        let listener = PaymentListener::new(
            network.clone(),
            prompts.clone(),
            event_tx.clone(),
            poll_interval,
        );
        let listener_shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(listener.run(listener_shutdown)));

        let publisher = SummaryPublisher::new(network.clone(), summaries.clone(), summary_interval);
        let publisher_shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(publisher.run(publisher_shutdown)));

        info!(network = %network.network(), "payment listener and summary publisher started");
    }

    // Only the listeners hold event senders from here on, so the drain task
    // ends once they do
    drop(event_tx);

    info!("Payment watcher ready");

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    // Send shutdown signal and let in-flight poll cycles finish
    let _ = shutdown_tx.send(());

    for handle in handles {
        let _ = handle.await;
    }
    pool.close_all().await;
    let _ = api_handle.await;
    let _ = event_handle.await;

    info!("Payment watcher shut down");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal(mut shutdown: broadcast::Receiver<()>) {
    let _ = shutdown.recv().await;
}
