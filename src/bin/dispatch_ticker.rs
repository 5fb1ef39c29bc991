//! dispatch-ticker: Timer driver
//!
//! Emits a `ticker.tick` event every interval and forwards it to the local
//! sidecar. Useful as a heartbeat and for smoke-testing a deployment.
//!
//! ## Configuration
//! - DISPATCH_CONFIG: Path to a YAML config file (optional)
//! - DISPATCH__INTERVAL_MS: Emit interval (default: 1000)
//! - DISPATCH__SOURCE_ID: Source ID stamped on each tick (default: hostname)
//! - DISPATCH_URL, or DISPATCH_HOST / DISPATCH_PORT: sidecar address
//!
//! Exits non-zero on the first failed delivery.

use tracing::{error, info};

use dispatch_events::config::DriverConfig;
use dispatch_events::driver::{Driver, TickerConsumer};
use dispatch_events::utils::bootstrap::{init_tracing, shutdown_signal, shutdown_tracing};
use dispatch_events::SidecarClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = DriverConfig::load(None)?;
    init_tracing("dispatch-ticker", config.debug, config.tracer_url.as_deref())?;

    let source_id = config
        .source_id
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "dispatch-ticker".to_string());
    let consumer = TickerConsumer::new(config.interval()?, source_id);

    // Blocks until the sidecar is healthy
    let client = SidecarClient::connect(config.client_options()).await?;
    info!(sidecar = %client.url(), "dispatch-ticker started");

    let driver = Driver::new(consumer, client);
    let outcome = tokio::select! {
        result = driver.run() => result.map(|sent| info!(sent, "Ticker stopped")),
        _ = shutdown_signal() => Ok(()),
    };

    if let Err(e) = driver.close().await {
        error!(error = %e, "Failed to close consumer");
    }
    shutdown_tracing();

    outcome?;
    Ok(())
}
