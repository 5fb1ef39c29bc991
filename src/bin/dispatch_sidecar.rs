//! dispatch-sidecar: Event ingestion sidecar
//!
//! Accepts event payloads from a co-located driver, validates them and
//! publishes each event to the configured transport under the tenant
//! organization.
//!
//! ## Architecture
//! ```text
//! [driver] --(HTTP POST / or UDS)--> [dispatch-sidecar] --> [memory | rabbitmq | kafka]
//! ```
//!
//! ## Configuration
//! - DISPATCH_CONFIG: Path to a YAML config file (optional)
//! - DISPATCH__LISTENER_PROTOCOL: `http` (default) or `pipe`
//! - DISPATCH__LISTENER_PORT: TCP port (default: 8080)
//! - DISPATCH__TRANSPORT: `memory` (default), `rabbitmq` or `kafka`
//! - DISPATCH__TENANT: Organization events are published under
//! - DISPATCH_LOG: Log filter (overrides `debug`)

use tracing::{error, info};

use dispatch_events::bus::init_transport;
use dispatch_events::config::SidecarConfig;
use dispatch_events::sidecar::{self, SidecarState};
use dispatch_events::utils::bootstrap::{init_tracing, shutdown_signal, shutdown_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SidecarConfig::load(None)?;
    init_tracing("dispatch-sidecar", config.debug, config.tracer_url.as_deref())?;

    let transport = init_transport(&config.transport_config()?).await?;
    let state = SidecarState::new(transport.clone(), config.tenant.as_str());

    info!(
        protocol = %config.listener_protocol,
        transport = %config.transport,
        "dispatch-sidecar starting"
    );

    let served = sidecar::serve(&config, state, shutdown_signal()).await;

    if let Err(e) = transport.close().await {
        error!(error = %e, "Failed to close transport");
    }
    shutdown_tracing();

    served?;
    Ok(())
}
