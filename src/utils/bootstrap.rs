//! Bootstrap utilities for dispatch binaries.
//!
//! Shared initialization code for the sidecar and driver binaries.

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

/// Log filter: `DISPATCH_LOG` if set, else `debug` or `info`.
pub fn log_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }))
}

/// Initialize tracing.
///
/// With the `otel` feature and a `tracer_url`, spans are also exported over
/// OTLP and the W3C trace-context propagator is installed globally, which
/// turns on trace propagation through HTTP and broker headers.
pub fn init_tracing(
    service_name: &str,
    debug: bool,
    tracer_url: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = tracing_subscriber::registry()
        .with(log_filter(debug))
        .with(tracing_subscriber::fmt::layer());

    #[cfg(feature = "otel")]
    if let Some(url) = tracer_url {
        let tracer = otel::install(service_name, url)?;
        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
        info!(service = service_name, tracer_url = url, "Tracing export enabled");
        return Ok(());
    }

    registry.try_init()?;
    if let Some(url) = tracer_url {
        warn!(
            tracer_url = url,
            "tracer_url is set but the otel feature is not compiled in"
        );
    }
    info!(service = service_name, "Tracing initialized");
    Ok(())
}

/// Flush and stop span export. No-op without the `otel` feature.
pub fn shutdown_tracing() {
    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::trace::{Tracer, TracerProvider};
    use opentelemetry_sdk::{runtime, Resource};

    pub fn install(service_name: &str, url: &str) -> Result<Tracer, Box<dyn std::error::Error>> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(url)
            .build()?;

        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                service_name.to_string(),
            )]))
            .build();

        let tracer = provider.tracer(service_name.to_string());
        opentelemetry::global::set_tracer_provider(provider);
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        Ok(tracer)
    }
}

/// Resolves on SIGINT (ctrl-c) or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
