//! HTTP client used by drivers to reach a sidecar.
//!
//! Construction blocks on a health check (GET on the sidecar URL with
//! jittered exponential backoff) so a driver never starts pumping events
//! into a sidecar that is not listening yet.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::{ClientError, Result};
use crate::trace::{self, TraceCarrier};
use crate::validation;

/// Environment variable for a full sidecar URL (overrides host/port).
pub const URL_ENV_VAR: &str = "DISPATCH_URL";
/// Environment variable for the sidecar host.
pub const HOST_ENV_VAR: &str = "DISPATCH_HOST";
/// Environment variable for the sidecar port.
pub const PORT_ENV_VAR: &str = "DISPATCH_PORT";
/// Environment variable for the bearer token sent with every request.
pub const API_KEY_ENV_VAR: &str = "DISPATCH_API_KEY";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to reach the sidecar.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    /// Full URL; wins over `host`/`port` when set.
    pub url: Option<String>,
    pub token: Option<String>,
    /// Overall budget for the startup health check.
    pub health_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            url: None,
            token: None,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientOptions {
    /// Defaults overlaid with `DISPATCH_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(url) = std::env::var(URL_ENV_VAR) {
            options.url = Some(url);
        }
        if let Ok(host) = std::env::var(HOST_ENV_VAR) {
            options.host = host;
        }
        if let Some(port) = std::env::var(PORT_ENV_VAR)
            .ok()
            .and_then(|p| p.parse().ok())
        {
            options.port = port;
        }
        if let Ok(token) = std::env::var(API_KEY_ENV_VAR) {
            options.token = Some(token);
        }
        options
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Resolve the sidecar URL.
    pub fn target_url(&self) -> Result<Url> {
        let raw = match &self.url {
            Some(url) => url.clone(),
            None => format!("http://{}:{}/", self.host, self.port),
        };
        Url::parse(&raw).map_err(|e| ClientError::InvalidAddress(format!("{}: {}", raw, e)))
    }
}

/// Backoff for the startup health check.
///
/// - Min delay: 250ms
/// - Factor: 2
/// - Max delay: 5s
/// - Jitter enabled
/// - Unbounded attempts (the caller's timeout ends the loop)
pub fn health_check_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_factor(2.0)
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(usize::MAX)
        .with_jitter()
}

/// Anything that can deliver envelopes to a sidecar.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send_one(&self, envelope: &Envelope) -> Result<()>;

    async fn send(&self, envelopes: &[Envelope]) -> Result<()>;
}

/// Sidecar client over HTTP.
#[derive(Clone, Debug)]
pub struct SidecarClient {
    http: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl SidecarClient {
    /// Build a client and wait until the sidecar answers its health check.
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        let client = Self::new(&options)?;
        client.wait_healthy(options.health_timeout).await?;
        info!(url = %client.url, "Sidecar is healthy");
        Ok(client)
    }

    /// Connect using `DISPATCH_*` environment variables.
    pub async fn from_env() -> Result<Self> {
        Self::connect(ClientOptions::from_env()).await
    }

    /// Build a client without the health check.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        let url = options.target_url()?;
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            http,
            url,
            token: options.token.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Single liveness probe.
    pub async fn health(&self) -> Result<()> {
        self.http
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn wait_healthy(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let probe = (|| async { self.health().await })
            .retry(health_check_backoff())
            .notify(|err: &ClientError, delay: Duration| {
                debug!(url = %self.url, error = %err, delay = ?delay, "Sidecar not ready, retrying");
            });

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(url = %self.url, error = %e, "Sidecar health check gave up");
                Err(ClientError::Timeout {
                    url: self.url.to_string(),
                    elapsed: started.elapsed(),
                })
            }
            Err(_) => Err(ClientError::Timeout {
                url: self.url.to_string(),
                elapsed: started.elapsed(),
            }),
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<()> {
        let mut carrier = TraceCarrier::new();
        trace::inject_context(&mut carrier);

        let mut request = self.http.post(self.url.clone()).json(body);
        for (key, value) in &carrier {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::CREATED {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl EventSender for SidecarClient {
    #[tracing::instrument(name = "client.send_one", skip_all, fields(event_id = %envelope.event_id))]
    async fn send_one(&self, envelope: &Envelope) -> Result<()> {
        validation::validate(envelope)?;
        self.post(envelope).await?;
        debug!("Event delivered to sidecar");
        Ok(())
    }

    #[tracing::instrument(name = "client.send", skip_all, fields(count = envelopes.len()))]
    async fn send(&self, envelopes: &[Envelope]) -> Result<()> {
        validation::validate_all(envelopes)?;
        self.post(envelopes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn sample() -> Envelope {
        Envelope::new("ticker", "tick", "ticker", "ticker-1", json!({"seq": 1}))
    }

    async fn spawn(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn fast(url: &str) -> ClientOptions {
        ClientOptions::default()
            .with_url(url)
            .with_health_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_target_url_from_host_port() {
        let options = ClientOptions::default().with_host("sidecar").with_port(9000);
        assert_eq!(options.target_url().unwrap().as_str(), "http://sidecar:9000/");
    }

    #[test]
    fn test_target_url_override_wins() {
        let options = ClientOptions::default()
            .with_host("ignored")
            .with_url("http://gateway.example.com/ingest");
        assert_eq!(
            options.target_url().unwrap().as_str(),
            "http://gateway.example.com/ingest"
        );
    }

    #[test]
    fn test_invalid_url() {
        let options = ClientOptions::default().with_url("not a url");
        assert!(matches!(
            options.target_url(),
            Err(ClientError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_waits_for_health() {
        let url = spawn(Router::new().route("/", get(|| async { AxumStatus::OK }))).await;
        let client = SidecarClient::connect(fast(&url)).await.unwrap();
        assert_eq!(client.url().as_str(), url);
    }

    #[tokio::test]
    async fn test_connect_retries_until_healthy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        AxumStatus::SERVICE_UNAVAILABLE
                    } else {
                        AxumStatus::OK
                    }
                }
            }),
        );
        let url = spawn(router).await;

        SidecarClient::connect(fast(&url)).await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        // Bind then drop so the port refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = ClientOptions::default()
            .with_url(format!("http://{}/", addr))
            .with_health_timeout(Duration::from_millis(600));
        let err = SidecarClient::connect(options).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }), "{}", err);
    }

    #[tokio::test]
    async fn test_send_one_validates_before_network() {
        // Nothing listens here; a network call would fail differently.
        let client = SidecarClient::new(&ClientOptions::default().with_url("http://127.0.0.1:9/"))
            .unwrap();
        let mut env = sample();
        env.namespace.clear();

        let err = client.send_one(&env).await.unwrap_err();
        assert!(err.is_validation_error(), "{}", err);
    }

    #[tokio::test]
    async fn test_send_one_posts_and_accepts_created() {
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let router = Router::new().route(
            "/",
            get(|| async { AxumStatus::OK }).post(move |headers: HeaderMap, body: String| {
                let counter = counter.clone();
                async move {
                    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
                    assert!(value.is_object());
                    assert_eq!(
                        headers.get("authorization").unwrap().to_str().unwrap(),
                        "Bearer secret"
                    );
                    counter.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::CREATED
                }
            }),
        );
        let url = spawn(router).await;

        let client = SidecarClient::connect(fast(&url).with_token("secret"))
            .await
            .unwrap();
        client.send_one(&sample()).await.unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_batch_posts_array() {
        let router = Router::new().route(
            "/",
            get(|| async { AxumStatus::OK }).post(|body: String| async move {
                let value: serde_json::Value = serde_json::from_str(&body).unwrap();
                assert_eq!(value.as_array().map(Vec::len), Some(2));
                AxumStatus::CREATED
            }),
        );
        let url = spawn(router).await;

        let client = SidecarClient::connect(fast(&url)).await.unwrap();
        client.send(&[sample(), sample()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_created_is_rejected() {
        let router = Router::new().route(
            "/",
            get(|| async { AxumStatus::OK })
                .post(|| async { (AxumStatus::BAD_REQUEST, "No events parsed") }),
        );
        let url = spawn(router).await;

        let client = SidecarClient::connect(fast(&url)).await.unwrap();
        let err = client.send_one(&sample()).await.unwrap_err();
        match err {
            ClientError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "No events parsed");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
