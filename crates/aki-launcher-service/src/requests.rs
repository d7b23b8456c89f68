//! Requests against the local game server.

use std::fmt;
use std::io::Read;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use flate2::read::ZlibDecoder;
use futures::future::BoxFuture;
use reqwest::{StatusCode, Url};
use thiserror::Error;

/// The body the server answers a successful ping with.
const PONG: &str = "pong!";

/// How long a single connection attempt may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a single ping may take once connected.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An error that happens while talking to the game server.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request could not be sent or its response not be read.
    #[error("failed to reach the server")]
    Transport(#[from] reqwest::Error),
    /// The server answered with an error status.
    #[error("server responded with status {0}")]
    Status(StatusCode),
    /// The request URL could not be built from the server address.
    #[error("invalid server address")]
    InvalidAddress(#[from] url::ParseError),
}

/// The server calls the process services depend on.
pub trait ServerRequester: Send + Sync + fmt::Debug {
    /// Pings the server at `address`.
    ///
    /// Resolves to the round-trip time, or to `None` if the server answered with something else
    /// than a pong.
    fn ping(&self, address: SocketAddr) -> BoxFuture<'_, Result<Option<Duration>, RequestError>>;
}

/// A [`ServerRequester`] talking HTTP.
#[derive(Debug, Clone)]
pub struct HttpServerRequester {
    client: reqwest::Client,
    connect_window: Duration,
    retry_interval: Duration,
}

impl HttpServerRequester {
    /// Creates a requester that keeps retrying refused connections for `connect_window`.
    ///
    /// A freshly started server needs a moment before it accepts connections. Fails if the
    /// HTTP client cannot be set up.
    pub fn new(connect_window: Duration) -> Result<Self, RequestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            connect_window,
            retry_interval: Duration::from_millis(500),
        })
    }

    pub fn connect_window(&self) -> Duration {
        self.connect_window
    }

    /// Sets the pause between two connection attempts.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    async fn ping_address(&self, address: SocketAddr) -> Result<Option<Duration>, RequestError> {
        let url = ping_url(address)?;
        let started = Instant::now();

        loop {
            let attempt = Instant::now();
            let response = match self.client.get(url.clone()).send().await {
                Ok(response) => response,
                Err(e) if e.is_connect() && started.elapsed() < self.connect_window => {
                    tracing::trace!("Server at {} not reachable yet", address);
                    tokio::time::sleep(self.retry_interval).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if !status.is_success() {
                return Err(RequestError::Status(status));
            }
            let body = response.bytes().await?;
            let elapsed = attempt.elapsed();

            if !is_pong(&decode_body(&body)) {
                tracing::debug!("Server at {} did not answer the ping", address);
                return Ok(None);
            }
            metric!(timer("server.ping") = elapsed);
            return Ok(Some(elapsed));
        }
    }
}

impl ServerRequester for HttpServerRequester {
    fn ping(&self, address: SocketAddr) -> BoxFuture<'_, Result<Option<Duration>, RequestError>> {
        Box::pin(self.ping_address(address))
    }
}

/// The ping endpoint of the server listening at `address`.
pub fn ping_url(address: SocketAddr) -> Result<Url, url::ParseError> {
    Url::parse(&format!("http://{address}/"))?.join("launcher/ping")
}

/// Inflates zlib compressed response bodies and returns everything else unchanged.
fn decode_body(body: &[u8]) -> Vec<u8> {
    // Magic bytes for zlib
    if let [0x78, 0x01 | 0x5e | 0x9c | 0xda, ..] = body {
        let mut inflated = Vec::new();
        match ZlibDecoder::new(body).read_to_end(&mut inflated) {
            Ok(_) => return inflated,
            Err(e) => tracing::trace!(error = %e, "Response body is not zlib data after all"),
        }
    }
    body.to_vec()
}

fn is_pong(body: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    text.trim().trim_matches('"') == PONG
}
