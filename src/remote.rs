//! Client for the peer's iperf control endpoint.
//!
//! The peer exposes `GET /start-iperf?args=...` and `GET /stop-iperf` and
//! answers with a short text body. Every failure, whether the host does not
//! resolve, the connection fails, the status is not 2xx or the timeout fires,
//! is reported as the same [`FAILURE_SENTINEL`] response.

use std::fmt;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::speedtest::ServerAddress;

/// Response text that stands for "the request failed".
pub const FAILURE_SENTINEL: &str = "error";

pub fn is_failure(response: &str) -> bool {
    response == FAILURE_SENTINEL
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Start,
    Stop,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Start => write!(f, "start"),
            RequestKind::Stop => write!(f, "stop"),
        }
    }
}

#[async_trait::async_trait]
pub trait RemoteControl: Send + Sync {
    /// Issue `kind` to the peer. `args` is forwarded with start requests.
    /// Returns the response body or [`FAILURE_SENTINEL`].
    async fn request(
        &self,
        server: &ServerAddress,
        kind: RequestKind,
        timeout: Duration,
        args: &str,
    ) -> String;
}

/// HTTP implementation over reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpRemoteControl {
    client: Client,
}

impl HttpRemoteControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn send(&self, server: &ServerAddress, kind: RequestKind, args: &str) -> reqwest::Result<String> {
        let base = format!("http://{}", server.control_authority());
        let request = match kind {
            RequestKind::Start => self
                .client
                .get(format!("{}/start-iperf", base))
                .query(&[("args", args)]),
            RequestKind::Stop => self.client.get(format!("{}/stop-iperf", base)),
        };
        request.send().await?.error_for_status()?.text().await
    }
}

#[async_trait::async_trait]
impl RemoteControl for HttpRemoteControl {
    async fn request(
        &self,
        server: &ServerAddress,
        kind: RequestKind,
        timeout: Duration,
        args: &str,
    ) -> String {
        debug!(server = %server, %kind, args, "remote control request");
        match tokio::time::timeout(timeout, self.send(server, kind, args)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                warn!(server = %server, %kind, error = %e, "remote control request failed");
                FAILURE_SENTINEL.to_string()
            }
            Err(_) => {
                warn!(server = %server, %kind, timeout_ms = timeout.as_millis() as u64, "remote control request timed out");
                FAILURE_SENTINEL.to_string()
            }
        }
    }
}
