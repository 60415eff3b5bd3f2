use anyhow::Result;

pub mod icmp;

pub use self::icmp::IcmpProbe;

/// Round-trip latency probe used to rank candidate servers.
#[async_trait::async_trait]
pub trait PingProbe: Send + Sync {
    /// Round trip to `host` in milliseconds. An unreachable host is an error.
    async fn round_trip(&self, host: &str) -> Result<f64>;
}
