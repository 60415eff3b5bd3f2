//! Candidate iperf servers and lowest-latency selection.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::probes::PingProbe;

/// iperf's own default port.
pub const DEFAULT_IPERF_PORT: u16 = 5201;

/// A remote peer: its control endpoint and the port its iperf server
/// listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub control_port: u16,
    pub iperf_port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, control_port: u16, iperf_port: u16) -> Self {
        Self {
            host: host.into(),
            control_port,
            iperf_port,
        }
    }

    /// Parses either the full `HOST:CONTROL_PORT:IPERF_PORT` form or a bare
    /// host, which gets `control_port` and the default iperf port.
    pub fn parse_with_default(s: &str, control_port: u16) -> Result<Self> {
        let bare = !s.contains(':') || (s.contains("::") && !s.starts_with('['));
        if bare {
            if s.is_empty() || s.starts_with('-') {
                bail!("invalid host {:?}", s);
            }
            return Ok(Self::new(s, control_port, DEFAULT_IPERF_PORT));
        }
        s.parse()
    }

    /// `host:control_port`, with IPv6 literals bracketed.
    pub fn control_authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.control_port)
        } else {
            format!("{}:{}", self.host, self.control_port)
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (iperf port {})", self.control_authority(), self.iperf_port)
    }
}

/// Parses `HOST:CONTROL_PORT:IPERF_PORT`; IPv6 hosts go in brackets.
impl FromStr for ServerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, ports) = if let Some(rest) = s.strip_prefix('[') {
            let (host, ports) = rest
                .split_once("]:")
                .with_context(|| format!("unterminated IPv6 host in {:?}", s))?;
            (host, ports)
        } else {
            s.split_once(':')
                .with_context(|| format!("expected HOST:CONTROL_PORT:IPERF_PORT, got {:?}", s))?
        };

        let (control, iperf) = ports
            .split_once(':')
            .with_context(|| format!("missing iperf port in {:?}", s))?;
        if host.is_empty() {
            bail!("empty host in {:?}", s);
        }
        Ok(Self {
            host: host.to_string(),
            control_port: control
                .parse()
                .with_context(|| format!("invalid control port {:?}", control))?,
            iperf_port: iperf
                .parse()
                .with_context(|| format!("invalid iperf port {:?}", iperf))?,
        })
    }
}

/// Source of candidate servers for a test run.
#[async_trait::async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn candidates(&self) -> Result<Vec<ServerAddress>>;
}

/// A fixed candidate list.
#[derive(Debug, Clone)]
pub struct StaticServers(pub Vec<ServerAddress>);

#[async_trait::async_trait]
impl ServerDirectory for StaticServers {
    async fn candidates(&self) -> Result<Vec<ServerAddress>> {
        Ok(self.0.clone())
    }
}

/// Ping every candidate concurrently. Results are in candidate order.
pub async fn ping_all(candidates: &[ServerAddress], probe: &dyn PingProbe) -> Vec<Result<f64>> {
    join_all(candidates.iter().map(|c| probe.round_trip(&c.host))).await
}

/// Index of the reachable candidate with the lowest round trip, and that
/// round trip in whole milliseconds. Ties go to the earlier candidate.
pub fn pick_fastest(candidates: &[ServerAddress], pings: &[Result<f64>]) -> Option<(usize, u64)> {
    candidates
        .iter()
        .zip(pings)
        .enumerate()
        .filter_map(|(i, (candidate, ping))| match ping {
            Ok(ms) => {
                debug!(host = %candidate.host, rtt_ms = ms, "server reachable");
                Some((i, *ms))
            }
            Err(e) => {
                warn!(host = %candidate.host, error = %e, "server unreachable");
                None
            }
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, ms)| (i, ms.round() as u64))
}

/// Probe every candidate concurrently and return the reachable one with the
/// lowest round trip, in whole milliseconds.
pub async fn select_fastest(
    candidates: &[ServerAddress],
    probe: &dyn PingProbe,
) -> Option<(ServerAddress, u64)> {
    let pings = ping_all(candidates, probe).await;
    pick_fastest(candidates, &pings).map(|(i, ms)| (candidates[i].clone(), ms))
}
