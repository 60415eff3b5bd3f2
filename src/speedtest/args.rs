//! Command lines for the throughput tool.

use std::fmt;

use crate::config::IperfConfig;

use super::server::ServerAddress;

/// One of the two measurement intervals of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Download,
    Upload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Download => write!(f, "download"),
            Phase::Upload => write!(f, "upload"),
        }
    }
}

/// Builds the argument strings handed to the local client and to the peer.
#[derive(Debug, Clone)]
pub struct IperfArgs<'a> {
    config: &'a IperfConfig,
}

impl<'a> IperfArgs<'a> {
    pub fn new(config: &'a IperfConfig) -> Self {
        Self { config }
    }

    /// Client arguments for `phase`: CSV reports every interval at a fixed
    /// bitrate ceiling; download runs in reverse so the peer sends.
    pub fn client(&self, server: &ServerAddress, phase: Phase) -> String {
        let mut args = format!(
            "-c {} -p {} -i {} -y C",
            server.host, server.iperf_port, self.config.interval_sec
        );
        if self.config.udp {
            args.push_str(" -u");
        }
        args.push_str(" -b ");
        args.push_str(&self.config.bitrate);
        if phase == Phase::Download {
            args.push_str(" -R");
        }
        args
    }

    /// Arguments the peer's control endpoint starts its server with.
    pub fn server(&self) -> &str {
        &self.config.server_args
    }
}
