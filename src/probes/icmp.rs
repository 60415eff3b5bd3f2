use super::PingProbe;
use anyhow::{bail, Context, Result};
use std::time::{Duration, Instant};
use tracing::warn;

/// ICMP round-trip probe (uses system ping)
pub struct IcmpProbe {
    pub timeout: Duration,
}

impl Default for IcmpProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait::async_trait]
impl PingProbe for IcmpProbe {
    async fn round_trip(&self, host: &str) -> Result<f64> {
        validate_host(host)?;
        let start = Instant::now();

        // -c 1: count 1
        // -W N: timeout in seconds
        let timeout_secs = self.timeout.as_secs().max(1);

        let output = tokio::process::Command::new("ping")
            .arg("-c").arg("1")
            .arg("-W").arg(timeout_secs.to_string())
            .arg(host)
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute ping")?;

        if !output.status.success() {
            bail!("{} did not answer ping", host);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(extract_rtt(&stdout).unwrap_or_else(|| {
            warn!("Ping success but failed to parse RTT for {}", host);
            start.elapsed().as_secs_f64() * 1000.0 // Fallback to wall clock
        }))
    }
}

fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        bail!("Host cannot be empty");
    }
    if host.starts_with('-') {
        bail!("Host cannot start with hyphen");
    }
    // Allow alphanumeric, dot, hyphen, colon (IPv6)
    if host.chars().any(|c| !c.is_alphanumeric() && c != '.' && c != '-' && c != ':') {
        bail!("Host contains invalid characters");
    }
    Ok(())
}

fn extract_rtt(output: &str) -> Option<f64> {
    // "time=12.3 ms"
    if let Some(pos) = output.find("time=") {
        let rest = &output[pos + 5..];
        if let Some(end) = rest.find(' ') {
            return rest[..end].parse::<f64>().ok();
        }
    }

    // "rtt min/avg/max/mdev = 14.188/14.188/14.188/0.000 ms"
    if let Some(pos) = output.find(" = ") {
        if output[..pos].contains("rtt") || output[..pos].contains("round-trip") {
            let parts: Vec<&str> = output[pos + 3..].split('/').collect();
            if parts.len() >= 2 {
                return parts[1].parse::<f64>().ok(); // avg
            }
        }
    }

    None
}
