//! Running summary of the speed samples of one phase.

use std::fmt;

use serde::Serialize;

/// Human-readable rate for a bit/s value.
pub fn format_speed(bps: f64) -> String {
    let mbps = bps / 1_000_000.0;
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// Count, minimum, maximum and sum of the samples seen so far, in bit/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpeedStatistics {
    pub count: u64,
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub sum: u64,
}

impl SpeedStatistics {
    pub fn accept(&mut self, sample: u64) {
        self.count += 1;
        self.sum = self.sum.saturating_add(sample);
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = Some(self.max.map_or(sample, |m| m.max(sample)));
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl fmt::Display for SpeedStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (Some(avg), Some(min), Some(max)) = (self.average(), self.min, self.max) else {
            return write!(f, "no samples");
        };
        write!(
            f,
            "{} avg ({} min, {} max, {} sample{})",
            format_speed(avg),
            format_speed(min as f64),
            format_speed(max as f64),
            self.count,
            if self.count == 1 { "" } else { "s" },
        )
    }
}
