//! Parsing of iperf's comma-separated report lines (`-y C`).
//!
//! A line looks like
//! `20240101120000,10.0.0.2,5001,10.0.0.1,41234,3,0.0-0.1,1470000,117600000`;
//! the ninth field is the bandwidth of the interval in bit/s.

use std::num::ParseIntError;

use thiserror::Error;

/// Zero-based index of the bandwidth field.
pub const SPEED_FIELD: usize = 8;

#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    #[error("expected at least {} fields, found {found} in {line:?}", SPEED_FIELD + 1)]
    TooFewFields { found: usize, line: String },

    #[error("invalid speed {field:?} in {line:?}")]
    InvalidSpeed {
        field: String,
        line: String,
        #[source]
        source: ParseIntError,
    },
}

/// Extract the bandwidth sample from one report line.
pub fn parse_speed(line: &str) -> Result<u64, SampleError> {
    let fields: Vec<&str> = line.split(',').collect();
    let field = fields.get(SPEED_FIELD).ok_or_else(|| SampleError::TooFewFields {
        found: fields.len(),
        line: line.to_string(),
    })?;
    field
        .trim()
        .parse::<u64>()
        .map_err(|source| SampleError::InvalidSpeed {
            field: field.to_string(),
            line: line.to_string(),
            source,
        })
}

/// Reassembles text chunks into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    /// Append `chunk` and return every line it completed, without the line
    /// terminator. Blank lines are skipped.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let Some(last_newline) = self.partial.rfind('\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Take the unterminated remainder, if any.
    pub fn take_partial(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        let rest = rest.trim_end();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}
