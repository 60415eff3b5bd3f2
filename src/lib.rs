//! speedcheck -- two-phase network throughput test driven by an external
//! iperf client.
//!
//! The library supervises the client process through a pair of named pipes
//! ([`process`]), sequences ping, download and upload phases on top of it
//! ([`speedtest`]), and arms the remote peer over its HTTP control endpoint
//! ([`remote`]).

pub mod config;
pub mod probes;
pub mod process;
pub mod remote;
pub mod speedtest;

pub use crate::config::SpeedCheckConfig;
pub use crate::speedtest::{Callbacks, Collaborators, SpeedTestManager, TestState};
