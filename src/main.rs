use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;

use speedcheck::config::{LoggingConfig, SpeedCheckConfig};
use speedcheck::probes::IcmpProbe;
use speedcheck::process::{self, UnixProcessControl};
use speedcheck::remote::HttpRemoteControl;
use speedcheck::speedtest::{
    format_speed, pick_fastest, ping_all, Callbacks, Collaborators, ServerAddress, SpeedStatistics,
    SpeedTestManager, StaticServers,
};

#[derive(Parser)]
#[command(
    name = "speedcheck",
    about = "Two-phase iperf throughput test (download, then upload)",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $SPEEDCHECK_CONFIG, then /etc/speedcheck/speedcheck.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full speed test against the closest server
    Run {
        /// Candidate server, HOST or HOST:CONTROL_PORT:IPERF_PORT (repeatable)
        #[arg(long = "server")]
        servers: Vec<String>,

        /// Pause between download and upload, in milliseconds
        #[arg(long, default_value = "1000")]
        delay_ms: u64,

        /// Print the final summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ping every configured server and show which one a test would use
    Ping,

    /// Print the effective configuration as TOML
    Config,
}

/// Final report of a completed run.
#[derive(Serialize)]
struct Summary {
    server: Option<ServerAddress>,
    download: SpeedStatistics,
    upload: SpeedStatistics,
}

/// How a test run ended.
#[derive(Debug)]
enum Outcome {
    Finished,
    Stopped,
    Fatal(String),
}

fn env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
}

/// Load the configuration with a plain stderr subscriber in scope, so config
/// fallback warnings are shown before the configured logger exists.
fn load_config(path: Option<&std::path::Path>) -> Result<SpeedCheckConfig> {
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || SpeedCheckConfig::resolve(path))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = env_filter(&logging.level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run {
            servers,
            delay_ms,
            json,
        } => {
            if !servers.is_empty() {
                config.servers = servers
                    .iter()
                    .map(|s| ServerAddress::parse_with_default(s, config.control.default_port))
                    .collect::<Result<_>>()?;
            }
            tracing::info!(servers = config.servers.len(), delay_ms, "Running speed test");
            run(config, Duration::from_millis(delay_ms), json).await?;
        }
        Commands::Ping => {
            ping(&config).await;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn printing_callbacks(
    delay: Duration,
    quiet: bool,
    outcome: mpsc::UnboundedSender<Outcome>,
) -> Callbacks {
    let (finished, stopped) = (outcome.clone(), outcome.clone());
    let progress = move |line: String| {
        if !quiet {
            println!("{}", line);
        }
    };
    Callbacks {
        on_ping_update: Box::new(move |ms| progress(format!("Ping:     {} ms", ms))),
        on_download_start: Box::new(move || progress("Download started".to_string())),
        on_download_speed_update: Box::new(move |bps| {
            progress(format!("  down {}", format_speed(bps as f64)))
        }),
        on_download_finish: Box::new(move |stats| {
            progress(format!("Download: {}", stats));
            delay
        }),
        on_upload_start: Box::new(move || progress("Upload started".to_string())),
        on_upload_speed_update: Box::new(move |bps| {
            progress(format!("  up   {}", format_speed(bps as f64)))
        }),
        on_upload_finish: Box::new(move |stats| progress(format!("Upload:   {}", stats))),
        on_finish: Box::new(move || {
            let _ = finished.send(Outcome::Finished);
        }),
        on_stopped: Box::new(move || {
            let _ = stopped.send(Outcome::Stopped);
        }),
        on_log: Box::new(|text| eprintln!("iperf: {}", text.trim_end())),
        on_fatal_error: Box::new(move |text| {
            let _ = outcome.send(Outcome::Fatal(text.to_string()));
        }),
    }
}

async fn run(config: SpeedCheckConfig, delay: Duration, json: bool) -> Result<()> {
    process::init(&config.iperf.path)?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let manager = SpeedTestManager::new(
        &config,
        Collaborators {
            control: Arc::new(UnixProcessControl::from_init()?),
            remote: Arc::new(HttpRemoteControl::default()),
            ping: Arc::new(IcmpProbe::default()),
            servers: Arc::new(StaticServers(config.servers.clone())),
        },
        printing_callbacks(delay, json, tx),
    )?;
    manager.start();

    let outcome = tokio::select! {
        outcome = rx.recv() => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping speed test");
            let stopping = manager.clone();
            tokio::task::spawn_blocking(move || stopping.stop()).await??;
            // A fatal error may already be queued ahead of the stop.
            rx.recv().await
        }
    };

    match outcome {
        Some(Outcome::Finished) => {
            if json {
                let summary = Summary {
                    server: manager.server(),
                    download: manager.download_statistics(),
                    upload: manager.upload_statistics(),
                };
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Ok(())
        }
        Some(Outcome::Stopped) => {
            println!("stopped");
            Ok(())
        }
        Some(Outcome::Fatal(message)) => bail!("speed test failed: {}", message),
        None => bail!("speed test ended without a result"),
    }
}

async fn ping(config: &SpeedCheckConfig) {
    let probe = IcmpProbe::default();
    let results = ping_all(&config.servers, &probe).await;
    let best = pick_fastest(&config.servers, &results).map(|(i, _)| i);

    println!("{:<40} | Round trip", "Server");
    println!("{:-<40}-|-{:-<20}", "", "");
    for (i, (server, result)) in config.servers.iter().zip(&results).enumerate() {
        let marker = if Some(i) == best { " (selected)" } else { "" };
        match result {
            Ok(ms) => println!("{:<40} | {:.1} ms{}", server.to_string(), ms, marker),
            Err(e) => println!("{:<40} | unreachable: {}", server.to_string(), e),
        }
    }
    if best.is_none() {
        println!("\nNo servers are available right now");
    }
}
