use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use beacon_sim::{run_scenario, SimConfig};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Simulates beacon devices exchanging messages over a lossy LAN.
#[derive(Parser)]
#[command(name = "beacon-sim", version)]
struct Cli {
    /// Path to a TOML scenario file
    #[arg(long, short, env = "BEACON_SIM_CONFIG")]
    config: Option<PathBuf>,
    /// Number of simulated devices
    #[arg(long, env = "BEACON_SIM_DEVICES")]
    devices: Option<usize>,
    /// Messages each device sends
    #[arg(long)]
    messages: Option<usize>,
    /// Probability that one record observation is lost
    #[arg(long, env = "BEACON_SIM_LOSS")]
    loss: Option<f64>,
    /// Probability that one record observation is delivered twice
    #[arg(long)]
    duplicate: Option<f64>,
    #[arg(long, env = "BEACON_SIM_SEED")]
    seed: Option<u64>,
    /// Virtual run time in seconds after the scripted sends start
    #[arg(long)]
    duration_secs: Option<u64>,
    /// Broadcast every message instead of sending around a ring
    #[arg(long)]
    broadcast: bool,
    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn apply(&self, config: &mut SimConfig) {
        if let Some(devices) = self.devices {
            config.devices = devices;
        }
        if let Some(messages) = self.messages {
            config.messages_per_device = messages;
        }
        if let Some(loss) = self.loss {
            config.loss = loss;
        }
        if let Some(duplicate) = self.duplicate {
            config.duplicate = duplicate;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(secs) = self.duration_secs {
            config.duration = Duration::from_secs(secs);
        }
        if self.broadcast {
            config.broadcast = true;
        }
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => match SimConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => SimConfig::default(),
    };
    cli.apply(&mut config);
    if let Err(err) = config.validate() {
        error!("{err}");
        return ExitCode::FAILURE;
    }

    info!(
        devices = config.devices,
        loss = config.loss,
        duplicate = config.duplicate,
        seed = config.seed,
        "starting simulation"
    );
    let report = run_scenario(&config);

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                error!("failed to encode report: {err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!(
            "elapsed {}s: sent {} delivered {} duplicates {} acked {} pending {}",
            report.elapsed_ms / 1000,
            report.sent,
            report.delivered,
            report.duplicate_deliveries,
            report.acked,
            report.pending
        );
        for device in &report.devices {
            println!(
                "  {:<16} {} sent {} received {} acked {} syncs {} owed acks {}",
                device.name,
                device.peer_id.short(),
                device.sent,
                device.received,
                device.acked,
                device.syncs_completed,
                device.pending_ack_count
            );
        }
    }
    ExitCode::SUCCESS
}
