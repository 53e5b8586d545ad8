//! PimmsLink Operator Console
//!
//! Stands in for the ride control panel: every subcommand triggers one core
//! operation against the PiMMS server or the hot folders.

mod keepalive;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pimms_shared::logging;
use pimms_shared::{Config, HotFolderSync, ProtocolClient, ResetPolicy, SlotReport};
use tracing::{info, warn};

/// Port rotation state kept between runs, next to the config file
const PORT_STATE_FILE: &str = "pimms_ports.json";

/// PimmsLink operator console
///
/// Sends ride start and log on messages to a PiMMS server and resets the
/// PiMMS hot folders between rides.
#[derive(Parser, Debug)]
#[command(name = "pimms_console")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Log to the console only
    #[arg(long)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Announce that a train has started the ride
    StartRide {
        /// Train number, starting at 1
        #[arg(short, long)]
        train: u32,
    },

    /// Log a controller on once its clips are ready
    LogOn {
        /// Controller (train) number, starting at 1
        #[arg(short, long)]
        controller: usize,
    },

    /// Reset controller and camera hot folders for the next ride
    Reset {
        /// Delete the existing output clip first
        #[arg(long)]
        delete_clip: bool,

        /// Stage the sample video instead of the newest capture
        #[arg(long)]
        sample_video: bool,

        /// Delete each capture after promoting it
        #[arg(long)]
        delete_stream: bool,

        /// Number of controllers (defaults to the config value)
        #[arg(long)]
        controllers: Option<u32>,

        /// Number of camera rows per controller (defaults to the config value)
        #[arg(long)]
        rows: Option<u32>,
    },

    /// Hold the trigger connection open and answer polls until Ctrl-C
    Keepalive {
        /// Seconds between poll responses (defaults to the config value)
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Print the effective configuration as JSON
    ShowConfig,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    // Each run is a new process; without saved state every run would bind
    // the first port of the range again
    if config.network.port_state_file.is_none() {
        config.network.port_state_file = Some(port_state_path(args.config.as_deref()));
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    if args.no_log_file {
        logging::init_console_logging(&level);
    } else {
        logging::init_logging(&config.log_dir, "pimms_console", &level)?;
    }

    info!("PimmsLink console v{}", pimms_shared::VERSION);

    // Operations run to completion one at a time
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let ok = rt.block_on(run(args.command, &config))?;

    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn port_state_path(config_path: Option<&Path>) -> PathBuf {
    config_path
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new(""))
        .join(PORT_STATE_FILE)
}

async fn run(command: Command, config: &Config) -> anyhow::Result<bool> {
    let network = &config.network;

    match command {
        Command::StartRide { train } => {
            let client =
                ProtocolClient::from_config(network).context("invalid network configuration")?;
            Ok(client.start_ride(train, &network.trigger_address).await)
        }

        Command::LogOn { controller } => {
            let client =
                ProtocolClient::from_config(network).context("invalid network configuration")?;
            let local_ip = network
                .controller_address(controller)
                .with_context(|| format!("no interface address for controller {}", controller))?;
            Ok(client.log_on(local_ip).await)
        }

        Command::Reset {
            delete_clip,
            sample_video,
            delete_stream,
            controllers,
            rows,
        } => {
            let policy = ResetPolicy {
                delete_original_clip: delete_clip,
                use_sample_video: sample_video,
                delete_stream_source: delete_stream,
            };
            let sync = HotFolderSync::new(config.hot_folders.clone());
            let reports = sync.reset(
                controllers.unwrap_or(config.hot_folders.controllers),
                rows.unwrap_or(config.hot_folders.rows),
                policy,
            );

            for report in &reports {
                println!("{}", report);
            }
            let failed = reports.iter().filter(|r| !r.is_ok()).count();
            if failed > 0 {
                warn!("{} of {} hot folders failed to reset", failed, reports.len());
            }
            Ok(reports.iter().all(SlotReport::is_ok))
        }

        Command::Keepalive { interval_secs } => {
            let period = interval_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| network.keepalive_interval());
            keepalive::run(network, period, tokio::signal::ctrl_c()).await
        }

        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(config)?);
            Ok(true)
        }
    }
}
