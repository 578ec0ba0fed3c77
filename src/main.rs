//! Zanarkand CLI - streams decoded capture packets as JSON lines.
//!
//! This is the main binary entry point. See the `zanarkand` library for the
//! core functionality.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use zanarkand::{process, CaptureSession, Config, Options, Region};

// CLI
#[derive(Parser)]
#[command(name = "zanarkand")]
#[command(version)]
#[command(about = "Client bridge to the ZanarkandWrapper packet capture process")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a capture session and print every dispatched packet
    Capture {
        #[command(flatten)]
        session: SessionArgs,
        /// Only dispatch packets of these types, subtypes or supertypes
        #[arg(long, value_delimiter = ',')]
        filter: Vec<String>,
        /// Channel to print ("any", a packet type, superType or subType)
        #[arg(long, default_value = "any")]
        channel: String,
    },
    /// Print the command line the capture process would be launched with
    Cmdline {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// JSON file holding an options object (camelCase keys)
    #[arg(long)]
    options: Option<PathBuf>,
    /// Game client region (Global, KR, CN)
    #[arg(long)]
    region: Option<Region>,
    /// Port of the capture process endpoint
    #[arg(long)]
    port: Option<u16>,
    /// Host or device IP to capture on
    #[arg(long)]
    network_device: Option<String>,
    /// Enable developer mode in the capture process
    #[arg(long)]
    dev: bool,
    /// Path to ZanarkandWrapperJSON.exe
    #[arg(long)]
    exe_path: Option<PathBuf>,
    /// Connect to an externally managed capture process
    #[arg(long)]
    no_exe: bool,
    /// Data path forwarded to the capture process
    #[arg(long)]
    data_path: Option<String>,
    /// Give up waiting for the endpoint after this many milliseconds
    #[arg(long)]
    ready_timeout_ms: Option<u64>,
}

impl SessionArgs {
    /// Merge file options, flags and environment. Flags win over the file,
    /// which wins over the environment.
    fn into_options(self) -> Result<Options> {
        let mut options = match &self.options {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read options file {}", path.display()))?;
                serde_json::from_str::<Options>(&raw)
                    .with_context(|| format!("Invalid options file {}", path.display()))?
            }
            None => Options::new(),
        };

        if let Some(region) = self.region {
            options = options.region(region);
        }
        if let Some(port) = self.port {
            options = options.port(port);
        }
        if let Some(device) = self.network_device {
            options = options.network_device(device);
        }
        if self.dev {
            options = options.dev(true);
        }
        if let Some(path) = self.exe_path {
            options = options.executable_path(path);
        }
        if self.no_exe {
            options = options.no_exe(true);
        }
        if let Some(path) = self.data_path {
            options = options.data_path(path);
        }
        if let Some(ms) = self.ready_timeout_ms {
            options = options.ready_timeout(Duration::from_millis(ms));
        }

        options.apply_env_overrides();
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Capture {
            session,
            filter,
            channel,
        } => run_capture(session.into_options()?, filter, &channel).await?,
        Commands::Cmdline { session } => {
            let config = Config::resolve(&session.into_options()?)?;
            println!(
                "{} {}",
                config.executable_path.display(),
                process::build_args(&config).join(" ")
            );
        }
    }

    Ok(())
}

/// Run a session until Ctrl-C, printing packets on `channel` to stdout.
async fn run_capture(options: Options, filter: Vec<String>, channel: &str) -> Result<()> {
    let session = CaptureSession::new(options)?;
    if !filter.is_empty() {
        session.set_filter(filter);
    }

    session.subscribe(channel, |packet| match serde_json::to_string(packet.as_ref()) {
        Ok(line) => println!("{line}"),
        Err(e) => log::warn!("Failed to serialize packet: {}", e),
    });

    session.start().await?;
    log::info!("Capturing on {}, press Ctrl-C to stop", session.config().endpoint_url());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down");

    if let Err(e) = session.stop().await {
        log::warn!("Stop failed: {}", e);
    }
    session.close().await;
    Ok(())
}
