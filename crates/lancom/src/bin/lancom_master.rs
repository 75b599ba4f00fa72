//! Runs a LanCom master until Ctrl-C.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use lancom::logging::{DEFAULT_FILTER, init_logging, init_logging_to_dir};
use lancom::{LanComConfig, MasterNode, discovery};

#[derive(Parser)]
#[command(name = "lancom-master")]
#[command(about = "Registry and discovery master for a LanCom network")]
struct Cli {
    /// IPv4 address to bind and announce. Detected when omitted.
    #[arg(long)]
    ip: Option<Ipv4Addr>,

    /// JSON config file. Defaults apply when missing.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG.
    #[arg(long, default_value = DEFAULT_FILTER)]
    log_filter: String,

    /// Also write daily log files into this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write the effective config to the config path and exit.
    #[arg(long, requires = "config")]
    write_config: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _guard = match &cli.log_dir {
        Some(dir) => Some(
            init_logging_to_dir(dir, &cli.log_filter)
                .with_context(|| format!("Cannot log to {}", dir.display()))?,
        ),
        None => {
            init_logging(&cli.log_filter)?;
            None
        }
    };

    let config = cli
        .config
        .as_deref()
        .map(LanComConfig::load_or_default)
        .unwrap_or_default();

    if cli.write_config {
        if let Some(path) = &cli.config {
            config
                .save_to_file(path)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            info!("Config written to {}", path.display());
        }
        return Ok(());
    }

    let ip = match cli.ip {
        Some(ip) => ip,
        None => discovery::detect_local_ip().unwrap_or_else(|e| {
            warn!("Cannot detect a LAN address ({e}), using loopback");
            Ipv4Addr::LOCALHOST
        }),
    };

    let master = MasterNode::start(ip, config).context("Master failed to start")?;
    info!("Master {} running at {ip}, press Ctrl-C to stop", master.id());
    master.spin();
    Ok(())
}
