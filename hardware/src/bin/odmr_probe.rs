//! Probe binary for the ODMR board photon counter.
//!
//! Connects over TCP, runs a number of start/poll cycles at a fixed
//! integration time and logs each count.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hardware::odmr::{
    AcquisitionClient, ClientSettings, PhotonCounter, RequestSettings, DEFAULT_ODMR_ADDR,
};
use tracing::{info, warn};

/// ODMR photon counter probe
#[derive(Parser, Debug)]
#[command(name = "odmr_probe")]
#[command(version)]
struct Args {
    /// Board address (host:port)
    #[arg(long, default_value = DEFAULT_ODMR_ADDR)]
    addr: String,

    /// Integration time in seconds
    #[arg(short, long, default_value = "0.1")]
    integration: f64,

    /// Number of measurements
    #[arg(short, long, default_value = "5")]
    count: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let integration = Duration::try_from_secs_f64(args.integration)?;

    info!("Connecting to ODMR board at {}...", args.addr);
    let mut client = AcquisitionClient::connect(args.addr.as_str(), ClientSettings::default())?;
    let request = RequestSettings::default().request_for(integration);

    for i in 0..args.count {
        match client.measure(&request, integration) {
            Ok(result) if result.valid => info!("#{i}: {} photons", result.photon_count),
            Ok(_) => warn!("#{i}: no counts reported"),
            Err(e) => warn!("#{i}: measurement failed: {e}"),
        }
    }

    client.close();
    Ok(())
}
