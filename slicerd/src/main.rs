use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

mod replay;

/// Drives the slicer engine from a recorded scenario instead of a live
/// OpenFlow session: datapath and REST events are applied in order and the
/// resulting message stream is narrated on the log.
#[derive(Debug, Parser)]
#[command(name = "slicerd")]
#[command(author, version, about = "Replay switch-slicing scenarios", long_about = None)]
struct Slicerd {
    /// The scenario file to replay
    #[arg(value_name = "FILE")]
    scenario: PathBuf,

    /// Idle timeout for learned ingress rules, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 600)]
    idle_timeout: u16,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Slicerd::parse();
    replay::run(&args.scenario, args.idle_timeout).await
}
