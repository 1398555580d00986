use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use swarmshare::{
    conf::{self, CommonConfig},
    engine::Engine,
};

/// A peer in a cooperative file-distribution swarm.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Id of this peer; must appear in the peer directory file.
    peer_id: u32,
    /// Path to the common configuration file.
    #[arg(long, default_value = "Common.cfg")]
    common: PathBuf,
    /// Path to the peer directory file.
    #[arg(long, default_value = "PeerInfo.cfg")]
    peers: PathBuf,
    /// Directory holding the peer_<id>/ directories and the log files.
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let conf = CommonConfig::load(&args.common)
        .with_context(|| format!("loading {}", args.common.display()))?;
    let peers =
        conf::load_peers(&args.peers).with_context(|| format!("loading {}", args.peers.display()))?;

    let engine = Engine::new(conf, peers, args.peer_id, &args.work_dir)?;
    engine.run().await?;
    Ok(())
}
