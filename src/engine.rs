//! Peer lifecycle: bootstrapping the sessions and timers, and the orderly
//! shutdown once the whole cohort is complete.

use std::{path::Path, sync::Arc};

use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    choker,
    conf::{CommonConfig, PeerInfo},
    disk::PieceStore,
    error::{Error, Result},
    journal::Journal,
    peer,
    swarm::Swarm,
    PeerId,
};

/// One running peer.
///
/// Owns the swarm state and, once [`run`](Self::run) is called, the acceptor
/// task, one session task per neighbor, and the two choking timers.
pub struct Engine {
    swarm: Arc<Swarm>,
    port: u16,
}

impl Engine {
    /// Validates the configuration against the local peer id and prepares
    /// the piece store and the journal. Fails fatally on an unknown id or,
    /// for a seed, a missing backing file.
    pub fn new(
        conf: CommonConfig,
        peers: Vec<PeerInfo>,
        local_id: PeerId,
        work_dir: &Path,
    ) -> Result<Self> {
        let local = peers
            .iter()
            .find(|p| p.id == local_id)
            .cloned()
            .ok_or(Error::UnknownPeer(local_id))?;

        let peer_dir = work_dir.join(format!("peer_{}", local_id));
        let store = PieceStore::open(&peer_dir, &conf)?;
        if local.has_file && store.file_len()? < conf.file_size {
            return Err(Error::Config(format!(
                "peer {} is a seed but {} is missing or short",
                local_id,
                peer_dir.join(&conf.file_name).display()
            )));
        }
        let journal = Journal::open(work_dir, local_id)?;
        let port = local.port;
        let swarm = Arc::new(Swarm::new(
            conf,
            peers,
            local,
            store,
            journal,
            CancellationToken::new(),
        ));
        Ok(Self { swarm, port })
    }

    /// Runs the peer until the whole cohort holds the complete file.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        log::info!(
            "peer {}: listening on port {}",
            self.swarm.local_id(),
            self.port
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(self.swarm.clone(), listener));

        // the peer with the higher id initiates, so dial everyone below us
        for info in self.swarm.lower_peers() {
            let swarm = self.swarm.clone();
            tasks.spawn(async move {
                let remote = info.id;
                if let Err(e) = peer::outbound(swarm.clone(), info).await {
                    log::warn!(
                        "peer {}: session with peer {} failed: {}",
                        swarm.local_id(),
                        remote,
                        e
                    );
                }
            });
        }

        tasks.spawn(choker::preferred_timer(self.swarm.clone()));
        tasks.spawn(choker::optimistic_timer(self.swarm.clone()));

        // a cohort of seeds may already satisfy the termination condition
        self.swarm.evaluate_termination();

        // every task ends once the swarm's shutdown token fires
        while tasks.join_next().await.is_some() {}
        log::info!("peer {}: shut down", self.swarm.local_id());
        Ok(())
    }
}

/// Accepts inbound connections (peers with a higher id dial us) until
/// shutdown. Each accepted socket runs its session on its own task; a failed
/// session never disturbs the others.
async fn accept_loop(swarm: Arc<Swarm>, listener: TcpListener) {
    let shutdown = swarm.shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let swarm = swarm.clone();
                    tokio::spawn(async move {
                        if let Err(e) = peer::inbound(swarm.clone(), socket).await {
                            log::warn!(
                                "peer {}: inbound session from {} failed: {}",
                                swarm.local_id(),
                                addr,
                                e
                            );
                        }
                    });
                }
                Err(e) => log::warn!("peer {}: accept failed: {}", swarm.local_id(), e),
            }
        }
    }
}
