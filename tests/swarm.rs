//! End-to-end swarm scenarios: whole peers running against each other over
//! loopback sockets, with per-peer directories under a scratch dir.

use std::{fs, net::TcpListener, path::Path, time::Duration};

use swarmshare::{
    conf::{CommonConfig, PeerInfo},
    engine::Engine,
};

/// Picks `n` distinct free loopback ports by holding all the probe sockets
/// open at once.
fn free_ports(n: usize) -> Vec<u16> {
    let probes: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    probes
        .iter()
        .map(|probe| probe.local_addr().unwrap().port())
        .collect()
}

fn test_conf(file_size: u64, piece_size: u32, preferred_count: usize) -> CommonConfig {
    CommonConfig {
        preferred_count,
        unchoking_interval: Duration::from_secs(1),
        optimistic_interval: Duration::from_secs(1),
        file_name: "payload.dat".into(),
        file_size,
        piece_size,
    }
}

fn cohort(flags: &[bool]) -> Vec<PeerInfo> {
    let ports = free_ports(flags.len());
    flags
        .iter()
        .zip(ports)
        .enumerate()
        .map(|(i, (&has_file, port))| PeerInfo {
            id: i as u32 + 1,
            host: "127.0.0.1".into(),
            port,
            has_file,
        })
        .collect()
}

/// A payload with enough structure that piece mixups would be caught.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn seed_file(dir: &Path, conf: &CommonConfig, peer_id: u32, content: &[u8]) {
    let peer_dir = dir.join(format!("peer_{}", peer_id));
    fs::create_dir_all(&peer_dir).unwrap();
    fs::write(peer_dir.join(&conf.file_name), content).unwrap();
}

fn read_file(dir: &Path, conf: &CommonConfig, peer_id: u32) -> Vec<u8> {
    fs::read(dir.join(format!("peer_{}", peer_id)).join(&conf.file_name)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_peer_swarm_transfers_the_whole_file() {
    let dir = tempfile::tempdir().unwrap();
    // 3 pieces: 100 + 100 + 50 bytes
    let conf = test_conf(250, 100, 1);
    let peers = cohort(&[true, false]);
    let content = payload(250);
    seed_file(dir.path(), &conf, 1, &content);

    let seed = Engine::new(conf.clone(), peers.clone(), 1, dir.path()).unwrap();
    let leecher = Engine::new(conf.clone(), peers, 2, dir.path()).unwrap();

    let seed = tokio::spawn(seed.run());
    let leecher = tokio::spawn(leecher.run());
    tokio::time::timeout(Duration::from_secs(30), async {
        seed.await.unwrap().unwrap();
        leecher.await.unwrap().unwrap();
    })
    .await
    .expect("the swarm did not terminate in time");

    assert_eq!(read_file(dir.path(), &conf, 2), content);

    // one line per downloaded piece plus the completion line
    let log = fs::read_to_string(dir.path().join("log_peer_2.log")).unwrap();
    assert_eq!(log.matches("has downloaded the piece").count(), 3);
    assert_eq!(log.matches("has downloaded the complete file").count(), 1);
    assert_eq!(log.matches("makes a connection to Peer 1.").count(), 1);

    // the seed saw the connection and never re-downloaded anything
    let log = fs::read_to_string(dir.path().join("log_peer_1.log")).unwrap();
    assert_eq!(log.matches("is connected from Peer 2.").count(), 1);
    assert_eq!(log.matches("has downloaded the piece").count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn three_peer_swarm_converges_and_terminates() {
    let dir = tempfile::tempdir().unwrap();
    // 6 pieces of 100 bytes each
    let conf = test_conf(600, 100, 2);
    let peers = cohort(&[true, false, false]);
    let content = payload(600);
    seed_file(dir.path(), &conf, 1, &content);

    let engines: Vec<_> = (1..=3)
        .map(|id| Engine::new(conf.clone(), peers.clone(), id, dir.path()).unwrap())
        .collect();
    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| tokio::spawn(engine.run()))
        .collect();

    tokio::time::timeout(Duration::from_secs(60), async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    })
    .await
    .expect("the swarm did not terminate in time");

    for id in [2, 3] {
        assert_eq!(read_file(dir.path(), &conf, id), content, "peer {}", id);
        let log = fs::read_to_string(dir.path().join(format!("log_peer_{}.log", id))).unwrap();
        assert_eq!(log.matches("has downloaded the piece").count(), 6);
        assert_eq!(log.matches("has downloaded the complete file").count(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_malformed_handshake_is_rejected() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let dir = tempfile::tempdir().unwrap();
    let conf = test_conf(250, 100, 1);
    let peers = cohort(&[true, false]);
    let content = payload(250);
    seed_file(dir.path(), &conf, 1, &content);
    let port = peers[0].port;

    let seed = Engine::new(conf, peers, 1, dir.path()).unwrap();
    let seed = tokio::spawn(seed.run());

    // a 32-byte frame with the wrong header: the peer must close the
    // connection without answering
    let mut frame = [0u8; 32];
    frame[..18].copy_from_slice(b"WRONGHEADER......X");
    let mut socket = {
        // the listener may still be coming up
        let mut attempt = 0;
        loop {
            match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                Ok(socket) => break socket,
                Err(_) if attempt < 40 => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => panic!("cannot reach the peer: {}", e),
            }
        }
    };
    socket.write_all(&frame).await.unwrap();

    let mut reply = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut reply)).await;
    assert!(matches!(read, Ok(Ok(0))), "expected EOF without a reply");

    // the failed attempt must not be journaled as a connection
    let log = fs::read_to_string(dir.path().join("log_peer_1.log")).unwrap_or_default();
    assert_eq!(log.matches("is connected from").count(), 0);

    seed.abort();
}
