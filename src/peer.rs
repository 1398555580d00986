//! Neighbor sessions.
//!
//! One session exists per remote peer and runs as its own task. The session
//! owns the socket: it performs the handshake, sends the initial bitfield,
//! then loops receiving framed messages and dispatching them to the swarm
//! controller. It is also the egress point for the neighbor: the controller
//! enqueues outbound frames on the session's channel and the session task
//! writes them, which serializes all sends on the socket.

mod codec;

pub(crate) use codec::{Handshake, HandshakeCodec, Message, MessageCodec};

use {
    futures::{stream::SplitSink, SinkExt, StreamExt},
    std::{io, sync::Arc, time::Duration},
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use crate::{
    conf::PeerInfo,
    error::{Error, Result},
    swarm::Swarm,
    PeerId,
};

/// The channel on which the controller pushes outbound frames to a session.
pub(crate) type Sender = UnboundedSender<Message>;
type Receiver = UnboundedReceiver<Message>;

/// How long and how often to retry the initial dial. Cohort members launch in
/// arbitrary order, so the listener of a lower id peer may not be up yet.
const CONNECT_ATTEMPTS: u32 = 40;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Connects to a peer with a lower id, handshakes, and runs the session until
/// the connection closes or the swarm shuts down.
pub(crate) async fn outbound(swarm: Arc<Swarm>, info: PeerInfo) -> Result<()> {
    let addr = format!("{}:{}", info.host, info.port);
    log::info!("peer {}: connecting to peer {} at {}", swarm.local_id(), info.id, addr);
    let socket = connect_with_retry(&addr).await?;

    let mut socket = Framed::new(socket, HandshakeCodec);
    // the initiator speaks first
    socket
        .send(Handshake {
            peer_id: swarm.local_id(),
        })
        .await?;
    let handshake = recv_handshake(&mut socket).await?;
    // the answering handshake must echo the id we dialed
    if handshake.peer_id != info.id {
        return Err(Error::UnexpectedPeer {
            expected: info.id,
            actual: handshake.peer_id,
        });
    }
    swarm.journal().connection_made(info.id);

    run(swarm, socket, info.id).await
}

/// Runs the accepting side of a session on a freshly accepted socket: the
/// remote identifies itself first, then we answer.
pub(crate) async fn inbound(swarm: Arc<Swarm>, socket: TcpStream) -> Result<()> {
    let mut socket = Framed::new(socket, HandshakeCodec);
    let handshake = recv_handshake(&mut socket).await?;
    if !swarm.is_cohort_member(handshake.peer_id) {
        return Err(Error::UnknownPeer(handshake.peer_id));
    }
    socket
        .send(Handshake {
            peer_id: swarm.local_id(),
        })
        .await?;
    swarm.journal().connection_received(handshake.peer_id);

    run(swarm, socket, handshake.peer_id).await
}

async fn recv_handshake(socket: &mut Framed<TcpStream, HandshakeCodec>) -> Result<Handshake> {
    match socket.next().await {
        Some(handshake) => handshake,
        None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}

async fn connect_with_retry(addr: &str) -> Result<TcpStream> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                log::debug!("connect to {} failed (attempt {}): {}", addr, attempt, e);
                attempt += 1;
                time::sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Runs the message phase of the session: registers the egress channel with
/// the controller, exchanges bitfields, then receives until the connection or
/// the swarm ends. Always deregisters on the way out.
async fn run(
    swarm: Arc<Swarm>,
    socket: Framed<TcpStream, HandshakeCodec>,
    remote: PeerId,
) -> Result<()> {
    // switch to the message codec, keeping whatever bytes the remote may have
    // sent right after its handshake
    let old_parts = socket.into_parts();
    let mut parts = FramedParts::new(old_parts.io, MessageCodec::new(swarm.piece_size()));
    // reuse buffers of the previous codec
    parts.read_buf = old_parts.read_buf;
    parts.write_buf = old_parts.write_buf;
    let socket = Framed::from_parts(parts);

    let (frame_chan, frame_port) = mpsc::unbounded_channel();
    swarm.register_session(remote, frame_chan)?;

    let result = drive(&swarm, socket, frame_port, remote).await;
    swarm.deregister_session(remote);
    log::info!(
        "peer {}: session with peer {} ended{}",
        swarm.local_id(),
        remote,
        if result.is_err() { " with error" } else { "" }
    );
    result
}

async fn drive(
    swarm: &Swarm,
    socket: Framed<TcpStream, MessageCodec>,
    mut frame_port: Receiver,
    remote: PeerId,
) -> Result<()> {
    let (mut sink, mut stream) = socket.split();
    // piece availability is exchanged before anything else
    sink.send(Message::Bitfield(swarm.local_bitfield_bytes()))
        .await?;

    let shutdown = swarm.shutdown_token();
    loop {
        // outbound frames are drained first so that everything enqueued
        // before a shutdown still reaches the wire
        tokio::select! {
            biased;
            Some(msg) = frame_port.recv() => {
                send_frame(&mut sink, msg).await?;
            }
            msg = stream.next() => match msg {
                Some(msg) => {
                    let msg = msg?;
                    log::trace!(
                        "peer {}: received message {} from peer {}",
                        swarm.local_id(),
                        msg.id(),
                        remote
                    );
                    swarm.handle_message(remote, msg);
                }
                // clean EOF: the remote closed, typically on shutdown
                None => return Ok(()),
            },
            _ = shutdown.cancelled() => {
                while let Ok(msg) = frame_port.try_recv() {
                    send_frame(&mut sink, msg).await?;
                }
                return Ok(());
            }
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<Framed<TcpStream, MessageCodec>, Message>,
    msg: Message,
) -> Result<()> {
    log::trace!("sending message {}", msg.id());
    sink.send(msg).await
}
