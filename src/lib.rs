//! A peer in a cooperative file-distribution swarm.
//!
//! A fixed cohort of peers, described by a static configuration, jointly
//! distribute a single file split into fixed-size pieces. Each peer either
//! starts with the complete file (a seed) or starts empty and acquires every
//! piece from its neighbors over a bespoke binary wire protocol. A peer shuts
//! down once every member of the cohort holds every piece.
//!
//! The entry point is [`engine::Engine`], which bootstraps one session task
//! per neighbor, the choking scheduler, and the acceptor, all sharing the
//! swarm state.

pub mod bitfield;
mod choker;
pub mod conf;
mod disk;
pub mod engine;
pub mod error;
mod journal;
mod peer;
mod swarm;

pub use bitfield::Bitfield;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types in
/// Rust.
pub type PieceIndex = usize;

/// A peer's identifier within the cohort.
///
/// Ids are assigned by the peer directory file and sent on the wire as 4-byte
/// big endian integers during the handshake. The total order over ids decides
/// the connection direction for each pair: the peer with the higher id
/// initiates.
pub type PeerId = u32;
