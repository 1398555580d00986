//! Error types used across the crate.

use std::io;

use thiserror::Error;

use crate::PeerId;

/// The result type used by all fallible operations in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for all operations in the crate.
///
/// Protocol and IO errors are session-level: they tear down the offending
/// neighbor session but never the peer. Config errors are fatal at startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The 32-byte handshake frame did not start with the expected protocol
    /// header.
    #[error("invalid handshake header")]
    InvalidHandshake,

    /// A handshake carried an id that is not part of the cohort.
    #[error("handshake from unknown peer {0}")]
    UnknownPeer(PeerId),

    /// An initiated connection was answered by a different peer than the one
    /// dialed.
    #[error("expected handshake from peer {expected}, got peer {actual}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },

    /// A session for this neighbor already exists; each ordered pair keeps
    /// exactly one connection.
    #[error("already connected to peer {0}")]
    AlreadyConnected(PeerId),

    /// A message frame carried a type byte outside the protocol.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// A message frame declared a length that cannot be valid: zero, larger
    /// than any legal frame, or inconsistent with its type's payload.
    #[error("invalid message length {0}")]
    InvalidMessageLength(u32),

    /// A piece buffer did not match the length mandated by its index.
    #[error("piece {index} has length {len}, expected {expected}")]
    InvalidPieceLength {
        index: crate::PieceIndex,
        len: usize,
        expected: usize,
    },

    /// The configuration could not be loaded or failed validation.
    #[error("config: {0}")]
    Config(String),

    /// An IO error on a socket or the piece store.
    #[error(transparent)]
    Io(#[from] io::Error),
}
