//! The per-peer activity journal.
//!
//! Every protocol event of interest is appended as one line to
//! `log_peer_<id>.log`, timestamped with the local wall clock. The journal is
//! a capability handed to the controller at construction; diagnostics that
//! are not part of the activity record go through the `log` facade instead.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    sync::Mutex,
};

use chrono::Local;

use crate::{error::Result, PeerId, PieceIndex};

pub(crate) struct Journal {
    peer_id: PeerId,
    out: Mutex<BufWriter<File>>,
}

impl Journal {
    /// Opens (appending) the journal file for the given peer inside `dir`.
    pub fn open(dir: &Path, peer_id: PeerId) -> Result<Self> {
        let path = dir.join(format!("log_peer_{}.log", peer_id));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            peer_id,
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn connection_made(&self, to: PeerId) {
        self.record(format_args!("makes a connection to Peer {}.", to));
    }

    pub fn connection_received(&self, from: PeerId) {
        self.record(format_args!("is connected from Peer {}.", from));
    }

    pub fn preferred_neighbors(&self, neighbors: &[PeerId]) {
        let list = neighbors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.record(format_args!("has the preferred neighbors {}.", list));
    }

    pub fn optimistic_unchoke(&self, neighbor: PeerId) {
        self.record(format_args!(
            "has the optimistically unchoked neighbor {}.",
            neighbor
        ));
    }

    pub fn unchoked_by(&self, neighbor: PeerId) {
        self.record(format_args!("is unchoked by {}.", neighbor));
    }

    pub fn choked_by(&self, neighbor: PeerId) {
        self.record(format_args!("is choked by {}.", neighbor));
    }

    pub fn received_have(&self, from: PeerId, piece: PieceIndex) {
        self.record(format_args!(
            "received the 'have' message from {} for the piece {}.",
            from, piece
        ));
    }

    pub fn received_interested(&self, from: PeerId) {
        self.record(format_args!(
            "received the 'interested' message from {}.",
            from
        ));
    }

    pub fn received_not_interested(&self, from: PeerId) {
        self.record(format_args!(
            "received the 'not interested' message from {}.",
            from
        ));
    }

    pub fn downloaded_piece(&self, from: PeerId, piece: PieceIndex, owned: usize) {
        self.record(format_args!(
            "has downloaded the piece {} from {}. Now the number of pieces it has is {}.",
            piece, from, owned
        ));
    }

    pub fn download_complete(&self) {
        self.record(format_args!("has downloaded the complete file."));
    }

    /// Appends one timestamped line and flushes it so the record survives an
    /// abrupt exit.
    fn record(&self, event: fmt::Arguments<'_>) {
        let timestamp = Local::now().format("%m/%d/%Y %I:%M:%S %p");
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        let written = writeln!(out, "[{}]: Peer {} {}", timestamp, self.peer_id, event)
            .and_then(|_| out.flush());
        if let Err(e) = written {
            log::warn!("peer {}: journal write failed: {}", self.peer_id, e);
        }
    }
}
