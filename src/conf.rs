//! The static swarm configuration: the common parameters shared by the whole
//! cohort and the peer directory describing its members.
//!
//! Both files are plain whitespace separated text, loaded once at startup
//! and immutable afterwards.

use std::{fs, path::Path, str::FromStr, time::Duration};

use crate::{
    error::{Error, Result},
    PeerId, PieceIndex,
};

/// The parameters every member of the cohort agrees on.
#[derive(Clone, Debug)]
pub struct CommonConfig {
    /// How many neighbors the choking scheduler prefers at a time (`k`).
    pub preferred_count: usize,
    /// How often the preferred neighbors are recomputed (`p`).
    pub unchoking_interval: Duration,
    /// How often the optimistically unchoked neighbor rotates (`m`).
    pub optimistic_interval: Duration,
    /// Name of the distributed file inside each peer's directory.
    pub file_name: String,
    /// Total length of the distributed file in bytes.
    pub file_size: u64,
    /// Length of every piece except possibly the last, in bytes.
    pub piece_size: u32,
}

impl CommonConfig {
    /// Loads and parses the common configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let input = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&input)
    }

    /// Parses the key/value lines of a common configuration file. Keys may
    /// appear in any order; all six are required.
    pub fn parse(input: &str) -> Result<Self> {
        let mut preferred_count = None;
        let mut unchoking_interval = None;
        let mut optimistic_interval = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for line in input.lines() {
            let mut fields = line.split_whitespace();
            let key = match fields.next() {
                Some(key) => key,
                None => continue,
            };
            let value = fields
                .next()
                .ok_or_else(|| Error::Config(format!("missing value for '{}'", key)))?;
            match key {
                "NumberOfPreferredNeighbors" => {
                    preferred_count = Some(parse_value(key, value)?);
                }
                "UnchokingInterval" => {
                    unchoking_interval = Some(Duration::from_secs(parse_value(key, value)?));
                }
                "OptimisticUnchokingInterval" => {
                    optimistic_interval = Some(Duration::from_secs(parse_value(key, value)?));
                }
                "FileName" => file_name = Some(value.to_string()),
                "FileSize" => file_size = Some(parse_value(key, value)?),
                "PieceSize" => piece_size = Some(parse_value(key, value)?),
                _ => return Err(Error::Config(format!("unknown key '{}'", key))),
            }
        }

        let conf = Self {
            preferred_count: require(preferred_count, "NumberOfPreferredNeighbors")?,
            unchoking_interval: require(unchoking_interval, "UnchokingInterval")?,
            optimistic_interval: require(optimistic_interval, "OptimisticUnchokingInterval")?,
            file_name: require(file_name, "FileName")?,
            file_size: require(file_size, "FileSize")?,
            piece_size: require(piece_size, "PieceSize")?,
        };
        if conf.piece_size == 0 {
            return Err(Error::Config("PieceSize must be positive".into()));
        }
        if conf.file_size == 0 {
            return Err(Error::Config("FileSize must be positive".into()));
        }
        Ok(conf)
    }

    /// The number of pieces the file divides into, rounding the short final
    /// piece up.
    pub fn num_pieces(&self) -> usize {
        ((self.file_size + u64::from(self.piece_size) - 1) / u64::from(self.piece_size)) as usize
    }

    /// The byte length of the piece at the given index. All pieces have the
    /// configured size except the final one, which covers whatever remains.
    pub fn piece_len(&self, index: PieceIndex) -> usize {
        debug_assert!(index < self.num_pieces());
        if index + 1 == self.num_pieces() {
            (self.file_size - (self.num_pieces() as u64 - 1) * u64::from(self.piece_size)) as usize
        } else {
            self.piece_size as usize
        }
    }
}

/// One cohort member as listed in the peer directory file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's unique id; the cohort is totally ordered by it.
    pub id: PeerId,
    /// Host to dial for this peer's listening socket.
    pub host: String,
    /// Port of this peer's listening socket.
    pub port: u16,
    /// Whether the peer starts with the complete file.
    pub has_file: bool,
}

/// Loads and parses the peer directory file.
pub fn load_peers(path: &Path) -> Result<Vec<PeerInfo>> {
    let input = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    parse_peers(&input)
}

/// Parses the peer directory: one `<id> <host> <port> <0|1>` line per peer.
pub fn parse_peers(input: &str) -> Result<Vec<PeerInfo>> {
    let mut peers: Vec<PeerInfo> = Vec::new();
    for line in input.lines() {
        let mut fields = line.split_whitespace();
        let id = match fields.next() {
            Some(id) => parse_value("peer id", id)?,
            None => continue,
        };
        let host = fields
            .next()
            .ok_or_else(|| Error::Config(format!("peer {}: missing host", id)))?
            .to_string();
        let port = fields
            .next()
            .ok_or_else(|| Error::Config(format!("peer {}: missing port", id)))
            .and_then(|port| parse_value("port", port))?;
        let has_file = match fields.next() {
            Some("0") => false,
            Some("1") => true,
            other => {
                return Err(Error::Config(format!(
                    "peer {}: has-file flag must be 0 or 1, got {:?}",
                    id, other
                )))
            }
        };
        if peers.iter().any(|p| p.id == id) {
            return Err(Error::Config(format!("duplicate peer id {}", id)));
        }
        peers.push(PeerInfo {
            id,
            host,
            port,
            has_file,
        });
    }
    if peers.is_empty() {
        return Err(Error::Config("peer directory lists no peers".into()));
    }
    Ok(peers)
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value '{}' for {}", value, key)))
}

fn require<T>(value: Option<T>, key: &str) -> Result<T> {
    value.ok_or_else(|| Error::Config(format!("missing key '{}'", key)))
}
