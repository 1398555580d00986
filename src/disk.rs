//! Piece granular access to the distributed file.
//!
//! Each peer keeps its copy of the file under its own `peer_<id>/` directory.
//! A piece's bytes live at the byte range `index * piece_size ..` of that
//! file; all pieces have the configured size except the final one.

use std::{
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use crate::{
    conf::CommonConfig,
    error::{Error, Result},
    PieceIndex,
};

/// Reads and writes single pieces of the backing file.
///
/// Reads and writes are positional, so no seek state is shared between
/// concurrent sessions serving different pieces.
pub(crate) struct PieceStore {
    file: File,
    conf: CommonConfig,
}

impl PieceStore {
    /// Opens the backing file inside `dir`, creating the directory and the
    /// file if they don't exist yet.
    pub fn open(dir: &Path, conf: &CommonConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.join(&conf.file_name))?;
        Ok(Self {
            file,
            conf: conf.clone(),
        })
    }

    /// The current length of the backing file in bytes.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Reads the piece at the given index at its natural length.
    pub fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>> {
        let mut data = vec![0; self.conf.piece_len(index)];
        self.file.read_exact_at(&mut data, self.offset(index))?;
        Ok(data)
    }

    /// Writes one complete piece. The buffer must match the piece's natural
    /// length exactly.
    pub fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<()> {
        let expected = self.conf.piece_len(index);
        if data.len() != expected {
            return Err(Error::InvalidPieceLength {
                index,
                len: data.len(),
                expected,
            });
        }
        self.file.write_all_at(data, self.offset(index))?;
        Ok(())
    }

    fn offset(&self, index: PieceIndex) -> u64 {
        index as u64 * u64::from(self.conf.piece_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_conf() -> CommonConfig {
        CommonConfig {
            preferred_count: 2,
            unchoking_interval: std::time::Duration::from_secs(1),
            optimistic_interval: std::time::Duration::from_secs(1),
            file_name: "payload.dat".into(),
            file_size: 250,
            piece_size: 100,
        }
    }

    #[test]
    fn writes_pieces_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::open(dir.path(), &test_conf()).unwrap();

        store.write_piece(1, &[0xbb; 100]).unwrap();
        store.write_piece(0, &[0xaa; 100]).unwrap();
        store.write_piece(2, &[0xcc; 50]).unwrap();

        let file = fs::read(dir.path().join("payload.dat")).unwrap();
        assert_eq!(file.len(), 250);
        assert!(file[..100].iter().all(|&b| b == 0xaa));
        assert!(file[100..200].iter().all(|&b| b == 0xbb));
        assert!(file[200..].iter().all(|&b| b == 0xcc));
    }

    #[test]
    fn reads_back_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::open(dir.path(), &test_conf()).unwrap();

        let piece: Vec<u8> = (0u8..100).collect();
        store.write_piece(0, &piece).unwrap();
        store.write_piece(2, &[7; 50]).unwrap();

        assert_eq!(store.read_piece(0).unwrap(), piece);
        assert_eq!(store.read_piece(2).unwrap(), vec![7; 50]);
    }

    #[test]
    fn rejects_wrong_piece_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::open(dir.path(), &test_conf()).unwrap();

        // non-final pieces must be exactly piece_size
        assert!(matches!(
            store.write_piece(0, &[0; 50]),
            Err(Error::InvalidPieceLength { expected: 100, .. })
        ));
        // the final piece covers the remainder only
        assert!(matches!(
            store.write_piece(2, &[0; 100]),
            Err(Error::InvalidPieceLength { expected: 50, .. })
        ));
    }

    #[test]
    fn opens_an_existing_file_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("payload.dat"), vec![9; 250]).unwrap();

        let store = PieceStore::open(dir.path(), &test_conf()).unwrap();
        assert_eq!(store.file_len().unwrap(), 250);
        assert_eq!(store.read_piece(2).unwrap(), vec![9; 50]);
    }
}
