use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    ops::Range,
    sync::{Arc, Mutex},
};

use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task};

use super::Command;
use crate::{
    block_count,
    error::{Error, Result},
    storage_info::{FsStructure, StorageInfo},
    BlockInfo, FileIndex, FileInfo, PieceIndex, Sha1Hash,
};

/// Failure to set up a torrent's on-disk file structure.
#[derive(thiserror::Error, Debug)]
pub(crate) enum NewTorrentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The disk I/O actor for a single torrent.
pub(crate) struct Disk {
    info: StorageInfo,
    /// The in-progress piece downloads and disk writes; this is the
    /// torrent's disk write buffer. Each piece is mapped to its index for
    /// faster lookups.
    pieces: std::collections::HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation. Each writer thread gets exclusive access to the file
    /// handle it needs via the per-file mutex.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    stats: Stats,
}

impl Disk {
    /// Creates (or reopens, when resuming) the file system structure of the
    /// torrent and opens the file handles.
    ///
    /// The download directory and its files are allowed to already exist:
    /// a resumed download leaves behind exactly the files a fresh one would
    /// create, each already extended to its declared length. `set_len` is a
    /// no-op for a file that's already the right size, so a resumed run
    /// neither fails nor touches previously-written bytes.
    pub fn new(info: StorageInfo) -> std::result::Result<Self, NewTorrentError> {
        if info.download_dir.exists() {
            log::info!(
                "Download path {:?} already exists, reusing it",
                info.download_dir
            );
        }

        let download_dir = &info.download_dir;
        let open_file = |path: std::path::PathBuf, len: u64, torrent_offset: u64| {
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)?;
            handle.set_len(len)?;
            Ok(Mutex::new(TorrentFile {
                info: FileInfo { path, len, torrent_offset },
                handle,
            }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} byte file {:?}",
                    file.len,
                    file.path
                );
                let path = download_dir.join(&file.path);
                vec![open_file(path, file.len, file.torrent_offset)?]
            }
            FsStructure::Archive { files } => {
                log::debug!("Torrent is multi file: {} files", files.len());
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files {
                    let path = download_dir.join(&file.path);
                    torrent_files.push(open_file(
                        path,
                        file.len,
                        file.torrent_offset,
                    )?);
                }
                torrent_files
            }
        };

        Ok(Self {
            info,
            pieces: std::collections::HashMap::new(),
            files: Arc::new(files),
            stats: Stats::default(),
        })
    }

    /// Runs the disk event loop until the command channel is closed or a
    /// shutdown command is received.
    pub async fn run(&mut self, mut cmd_port: mpsc::UnboundedReceiver<Command>) {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = cmd_port.recv().await {
            match cmd {
                Command::WriteBlock { info, data, resp } => {
                    let result = self.write_block(info, data).await;
                    let _ = resp.send(result);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
    }

    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<Option<bool>> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            self.start_new_piece(piece_index)?;
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("newly inserted piece not present");

        piece.enqueue_block(info.offset, data);

        if !piece.is_complete() {
            return Ok(None);
        }

        let piece = self.pieces.remove(&piece_index).unwrap();
        let piece_len = self.info.piece_len;
        let files = Arc::clone(&self.files);

        // don't block the reactor with the potentially expensive hashing
        // and sync file writing
        let is_valid = task::spawn_blocking(move || -> Result<bool> {
            let is_valid = piece.matches_hash();
            if is_valid {
                log::info!("Piece {} is valid", piece_index);
                let piece_torrent_offset =
                    piece_index as u64 * piece_len as u64;
                piece.write(piece_torrent_offset, &files)?;
            } else {
                log::warn!("Piece {} is NOT valid", piece_index);
            }
            Ok(is_valid)
        })
        .await
        .map_err(|e| Error::DiskWriteFailed(e.to_string()))??;

        if is_valid {
            self.stats.verified_piece_count += 1;
        } else {
            self.stats.invalid_piece_count += 1;
        }

        Ok(Some(is_valid))
    }

    /// Starts a new in-progress piece write buffer.
    fn start_new_piece(&mut self, piece_index: PieceIndex) -> Result<()> {
        log::trace!("Creating piece {} write buffer", piece_index);

        let expected_hash = *self
            .info
            .piece_hashes
            .get(piece_index)
            .ok_or(Error::InvalidPieceIndex)?;
        let len = self.info.piece_len(piece_index)?;
        let files = self.info.files_intersecting_piece(piece_index)?;

        self.pieces.insert(
            piece_index,
            Piece { expected_hash, len, blocks: BTreeMap::new(), files },
        );

        Ok(())
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.handle.seek(SeekFrom::Start(offset))?;
        self.handle.write_all(data)?;
        Ok(())
    }
}

#[derive(Default)]
struct Stats {
    verified_piece_count: u64,
    invalid_piece_count: u64,
}

/// An in-progress piece download that keeps in memory the so far
/// downloaded blocks and the expected hash of the piece.
struct Piece {
    expected_hash: Sha1Hash,
    len: u32,
    /// The so far downloaded blocks, keyed by offset within the piece. We
    /// use a `BTreeMap` to keep keys sorted, since blocks must be
    /// concatenated in order both to hash and to write the piece.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with, as a range into
    /// `Disk::files`.
    files: Range<FileIndex>,
}

impl Piece {
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Hashes the piece's concatenated blocks and compares against the
    /// expected hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on a thread
    /// pool and not the executor.
    fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(&block);
        }
        let hash = hasher.finalize();
        hash.as_slice() == self.expected_hash
    }

    /// Writes the piece's concatenated blocks across the files it
    /// overlaps with.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking and should be
    /// executed on a thread pool and not the executor.
    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> Result<()> {
        let buf: Vec<u8> =
            self.blocks.values().flat_map(|b| b.iter().copied()).collect();
        let mut remaining = &buf[..];
        let mut write_torrent_offset = piece_torrent_offset;

        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());

        for file in files {
            let mut file = file.lock().unwrap();
            let slice =
                file.info.get_slice(write_torrent_offset, remaining.len() as u64);
            let (chunk, rest) = remaining.split_at(slice.len as usize);
            file.write_at(slice.offset, chunk)
                .map_err(|e| Error::DiskWriteFailed(e.to_string()))?;
            write_torrent_offset += slice.len;
            remaining = rest;
        }

        debug_assert!(remaining.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_reports_complete_only_once_all_blocks_arrive() {
        let mut piece = Piece {
            expected_hash: [0; 20],
            len: crate::BLOCK_LEN * 2,
            blocks: BTreeMap::new(),
            files: 0..1,
        };
        assert!(!piece.is_complete());
        piece.enqueue_block(0, vec![0u8; crate::BLOCK_LEN as usize]);
        assert!(!piece.is_complete());
        piece.enqueue_block(
            crate::BLOCK_LEN,
            vec![0u8; crate::BLOCK_LEN as usize],
        );
        assert!(piece.is_complete());
    }

    #[test]
    fn piece_hash_matches_concatenated_blocks() {
        let data = b"hello world, this is a piece".to_vec();
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let expected_hash: Sha1Hash = {
            let mut h = [0; 20];
            h.copy_from_slice(&hasher.finalize());
            h
        };

        let mut piece = Piece {
            expected_hash,
            len: data.len() as u32,
            blocks: BTreeMap::new(),
            files: 0..1,
        };
        piece.enqueue_block(0, data);
        assert!(piece.matches_hash());
    }
}
