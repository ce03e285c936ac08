//! Durable record of which pieces have already been verified, plus the
//! in-memory claim bookkeeping used to hand out work to peer sessions
//! without two sessions ever downloading the same piece at once.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Utc;

use crate::{
    error::{Error, Result},
    Bitfield, PieceIndex, Sha1Hash,
};

/// The JSON-serializable, on-disk shape of the resume record.
///
/// Field names and shape intentionally mirror the layout documented for the
/// resume file: a flat object keyed by these exact names, so that a resume
/// file written by one run can be inspected or hand-edited between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub info_hash: String,
    pub piece_length: u64,
    pub total_pieces: usize,
    pub downloaded: usize,
    pub file_sizes: Vec<u64>,
    pub mtime: u64,
    pub verified_pieces: Vec<bool>,
    pub last_active: String,
}

impl ResumeRecord {
    fn fresh(
        info_hash: Sha1Hash,
        piece_length: u64,
        total_pieces: usize,
        file_sizes: Vec<u64>,
    ) -> Self {
        Self {
            info_hash: hex::encode(info_hash),
            piece_length,
            total_pieces,
            downloaded: 0,
            file_sizes,
            mtime: now_secs(),
            verified_pieces: vec![false; total_pieces],
            last_active: Utc::now().to_rfc3339(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The mutable, in-memory download state: which pieces are verified, which
/// are currently claimed by some peer session, and the running count of
/// verified pieces. All three are kept under one mutex because the claim
/// and verification invariants span all of them together.
pub(crate) struct ResumeState {
    verified_pieces: Bitfield,
    downloaded: usize,
    claimed_pieces: HashSet<PieceIndex>,
}

impl ResumeState {
    fn from_record(record: &ResumeRecord) -> Self {
        let mut verified_pieces = Bitfield::with_capacity(record.total_pieces);
        for &bit in &record.verified_pieces {
            verified_pieces.push(bit);
        }
        Self {
            verified_pieces,
            downloaded: record.downloaded,
            claimed_pieces: HashSet::new(),
        }
    }

    /// Picks up to `max_per_peer` pieces that are neither verified nor
    /// already claimed, from among the indices where `available` is set,
    /// claims them, and returns their indices in ascending order.
    pub fn claim_batch(
        &mut self,
        available: &Bitfield,
        max_per_peer: usize,
    ) -> Vec<PieceIndex> {
        let mut claimed = Vec::with_capacity(max_per_peer);
        for index in 0..self.verified_pieces.len() {
            if claimed.len() >= max_per_peer {
                break;
            }
            if self.verified_pieces[index] || self.claimed_pieces.contains(&index)
            {
                continue;
            }
            if index >= available.len() || !available[index] {
                continue;
            }
            self.claimed_pieces.insert(index);
            claimed.push(index);
        }
        claimed
    }

    /// Releases a claimed piece back to the pool, e.g. after a failed
    /// download attempt or a hash mismatch.
    pub fn release(&mut self, index: PieceIndex) {
        self.claimed_pieces.remove(&index);
    }

    /// Marks a piece as verified. Returns whether this call actually
    /// flipped the bit (a piece, once verified, never transitions back).
    pub fn mark_verified(&mut self, index: PieceIndex) -> bool {
        self.claimed_pieces.remove(&index);
        if self.verified_pieces[index] {
            return false;
        }
        self.verified_pieces.set(index, true);
        self.downloaded += 1;
        true
    }

    /// Returns true once every piece is verified.
    pub fn is_complete(&self) -> bool {
        self.downloaded == self.verified_pieces.len()
    }

    pub fn downloaded(&self) -> usize {
        self.downloaded
    }

    pub fn total_pieces(&self) -> usize {
        self.verified_pieces.len()
    }

    pub fn verified_pieces(&self) -> &Bitfield {
        &self.verified_pieces
    }
}

/// Owns the resume file path and the mutex-guarded in-memory state derived
/// from it.
pub(crate) struct ResumeStore {
    path: PathBuf,
    info_hash: Sha1Hash,
    piece_length: u64,
    file_sizes: Vec<u64>,
    state: Mutex<ResumeState>,
}

impl ResumeStore {
    /// Loads the resume file at `path` if present, verifying it matches the
    /// torrent we're about to download; otherwise starts a fresh record.
    pub fn load_or_init(
        path: impl Into<PathBuf>,
        info_hash: Sha1Hash,
        piece_length: u64,
        total_pieces: usize,
        file_sizes: Vec<u64>,
    ) -> Result<Self> {
        let path = path.into();
        let record = match fs::read(&path) {
            Ok(bytes) => {
                let record: ResumeRecord = serde_json::from_slice(&bytes)?;
                if record.info_hash != hex::encode(info_hash)
                    || record.total_pieces != total_pieces
                {
                    log::warn!(
                        "Resume file {:?} does not match torrent, starting fresh",
                        path
                    );
                    return Err(Error::ResumeMismatch);
                }
                log::info!(
                    "Resuming {}/{} pieces from {:?}",
                    record.downloaded,
                    record.total_pieces,
                    path
                );
                record
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No resume file at {:?}, starting fresh", path);
                ResumeRecord::fresh(
                    info_hash,
                    piece_length,
                    total_pieces,
                    file_sizes.clone(),
                )
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            info_hash,
            piece_length,
            file_sizes,
            state: Mutex::new(ResumeState::from_record(&record)),
        })
    }

    pub fn state(&self) -> &Mutex<ResumeState> {
        &self.state
    }

    /// Serializes the current state and atomically replaces the resume
    /// file with it (write to a temp file beside it, then rename over).
    pub fn save(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        let record = ResumeRecord {
            info_hash: hex::encode(self.info_hash),
            piece_length: self.piece_length,
            total_pieces: state.total_pieces(),
            downloaded: state.downloaded(),
            file_sizes: self.file_sizes.clone(),
            mtime: now_secs(),
            verified_pieces: state.verified_pieces().iter().map(|b| *b).collect(),
            last_active: Utc::now().to_rfc3339(),
        };
        drop(state);

        let bytes = serde_json::to_vec_pretty(&record)?;
        let tmp_path = tmp_path_for(&self.path);
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &self.path)?;
        log::debug!("Saved resume file to {:?}", self.path);
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn facts() -> ([u8; 20], u64, usize, Vec<u64>) {
        ([7; 20], 16384, 4, vec![4 * 16384])
    }

    #[test]
    fn claim_is_exclusive_and_releasable() {
        let (info_hash, piece_len, total, sizes) = facts();
        let store = ResumeStore::load_or_init(
            "/tmp/this-path-does-not-exist-resume.json",
            info_hash,
            piece_len,
            total,
            sizes,
        )
        .unwrap();

        let mut available = Bitfield::with_capacity(total);
        for _ in 0..total {
            available.push(true);
        }

        let mut state = store.state.lock().unwrap();
        let claimed_a = state.claim_batch(&available, 1);
        assert_eq!(claimed_a, vec![0]);
        // same piece cannot be claimed again while outstanding
        let claimed_b = state.claim_batch(&available, 1);
        assert_eq!(claimed_b, vec![1]);

        state.release(0);
        let claimed_c = state.claim_batch(&available, 1);
        assert_eq!(claimed_c, vec![0]);
    }

    #[test]
    fn mark_verified_is_monotonic() {
        let (info_hash, piece_len, total, sizes) = facts();
        let store = ResumeStore::load_or_init(
            "/tmp/this-path-also-does-not-exist-resume.json",
            info_hash,
            piece_len,
            total,
            sizes,
        )
        .unwrap();

        let mut state = store.state.lock().unwrap();
        assert!(state.mark_verified(2));
        assert!(!state.mark_verified(2));
        assert_eq!(state.downloaded(), 1);
    }
}
