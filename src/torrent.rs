//! State shared by every part of the engine that needs read-only access to
//! the torrent's identity, plus the one piece of state (the resume store)
//! that must be shared and mutated safely across concurrent peer sessions.

use std::sync::Arc;

use crate::{
    conf::TorrentConf, resume::ResumeStore, storage_info::StorageInfo, PeerId,
    Sha1Hash,
};

/// Immutable facts about the torrent and the handles peer sessions need to
/// claim and report on pieces, bundled so it can be handed to every session
/// behind a single `Arc`.
pub(crate) struct SharedStatus {
    /// The torrent's info hash, sent in the handshake and verified against
    /// each peer's own handshake.
    pub info_hash: Sha1Hash,
    /// Our own client id, sent in the handshake.
    pub client_id: PeerId,
    /// The piece and file layout of the torrent.
    pub storage: StorageInfo,
    /// The shared claim/verification state for all pieces.
    pub resume: Arc<ResumeStore>,
    /// Timeouts and worker/queue tuning shared by every session.
    pub conf: TorrentConf,
}

impl SharedStatus {
    pub fn new(
        info_hash: Sha1Hash,
        client_id: PeerId,
        storage: StorageInfo,
        resume: Arc<ResumeStore>,
        conf: TorrentConf,
    ) -> Self {
        Self { info_hash, client_id, storage, resume, conf }
    }
}
