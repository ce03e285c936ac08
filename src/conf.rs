//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// The client id is randomly generated, per peer id conventions
    /// (http://bittorrent.org/beps/bep_0020.html).
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::new(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

impl EngineConf {
    /// Generates a fresh Azureus-style peer id: the fixed `-TR4003-` client
    /// abbreviation and version, followed by 12 random bytes, chosen once
    /// per process.
    pub fn new() -> Self {
        let mut client_id = [0u8; 20];
        client_id[..8].copy_from_slice(b"-TR4003-");
        rand::Rng::fill(&mut rand::thread_rng(), &mut client_id[8..]);
        Self { client_id }
    }
}

impl Default for EngineConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the torrent this engine drives.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The path of the resume file. Defaults to `<download_dir>/resume.json`
    /// when unset.
    pub resume_path: Option<PathBuf>,

    /// If true, an existing resume file is ignored and all pieces are
    /// rehashed from disk contents before starting (see DESIGN.md's Open
    /// Question about crash safety). Defaults to false.
    pub rehash_on_start: bool,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we
    /// default to this value.
    pub announce_interval: Duration,

    /// After this many consecutive failed rounds against every tracker in
    /// the announce list, the torrent gives up.
    pub tracker_error_threshold: usize,

    /// How long to wait for a UDP tracker reply before retrying.
    pub tracker_timeout: Duration,

    /// How many times to retry a single UDP tracker request before moving
    /// on to the next tracker URL.
    pub tracker_retries: usize,

    /// If every tracker in the announce list fails in a round, how long to
    /// sleep before retrying the whole list.
    pub tracker_fallback_interval: Duration,

    /// Deadline for establishing the TCP connection to a peer.
    pub connect_timeout: Duration,

    /// Deadline for completing the handshake exchange with a peer.
    pub handshake_timeout: Duration,

    /// Deadline for reading the next frame from a peer once connected.
    pub peer_read_timeout: Duration,

    /// Deadline for a peer to unchoke us after we declare interest.
    pub unchoke_timeout: Duration,

    /// Maximum accepted peer message length, in bytes; larger frames are
    /// rejected without panicking.
    pub max_frame_len: u32,

    /// The maximum number of pieces a single peer session may have claimed
    /// at once.
    pub max_claim_per_peer: usize,

    /// The number of connection-stage workers.
    pub connection_worker_count: usize,

    /// The number of handshake/handler-stage workers.
    pub handler_worker_count: usize,

    /// The number of download-stage workers.
    pub downloader_worker_count: usize,

    /// How often the progress display thread prints a status line.
    pub progress_interval: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            resume_path: None,
            rehash_on_start: false,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
            tracker_timeout: Duration::from_secs(1),
            tracker_retries: 1,
            tracker_fallback_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            peer_read_timeout: Duration::from_secs(5),
            unchoke_timeout: Duration::from_secs(30),
            max_frame_len: 1 << 20,
            max_claim_per_peer: 1,
            connection_worker_count: 4,
            handler_worker_count: 2,
            downloader_worker_count: 8,
            progress_interval: Duration::from_secs(10),
        }
    }

    /// Returns the configured resume file path, falling back to
    /// `<download_dir>/resume.json`.
    pub fn resume_path(&self) -> PathBuf {
        self.resume_path
            .clone()
            .unwrap_or_else(|| self.download_dir.join("resume.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_bound_is_four_times_consumer_workers() {
        let conf = TorrentConf::new("/tmp");
        // the handler stage consumes from the connection stage's queue and
        // the downloader stage consumes from the handler stage's queue; the
        // pipeline module derives each queue's bound as 4x its consumer
        // worker count using these fields directly
        assert_eq!(conf.handler_worker_count, 2);
        assert_eq!(conf.downloader_worker_count, 8);
    }

    #[test]
    fn resume_path_defaults_under_download_dir() {
        let conf = TorrentConf::new("/tmp/downloads");
        assert_eq!(
            conf.resume_path(),
            PathBuf::from("/tmp/downloads/resume.json")
        );
    }
}
