//! The crate's error and result types.

use std::net::SocketAddr;

use crate::PieceIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The master error type, encompassing every failure mode a torrent download
/// can hit, from a malformed metainfo file all the way down to a single
/// peer's protocol violation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The metainfo file could not be parsed, or its `info` dictionary is
    /// internally inconsistent (e.g. `pieces` isn't a multiple of 20 bytes).
    #[error("malformed metainfo: {0}")]
    MalformedMetainfo(String),

    /// A resume file was found on disk but it doesn't match the torrent
    /// we're about to download (different info hash or piece count).
    #[error("resume file does not match torrent")]
    ResumeMismatch,

    /// A block or piece index fell outside of the torrent's bounds.
    #[error("invalid piece index")]
    InvalidPieceIndex,

    /// Used internally to look up a torrent by id; since this crate drives a
    /// single torrent at a time, this should never surface.
    #[error("invalid torrent id")]
    InvalidTorrentId,

    /// Peer's handshake carried a different info hash than the one we're
    /// downloading.
    #[error("peer {0} sent invalid info hash in handshake")]
    InvalidPeerInfoHash(SocketAddr),

    /// Peer's handshake frame was malformed (bad protocol string length or
    /// protocol string).
    #[error("peer {0} sent an invalid handshake")]
    BadHandshake(SocketAddr),

    /// A peer violated the wire protocol in a way that isn't one of the
    /// more specific variants above: an unexpected bitfield mid-session, an
    /// unsolicited piece, or similar.
    #[error("peer {0} violated the wire protocol: {1}")]
    ProtocolViolation(SocketAddr, String),

    /// Peer failed to unchoke us within the configured deadline.
    #[error("peer {0} did not unchoke us in time")]
    UnchokeTimeout(SocketAddr),

    /// Peer stopped sending us frames within the per-read deadline.
    #[error("peer {0} timed out")]
    PeerTimeout(SocketAddr),

    /// A peer message declared a length exceeding our configured frame cap.
    #[error("oversized frame ({0} bytes)")]
    OversizedFrame(u32),

    /// A piece's contents didn't hash to the value recorded in the
    /// metainfo file.
    #[error("piece {0} failed hash verification")]
    InvalidPieceHash(PieceIndex),

    /// Writing a verified piece to one of the output files failed.
    #[error("disk write failed: {0}")]
    DiskWriteFailed(String),

    /// No UDP tracker in the metainfo's announce list could be reached.
    #[error("no reachable tracker")]
    NoReachableTracker,

    /// A tracker URL could not be resolved or reached at all (DNS failure,
    /// unsupported scheme, socket error) -- distinct from one that replied
    /// with a malformed connect/announce response.
    #[error("tracker {0} unreachable: {1}")]
    TrackerUnreachable(String, String),

    /// The UDP tracker's connect reply was too short, or its action/
    /// transaction id didn't match our request.
    #[error("tracker {0} sent invalid connect response: {1}")]
    InvalidConnectionResponse(String, String),

    /// The UDP tracker's announce reply was too short, or its action/
    /// transaction id didn't match our request.
    #[error("tracker {0} sent invalid announce response: {1}")]
    InvalidAnnounceResponse(String, String),

    /// Dialing a peer's TCP address failed outright (distinct from a dial
    /// that simply ran past the connect deadline, see `PeerTimeout`).
    #[error("could not connect to peer {0}: {1}")]
    PeerConnectFailed(SocketAddr, String),

    /// Bubbled up from `std::io`.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Bubbled up from bencode decoding.
    #[error(transparent)]
    Bencode(#[from] serde_bencode::Error),

    /// Bubbled up from resume file (de)serialization.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Per spec.md §7's propagation policy: these three variants are the
    /// only ones that should ever reach the supervisor and abort the run;
    /// every other variant is handled and logged at its own call site
    /// (per-tracker, per-peer, or per-piece).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedMetainfo(_)
                | Error::ResumeMismatch
                | Error::DiskWriteFailed(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        // by the time a channel send fails, the receiving task has already
        // gone away, which for our purposes is equivalent to the session or
        // pipeline stage having shut down
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "receiver dropped",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn only_the_documented_trio_is_fatal() {
        assert!(Error::MalformedMetainfo("x".into()).is_fatal());
        assert!(Error::ResumeMismatch.is_fatal());
        assert!(Error::DiskWriteFailed("x".into()).is_fatal());

        assert!(!Error::PeerTimeout(addr()).is_fatal());
        assert!(!Error::UnchokeTimeout(addr()).is_fatal());
        assert!(!Error::InvalidPieceHash(0).is_fatal());
        assert!(!Error::NoReachableTracker.is_fatal());
    }

    #[test]
    fn display_carries_context() {
        let err = Error::ProtocolViolation(addr(), "bitfield mid-session".into());
        assert_eq!(
            err.to_string(),
            "peer 127.0.0.1:6881 violated the wire protocol: bitfield mid-session"
        );
    }
}
