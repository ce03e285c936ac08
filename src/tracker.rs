//! A minimal UDP tracker client implementing the connect/announce exchange
//! (BEP 15). HTTP(S) trackers are out of scope and are skipped with a
//! warning if encountered in a torrent's announce list.

use std::{net::SocketAddrV4, sync::Arc, time::Duration};

use rand::Rng;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
    time::timeout,
};
use url::Url;

use crate::{
    error::{Error, Result},
    torrent::SharedStatus,
    PeerId, Sha1Hash,
};

/// The fixed protocol id every UDP tracker exchange begins with.
const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

const CONNECT_REQUEST_LEN: usize = 16;
const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_REQUEST_LEN: usize = 98;
const ANNOUNCE_RESPONSE_HEADER_LEN: usize = 20;

/// The announce event, sent once as `Started` on a torrent's first
/// successful announce and as `None` on every subsequent round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AnnounceEvent {
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}

/// The result of a successful announce: the peers the tracker returned and
/// the interval it asks us to wait before announcing again (if any).
#[derive(Debug)]
pub(crate) struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddrV4>,
}

/// A UDP tracker client for a single torrent.
///
/// The announce `key`, a per-session anti-spoofing nonce, is generated once
/// and reused for every announce round for the lifetime of this client; it
/// is not persisted across process restarts.
pub(crate) struct Client {
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    key: u32,
    timeout: Duration,
    retries: usize,
    has_announced: bool,
}

impl Client {
    pub fn new(
        info_hash: Sha1Hash,
        peer_id: PeerId,
        port: u16,
        timeout: Duration,
        retries: usize,
    ) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            key: rand::thread_rng().gen(),
            timeout,
            retries,
            has_announced: false,
        }
    }

    /// Connects to and announces to a single UDP tracker, returning the
    /// peers it offers. `left` is the number of bytes still needed to
    /// complete the torrent.
    pub async fn announce(
        &mut self,
        tracker_url: &str,
        left: u64,
    ) -> Result<AnnounceResponse> {
        let addr = resolve_udp_tracker(tracker_url)?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let connection_id = self.connect(&socket, tracker_url).await?;
        let event = if self.has_announced {
            AnnounceEvent::None
        } else {
            AnnounceEvent::Started
        };
        let response = self
            .announce_once(&socket, connection_id, left, event, tracker_url)
            .await?;
        self.has_announced = true;
        Ok(response)
    }

    async fn connect(&self, socket: &UdpSocket, tracker_url: &str) -> Result<u64> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut req = [0u8; CONNECT_REQUEST_LEN];
        req[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
        req[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
        req[12..16].copy_from_slice(&transaction_id.to_be_bytes());

        let mut buf = [0u8; 2048];
        let len = self
            .send_and_recv(socket, &req, &mut buf, tracker_url)
            .await?;
        if len < CONNECT_RESPONSE_LEN {
            return Err(Error::InvalidConnectionResponse(
                tracker_url.to_string(),
                format!("response was {} bytes, expected at least {}", len, CONNECT_RESPONSE_LEN),
            ));
        }

        let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let resp_transaction_id =
            u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let connection_id = u64::from_be_bytes(buf[8..16].try_into().unwrap());

        if action != ACTION_CONNECT {
            return Err(Error::InvalidConnectionResponse(
                tracker_url.to_string(),
                "unexpected action".into(),
            ));
        }
        if resp_transaction_id != transaction_id {
            return Err(Error::InvalidConnectionResponse(
                tracker_url.to_string(),
                "transaction id mismatch".into(),
            ));
        }

        Ok(connection_id)
    }

    async fn announce_once(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        left: u64,
        event: AnnounceEvent,
        tracker_url: &str,
    ) -> Result<AnnounceResponse> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut req = [0u8; ANNOUNCE_REQUEST_LEN];
        let mut pos = 0;
        macro_rules! put {
            ($bytes:expr) => {{
                let bytes = $bytes;
                req[pos..pos + bytes.len()].copy_from_slice(&bytes);
                pos += bytes.len();
            }};
        }
        put!(connection_id.to_be_bytes());
        put!(ACTION_ANNOUNCE.to_be_bytes());
        put!(transaction_id.to_be_bytes());
        put!(self.info_hash);
        put!(self.peer_id);
        put!(0u64.to_be_bytes()); // downloaded
        put!(left.to_be_bytes());
        put!(0u64.to_be_bytes()); // uploaded
        put!((event as u32).to_be_bytes());
        put!(0u32.to_be_bytes()); // ip: let tracker detect
        put!(self.key.to_be_bytes());
        put!((-1i32).to_be_bytes()); // num_want: default
        put!(self.port.to_be_bytes());
        debug_assert_eq!(pos, ANNOUNCE_REQUEST_LEN);

        let mut buf = [0u8; 4096];
        let len = self
            .send_and_recv(socket, &req, &mut buf, tracker_url)
            .await?;
        if len < ANNOUNCE_RESPONSE_HEADER_LEN {
            return Err(Error::InvalidAnnounceResponse(
                tracker_url.to_string(),
                format!("response was {} bytes, expected at least {}", len, ANNOUNCE_RESPONSE_HEADER_LEN),
            ));
        }

        let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let resp_transaction_id =
            u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let leechers = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let seeders = u32::from_be_bytes(buf[16..20].try_into().unwrap());

        if action != ACTION_ANNOUNCE {
            return Err(Error::InvalidAnnounceResponse(
                tracker_url.to_string(),
                "unexpected action".into(),
            ));
        }
        if resp_transaction_id != transaction_id {
            return Err(Error::InvalidAnnounceResponse(
                tracker_url.to_string(),
                "transaction id mismatch".into(),
            ));
        }

        let mut peers = Vec::new();
        let mut offset = ANNOUNCE_RESPONSE_HEADER_LEN;
        while offset + 6 <= len {
            let ip = std::net::Ipv4Addr::new(
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            );
            let port = u16::from_be_bytes(
                buf[offset + 4..offset + 6].try_into().unwrap(),
            );
            peers.push(SocketAddrV4::new(ip, port));
            offset += 6;
        }

        Ok(AnnounceResponse {
            interval: if interval == 0 {
                None
            } else {
                Some(Duration::from_secs(interval as u64))
            },
            leechers,
            seeders,
            peers,
        })
    }

    /// Sends `req` and waits for a reply, retrying up to `self.retries`
    /// additional times on timeout.
    async fn send_and_recv(
        &self,
        socket: &UdpSocket,
        req: &[u8],
        buf: &mut [u8],
        tracker_url: &str,
    ) -> Result<usize> {
        let mut attempt = 0;
        loop {
            socket.send(req).await?;
            match timeout(self.timeout, socket.recv(buf)).await {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => {
                    return Err(Error::TrackerUnreachable(
                        tracker_url.to_string(),
                        e.to_string(),
                    ))
                }
                Err(_) => {
                    if attempt >= self.retries {
                        return Err(Error::TrackerUnreachable(
                            tracker_url.to_string(),
                            "timed out".into(),
                        ));
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// A handle to the tracker announce loop's dedicated OS thread.
pub(crate) struct TrackerHandle {
    join: std::thread::JoinHandle<()>,
}

/// Spawns the tracker announce loop on its own OS thread, per spec.md §5's
/// "one dedicated OS thread for the tracker announce loop" (the same
/// requirement `progress.rs`'s display thread satisfies). `run_loop` is
/// itself async, so the thread builds a small current-thread runtime to
/// drive it; the `mpsc`/`watch` channels it talks through are runtime
/// agnostic, so the rest of the engine keeps running on the shared
/// multi-threaded runtime untouched.
pub(crate) fn spawn_thread(
    trackers: Vec<String>,
    torrent: Arc<SharedStatus>,
    port: u16,
    peer_tx: mpsc::Sender<SocketAddrV4>,
    shutdown: watch::Receiver<bool>,
) -> TrackerHandle {
    let join = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to start tracker thread's runtime");
        runtime.block_on(run_loop(trackers, torrent, port, peer_tx, shutdown));
    });
    TrackerHandle { join }
}

/// Waits for the tracker thread to exit. Should only be called after the
/// shutdown signal has been sent, at which point `run_loop` returns shortly.
pub(crate) fn join(handle: TrackerHandle) {
    if handle.join.join().is_err() {
        log::warn!("Tracker thread panicked");
    }
}

/// Drives the announce loop for the lifetime of the torrent: announces to
/// each tracker in `trackers` in turn until one succeeds, forwards the
/// peers it returns on `peer_tx`, then sleeps until the next round (either
/// the tracker-provided interval, the configured default, or, if every
/// tracker in the list failed this round, `tracker_fallback_interval`).
/// Gives up after `tracker_error_threshold` consecutive failed rounds, and
/// exits as soon as `shutdown` reports true.
pub(crate) async fn run_loop(
    trackers: Vec<String>,
    torrent: Arc<SharedStatus>,
    port: u16,
    peer_tx: mpsc::Sender<SocketAddrV4>,
    mut shutdown: watch::Receiver<bool>,
) {
    if trackers.is_empty() {
        log::error!("No trackers to announce to");
        return;
    }

    let mut client = Client::new(
        torrent.info_hash,
        torrent.client_id,
        port,
        torrent.conf.tracker_timeout,
        torrent.conf.tracker_retries,
    );

    let mut consecutive_failures = 0usize;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut round_succeeded = false;
        let mut next_interval = torrent.conf.announce_interval;

        for tracker_url in &trackers {
            if *shutdown.borrow() {
                return;
            }

            let left = {
                let state = torrent.resume.state().lock().unwrap();
                torrent.storage.download_len
                    - torrent.storage.verified_bytes(state.verified_pieces())
            };

            match client.announce(tracker_url, left).await {
                Ok(response) => {
                    log::info!(
                        "Tracker {} returned {} peers ({} seeders, {} leechers)",
                        tracker_url,
                        response.peers.len(),
                        response.seeders,
                        response.leechers
                    );
                    for peer in response.peers {
                        if peer_tx.send(peer).await.is_err() {
                            return;
                        }
                    }
                    if let Some(interval) = response.interval {
                        next_interval = interval;
                    }
                    round_succeeded = true;
                    consecutive_failures = 0;
                    break;
                }
                Err(e) => {
                    log::warn!("Tracker {} failed: {}", tracker_url, e);
                }
            }
        }

        if !round_succeeded {
            consecutive_failures += 1;
            if consecutive_failures >= torrent.conf.tracker_error_threshold {
                log::error!(
                    "All {} trackers failed {} consecutive rounds, giving up",
                    trackers.len(),
                    consecutive_failures
                );
                return;
            }
            next_interval = torrent.conf.tracker_fallback_interval;
        }

        tokio::select! {
            _ = tokio::time::sleep(next_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Parses a `udp://host:port[/...]` tracker URL into a socket address,
/// rejecting any other scheme since HTTP(S) trackers are out of scope.
fn resolve_udp_tracker(url: &str) -> Result<std::net::SocketAddr> {
    let unreachable = |reason: &str| {
        Error::TrackerUnreachable(url.to_string(), reason.to_string())
    };
    let parsed = Url::parse(url).map_err(|_| unreachable("invalid tracker URL"))?;
    if parsed.scheme() != "udp" {
        log::warn!("Skipping non-UDP tracker {}", url);
        return Err(unreachable("non-UDP tracker"));
    }
    let host = parsed.host_str().ok_or_else(|| unreachable("tracker URL missing host"))?;
    let port = parsed.port().ok_or_else(|| unreachable("tracker URL missing port"))?;
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()
        .map_err(|e| unreachable(&e.to_string()))
        .and_then(|mut addrs| {
            addrs.next().ok_or_else(|| unreachable("could not resolve tracker host"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_udp_tracker_urls() {
        assert!(resolve_udp_tracker("http://example.com:80/announce").is_err());
    }

    #[test]
    fn announce_event_is_started_only_on_first_round() {
        let mut client = Client::new([1; 20], [2; 20], 6881, Duration::from_secs(1), 1);
        assert!(!client.has_announced);
        client.has_announced = true;
        assert!(client.has_announced);
    }
}
