//! The three-stage bounded pipeline that turns tracker-discovered peer
//! addresses into completed piece downloads.
//!
//! A connect stage dials and handshakes each address, a handle stage
//! exchanges bitfield/have availability and waits for an unchoke, and a
//! download stage drives the request/response loop until the peer has
//! nothing left to offer. Each stage runs a fixed pool of workers reading
//! from one shared, bounded queue; a worker that panics is respawned so a
//! single bad peer never permanently shrinks a stage's capacity.
//!
//! Shutdown is driven entirely by channel closure: once the tracker loop's
//! `peer_tx` is dropped, the connect stage's workers drain their queue and
//! return, which drops their clones of `handle_tx`, which closes the
//! handle stage's queue once it's drained, and so on down to the download
//! stage. `run` resolves once every stage has wound down this way.

use std::{net::SocketAddrV4, sync::Arc};

use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinSet,
};

use crate::{disk::DiskHandle, peer::PeerSession, torrent::SharedStatus};

/// Runs the pipeline to completion: returns once `peer_rx` is closed and
/// every peer session has either finished downloading or dropped out.
pub(crate) async fn run(
    torrent: Arc<SharedStatus>,
    disk: DiskHandle,
    peer_rx: mpsc::Receiver<SocketAddrV4>,
) {
    let connect_count = torrent.conf.connection_worker_count;
    let handler_count = torrent.conf.handler_worker_count;
    let downloader_count = torrent.conf.downloader_worker_count;

    let (handle_tx, handle_rx) = mpsc::channel(4 * handler_count);
    let (download_tx, download_rx) = mpsc::channel(4 * downloader_count);

    let peer_rx = Arc::new(AsyncMutex::new(peer_rx));
    let handle_rx = Arc::new(AsyncMutex::new(handle_rx));
    let download_rx = Arc::new(AsyncMutex::new(download_rx));

    let connect_stage = {
        let torrent = Arc::clone(&torrent);
        let disk = disk.clone();
        let peer_rx = Arc::clone(&peer_rx);
        let handle_tx = handle_tx.clone();
        run_stage(connect_count, move || {
            connect_worker(
                Arc::clone(&torrent),
                disk.clone(),
                Arc::clone(&peer_rx),
                handle_tx.clone(),
            )
        })
    };

    let handle_stage = {
        let handle_rx = Arc::clone(&handle_rx);
        let download_tx = download_tx.clone();
        run_stage(handler_count, move || {
            handle_worker(Arc::clone(&handle_rx), download_tx.clone())
        })
    };

    let download_stage = {
        let download_rx = Arc::clone(&download_rx);
        run_stage(downloader_count, move || {
            download_worker(Arc::clone(&download_rx))
        })
    };

    // drop our own references so each queue closes once its stage's
    // workers (the only remaining senders) have all exited
    drop(handle_tx);
    drop(download_tx);

    tokio::join!(connect_stage, handle_stage, download_stage);
}

/// Spawns `count` copies of a worker and keeps the stage alive until every
/// worker has returned, respawning any that panic.
async fn run_stage<F, Fut>(count: usize, make_worker: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut workers = JoinSet::new();
    for _ in 0..count {
        workers.spawn(make_worker());
    }
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                log::error!("Pipeline worker panicked, respawning: {}", e);
                workers.spawn(make_worker());
            }
            Err(e) => {
                log::debug!("Pipeline worker did not complete normally: {}", e);
            }
        }
    }
}

async fn connect_worker(
    torrent: Arc<SharedStatus>,
    disk: DiskHandle,
    peer_rx: Arc<AsyncMutex<mpsc::Receiver<SocketAddrV4>>>,
    handle_tx: mpsc::Sender<PeerSession>,
) {
    loop {
        let addr = {
            let mut rx = peer_rx.lock().await;
            rx.recv().await
        };
        let addr = match addr {
            Some(addr) => addr,
            None => return,
        };

        let mut session = PeerSession::outbound(
            Arc::clone(&torrent),
            disk.clone(),
            std::net::SocketAddr::V4(addr),
        );
        match session.connect().await {
            Ok(()) => {
                if handle_tx.send(session).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                log::debug!("Could not connect to peer {}: {}", addr, e);
            }
        }
    }
}

async fn handle_worker(
    handle_rx: Arc<AsyncMutex<mpsc::Receiver<PeerSession>>>,
    download_tx: mpsc::Sender<PeerSession>,
) {
    loop {
        let session = {
            let mut rx = handle_rx.lock().await;
            rx.recv().await
        };
        let mut session = match session {
            Some(session) => session,
            None => return,
        };

        match session.exchange_availability().await {
            Ok(true) => {
                if download_tx.send(session).await.is_err() {
                    return;
                }
            }
            Ok(false) => {
                log::debug!("Peer {} has nothing we need", session.addr());
            }
            Err(e) => {
                log::debug!(
                    "Peer {} dropped during availability exchange: {}",
                    session.addr(),
                    e
                );
            }
        }
    }
}

async fn download_worker(
    download_rx: Arc<AsyncMutex<mpsc::Receiver<PeerSession>>>,
) {
    loop {
        let session = {
            let mut rx = download_rx.lock().await;
            rx.recv().await
        };
        let mut session = match session {
            Some(session) => session,
            None => return,
        };

        if let Err(e) = session.download_loop().await {
            log::debug!("Peer {} dropped: {}", session.addr(), e);
        }
    }
}
