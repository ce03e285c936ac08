//! The top-level orchestrator: wires together the tracker loop, the
//! download pipeline, and the progress display, and owns the run's exit
//! conditions (completion, Ctrl-C, or a fatal error).

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};

use crate::{
    conf::Conf,
    disk,
    error::{Error, Result},
    metainfo::Metainfo,
    pipeline, progress,
    resume::ResumeStore,
    storage_info::{FsStructure, StorageInfo},
    torrent::SharedStatus,
    tracker,
};

/// The port we announce to trackers. This client never accepts inbound
/// connections (see the crate's seeding non-goal), so the value is purely
/// nominal, but trackers still expect one.
const LISTEN_PORT: u16 = 6881;

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every piece was downloaded and verified.
    Completed,
    /// The user interrupted the run (Ctrl-C), or every tracker and peer
    /// was exhausted before the torrent finished. Progress up to that
    /// point has been saved to the resume file.
    Interrupted,
}

/// Downloads a single torrent to completion, or until interrupted.
///
/// `torrent_path` is the path to the `.torrent` metainfo file. `conf`
/// supplies every other tunable; `conf.torrent.download_dir` is where the
/// torrent's files are written and, by default, where the resume file
/// lives.
pub async fn run(torrent_path: PathBuf, conf: Conf) -> Result<Outcome> {
    let metainfo_bytes = std::fs::read(&torrent_path)?;
    let metainfo = Metainfo::from_bytes(&metainfo_bytes)?;

    let trackers = metainfo.trackers();
    if trackers.is_empty() {
        log::warn!("Torrent {:?} has no announce URLs", torrent_path);
        return Err(Error::NoReachableTracker);
    }

    let storage = StorageInfo::new(&metainfo, conf.torrent.download_dir.clone())?;
    let info_hash = storage.info_hash;
    log::info!(
        "Starting torrent {} ({} pieces, {} bytes)",
        hex::encode(info_hash),
        storage.piece_count,
        storage.download_len
    );

    // the resume file lives beside the torrent's own output files, i.e.
    // under `storage.download_dir` (which already accounts for the
    // torrent-named subdirectory), not the raw CLI destination argument
    let resume_path = conf
        .torrent
        .resume_path
        .clone()
        .unwrap_or_else(|| storage.download_dir.join("resume.json"));
    let resume = Arc::new(ResumeStore::load_or_init(
        resume_path,
        info_hash,
        storage.piece_len as u64,
        storage.piece_count,
        file_sizes(&storage),
    )?);

    let disk = disk::spawn(storage.clone())
        .map_err(|e| Error::DiskWriteFailed(e.to_string()))?;

    let torrent = Arc::new(SharedStatus::new(
        info_hash,
        conf.engine.client_id,
        storage,
        Arc::clone(&resume),
        conf.torrent.clone(),
    ));

    // the peer_queue's consumer is the connect stage, so its soft bound is
    // 4x the connect stage's worker count, the same rule pipeline.rs uses
    // for its own two internal queues
    let (peer_tx, peer_rx) =
        mpsc::channel(4 * conf.torrent.connection_worker_count);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tracker_handle = tracker::spawn_thread(
        trackers,
        Arc::clone(&torrent),
        LISTEN_PORT,
        peer_tx,
        shutdown_rx,
    );

    let progress_handle = progress::spawn(Arc::clone(&torrent));

    let outcome = tokio::select! {
        _ = pipeline::run(Arc::clone(&torrent), disk.clone(), peer_rx) => {
            if torrent.resume.state().lock().unwrap().is_complete() {
                log::info!("Torrent complete");
                Outcome::Completed
            } else {
                log::warn!(
                    "Ran out of trackers and peers before the torrent finished"
                );
                Outcome::Interrupted
            }
        }
        _ = wait_until_complete(Arc::clone(&torrent)) => {
            log::info!("Torrent complete");
            Outcome::Completed
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received interrupt, shutting down");
            Outcome::Interrupted
        }
    };

    let _ = shutdown_tx.send(true);
    disk.shutdown();
    tracker::join(tracker_handle);
    progress::stop(progress_handle);

    resume.save()?;

    Ok(outcome)
}

/// Polls the shared resume state until every piece is verified.
///
/// The pipeline itself has no notion of "done": its worker pools keep
/// waiting on their queues for as long as the tracker loop keeps feeding
/// peer addresses in, even after the last piece has been written. This is
/// the missing piece that lets a successful download actually end the
/// `select!` in [`run`] with [`Outcome::Completed`] instead of waiting on
/// the tracker to give up or the user to hit Ctrl-C.
async fn wait_until_complete(torrent: Arc<SharedStatus>) {
    loop {
        if torrent.resume.state().lock().unwrap().is_complete() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn file_sizes(storage: &StorageInfo) -> Vec<u64> {
    match &storage.structure {
        FsStructure::File(file) => vec![file.len],
        FsStructure::Archive { files } => files.iter().map(|f| f.len).collect(),
    }
}
