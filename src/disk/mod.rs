//! The disk I/O actor: a dedicated task that owns every open file handle
//! for the torrent, buffers a piece's blocks until it's complete, verifies
//! the piece's hash off the reactor, and scatters the verified bytes across
//! the files it overlaps.

mod io;

use tokio::sync::{mpsc, oneshot};

use crate::{error::Result, storage_info::StorageInfo, BlockInfo};

pub(crate) use io::NewTorrentError;

/// A handle peer sessions use to enqueue a downloaded block for writing.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: mpsc::UnboundedSender<Command>,
}

enum Command {
    WriteBlock {
        info: BlockInfo,
        data: Vec<u8>,
        resp: oneshot::Sender<Result<Option<bool>>>,
    },
    Shutdown,
}

impl DiskHandle {
    /// Enqueues `data` as the block described by `info`. Returns `Ok(None)`
    /// if the piece isn't complete yet, or `Ok(Some(is_valid))` once this
    /// call completed the piece and its hash was checked.
    pub async fn write_block(
        &self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<Option<bool>> {
        let (resp, recv) = oneshot::channel();
        self.cmd_chan
            .send(Command::WriteBlock { info, data, resp })?;
        recv.await.unwrap_or(Ok(None))
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_chan.send(Command::Shutdown);
    }
}

/// Spawns the disk I/O task for a single torrent, creating the output
/// files (and any necessary subdirectories) up front.
pub(crate) fn spawn(
    info: StorageInfo,
) -> std::result::Result<DiskHandle, NewTorrentError> {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut disk = io::Disk::new(info)?;
    tokio::spawn(async move {
        disk.run(cmd_port).await;
    });
    Ok(DiskHandle { cmd_chan })
}
