pub(crate) mod codec;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use codec::*;

use crate::{
    disk::DiskHandle, download::PieceDownload, error::*, torrent::SharedStatus,
    Bitfield, BlockInfo, PeerId,
};

/// A single peer's connection, from TCP dial through the handshake,
/// availability exchange, and the block-request download loop.
///
/// The session itself moves between the three pipeline stages (connect,
/// handle, download) as plain ownership transfer through a channel; each
/// stage method below corresponds to one of those stages and is meant to be
/// driven by `pipeline::run`, not called out of order.
pub(crate) struct PeerSession {
    /// Shared, read-only information about the torrent, and the handle to
    /// its shared claim/verification state.
    torrent: Arc<SharedStatus>,
    /// The entity used to save downloaded file blocks to disk.
    disk: DiskHandle,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session related information.
    status: Status,
    /// The framed socket, present from the end of the connect stage onward.
    socket: Option<Framed<TcpStream, PeerCodec>>,
    /// The active piece downloads this session is participating in. Bound
    /// by `conf.max_claim_per_peer`.
    downloads: Vec<PieceDownload>,
    /// Our pending requests sent to peer, i.e. the blocks we're expecting.
    /// Cleared when we're choked, since we don't expect pending requests to
    /// be served in that case.
    outgoing_requests: Vec<BlockInfo>,
    /// Information about the peer, set after a successful handshake.
    peer_info: Option<PeerInfo>,
}

impl PeerSession {
    /// Creates a new outbound session for the peer at the given address.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        disk: DiskHandle,
        addr: SocketAddr,
    ) -> Self {
        Self {
            torrent,
            disk,
            addr,
            status: Status::default(),
            socket: None,
            downloads: Vec::new(),
            outgoing_requests: Vec::new(),
            peer_info: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connect stage: dials the peer and exchanges the fixed handshake.
    ///
    /// On success the session holds an open, framed socket ready for the
    /// availability exchange and advances to `AwaitFirstMessage`.
    pub async fn connect(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);

        self.status.state = State::Dial;
        let socket = timeout(
            self.torrent.conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| Error::PeerTimeout(self.addr))?
        .map_err(|e| Error::PeerConnectFailed(self.addr, e.to_string()))?;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        let peer_handshake =
            timeout(self.torrent.conf.handshake_timeout, socket.next())
                .await
                .map_err(|_| Error::PeerTimeout(self.addr))?
                .ok_or(Error::BadHandshake(self.addr))?
                .map_err(|_| Error::BadHandshake(self.addr))?;
        log::debug!(
            "Peer {} handshake info hash: {}",
            self.addr,
            hex::encode(peer_handshake.info_hash)
        );

        if peer_handshake.info_hash != self.torrent.info_hash {
            log::warn!("Peer {} sent invalid info hash in handshake", self.addr);
            return Err(Error::InvalidPeerInfoHash(self.addr));
        }

        self.peer_info =
            Some(PeerInfo { peer_id: peer_handshake.peer_id, pieces: None });

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(
            old_parts.io,
            PeerCodec::new(self.torrent.conf.max_frame_len),
        );
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        self.socket = Some(Framed::from_parts(new_parts));

        self.status.state = State::AwaitFirstMessage;
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        Ok(())
    }

    /// Handle stage: reads the peer's first message (bitfield or have),
    /// declares interest if it has anything we still need, and waits for
    /// the peer to unchoke us.
    ///
    /// Returns `Ok(true)` once unchoked and ready for the download stage,
    /// or `Ok(false)` if the peer has nothing we need (a `no_work` close,
    /// per spec.md §4.5's `AwaitUnchoke` transition).
    pub async fn exchange_availability(&mut self) -> Result<bool> {
        debug_assert_eq!(self.status.state, State::AwaitFirstMessage);
        log::info!("Awaiting first message from peer {}", self.addr);

        let mut available = empty_bitfield(self.torrent.storage.piece_count);
        let first = self.read_frame().await?;
        match first {
            Message::Bitfield(mut bitfield) => {
                // the wire bitfield may be padded to a byte boundary, so
                // trim it down to the logical piece count
                bitfield.resize(self.torrent.storage.piece_count, false);
                available = bitfield;
            }
            Message::Have { piece_index } => {
                if piece_index < available.len() {
                    available.set(piece_index, true);
                }
            }
            other => {
                log::warn!(
                    "Peer {} sent unexpected first message {:?}",
                    self.addr,
                    other.id()
                );
                return Err(Error::ProtocolViolation(
                    self.addr,
                    "expected bitfield or have as first message".into(),
                ));
            }
        }

        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(available.clone());
        }

        let has_needed_piece = {
            let state = self.torrent.resume.state().lock().unwrap();
            let verified = state.verified_pieces();
            (0..available.len()).any(|index| available[index] && !verified[index])
        };
        if !has_needed_piece {
            log::info!("Peer {} has nothing we need, closing", self.addr);
            return Ok(false);
        }

        log::info!("Interested in peer {}", self.addr);
        self.socket.as_mut().unwrap().send(Message::Interested).await?;
        self.status.is_interested = true;
        self.status.state = State::AwaitUnchoke;
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        self.wait_for_unchoke().await?;

        Ok(true)
    }

    /// Waits, with a hard cap, for the peer to unchoke us, updating our
    /// availability view in response to any `have` messages seen along the
    /// way. A `choke` received while already choked is a no-op repeat.
    async fn wait_for_unchoke(&mut self) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + self.torrent.conf.unchoke_timeout;
        loop {
            let remaining =
                deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining == Duration::from_secs(0) {
                return Err(Error::UnchokeTimeout(self.addr));
            }
            let msg = timeout(remaining, self.socket.as_mut().unwrap().next())
                .await
                .map_err(|_| Error::UnchokeTimeout(self.addr))?
                .ok_or(Error::UnchokeTimeout(self.addr))??;
            match msg {
                Message::Unchoke => {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.status.state = State::Downloading;
                    return Ok(());
                }
                Message::Choke => {
                    log::debug!("Peer {} (still) choked", self.addr);
                }
                Message::Have { piece_index } => {
                    self.record_have(piece_index);
                }
                Message::Bitfield(_) => {
                    return Err(Error::ProtocolViolation(
                        self.addr,
                        "bitfield received outside availability exchange".into(),
                    ));
                }
                Message::KeepAlive => {}
                _ => {}
            }
        }
    }

    /// Download stage: repeatedly claims pieces and downloads their
    /// blocks, one block in flight per claimed piece, until no more
    /// pieces are claimable from this peer's availability set or an I/O
    /// error occurs.
    pub async fn download_loop(&mut self) -> Result<()> {
        debug_assert_eq!(self.status.state, State::Downloading);
        log::info!("Peer {} entering download loop", self.addr);

        loop {
            if self.status.is_choked {
                self.wait_for_unchoke().await?;
            }

            self.make_requests().await?;

            if self.downloads.is_empty() && self.outgoing_requests.is_empty() {
                log::info!("No more claimable pieces from peer {}", self.addr);
                return Ok(());
            }

            let msg = self.read_frame().await?;
            self.handle_msg(msg).await?;
        }
    }

    /// Reads the next frame with the configured per-frame read deadline.
    async fn read_frame(&mut self) -> Result<Message> {
        timeout(
            self.torrent.conf.peer_read_timeout,
            self.socket.as_mut().unwrap().next(),
        )
        .await
        .map_err(|_| Error::PeerTimeout(self.addr))?
        .ok_or(Error::PeerTimeout(self.addr))?
    }

    fn record_have(&mut self, piece_index: usize) {
        log::trace!("Peer {} announced having piece {}", self.addr, piece_index);
        if let Some(peer_info) = &mut self.peer_info {
            if let Some(pieces) = &mut peer_info.pieces {
                if piece_index < pieces.len() {
                    pieces.set(piece_index, true);
                }
            }
        }
    }

    /// Handles messages expected once past the availability exchange.
    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::warn!("Peer {} sent bitfield out of order", self.addr);
                return Err(Error::ProtocolViolation(
                    self.addr,
                    "bitfield received mid-session".into(),
                ));
            }
            Message::KeepAlive => {
                log::trace!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    let mut state = self.torrent.resume.state().lock().unwrap();
                    for download in self.downloads.drain(..) {
                        state.release(download.piece_index());
                    }
                    drop(state);
                    self.outgoing_requests.clear();
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests().await?;
                }
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
            }
            Message::Block { piece_index, offset, data } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;
                self.make_requests().await?;
            }
            Message::Have { piece_index } => {
                self.record_have(piece_index);
            }
            Message::Request(_) | Message::Cancel(_) => {
                log::warn!(
                    "Peer {} sent unexpected upload-side message: {:?}",
                    self.addr,
                    msg.id()
                );
            }
        }

        Ok(())
    }

    /// Claims and requests as many blocks as the session's claim budget
    /// allows: at most `conf.max_claim_per_peer` pieces in flight, one
    /// outstanding block request per active piece download.
    async fn make_requests(&mut self) -> Result<()> {
        log::trace!("Making requests to peer {}", self.addr);

        let mut blocks = Vec::new();

        if self.outgoing_requests.is_empty() {
            for download in self.downloads.iter_mut() {
                download.pick_blocks(1, &mut blocks);
            }
        }

        while self.downloads.len() < self.torrent.conf.max_claim_per_peer {
            let peer_pieces = self
                .peer_info
                .as_ref()
                .and_then(|info| info.pieces.clone())
                .unwrap_or_else(|| {
                    full_bitfield(self.torrent.storage.piece_count)
                });

            let claimed = self
                .torrent
                .resume
                .state()
                .lock()
                .unwrap()
                .claim_batch(&peer_pieces, 1);
            if claimed.is_empty() {
                break;
            }
            for index in claimed {
                log::info!("Session {} claimed piece {}", self.addr, index);
                let piece_len = self.torrent.storage.piece_len(index)?;
                let mut download = PieceDownload::new(index, piece_len);
                download.pick_blocks(1, &mut blocks);
                self.downloads.push(download);
            }
        }

        self.outgoing_requests.extend_from_slice(&blocks);
        let socket = self.socket.as_mut().unwrap();
        for block in blocks.iter() {
            socket.send(Message::Request(*block)).await?;
        }

        Ok(())
    }

    /// Validates a received block against our pending requests, forwards
    /// it to disk, and finalizes the piece (marking it verified or
    /// releasing the claim for retry) once all of its blocks have
    /// arrived.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!(
            "Received block from peer {}: {:?}",
            self.addr,
            block_info
        );

        let block_pos = match self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Peer {} sent unrequested block: {:?}",
                    self.addr,
                    block_info
                );
                return Ok(());
            }
        };
        self.outgoing_requests.remove(block_pos);

        let download_pos = match self
            .downloads
            .iter()
            .position(|d| d.piece_index() == block_info.piece_index)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Peer {} sent block for untracked piece {}",
                    self.addr,
                    block_info.piece_index
                );
                return Ok(());
            }
        };
        self.downloads[download_pos].received_block(block_info);

        let write_result = self.disk.write_block(block_info, data).await?;

        if self.downloads[download_pos].count_missing_blocks() == 0 {
            let piece_index = self.downloads[download_pos].piece_index();
            self.downloads.remove(download_pos);

            match write_result {
                Some(true) => {
                    log::info!(
                        "Finished piece {} via peer {}",
                        piece_index,
                        self.addr
                    );
                    self.torrent
                        .resume
                        .state()
                        .lock()
                        .unwrap()
                        .mark_verified(piece_index);
                }
                Some(false) => {
                    log::warn!(
                        "Piece {} failed hash verification, releasing for retry",
                        piece_index
                    );
                    self.torrent
                        .resume
                        .state()
                        .lock()
                        .unwrap()
                        .release(piece_index);
                }
                None => {
                    // shouldn't happen: the last block of a piece should
                    // always trigger a hash check
                    log::error!(
                        "Disk gave no verdict for completed piece {}",
                        piece_index
                    );
                    self.torrent
                        .resume
                        .state()
                        .lock()
                        .unwrap()
                        .release(piece_index);
                }
            }
        }

        self.status.downloaded_bytes_count += block_info.len as u64;

        Ok(())
    }
}

impl Drop for PeerSession {
    /// Releases any pieces this session still had claimed, regardless of
    /// which path ended the session (hash mismatch and explicit choke
    /// already release as they happen; this catches I/O errors, timeouts,
    /// and anything else that unwinds out of `download_loop`).
    fn drop(&mut self) {
        if self.downloads.is_empty() {
            return;
        }
        let mut state = self.torrent.resume.state().lock().unwrap();
        for download in self.downloads.drain(..) {
            log::debug!(
                "Releasing piece {} claimed by peer {} on session teardown",
                download.piece_index(),
                self.addr
            );
            state.release(download.piece_index());
        }
    }
}

/// The status of a peer session.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    is_choked: bool,
    is_interested: bool,
    is_peer_interested: bool,
    downloaded_bytes_count: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_interested: false,
            downloaded_bytes_count: 0,
        }
    }
}

/// The states a peer session passes through over its lifetime.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// Establishing the TCP connection.
    Dial,
    /// Exchanging the initial handshake.
    Handshaking,
    /// Waiting for the peer's first message, which must be a bitfield or a
    /// have.
    AwaitFirstMessage,
    /// Declared interest, waiting for the peer to unchoke us.
    AwaitUnchoke,
    /// Unchoked and requesting blocks.
    Downloading,
}

impl Default for State {
    fn default() -> Self {
        Self::Dial
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    #[allow(dead_code)]
    peer_id: PeerId,
    pieces: Option<Bitfield>,
}

fn empty_bitfield(len: usize) -> Bitfield {
    let mut bitfield = Bitfield::with_capacity(len);
    for _ in 0..len {
        bitfield.push(false);
    }
    bitfield
}

fn full_bitfield(len: usize) -> Bitfield {
    let mut bitfield = Bitfield::with_capacity(len);
    for _ in 0..len {
        bitfield.push(true);
    }
    bitfield
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_starts_at_dial() {
        assert_eq!(State::default(), State::Dial);
    }
}
