//! Peer-to-peer file transfer.
//!
//! The handshake rides on `usermessage` messages of kind `filetransfer`; the
//! payload itself goes over a data channel on a dedicated peer connection.
//! The receiver opens the channel and makes the offer, the sender answers
//! and pushes the file in fixed size chunks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::ensure;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::peer::{DataChannel, PeerConnection};
use crate::stream::Direction;
use crate::Result;

/// `kind` of the user messages carrying the handshake.
pub const FILE_TRANSFER_KIND: &str = "filetransfer";
/// Label of the data channel carrying the payload.
pub const CHANNEL_LABEL: &str = "file";
/// Text message the receiver sends once it has the whole file.
pub const DONE: &str = "done";

const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

/// Identifies a transfer: our role in it, the peer, and the transfer id
/// chosen by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    /// `Up` when we are sending
    pub direction: Direction,
    pub user_id: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransferState {
    Idle,
    Inviting,
    Connecting,
    Connected,
    Done,
    Cancelled,
    Closed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Done | TransferState::Cancelled | TransferState::Closed
        )
    }

    pub fn can_become(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Idle, Inviting) | (Inviting, Connecting) | (Connecting, Connected) => true,
            (Connected, Done) => true,
            (Done | Cancelled, Closed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileTransferKind {
    Invite,
    Offer,
    Answer,
    /// candidate from the sender
    UpIce,
    /// candidate from the receiver
    DownIce,
    Cancel,
    Reject,
}

/// `value` of a `filetransfer` user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FileTransferKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<RTCIceCandidateInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FileTransferMessage {
    pub fn new(id: &str, kind: FileTransferKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            name: None,
            size: None,
            mimetype: None,
            sdp: None,
            candidate: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FileTransferEventKind {
    /// someone offers us a file, accept or reject it with the event's key
    Invited {
        username: Option<String>,
        name: String,
        mimetype: String,
        size: u64,
    },
    State(TransferState),
    Progress {
        transferred: u64,
        size: u64,
    },
    /// `data` is the file on the receiving side, `None` for the sender
    Completed {
        data: Option<Bytes>,
    },
    Cancelled {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct FileTransferEvent {
    pub key: TransferKey,
    pub kind: FileTransferEventKind,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Received {
    Partial { received: u64 },
    Complete(Bytes),
    Overflow { received: u64 },
}

pub struct FileTransfer {
    pub(crate) key: TransferKey,
    pub(crate) username: Option<String>,
    pub(crate) name: String,
    pub(crate) mimetype: String,
    pub(crate) size: u64,
    state: TransferState,
    /// payload on the sending side
    pub(crate) data: Bytes,
    pub(crate) peer: Option<Arc<dyn PeerConnection>>,
    pub(crate) channel: Option<Arc<dyn DataChannel>>,
    chunks: Vec<Bytes>,
    received: u64,
    pub(crate) local_ice: Vec<RTCIceCandidateInit>,
    pub(crate) remote_ice: Vec<RTCIceCandidateInit>,
    pub(crate) local_description_sent: bool,
    pub(crate) remote_description_set: bool,
}

impl FileTransfer {
    fn new(key: TransferKey, username: Option<String>, name: String, mimetype: String) -> Self {
        Self {
            key,
            username,
            name,
            mimetype,
            size: 0,
            state: TransferState::Idle,
            data: Bytes::new(),
            peer: None,
            channel: None,
            chunks: Vec::new(),
            received: 0,
            local_ice: Vec::new(),
            remote_ice: Vec::new(),
            local_description_sent: false,
            remote_description_set: false,
        }
    }

    pub(crate) fn outgoing(
        key: TransferKey,
        username: Option<String>,
        name: String,
        mimetype: String,
        data: Bytes,
    ) -> Self {
        let mut transfer = Self::new(key, username, name, mimetype);
        transfer.size = data.len() as u64;
        transfer.data = data;
        transfer
    }

    pub(crate) fn incoming(
        key: TransferKey,
        username: Option<String>,
        name: String,
        mimetype: String,
        size: u64,
    ) -> Self {
        let mut transfer = Self::new(key, username, name, mimetype);
        transfer.size = size;
        transfer
    }

    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub(crate) fn transition(&mut self, next: TransferState) -> Result<()> {
        ensure!(
            self.state.can_become(next),
            "file transfer {} can't go from {} to {}",
            self.key.id,
            self.state,
            next
        );
        debug!("File transfer {}: {} -> {}", self.key.id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub(crate) fn receive_chunk(&mut self, chunk: Bytes) -> Received {
        self.received += chunk.len() as u64;
        self.chunks.push(chunk);
        if self.received > self.size {
            return Received::Overflow {
                received: self.received,
            };
        }
        if self.received < self.size {
            return Received::Partial {
                received: self.received,
            };
        }
        let mut data = BytesMut::with_capacity(self.size as usize);
        for chunk in self.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }
        Received::Complete(data.freeze())
    }

    /// Drops the channel and the peer connection. Safe to call repeatedly,
    /// only the first call closes anything.
    pub(crate) async fn release(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!("Closing data channel of {} failed: {}", self.key.id, e);
            }
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                debug!("Closing peer connection of {} failed: {}", self.key.id, e);
            }
        }
        self.chunks.clear();
    }
}

/// Pushes `data` down `channel`, waiting whenever more than `low_water_mark`
/// bytes are still queued.
pub(crate) async fn send_chunks(
    channel: Arc<dyn DataChannel>,
    data: Bytes,
    chunk_size: usize,
    low_water_mark: usize,
) -> Result<()> {
    ensure!(chunk_size > 0, "chunk size must be positive");
    let mut offset = 0;
    while offset < data.len() {
        while channel.buffered_amount().await > low_water_mark {
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }
        let end = (offset + chunk_size).min(data.len());
        channel.send(data.slice(offset..end)).await?;
        offset = end;
    }
    trace!("Queued {} bytes on the data channel", data.len());
    Ok(())
}
