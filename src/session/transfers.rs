use anyhow::{anyhow, ensure};
use bytes::Bytes;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::peer::{PeerEvent, PeerEvents, PeerOwner, SessionDescription};
use crate::session::{random_id, Internal, Session};
use crate::signaller::{SignallerMessage, UserMessage};
use crate::stream::Direction;
use crate::transfer::{
    send_chunks, FileTransfer, FileTransferEvent, FileTransferEventKind, FileTransferKind,
    FileTransferMessage, Received, TransferKey, TransferState, CHANNEL_LABEL, DONE,
    FILE_TRANSFER_KIND,
};
use crate::Result;

impl Session {
    /// Offers `data` to another user. Progress is reported through
    /// `on_file_transfer`.
    pub fn send_file(
        &mut self,
        user_id: &str,
        name: &str,
        mimetype: &str,
        data: Bytes,
    ) -> Result<TransferKey> {
        ensure!(self.joined, "can't send files before joining a group");
        let username = self
            .users
            .get(user_id)
            .ok_or_else(|| anyhow!("unknown user {}", user_id))?
            .username
            .clone();
        let key = TransferKey {
            direction: Direction::Up,
            user_id: user_id.to_string(),
            id: random_id(),
        };
        let mut transfer = FileTransfer::outgoing(
            key.clone(),
            username,
            name.to_string(),
            mimetype.to_string(),
            data,
        );
        transfer.transition(TransferState::Inviting)?;

        let mut invite = FileTransferMessage::new(&key.id, FileTransferKind::Invite);
        invite.name = Some(name.to_string());
        invite.size = Some(transfer.size());
        invite.mimetype = Some(mimetype.to_string());
        self.send_transfer_message(user_id, invite)?;

        info!("Offering {} ({} bytes) to {}", name, transfer.size(), user_id);
        self.transfers.insert(key.clone(), transfer);
        self.emit_transfer_event(&key, FileTransferEventKind::State(TransferState::Inviting));
        Ok(key)
    }

    /// Accepts an invitation: we open the data channel and make the offer.
    pub async fn accept_file(&mut self, key: &TransferKey) -> Result<()> {
        ensure!(
            key.direction == Direction::Down,
            "only incoming transfers can be accepted"
        );
        let transfer = self
            .transfers
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown file transfer {}", key.id))?;
        transfer.transition(TransferState::Connecting)?;
        self.emit_transfer_event(key, FileTransferEventKind::State(TransferState::Connecting));

        if let Err(e) = self.start_receiving(key).await {
            self.cancel_transfer(key, &format!("{:#}", e), true).await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_receiving(&mut self, key: &TransferKey) -> Result<()> {
        let peer = self
            .peers
            .new_peer(
                self.rtc_configuration(),
                PeerEvents::new(PeerOwner::Transfer(key.clone()), self.internal_sender.clone()),
            )
            .await?;
        if let Some(transfer) = self.transfers.get_mut(key) {
            transfer.peer = Some(peer.clone());
        }
        let channel = peer.create_data_channel(CHANNEL_LABEL).await?;
        if let Some(transfer) = self.transfers.get_mut(key) {
            transfer.channel = Some(channel);
        }
        let offer = peer.create_offer(false).await?;
        peer.set_local_description(offer.clone()).await?;

        let transfer = self
            .transfers
            .get_mut(key)
            .ok_or_else(|| anyhow!("file transfer {} went away", key.id))?;
        transfer.local_description_sent = true;
        let candidates = std::mem::take(&mut transfer.local_ice);
        let mut message = FileTransferMessage::new(&key.id, FileTransferKind::Offer);
        message.sdp = Some(offer.sdp);
        self.send_transfer_message(&key.user_id, message)?;
        for candidate in candidates {
            self.send_transfer_candidate(key, candidate);
        }
        Ok(())
    }

    pub async fn reject_file(&mut self, key: &TransferKey) {
        self.cancel_transfer(key, "rejected", true).await;
    }

    pub async fn cancel_file(&mut self, key: &TransferKey, reason: &str) {
        self.cancel_transfer(key, reason, true).await;
    }

    fn send_transfer_message(&self, dest: &str, message: FileTransferMessage) -> Result<()> {
        self.send(SignallerMessage::UserMessage(UserMessage {
            kind: FILE_TRANSFER_KIND.to_string(),
            source: Some(self.id.clone()),
            username: self.username.clone(),
            dest: Some(dest.to_string()),
            privileged: false,
            value: serde_json::to_value(&message)?,
        }))
    }

    fn send_transfer_candidate(&self, key: &TransferKey, candidate: RTCIceCandidateInit) {
        let kind = match key.direction {
            Direction::Up => FileTransferKind::UpIce,
            Direction::Down => FileTransferKind::DownIce,
        };
        let mut message = FileTransferMessage::new(&key.id, kind);
        message.candidate = Some(candidate);
        if let Err(e) = self.send_transfer_message(&key.user_id, message) {
            debug!("Couldn't send candidate for transfer {}: {}", key.id, e);
        }
    }

    fn emit_transfer_event(&mut self, key: &TransferKey, kind: FileTransferEventKind) {
        self.events.on_file_transfer.emit(&FileTransferEvent {
            key: key.clone(),
            kind,
        });
    }

    fn transition_transfer(&mut self, key: &TransferKey, next: TransferState) -> Result<()> {
        let transfer = self
            .transfers
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown file transfer {}", key.id))?;
        transfer.transition(next)?;
        self.emit_transfer_event(key, FileTransferEventKind::State(next));
        Ok(())
    }

    pub(crate) async fn got_file_transfer(&mut self, message: UserMessage) {
        let Some(source) = message.source else {
            warn!("File transfer message without a source");
            return;
        };
        let value: FileTransferMessage = match serde_json::from_value(message.value) {
            Ok(value) => value,
            Err(e) => {
                warn!("Malformed file transfer message from {}: {}", source, e);
                return;
            }
        };
        let id = value.id.clone();
        let key = |direction| TransferKey {
            direction,
            user_id: source.clone(),
            id: id.clone(),
        };
        match value.kind {
            FileTransferKind::Invite => self.got_file_invite(key(Direction::Down), message.username, value),
            FileTransferKind::Offer => self.got_file_offer(&key(Direction::Up), value.sdp).await,
            FileTransferKind::Answer => self.got_file_answer(&key(Direction::Down), value.sdp).await,
            FileTransferKind::UpIce => self.got_file_candidate(&key(Direction::Down), value.candidate).await,
            FileTransferKind::DownIce => self.got_file_candidate(&key(Direction::Up), value.candidate).await,
            FileTransferKind::Cancel | FileTransferKind::Reject => {
                let reason = value.message.clone().unwrap_or_else(|| match value.kind {
                    FileTransferKind::Reject => "rejected by peer".to_string(),
                    _ => "cancelled by peer".to_string(),
                });
                let up = key(Direction::Up);
                let target = if self.transfers.contains_key(&up) {
                    up
                } else {
                    key(Direction::Down)
                };
                self.cancel_transfer(&target, &reason, false).await;
            }
        }
    }

    fn got_file_invite(&mut self, key: TransferKey, username: Option<String>, invite: FileTransferMessage) {
        if self.transfers.contains_key(&key) {
            warn!("Duplicate file transfer invitation {}", key.id);
            return;
        }
        let (Some(name), Some(size)) = (invite.name, invite.size) else {
            warn!("Incomplete file transfer invitation {}", key.id);
            return;
        };
        let mimetype = invite.mimetype.unwrap_or_default();
        let mut transfer = FileTransfer::incoming(
            key.clone(),
            username.clone(),
            name.clone(),
            mimetype.clone(),
            size,
        );
        if let Err(e) = transfer.transition(TransferState::Inviting) {
            warn!("{:#}", e);
            return;
        }
        info!("{} offers {} ({} bytes)", key.user_id, name, size);
        self.transfers.insert(key.clone(), transfer);
        self.emit_transfer_event(
            &key,
            FileTransferEventKind::Invited {
                username,
                name,
                mimetype,
                size,
            },
        );
    }

    /// The receiver accepted and made an offer, we answer it.
    async fn got_file_offer(&mut self, key: &TransferKey, sdp: Option<String>) {
        if let Err(e) = self.answer_file_offer(key, sdp).await {
            self.cancel_transfer(key, &format!("{:#}", e), true).await;
        }
    }

    async fn answer_file_offer(&mut self, key: &TransferKey, sdp: Option<String>) -> Result<()> {
        let sdp = sdp.ok_or_else(|| anyhow!("offer without a session description"))?;
        self.transition_transfer(key, TransferState::Connecting)?;
        let peer = self
            .peers
            .new_peer(
                self.rtc_configuration(),
                PeerEvents::new(PeerOwner::Transfer(key.clone()), self.internal_sender.clone()),
            )
            .await?;
        if let Some(transfer) = self.transfers.get_mut(key) {
            transfer.peer = Some(peer.clone());
        }
        peer.set_remote_description(SessionDescription::offer(sdp)).await?;
        self.flush_transfer_remote_ice(key).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        let transfer = self
            .transfers
            .get_mut(key)
            .ok_or_else(|| anyhow!("file transfer {} went away", key.id))?;
        transfer.local_description_sent = true;
        let candidates = std::mem::take(&mut transfer.local_ice);
        let mut message = FileTransferMessage::new(&key.id, FileTransferKind::Answer);
        message.sdp = Some(answer.sdp);
        self.send_transfer_message(&key.user_id, message)?;
        for candidate in candidates {
            self.send_transfer_candidate(key, candidate);
        }
        Ok(())
    }

    async fn got_file_answer(&mut self, key: &TransferKey, sdp: Option<String>) {
        let result = async {
            let sdp = sdp.ok_or_else(|| anyhow!("answer without a session description"))?;
            let peer = self
                .transfers
                .get(key)
                .and_then(|t| t.peer.clone())
                .ok_or_else(|| anyhow!("answer for file transfer {} without a connection", key.id))?;
            peer.set_remote_description(SessionDescription::answer(sdp)).await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        match result {
            Ok(()) => self.flush_transfer_remote_ice(key).await,
            Err(e) => self.cancel_transfer(key, &format!("{:#}", e), true).await,
        }
    }

    async fn flush_transfer_remote_ice(&mut self, key: &TransferKey) {
        let Some(transfer) = self.transfers.get_mut(key) else {
            return;
        };
        transfer.remote_description_set = true;
        let candidates = std::mem::take(&mut transfer.remote_ice);
        let Some(peer) = transfer.peer.clone() else {
            return;
        };
        for candidate in candidates {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Couldn't add candidate to file transfer {}: {}", key.id, e);
            }
        }
    }

    async fn got_file_candidate(&mut self, key: &TransferKey, candidate: Option<RTCIceCandidateInit>) {
        let Some(candidate) = candidate else {
            return;
        };
        let Some(transfer) = self.transfers.get_mut(key) else {
            debug!("Candidate for unknown file transfer {}", key.id);
            return;
        };
        match (&transfer.peer, transfer.remote_description_set) {
            (Some(peer), true) => {
                let peer = peer.clone();
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!("Couldn't add candidate to file transfer {}: {}", key.id, e);
                }
            }
            _ => transfer.remote_ice.push(candidate),
        }
    }

    /// Moves a transfer to `Cancelled` and releases it. `notify_peer` tells
    /// the other side unless it is the one cancelling.
    pub(crate) async fn cancel_transfer(&mut self, key: &TransferKey, reason: &str, notify_peer: bool) {
        let Some(transfer) = self.transfers.get_mut(key) else {
            debug!("No file transfer {} to cancel", key.id);
            return;
        };
        let state = transfer.state();
        if state.is_terminal() {
            return;
        }
        if let Err(e) = transfer.transition(TransferState::Cancelled) {
            warn!("{:#}", e);
            return;
        }
        info!("File transfer {} cancelled: {}", key.id, reason);
        if notify_peer && state != TransferState::Idle {
            let kind = if key.direction == Direction::Down && state == TransferState::Inviting {
                FileTransferKind::Reject
            } else {
                FileTransferKind::Cancel
            };
            let mut message = FileTransferMessage::new(&key.id, kind);
            message.message = Some(reason.to_string());
            if let Err(e) = self.send_transfer_message(&key.user_id, message) {
                debug!("Couldn't tell {} about the cancellation: {}", key.user_id, e);
            }
        }
        self.emit_transfer_event(key, FileTransferEventKind::State(TransferState::Cancelled));
        self.emit_transfer_event(
            key,
            FileTransferEventKind::Cancelled {
                reason: reason.to_string(),
            },
        );
        self.close_transfer(key).await;
    }

    /// Releases the transfer's connection and forgets it.
    async fn close_transfer(&mut self, key: &TransferKey) {
        let Some(mut transfer) = self.transfers.remove(key) else {
            return;
        };
        transfer.release().await;
        match transfer.transition(TransferState::Closed) {
            Ok(()) => self.emit_transfer_event(key, FileTransferEventKind::State(TransferState::Closed)),
            Err(e) => debug!("{:#}", e),
        }
    }

    pub(crate) async fn transfer_peer_event(&mut self, key: &TransferKey, event: PeerEvent) {
        if !self.transfers.contains_key(key) {
            trace!("Ignoring {:?} for finished transfer {}", event, key.id);
            return;
        }
        match event {
            PeerEvent::IceCandidate(candidate) => {
                let Some(transfer) = self.transfers.get_mut(key) else {
                    return;
                };
                if transfer.local_description_sent {
                    self.send_transfer_candidate(key, candidate);
                } else {
                    transfer.local_ice.push(candidate);
                }
            }
            PeerEvent::IceConnectionState(RTCIceConnectionState::Failed) => {
                self.cancel_transfer(key, "ICE failed", true).await
            }
            PeerEvent::DataChannel(channel) => {
                if let Some(transfer) = self.transfers.get_mut(key) {
                    if transfer.channel.is_none() {
                        transfer.channel = Some(channel);
                    }
                }
            }
            PeerEvent::ChannelOpen => self.transfer_channel_open(key).await,
            PeerEvent::ChannelMessage { data, is_string } => {
                match key.direction {
                    Direction::Up => self.got_sender_message(key, data, is_string).await,
                    Direction::Down => self.got_chunk(key, data, is_string).await,
                }
            }
            PeerEvent::ChannelClosed => {
                self.cancel_transfer(key, "data channel closed", true).await
            }
            other => trace!("Ignoring {:?} on file transfer {}", other, key.id),
        }
    }

    async fn transfer_channel_open(&mut self, key: &TransferKey) {
        if let Err(e) = self.transition_transfer(key, TransferState::Connected) {
            warn!("{:#}", e);
            return;
        }
        let Some(transfer) = self.transfers.get(key) else {
            return;
        };
        if key.direction == Direction::Down {
            // no chunk will ever arrive for an empty file
            if transfer.size() == 0 {
                self.finish_receiving(key, Bytes::new()).await;
            }
            return;
        }
        let Some(channel) = transfer.channel.clone() else {
            self.cancel_transfer(key, "no data channel", true).await;
            return;
        };
        let data = transfer.data.clone();
        let chunk_size = self.config.file_chunk_size;
        let low_water_mark = self.config.file_low_water_mark;
        let sender = self.internal_sender.clone();
        let key = key.clone();
        debug!("Sending {} bytes for transfer {}", data.len(), key.id);
        tokio::spawn(async move {
            let result = send_chunks(channel, data, chunk_size, low_water_mark)
                .await
                .map_err(|e| format!("{:#}", e));
            let _ = sender.send(Internal::FileSent { key, result });
        });
    }

    pub(crate) async fn file_sent(&mut self, key: &TransferKey, result: std::result::Result<(), String>) {
        let Some(transfer) = self.transfers.get(key) else {
            return;
        };
        let size = transfer.size();
        match result {
            Ok(()) => {
                debug!("All of {} queued, waiting for the receiver", key.id);
                self.emit_transfer_event(
                    key,
                    FileTransferEventKind::Progress {
                        transferred: size,
                        size,
                    },
                );
            }
            Err(e) => self.cancel_transfer(key, &e, true).await,
        }
    }

    async fn got_sender_message(&mut self, key: &TransferKey, data: Bytes, is_string: bool) {
        if is_string && data.as_ref() == DONE.as_bytes() {
            if let Err(e) = self.transition_transfer(key, TransferState::Done) {
                warn!("{:#}", e);
                return;
            }
            info!("File transfer {} delivered", key.id);
            self.emit_transfer_event(key, FileTransferEventKind::Completed { data: None });
            self.close_transfer(key).await;
        } else {
            warn!("Unexpected data from the receiver of {}", key.id);
        }
    }

    async fn got_chunk(&mut self, key: &TransferKey, data: Bytes, is_string: bool) {
        if is_string {
            debug!("Ignoring text on file transfer {}", key.id);
            return;
        }
        let Some(transfer) = self.transfers.get_mut(key) else {
            return;
        };
        let size = transfer.size();
        match transfer.receive_chunk(data) {
            Received::Partial { received } => self.emit_transfer_event(
                key,
                FileTransferEventKind::Progress {
                    transferred: received,
                    size,
                },
            ),
            Received::Overflow { received } => {
                let reason = format!("received {} bytes, expected {}", received, size);
                self.cancel_transfer(key, &reason, true).await;
            }
            Received::Complete(file) => {
                if file.len() as u64 != size {
                    let reason = format!("received {} bytes, expected {}", file.len(), size);
                    self.cancel_transfer(key, &reason, true).await;
                    return;
                }
                self.finish_receiving(key, file).await;
            }
        }
    }

    /// Confirms a complete file to its sender and hands it to subscribers.
    async fn finish_receiving(&mut self, key: &TransferKey, file: Bytes) {
        let channel = self.transfers.get(key).and_then(|t| t.channel.clone());
        if let Some(channel) = channel {
            if let Err(e) = channel.send_text(DONE.to_string()).await {
                warn!("Couldn't confirm file transfer {}: {}", key.id, e);
            }
        }
        if let Err(e) = self.transition_transfer(key, TransferState::Done) {
            warn!("{:#}", e);
            return;
        }
        info!("File transfer {} received", key.id);
        self.emit_transfer_event(key, FileTransferEventKind::Completed { data: Some(file) });
        self.close_transfer(key).await;
    }
}
