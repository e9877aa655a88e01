use anyhow::{anyhow, bail, ensure, Context};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::peer::{
    MediaStream, MediaTrack, PeerEvent, PeerEvents, PeerOwner, SessionDescription, TrackKind,
};
use crate::session::dispatch::DownOffer;
use crate::session::{random_id, Internal, Session};
use crate::signaller::SignallerMessage;
use crate::stream::{Direction, Stream, StreamEventKind, StreamState};
use crate::Result;

/// `kind` of an offer renegotiating an established stream.
const RENEGOTIATE: &str = "renegotiate";

impl Session {
    /// Starts sending `media` under `label`. Passing the `local_id` of an
    /// existing up stream replaces that stream. Negotiation starts once the
    /// peer connection asks for it.
    pub async fn new_up_stream(
        &mut self,
        local_id: Option<&str>,
        label: &str,
        media: MediaStream,
    ) -> Result<String> {
        ensure!(self.joined, "can't send media before joining a group");
        let mut replace = None;
        if let Some(local_id) = local_id {
            let old = self
                .up
                .values()
                .find(|s| s.local_id() == local_id)
                .map(|s| s.id().to_string());
            if let Some(old) = old {
                debug!("Up stream {} replaces {}", local_id, old);
                self.close_stream(Direction::Up, &old, true).await;
                replace = Some(old);
            }
        }

        let id = random_id();
        let owner = PeerOwner::Stream {
            direction: Direction::Up,
            id: id.clone(),
        };
        let peer = self
            .peers
            .new_peer(
                self.rtc_configuration(),
                PeerEvents::new(owner, self.internal_sender.clone()),
            )
            .await?;
        let mut stream = Stream::new(
            id.clone(),
            local_id.map_or_else(random_id, str::to_string),
            Direction::Up,
            label.to_string(),
            peer.clone(),
            self.backoff(),
        );
        stream.replace = replace;
        stream.source = self.id.clone();
        stream.username = self.username.clone().unwrap_or_default();
        stream.media = Some(MediaStream::new(id.clone()));
        self.up.insert(id.clone(), stream);

        for track in media.tracks {
            let sender = match peer.add_track(&track).await {
                Ok(sender) => sender,
                Err(e) => {
                    let reason =
                        format!("couldn't add track {} to stream {}: {:#}", track.id, id, e);
                    self.stream_failed(Direction::Up, &id, e).await;
                    bail!(reason);
                }
            };
            if let Some(stream) = self.up.get_mut(&id) {
                stream.add_sent_track(track, sender);
            }
        }
        info!("Created up stream {} ({})", id, label);
        let own_id = self.id.clone();
        self.recompute_user_streams(&own_id, true);
        Ok(id)
    }

    /// Makes and sends an offer for an up stream. Deferred while a previous
    /// offer is still unanswered.
    pub(crate) async fn negotiate(&mut self, id: &str, restart_ice: bool) {
        let Some(stream) = self.up.get_mut(id) else {
            debug!("Not negotiating stream {}, it is gone", id);
            return;
        };
        if stream.state == StreamState::OfferSent {
            debug!("Stream {} is awaiting an answer, negotiating later", id);
            let restart = stream.pending_negotiation.unwrap_or(false) || restart_ice;
            stream.pending_negotiation = Some(restart);
            return;
        }
        let peer = stream.peer.clone();

        let offer = async {
            let offer = peer.create_offer(restart_ice).await?;
            peer.set_local_description(offer.clone()).await?;
            Ok::<_, anyhow::Error>(offer)
        }
        .await;
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                self.stream_failed(Direction::Up, id, e).await;
                return;
            }
        };

        let Some(stream) = self.up.get_mut(id) else {
            debug!("Stream {} closed while negotiating", id);
            return;
        };
        let kind = if stream.local_description_sent {
            RENEGOTIATE
        } else {
            ""
        };
        let message = SignallerMessage::Offer {
            id: id.to_string(),
            label: stream.label.clone(),
            replace: stream.replace.take(),
            source: self.id.clone(),
            username: self.username.clone().unwrap_or_default(),
            sdp: offer.sdp,
            kind: Some(kind.to_string()),
        };
        stream.local_description_sent = true;
        stream.state = StreamState::OfferSent;
        let candidates = stream.take_local_ice();
        self.send_or_log(message);
        for candidate in candidates {
            self.send_or_log(SignallerMessage::Ice {
                id: id.to_string(),
                candidate,
            });
        }
    }

    pub(crate) async fn got_offer(&mut self, offer: DownOffer) {
        let renegotiate = offer.kind.as_deref() == Some(RENEGOTIATE);

        let mut inherited_local_id = None;
        if let Some(old) = offer.replace.as_deref().filter(|old| *old != offer.id) {
            match self.down.get(old) {
                Some(old_stream) => {
                    inherited_local_id = Some(old_stream.local_id().to_string());
                    self.close_stream(Direction::Down, old, true).await;
                }
                None => warn!("Offer for {} replaces unknown stream {}", offer.id, old),
            }
        }

        if let Some(existing) = self.down.get_mut(&offer.id) {
            if !renegotiate && inherited_local_id.is_none() {
                warn!("Duplicate offer for stream {}", offer.id);
                self.send_or_log(SignallerMessage::Abort { id: offer.id });
                return;
            }
            debug!("Renegotiating down stream {}", offer.id);
            if let Some(local_id) = inherited_local_id {
                existing.local_id = local_id;
            }
        } else {
            let owner = PeerOwner::Stream {
                direction: Direction::Down,
                id: offer.id.clone(),
            };
            let peer = match self
                .peers
                .new_peer(
                    self.rtc_configuration(),
                    PeerEvents::new(owner, self.internal_sender.clone()),
                )
                .await
            {
                Ok(peer) => peer,
                Err(e) => {
                    warn!("Couldn't create peer connection for {}: {:#}", offer.id, e);
                    self.send_or_log(SignallerMessage::Abort { id: offer.id });
                    return;
                }
            };
            let mut stream = Stream::new(
                offer.id.clone(),
                inherited_local_id.unwrap_or_else(random_id),
                Direction::Down,
                offer.label,
                peer,
                self.backoff(),
            );
            stream.source = offer.source;
            stream.username = offer.username;
            info!(
                "New down stream {} ({}) from {}",
                stream.id(),
                stream.label(),
                stream.username()
            );
            self.events.on_down_stream.emit(&stream);
            self.down.insert(offer.id.clone(), stream);
        }

        self.answer(&offer.id, offer.sdp).await;
    }

    async fn answer(&mut self, id: &str, sdp: String) {
        let Some(stream) = self.down.get(id) else {
            return;
        };
        let peer = stream.peer.clone();
        if let Err(e) = peer.set_remote_description(SessionDescription::offer(sdp)).await {
            self.stream_failed(Direction::Down, id, e).await;
            return;
        }
        let Some(stream) = self.down.get_mut(id) else {
            return;
        };
        stream.remote_description_set = true;
        for candidate in stream.take_remote_ice() {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Couldn't add buffered candidate to {}: {}", id, e);
            }
        }

        let answer = async {
            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            Ok::<_, anyhow::Error>(answer)
        }
        .await;
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                self.stream_failed(Direction::Down, id, e).await;
                return;
            }
        };

        let Some(stream) = self.down.get_mut(id) else {
            return;
        };
        stream.local_description_sent = true;
        stream.state = StreamState::Answered;
        let candidates = stream.take_local_ice();
        self.send_or_log(SignallerMessage::Answer {
            id: id.to_string(),
            sdp: answer.sdp,
        });
        for candidate in candidates {
            self.send_or_log(SignallerMessage::Ice {
                id: id.to_string(),
                candidate,
            });
        }
        self.emit_stream_event(Direction::Down, id, StreamEventKind::NegotiationCompleted);
    }

    pub(crate) async fn got_answer(&mut self, id: &str, sdp: String) {
        let Some(stream) = self.up.get(id) else {
            warn!("Answer for unknown stream {}", id);
            return;
        };
        if stream.state != StreamState::OfferSent {
            warn!("Unexpected answer for stream {} in state {}", id, stream.state);
            return;
        }
        let peer = stream.peer.clone();
        if let Err(e) = peer.set_remote_description(SessionDescription::answer(sdp)).await {
            self.stream_failed(Direction::Up, id, e).await;
            return;
        }
        let Some(stream) = self.up.get_mut(id) else {
            return;
        };
        stream.remote_description_set = true;
        stream.state = StreamState::Answered;
        let pending = stream.pending_negotiation.take();
        for candidate in stream.take_remote_ice() {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Couldn't add buffered candidate to {}: {}", id, e);
            }
        }
        self.emit_stream_event(Direction::Up, id, StreamEventKind::NegotiationCompleted);
        if let Some(restart_ice) = pending {
            self.negotiate(id, restart_ice).await;
        }
    }

    pub(crate) async fn got_remote_ice(&mut self, id: &str, candidate: RTCIceCandidateInit) {
        let stream = match self.up.get_mut(id) {
            Some(stream) => Some(stream),
            None => self.down.get_mut(id),
        };
        let Some(stream) = stream else {
            warn!("Candidate for unknown stream {}", id);
            return;
        };
        if let Some(candidate) = stream.queue_remote_ice(candidate) {
            let peer = stream.peer.clone();
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Couldn't add candidate to {}: {}", id, e);
            }
        }
    }

    fn got_local_ice(&mut self, direction: Direction, id: &str, candidate: RTCIceCandidateInit) {
        let Some(stream) = self.stream_mut(direction, id) else {
            debug!("Dropping candidate of closed stream {}", id);
            return;
        };
        if let Some(candidate) = stream.queue_local_ice(candidate) {
            self.send_or_log(SignallerMessage::Ice {
                id: id.to_string(),
                candidate,
            });
        }
    }

    pub(crate) async fn got_renegotiate(&mut self, id: &str) {
        if self.up.contains_key(id) {
            self.negotiate(id, true).await;
        } else {
            warn!("Renegotiation requested for unknown stream {}", id);
        }
    }

    pub(crate) async fn got_close(&mut self, id: &str) {
        if self.down.contains_key(id) {
            self.close_stream(Direction::Down, id, false).await;
        } else {
            warn!("Close for unknown stream {}", id);
        }
    }

    pub(crate) async fn got_abort(&mut self, id: &str) {
        if self.up.contains_key(id) {
            info!("Server aborted stream {}", id);
            self.emit_stream_event(Direction::Up, id, StreamEventKind::Aborted);
            self.close_stream(Direction::Up, id, false).await;
        } else {
            warn!("Abort for unknown stream {}", id);
        }
    }

    /// Closes a stream and releases its peer connection. A closed up stream
    /// is announced to the server unless it is being replaced, in which case
    /// the successor's offer says so.
    pub async fn close_stream(&mut self, direction: Direction, id: &str, replace: bool) {
        let removed = match direction {
            Direction::Up => self.up.remove(id),
            Direction::Down => self.down.remove(id),
        };
        let Some(mut stream) = removed else {
            debug!("No {} stream {} to close", direction, id);
            return;
        };
        stream.state = if replace {
            StreamState::Replaced
        } else {
            StreamState::Closed
        };
        if let Err(e) = stream.peer.close().await {
            debug!("Closing peer connection of {} failed: {}", id, e);
        }
        if direction == Direction::Up && !replace && stream.local_description_sent {
            self.send_or_log(SignallerMessage::Close { id: id.to_string() });
        }
        if !replace {
            let owner = self.stream_owner(direction, stream.source());
            self.recompute_user_streams(&owner, true);
        }
        info!("Closed {} stream {}", direction, id);
        let event = stream.emit(StreamEventKind::Closed { replace });
        self.events.on_stream.emit(&event);
    }

    pub(crate) async fn stream_failed(&mut self, direction: Direction, id: &str, error: anyhow::Error) {
        warn!("Stream {} failed: {:#}", id, error);
        self.emit_stream_event(direction, id, StreamEventKind::Error(format!("{:#}", error)));
        if direction == Direction::Down && self.down.contains_key(id) {
            self.send_or_log(SignallerMessage::Abort { id: id.to_string() });
        }
        self.close_stream(direction, id, false).await;
    }

    /// Restarts ICE: up streams renegotiate, down streams ask the server to.
    pub async fn restart_ice(&mut self, direction: Direction, id: &str) -> Result<()> {
        match direction {
            Direction::Up => {
                ensure!(self.up.contains_key(id), "no up stream {}", id);
                self.negotiate(id, true).await;
                Ok(())
            }
            Direction::Down => {
                ensure!(self.down.contains_key(id), "no down stream {}", id);
                self.send(SignallerMessage::Renegotiate { id: id.to_string() })
            }
        }
    }

    /// Mutes or unmutes our own media by swapping what each sender sends,
    /// which needs no renegotiation. Returns false when the stream has no
    /// track of `kind`.
    pub async fn set_track_enabled(
        &mut self,
        id: &str,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<bool> {
        let stream = self
            .up
            .get_mut(id)
            .ok_or_else(|| anyhow!("no up stream {}", id))?;
        if !stream.media().map_or(false, |m| m.has_kind(kind)) {
            return Ok(false);
        }
        for track in stream.set_track_enabled(kind, enabled) {
            let Some(sender) = stream.sender(&track.id) else {
                continue;
            };
            debug!(
                "{} track {} on stream {}",
                if enabled { "Unmuting" } else { "Muting" },
                track.id,
                id
            );
            sender
                .replace_track(enabled.then_some(&track))
                .await
                .with_context(|| format!("couldn't switch track {}", track.id))?;
        }
        Ok(true)
    }

    fn emit_stream_event(&mut self, direction: Direction, id: &str, kind: StreamEventKind) {
        let stream = match direction {
            Direction::Up => self.up.get_mut(id),
            Direction::Down => self.down.get_mut(id),
        };
        if let Some(stream) = stream {
            let event = stream.emit(kind);
            self.events.on_stream.emit(&event);
        }
    }

    pub(crate) async fn stream_peer_event(&mut self, direction: Direction, id: &str, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded => match direction {
                Direction::Up => self.negotiate(id, false).await,
                Direction::Down => trace!("Ignoring negotiation request of down stream {}", id),
            },
            PeerEvent::IceCandidate(candidate) => self.got_local_ice(direction, id, candidate),
            PeerEvent::IceConnectionState(state) => self.ice_state_changed(direction, id, state).await,
            PeerEvent::Track(track) => self.got_track(direction, id, track),
            other => debug!("Ignoring {:?} on stream {}", other, id),
        }
    }

    async fn ice_state_changed(&mut self, direction: Direction, id: &str, state: RTCIceConnectionState) {
        debug!("ICE state of {} stream {}: {}", direction, id, state);
        self.emit_stream_event(direction, id, StreamEventKind::Status(state));
        let Some(stream) = self.stream_mut(direction, id) else {
            return;
        };
        match state {
            RTCIceConnectionState::Failed => match stream.ice_retry.next_delay() {
                None => warn!("ICE failed on {}, giving up", id),
                Some(delay) if delay.is_zero() => self.retry_ice(direction, id).await,
                Some(delay) => {
                    debug!("Restarting ICE on {} in {:?}", id, delay);
                    let sender = self.internal_sender.clone();
                    let id = id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = sender.send(Internal::RetryIce { direction, id });
                    });
                }
            },
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                stream.ice_retry.reset()
            }
            _ => {}
        }
    }

    pub(crate) async fn retry_ice(&mut self, direction: Direction, id: &str) {
        if self.stream(direction, id).is_none() {
            debug!("Not restarting ICE on {}, it is gone", id);
            return;
        }
        info!("Restarting ICE on {} stream {}", direction, id);
        match direction {
            Direction::Up => self.negotiate(id, true).await,
            Direction::Down => self.send_or_log(SignallerMessage::Renegotiate { id: id.to_string() }),
        }
    }

    fn got_track(&mut self, direction: Direction, id: &str, track: MediaTrack) {
        let Some(stream) = self.stream_mut(direction, id) else {
            return;
        };
        debug!("Track {} ({:?}) on stream {}", track.id, track.kind, id);
        let source = stream.source().to_string();
        stream.add_track(track.clone());
        let owner = self.stream_owner(direction, &source);
        self.emit_stream_event(direction, id, StreamEventKind::Track(track));
        self.recompute_user_streams(&owner, true);
    }
}
