//! One negotiated media connection with the server.
//!
//! An up stream carries our media and we make the offers; a down stream
//! carries someone else's media and the server makes the offers. Either way
//! ICE candidates may show up before the matching session description, so
//! both directions are buffered and flushed once, in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use strum_macros::Display;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::peer::{MediaStream, MediaTrack, PeerConnection, TrackKind, TrackSender};
use crate::retry::Backoff;
use crate::subscribers::{Subscribers, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StreamState {
    Created,
    OfferSent,
    Answered,
    Replaced,
    Closed,
}

#[derive(Debug, Clone)]
pub enum StreamEventKind {
    NegotiationCompleted,
    Status(RTCIceConnectionState),
    Track(MediaTrack),
    Error(String),
    /// the server refused one of our offers
    Aborted,
    Closed {
        replace: bool,
    },
}

#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub id: String,
    pub local_id: String,
    pub direction: Direction,
    pub label: String,
    pub kind: StreamEventKind,
}

pub struct Stream {
    pub(crate) id: String,
    pub(crate) local_id: String,
    pub(crate) direction: Direction,
    pub(crate) label: String,
    pub(crate) source: String,
    pub(crate) username: String,
    pub(crate) peer: Arc<dyn PeerConnection>,
    pub(crate) media: Option<MediaStream>,
    /// senders of our own tracks, by track id
    senders: HashMap<String, Arc<dyn TrackSender>>,
    local_ice: Vec<RTCIceCandidateInit>,
    remote_ice: Vec<RTCIceCandidateInit>,
    /// id of the stream this one supersedes, sent with the first offer only
    pub(crate) replace: Option<String>,
    pub(crate) local_description_sent: bool,
    pub(crate) remote_description_set: bool,
    pub(crate) state: StreamState,
    /// renegotiation requested while an offer was outstanding, and whether
    /// it asked for an ICE restart
    pub(crate) pending_negotiation: Option<bool>,
    pub(crate) ice_retry: Backoff,
    subscribers: Subscribers<StreamEvent>,
}

impl Stream {
    pub(crate) fn new(
        id: String,
        local_id: String,
        direction: Direction,
        label: String,
        peer: Arc<dyn PeerConnection>,
        ice_retry: Backoff,
    ) -> Self {
        Self {
            id,
            local_id,
            direction,
            label,
            source: String::new(),
            username: String::new(),
            peer,
            media: None,
            senders: HashMap::new(),
            local_ice: Vec::new(),
            remote_ice: Vec::new(),
            replace: None,
            local_description_sent: false,
            remote_description_set: false,
            state: StreamState::Created,
            pending_negotiation: None,
            ice_retry,
            subscribers: Subscribers::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// id of the user sending the media
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn media(&self) -> Option<&MediaStream> {
        self.media.as_ref()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn local_description_sent(&self) -> bool {
        self.local_description_sent
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&StreamEvent) + Send + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Notifies this stream's subscribers and hands the event back so the
    /// session can forward it.
    pub(crate) fn emit(&mut self, kind: StreamEventKind) -> StreamEvent {
        let event = StreamEvent {
            id: self.id.clone(),
            local_id: self.local_id.clone(),
            direction: self.direction,
            label: self.label.clone(),
            kind,
        };
        self.subscribers.emit(&event);
        event
    }

    /// Holds on to a locally gathered candidate until our description has
    /// gone out. Returns it when it may be sent right away.
    pub(crate) fn queue_local_ice(
        &mut self,
        candidate: RTCIceCandidateInit,
    ) -> Option<RTCIceCandidateInit> {
        if self.local_description_sent {
            Some(candidate)
        } else {
            self.local_ice.push(candidate);
            None
        }
    }

    pub(crate) fn take_local_ice(&mut self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut self.local_ice)
    }

    /// Same as [`Stream::queue_local_ice`], for candidates from the server
    /// that can't be applied before the remote description.
    pub(crate) fn queue_remote_ice(
        &mut self,
        candidate: RTCIceCandidateInit,
    ) -> Option<RTCIceCandidateInit> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.remote_ice.push(candidate);
            None
        }
    }

    pub(crate) fn take_remote_ice(&mut self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut self.remote_ice)
    }

    pub(crate) fn add_track(&mut self, track: MediaTrack) {
        let id = self.id.clone();
        self.media
            .get_or_insert_with(|| MediaStream::new(id))
            .tracks
            .push(track);
    }

    pub(crate) fn add_sent_track(&mut self, track: MediaTrack, sender: Arc<dyn TrackSender>) {
        self.senders.insert(track.id.clone(), sender);
        self.add_track(track);
    }

    pub(crate) fn sender(&self, track_id: &str) -> Option<Arc<dyn TrackSender>> {
        self.senders.get(track_id).cloned()
    }

    /// Flags every track of `kind` as enabled or not and returns the tracks
    /// whose flag actually changed.
    pub(crate) fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> Vec<MediaTrack> {
        let mut changed = Vec::new();
        if let Some(media) = self.media.as_mut() {
            for track in media.tracks.iter_mut().filter(|t| t.kind == kind) {
                if track.enabled != enabled {
                    track.enabled = enabled;
                    changed.push(track.clone());
                }
            }
        }
        changed
    }
}
