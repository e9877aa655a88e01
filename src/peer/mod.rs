//! Peer connection seam.
//!
//! The session never talks to webrtc-rs directly: it asks a [`PeerFactory`]
//! for a [`PeerConnection`] and receives everything the connection reports
//! (candidates, state changes, tracks, data channel traffic) as [`PeerEvent`]s
//! on its own event queue, tagged with the [`PeerOwner`] the peer was created
//! for.

mod webrtc_peer;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::session::Internal;
use crate::stream::Direction;
use crate::transfer::TransferKey;
use crate::Result;

pub use webrtc_peer::{WebRtcDataChannel, WebRtcPeer, WebRtcPeerFactory, WebRtcTrackSender};

#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    /// make a new peer connection whose callbacks are reported through `events`
    async fn new_peer(
        &self,
        configuration: RTCConfiguration,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    async fn add_track(&self, track: &MediaTrack) -> Result<Arc<dyn TrackSender>>;
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;
    /// the channel's open/message/close callbacks are reported as peer events
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;
    async fn close(&self) -> Result<()>;
}

/// Sending side of a track added with [`PeerConnection::add_track`].
#[async_trait]
pub trait TrackSender: Send + Sync + 'static {
    /// Swaps the media being sent without renegotiating. `None` stops sending.
    async fn replace_track(&self, track: Option<&MediaTrack>) -> Result<()>;
}

#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    async fn send(&self, data: Bytes) -> Result<()>;
    async fn send_text(&self, text: String) -> Result<()>;
    /// bytes queued but not yet handed to the transport
    async fn buffered_amount(&self) -> usize;
    async fn close(&self) -> Result<()>;
}

/// Who a peer connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerOwner {
    Stream { direction: Direction, id: String },
    Transfer(TransferKey),
}

pub enum PeerEvent {
    NegotiationNeeded,
    IceCandidate(RTCIceCandidateInit),
    IceConnectionState(RTCIceConnectionState),
    Track(MediaTrack),
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage { data: Bytes, is_string: bool },
    ChannelClosed,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            PeerEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            PeerEvent::IceConnectionState(s) => write!(f, "IceConnectionState({})", s),
            PeerEvent::Track(t) => write!(f, "Track({:?})", t),
            PeerEvent::DataChannel(_) => write!(f, "DataChannel"),
            PeerEvent::ChannelOpen => write!(f, "ChannelOpen"),
            PeerEvent::ChannelMessage { data, is_string } => {
                write!(f, "ChannelMessage({} bytes, text: {})", data.len(), is_string)
            }
            PeerEvent::ChannelClosed => write!(f, "ChannelClosed"),
        }
    }
}

/// Sending half handed to peer implementations.
#[derive(Clone)]
pub struct PeerEvents {
    owner: PeerOwner,
    sender: UnboundedSender<Internal>,
}

impl PeerEvents {
    pub(crate) fn new(owner: PeerOwner, sender: UnboundedSender<Internal>) -> Self {
        Self { owner, sender }
    }

    pub fn owner(&self) -> &PeerOwner {
        &self.owner
    }

    pub fn emit(&self, event: PeerEvent) {
        trace!("peer event for {:?}: {:?}", self.owner, event);
        let message = Internal::Peer {
            owner: self.owner.clone(),
            event,
        };
        if self.sender.send(message).is_err() {
            trace!("session is gone, dropping peer event");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Clone)]
pub enum TrackSource {
    /// bookkeeping only, nothing to send or read
    Detached,
    Local(Arc<dyn TrackLocal + Send + Sync>),
    Remote(Arc<TrackRemote>),
}

#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
    pub source: TrackSource,
}

impl MediaTrack {
    pub fn detached(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
            source: TrackSource::Detached,
        }
    }

    /// Wraps a track the application writes samples to.
    pub fn local(kind: TrackKind, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            id: track.id().to_string(),
            kind,
            enabled: true,
            source: TrackSource::Local(track),
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            TrackSource::Detached => "detached",
            TrackSource::Local(_) => "local",
            TrackSource::Remote(_) => "remote",
        };
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("source", &source)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}
