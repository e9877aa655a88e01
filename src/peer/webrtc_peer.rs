use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::peer::{
    DataChannel, MediaTrack, PeerConnection, PeerEvent, PeerEvents, PeerFactory, SdpKind,
    SessionDescription, TrackKind, TrackSender, TrackSource,
};
use crate::Result;

/// Builds webrtc-rs peer connections sharing one API instance.
pub struct WebRtcPeerFactory {
    api: API,
}

impl WebRtcPeerFactory {
    pub fn new() -> Result<Self> {
        info!("Initializing WebRTC");
        // Create a MediaEngine object to configure the supported codec
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        // NACKs, RTCP reports and the rest of the default RTP/RTCP pipeline
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        Ok(Self {
            api: APIBuilder::new()
                .with_media_engine(m)
                .with_interceptor_registry(registry)
                .build(),
        })
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn new_peer(
        &self,
        configuration: RTCConfiguration,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>> {
        debug!("Initializing a new WebRTC peer for {:?}", events.owner());
        let peer_connection = Arc::new(self.api.new_peer_connection(configuration).await?);

        let negotiation_events = events.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            negotiation_events.emit(PeerEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let ice_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => ice_events.emit(PeerEvent::IceCandidate(init)),
                    Err(e) => warn!("Couldn't serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let state_events = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                state_events.emit(PeerEvent::IceConnectionState(state));
                Box::pin(async {})
            },
        ));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                match kind {
                    Some(kind) => track_events.emit(PeerEvent::Track(MediaTrack {
                        id: track.id(),
                        kind,
                        enabled: true,
                        source: TrackSource::Remote(track),
                    })),
                    None => warn!("Ignoring track of unspecified kind"),
                }
                Box::pin(async {})
            },
        ));

        let channel_events = events.clone();
        peer_connection.on_data_channel(Box::new(move |data_channel: Arc<RTCDataChannel>| {
            debug!("Data channel received: {}", data_channel.label());
            // announce the channel before wiring it, an already open channel
            // reports its open event from inside `on_open`
            channel_events.emit(PeerEvent::DataChannel(Arc::new(WebRtcDataChannel {
                data_channel: data_channel.clone(),
            })));
            wire_data_channel(&data_channel, &channel_events);
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer {
            peer_connection,
            events,
        }))
    }
}

fn wire_data_channel(data_channel: &Arc<RTCDataChannel>, events: &PeerEvents) {
    let open_events = events.clone();
    data_channel.on_open(Box::new(move || {
        open_events.emit(PeerEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let message_events = events.clone();
    data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
        message_events.emit(PeerEvent::ChannelMessage {
            data: msg.data,
            is_string: msg.is_string,
        });
        Box::pin(async {})
    }));

    let close_events = events.clone();
    data_channel.on_close(Box::new(move || {
        close_events.emit(PeerEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
    })
}

pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    events: PeerEvents,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<Arc<dyn TrackSender>> {
        match &track.source {
            TrackSource::Local(local) => {
                let sender = self.peer_connection.add_track(local.clone()).await?;
                Ok(Arc::new(WebRtcTrackSender { sender }))
            }
            _ => bail!("track {} has no local source", track.id),
        }
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.peer_connection.create_offer(Some(options)).await?;
        trace!("Made an offer: {}", offer.sdp);
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        trace!("Made an answer: {}", answer.sdp);
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let data_channel = self.peer_connection.create_data_channel(label, None).await?;
        wire_data_channel(&data_channel, &self.events);
        Ok(Arc::new(WebRtcDataChannel { data_channel }))
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

pub struct WebRtcTrackSender {
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl TrackSender for WebRtcTrackSender {
    async fn replace_track(&self, track: Option<&MediaTrack>) -> Result<()> {
        let local = match track {
            None => None,
            Some(track) => match &track.source {
                TrackSource::Local(local) => Some(local.clone()),
                _ => bail!("track {} has no local source", track.id),
            },
        };
        self.sender.replace_track(local).await?;
        Ok(())
    }
}

pub struct WebRtcDataChannel {
    data_channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.data_channel.send(&data).await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.data_channel.send_text(text).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.data_channel.buffered_amount().await
    }

    async fn close(&self) -> Result<()> {
        self.data_channel.close().await?;
        Ok(())
    }
}
