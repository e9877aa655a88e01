//! In-memory stand-ins for the signalling channel and webrtc-rs, so session
//! logic can be driven message by message.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::config::SessionConfig;
use crate::peer::{
    DataChannel, MediaTrack, PeerConnection, PeerEvent, PeerEvents, PeerFactory,
    SessionDescription, TrackSender,
};
use crate::session::Session;
use crate::signaller::{Inbound, Signaller, SignallerMessage};
use crate::Result;

pub(crate) fn candidate(text: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: text.to_string(),
        ..Default::default()
    }
}

#[derive(Default)]
pub(crate) struct FakeSignaller {
    sent: Mutex<Vec<SignallerMessage>>,
    closed: Mutex<Option<String>>,
}

impl FakeSignaller {
    pub fn take_sent(&self) -> Vec<SignallerMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn close_reason(&self) -> Option<String> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signaller for FakeSignaller {
    fn send(&self, message: SignallerMessage) -> Result<()> {
        if !self.is_open() {
            bail!("signalling channel is not open");
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self, reason: &str) {
        *self.closed.lock().unwrap() = Some(reason.to_string());
    }

    fn is_open(&self) -> bool {
        self.closed.lock().unwrap().is_none()
    }
}

#[derive(Default)]
pub(crate) struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    pub fail: AtomicBool,
}

impl FakePeerFactory {
    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers.lock().unwrap().last().cloned().expect("no peer was created")
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn new_peer(
        &self,
        configuration: RTCConfiguration,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("peer connection refused");
        }
        let peer = Arc::new(FakePeer {
            events: Some(events),
            configuration: Some(configuration),
            ..Default::default()
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

/// Records every call. Offers and answers are numbered per peer.
#[derive(Default)]
pub(crate) struct FakePeer {
    events: Option<PeerEvents>,
    pub configuration: Option<RTCConfiguration>,
    calls: Arc<Mutex<Vec<String>>>,
    descriptions: AtomicUsize,
    negotiation_fired: AtomicBool,
    pub fail_offer: AtomicBool,
    pub fail_remote: AtomicBool,
    pub fail_candidates: AtomicBool,
    channel: Mutex<Option<Arc<FakeDataChannel>>>,
    closed: AtomicUsize,
}

impl FakePeer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Option<Arc<FakeDataChannel>> {
        self.channel.lock().unwrap().clone()
    }

    /// Simulates a callback from the underlying connection.
    pub fn fire(&self, event: PeerEvent) {
        self.events.as_ref().expect("peer has no event sink").emit(event);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<Arc<dyn TrackSender>> {
        self.record(format!("add_track:{}", track.id));
        if !self.negotiation_fired.swap(true, Ordering::SeqCst) {
            if let Some(events) = &self.events {
                events.emit(PeerEvent::NegotiationNeeded);
            }
        }
        Ok(Arc::new(FakeTrackSender {
            track_id: track.id.clone(),
            calls: self.calls.clone(),
        }))
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.record(format!("create_offer:{}", ice_restart));
        if self.fail_offer.load(Ordering::SeqCst) {
            bail!("offer failed");
        }
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("offer-{}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer".to_string());
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::answer(format!("answer-{}", n)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("set_local:{}", description.sdp));
        self.negotiation_fired.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("set_remote:{}", description.sdp));
        if self.fail_remote.load(Ordering::SeqCst) {
            bail!("bad remote description");
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.record(format!("add_ice:{}", candidate.candidate));
        if self.fail_candidates.load(Ordering::SeqCst) {
            bail!("bad candidate");
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.record(format!("create_data_channel:{}", label));
        let channel = Arc::new(FakeDataChannel::default());
        *self.channel.lock().unwrap() = Some(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records replacements on its peer as `replace_track:<sent id>:<new id or none>`.
pub(crate) struct FakeTrackSender {
    track_id: String,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TrackSender for FakeTrackSender {
    async fn replace_track(&self, track: Option<&MediaTrack>) -> Result<()> {
        let with = track.map_or("none", |t| t.id.as_str());
        self.calls
            .lock()
            .unwrap()
            .push(format!("replace_track:{}:{}", self.track_id, with));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeDataChannel {
    sent: Mutex<Vec<Bytes>>,
    texts: Mutex<Vec<String>>,
    buffered: AtomicUsize,
    closed: AtomicUsize,
}

impl FakeDataChannel {
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.texts.lock().unwrap().push(text);
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A session wired to fakes. Messages pushed with [`Harness::receive`] are
/// handled on the next [`Harness::settle`].
pub(crate) struct Harness {
    pub session: Session,
    pub signaller: Arc<FakeSignaller>,
    pub peers: Arc<FakePeerFactory>,
    inbound: Option<UnboundedSender<Inbound>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let peers = Arc::new(FakePeerFactory::default());
        let signaller = Arc::new(FakeSignaller::default());
        let mut session = Session::new(config, peers.clone());
        let (inbound, receiver) = mpsc::unbounded_channel();
        session.attach(signaller.clone(), receiver);
        Self {
            session,
            signaller,
            peers,
            inbound: Some(inbound),
        }
    }

    pub fn receive(&self, message: SignallerMessage) {
        if let Some(inbound) = &self.inbound {
            inbound.send(Inbound::Message(message)).unwrap();
        }
    }

    pub fn receive_json(&self, value: Value) {
        self.receive(serde_json::from_value(value).unwrap());
    }

    /// Simulates the server hanging up.
    pub fn disconnect(&mut self, code: u16, reason: &str) {
        if let Some(inbound) = self.inbound.take() {
            inbound
                .send(Inbound::Closed {
                    code: Some(code),
                    reason: reason.to_string(),
                })
                .unwrap();
        }
    }

    pub async fn settle(&mut self) {
        // let spawned tasks (retry timers, file senders) run first
        tokio::task::yield_now().await;
        self.session.drain().await;
    }

    /// Joins `group` as `alice`, with the server's reply already queued.
    pub async fn join(&mut self, group: &str) {
        self.receive_json(serde_json::json!({
            "type": "joined",
            "kind": "join",
            "group": group,
            "username": "alice",
            "permissions": ["present", "message"],
        }));
        let credentials = crate::auth::Credentials::Password {
            password: "secret".into(),
        };
        self.session
            .join(group, "alice", &credentials, None)
            .await
            .unwrap();
    }

    pub fn take_sent(&self) -> Vec<SignallerMessage> {
        self.signaller.take_sent()
    }
}
