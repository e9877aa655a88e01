//! The client side of one SFU connection.
//!
//! A [`Session`] owns the signalling channel, the roster, every stream and
//! every file transfer. All state changes happen on whichever task drives
//! [`Session::step`] (or [`Session::run`]): peer connection callbacks only
//! post [`Internal`] events to the session's queue, so handlers never race.

mod dispatch;
mod streams;
mod transfers;
mod user;


use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure};
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::auth::Credentials;
use crate::config::SessionConfig;
use crate::peer::{PeerEvent, PeerFactory, PeerOwner};
use crate::retry::{Backoff, PendingQueue};
use crate::signaller::{
    Action, ChatMessage, Inbound, JoinKind, JoinedKind, RtcConfigurationMessage, Signaller,
    SignallerMessage, UserMessage, WebSocketSignaller,
};
use crate::stream::{Direction, Stream, StreamEvent};
use crate::subscribers::Subscribers;
use crate::transfer::{FileTransfer, FileTransferEvent, TransferKey};
use crate::Result;

pub use user::{StreamKinds, User, UserEvent};

/// Events posted to the session by its own peers and timers.
#[derive(Debug)]
pub(crate) enum Internal {
    Peer { owner: PeerOwner, event: PeerEvent },
    RetryIce { direction: Direction, id: String },
    FileSent {
        key: TransferKey,
        result: std::result::Result<(), String>,
    },
    Close,
}

/// Asks a session to close from another task, such as a signal handler.
/// The session closes between two events, never in the middle of one.
#[derive(Clone)]
pub struct CloseHandle {
    sender: UnboundedSender<Internal>,
}

impl CloseHandle {
    pub fn close(&self) {
        if self.sender.send(Internal::Close).is_err() {
            trace!("session is gone, nothing to close");
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinedEvent {
    pub kind: JoinedKind,
    pub group: String,
    pub username: Option<String>,
    pub permissions: Vec<String>,
    pub status: Option<Value>,
    pub data: Option<Value>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatEvent {
    /// replayed from the group's history rather than sent just now
    pub history: bool,
    pub message: ChatMessage,
}

#[derive(Debug, Clone)]
pub struct CloseEvent {
    pub code: Option<u16>,
    pub reason: String,
}

/// Everything an application can subscribe to.
#[derive(Default)]
pub struct SessionEvents {
    pub on_connected: Subscribers<()>,
    pub on_joined: Subscribers<JoinedEvent>,
    pub on_user: Subscribers<UserEvent>,
    /// a new stream from the server, before it is answered
    pub on_down_stream: Subscribers<Stream>,
    pub on_stream: Subscribers<StreamEvent>,
    pub on_chat: Subscribers<ChatEvent>,
    pub on_user_message: Subscribers<UserMessage>,
    pub on_file_transfer: Subscribers<FileTransferEvent>,
    pub on_close: Subscribers<CloseEvent>,
}

type RtcConfigurationHook = Box<dyn Fn(RTCConfiguration) -> RTCConfiguration + Send>;

enum Next {
    Internal(Option<Internal>),
    Inbound(Option<Inbound>),
}

/// 128 random bits in hex, used for session, stream and transfer ids.
pub(crate) fn random_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

pub struct Session {
    config: SessionConfig,
    peers: Arc<dyn PeerFactory>,
    id: String,
    group: Option<String>,
    username: Option<String>,
    permissions: HashSet<String>,
    users: HashMap<String, User>,
    up: HashMap<String, Stream>,
    down: HashMap<String, Stream>,
    transfers: HashMap<TransferKey, FileTransfer>,
    rtc_configuration: Option<RtcConfigurationMessage>,
    rtc_configuration_hook: Option<RtcConfigurationHook>,
    signaller: Option<Arc<dyn Signaller>>,
    inbound: Option<UnboundedReceiver<Inbound>>,
    internal_sender: UnboundedSender<Internal>,
    internal_receiver: UnboundedReceiver<Internal>,
    pending: PendingQueue<SignallerMessage>,
    joined: bool,
    join_outcome: Option<Result<Option<String>>>,
    pub events: SessionEvents,
}

impl Session {
    pub fn new(config: SessionConfig, peers: Arc<dyn PeerFactory>) -> Self {
        let (internal_sender, internal_receiver) = mpsc::unbounded_channel();
        let pending = PendingQueue::new(config.pending_staleness());
        Self {
            config,
            peers,
            id: random_id(),
            group: None,
            username: None,
            permissions: HashSet::new(),
            users: HashMap::new(),
            up: HashMap::new(),
            down: HashMap::new(),
            transfers: HashMap::new(),
            rtc_configuration: None,
            rtc_configuration_hook: None,
            signaller: None,
            inbound: None,
            internal_sender,
            internal_receiver,
            pending,
            joined: false,
            join_outcome: None,
            events: SessionEvents::default(),
        }
    }

    /// Opens the signalling socket. When already connected, the old socket
    /// is closed and all state dropped first, and the new connection uses a
    /// fresh session id.
    pub async fn connect(&mut self, url: &str) -> Result<()> {
        if let Some(old) = self.signaller.take() {
            info!("Reconnecting to {}", url);
            old.close("reconnecting").await;
            self.destroy().await;
            tokio::time::sleep(self.config.reconnect_delay()).await;
        }
        self.id = random_id();
        let (signaller, inbound) = WebSocketSignaller::connect(url, &self.id).await?;
        self.attach(Arc::new(signaller), inbound);
        Ok(())
    }

    /// Uses an already open signalling channel. The handshake is expected
    /// to have been sent.
    pub fn attach(&mut self, signaller: Arc<dyn Signaller>, inbound: UnboundedReceiver<Inbound>) {
        self.signaller = Some(signaller);
        self.inbound = Some(inbound);
        info!("Connected as {}", self.id);
        self.events.on_connected.emit(&());
    }

    /// Joins `group` and waits for the server's verdict. Resolves with the
    /// server's message, if any. Everything else arriving meanwhile is
    /// handled as usual.
    pub async fn join(
        &mut self,
        group: &str,
        username: &str,
        credentials: &Credentials,
        data: Option<Value>,
    ) -> Result<Option<String>> {
        ensure!(self.signaller.is_some(), "not connected");
        let auth = credentials.resolve(username).await?;
        self.join_outcome = None;
        self.send(SignallerMessage::Join {
            kind: JoinKind::Join,
            group: group.to_string(),
            username: Some(username.to_string()),
            password: auth.password,
            token: auth.token,
            data,
        })?;
        self.group = Some(group.to_string());
        self.username = Some(username.to_string());
        loop {
            let alive = self.step().await?;
            if let Some(outcome) = self.join_outcome.take() {
                return outcome;
            }
            if !alive {
                bail!("connection closed before joining {}", group);
            }
        }
    }

    pub fn leave(&mut self) -> Result<()> {
        let group = self
            .group
            .clone()
            .ok_or_else(|| anyhow!("not in a group"))?;
        self.send(SignallerMessage::Join {
            kind: JoinKind::Leave,
            group,
            username: self.username.clone(),
            password: None,
            token: None,
            data: None,
        })
    }

    /// Closes the socket and drops every stream and transfer.
    pub async fn close(&mut self) {
        if let Some(signaller) = &self.signaller {
            signaller.close("closing").await;
        }
        self.socket_closed(None, "closed by client".to_string()).await;
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            sender: self.internal_sender.clone(),
        }
    }

    /// Handles one event, waiting for it if necessary. Returns false once
    /// the signalling channel is gone.
    pub async fn step(&mut self) -> Result<bool> {
        let next = {
            let inbound = self
                .inbound
                .as_mut()
                .ok_or_else(|| anyhow!("not connected"))?;
            let internal = &mut self.internal_receiver;
            tokio::select! {
                event = internal.recv() => Next::Internal(event),
                message = inbound.recv() => Next::Inbound(message),
            }
        };
        match next {
            Next::Internal(Some(event)) => {
                self.handle_internal(event).await;
                if self.inbound.is_none() {
                    return Ok(false);
                }
            }
            // we hold a sender ourselves
            Next::Internal(None) => {}
            Next::Inbound(Some(Inbound::Message(message))) => self.dispatch(message).await,
            Next::Inbound(Some(Inbound::Closed { code, reason })) => {
                self.socket_closed(code, reason).await;
                return Ok(false);
            }
            Next::Inbound(None) => {
                self.socket_closed(None, String::new()).await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs until the signalling channel closes.
    pub async fn run(&mut self) -> Result<()> {
        while self.step().await? {}
        Ok(())
    }

    /// Handles everything already queued without waiting for more.
    pub async fn drain(&mut self) {
        loop {
            if let Ok(event) = self.internal_receiver.try_recv() {
                self.handle_internal(event).await;
                continue;
            }
            let next = match self.inbound.as_mut() {
                Some(inbound) => inbound.try_recv(),
                None => return,
            };
            match next {
                Ok(Inbound::Message(message)) => self.dispatch(message).await,
                Ok(Inbound::Closed { code, reason }) => {
                    self.socket_closed(code, reason).await;
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.socket_closed(None, String::new()).await;
                    return;
                }
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        trace!("Internal event {:?}", event);
        match event {
            Internal::Peer {
                owner: PeerOwner::Stream { direction, id },
                event,
            } => self.stream_peer_event(direction, &id, event).await,
            Internal::Peer {
                owner: PeerOwner::Transfer(key),
                event,
            } => self.transfer_peer_event(&key, event).await,
            Internal::RetryIce { direction, id } => self.retry_ice(direction, &id).await,
            Internal::FileSent { key, result } => self.file_sent(&key, result).await,
            Internal::Close => self.close().await,
        }
    }

    async fn socket_closed(&mut self, code: Option<u16>, reason: String) {
        if self.signaller.is_none() && self.inbound.is_none() {
            return;
        }
        info!("Signalling channel closed ({:?}): {}", code, reason);
        if self.join_outcome.is_none() && !self.joined && self.group.is_some() {
            self.join_outcome = Some(Err(anyhow!("connection closed: {}", reason)));
        }
        self.destroy().await;
        self.events.on_close.emit(&CloseEvent { code, reason });
    }

    /// Closes every stream and transfer and forgets the group.
    async fn destroy(&mut self) {
        self.signaller = None;
        self.inbound = None;
        self.clear_group_state().await;
        let keys: Vec<_> = self.transfers.keys().cloned().collect();
        for key in keys {
            self.cancel_transfer(&key, "session closed", false).await;
        }
        self.group = None;
    }

    /// What leaving a group drops: streams, roster and permissions.
    async fn clear_group_state(&mut self) {
        let up: Vec<_> = self.up.keys().cloned().collect();
        for id in up {
            self.close_stream(Direction::Up, &id, false).await;
        }
        let down: Vec<_> = self.down.keys().cloned().collect();
        for id in down {
            self.close_stream(Direction::Down, &id, false).await;
        }
        self.users.clear();
        self.permissions.clear();
        self.pending.clear();
        self.rtc_configuration = None;
        self.joined = false;
    }

    pub(crate) fn send(&self, message: SignallerMessage) -> Result<()> {
        let signaller = self
            .signaller
            .as_ref()
            .ok_or_else(|| anyhow!("not connected"))?;
        debug!("Sending {}", message.kind());
        signaller.send(message)
    }

    /// For messages nobody waits on.
    pub(crate) fn send_or_log(&self, message: SignallerMessage) {
        let kind = message.kind();
        if let Err(e) = self.send(message) {
            debug!("Couldn't send {}: {}", kind, e);
        }
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.config.ice_retry_limit, self.config.ice_retry_base())
    }

    /// Lets the application adjust the configuration of every new peer
    /// connection, e.g. to add its own TURN servers.
    pub fn set_rtc_configuration_hook<F>(&mut self, hook: F)
    where
        F: Fn(RTCConfiguration) -> RTCConfiguration + Send + 'static,
    {
        self.rtc_configuration_hook = Some(Box::new(hook));
    }

    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        let mut configuration = self
            .rtc_configuration
            .as_ref()
            .map(RtcConfigurationMessage::to_rtc_configuration)
            .unwrap_or_default();
        if !self.config.ice_servers.is_empty() {
            configuration.ice_servers = self
                .config
                .ice_servers
                .iter()
                .map(RTCIceServer::from)
                .collect();
        }
        match &self.rtc_configuration_hook {
            Some(hook) => hook(configuration),
            None => configuration,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.signaller.as_ref().map_or(false, |s| s.is_open())
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn permissions(&self) -> &HashSet<String> {
        &self.permissions
    }

    pub fn users(&self) -> &HashMap<String, User> {
        &self.users
    }

    pub fn user(&self, id: &str) -> Option<&User> {
        self.users.get(id)
    }

    pub fn up_streams(&self) -> impl Iterator<Item = &Stream> {
        self.up.values()
    }

    pub fn down_streams(&self) -> impl Iterator<Item = &Stream> {
        self.down.values()
    }

    pub fn stream(&self, direction: Direction, id: &str) -> Option<&Stream> {
        match direction {
            Direction::Up => self.up.get(id),
            Direction::Down => self.down.get(id),
        }
    }

    pub fn stream_mut(&mut self, direction: Direction, id: &str) -> Option<&mut Stream> {
        match direction {
            Direction::Up => self.up.get_mut(id),
            Direction::Down => self.down.get_mut(id),
        }
    }

    pub fn transfer(&self, key: &TransferKey) -> Option<&FileTransfer> {
        self.transfers.get(key)
    }

    pub fn transfers(&self) -> impl Iterator<Item = &FileTransfer> {
        self.transfers.values()
    }

    /// Sends a chat message to the group, or privately to `dest`.
    pub fn chat(&self, kind: Option<&str>, dest: Option<&str>, text: &str) -> Result<()> {
        self.send(SignallerMessage::Chat(ChatMessage {
            source: Some(self.id.clone()),
            username: self.username.clone(),
            dest: dest.map(str::to_string),
            privileged: false,
            noecho: false,
            time: None,
            kind: kind.map(str::to_string),
            value: Value::String(text.to_string()),
        }))
    }

    pub fn user_message(&self, kind: &str, dest: Option<&str>, value: Value) -> Result<()> {
        self.send(SignallerMessage::UserMessage(UserMessage {
            kind: kind.to_string(),
            source: Some(self.id.clone()),
            username: self.username.clone(),
            dest: dest.map(str::to_string),
            privileged: false,
            value,
        }))
    }

    /// Asks the server to act on another user, e.g. `op`, `kick`.
    pub fn user_action(&self, kind: &str, dest: &str, value: Value) -> Result<()> {
        self.send(SignallerMessage::UserAction(Action {
            kind: kind.to_string(),
            source: Some(self.id.clone()),
            username: self.username.clone(),
            dest: Some(dest.to_string()),
            group: None,
            value,
        }))
    }

    /// Asks the server to act on the group, e.g. `lock`, `clearchat`.
    pub fn group_action(&self, kind: &str, value: Value) -> Result<()> {
        self.send(SignallerMessage::GroupAction(Action {
            kind: kind.to_string(),
            source: Some(self.id.clone()),
            username: self.username.clone(),
            dest: None,
            group: self.group.clone(),
            value,
        }))
    }

    /// Tells the server which media we want, per stream label.
    pub fn request(&self, request: HashMap<String, Vec<String>>) -> Result<()> {
        self.send(SignallerMessage::Request { request })
    }

    /// Overrides [`Session::request`] for one down stream.
    pub fn request_stream(&self, id: &str, request: Vec<String>) -> Result<()> {
        ensure!(self.down.contains_key(id), "no down stream {}", id);
        self.send(SignallerMessage::RequestStream {
            id: id.to_string(),
            request,
        })
    }
}
