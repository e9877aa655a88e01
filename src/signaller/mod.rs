mod websocket_signaller;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::IntoStaticStr;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

use crate::Result;

pub use websocket_signaller::WebSocketSignaller;

/// Protocol versions announced in the handshake.
pub const PROTOCOL_VERSION: &str = "2";

#[async_trait]
pub trait Signaller: Send + Sync + 'static {
    /// queue a message for the server, fails once the socket is gone
    fn send(&self, message: SignallerMessage) -> Result<()>;
    /// close the socket, telling the server why
    async fn close(&self, reason: &str);
    /// whether messages can still be sent
    fn is_open(&self) -> bool;
}

/// What the reading half of a signaller hands to the session.
#[derive(Debug)]
pub enum Inbound {
    Message(SignallerMessage),
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinedKind {
    Join,
    Change,
    Fail,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    Add,
    Change,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "type", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SignallerMessage {
    Handshake {
        version: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Join {
        kind: JoinKind,
        group: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Joined {
        kind: JoinedKind,
        #[serde(default)]
        group: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default)]
        permissions: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(rename = "rtcConfiguration", skip_serializing_if = "Option::is_none")]
        rtc_configuration: Option<RtcConfigurationMessage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    Offer {
        id: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        replace: Option<String>,
        #[serde(default)]
        source: String,
        #[serde(default)]
        username: String,
        sdp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
    Answer {
        id: String,
        sdp: String,
    },
    Ice {
        id: String,
        candidate: RTCIceCandidateInit,
    },
    Renegotiate {
        id: String,
    },
    Close {
        id: String,
    },
    Abort {
        id: String,
    },
    User {
        kind: UserKind,
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default)]
        permissions: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Chat(ChatMessage),
    ChatHistory(ChatMessage),
    UserMessage(UserMessage),
    Ping {},
    Pong {},
    Request {
        request: HashMap<String, Vec<String>>,
    },
    #[serde(rename = "requestStream")]
    #[strum(serialize = "requestStream")]
    RequestStream {
        id: String,
        request: Vec<String>,
    },
    UserAction(Action),
    GroupAction(Action),
    #[serde(other)]
    Unknown,
}

impl SignallerMessage {
    pub fn handshake(id: &str) -> Self {
        SignallerMessage::Handshake {
            version: vec![PROTOCOL_VERSION.to_string()],
            id: Some(id.to_string()),
        }
    }

    /// Name of the `type` discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub noecho: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl ChatMessage {
    /// Servers send either milliseconds since the epoch or an RFC 3339 string.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.time.as_ref()? {
            Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub value: Value,
}

/// Payload of `useraction` and `groupaction`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.to_vec(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfigurationMessage {
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(rename = "iceTransportPolicy", skip_serializing_if = "Option::is_none")]
    pub ice_transport_policy: Option<String>,
}

impl RtcConfigurationMessage {
    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        let ice_transport_policy = match self.ice_transport_policy.as_deref() {
            Some("relay") => RTCIceTransportPolicy::Relay,
            _ => RTCIceTransportPolicy::All,
        };
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(RTCIceServer::from).collect(),
            ice_transport_policy,
            ..Default::default()
        }
    }
}
