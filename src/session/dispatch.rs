use anyhow::anyhow;
use serde_json::Value;

use crate::session::{ChatEvent, JoinedEvent, Session, User, UserEvent};
use crate::signaller::{
    JoinedKind, RtcConfigurationMessage, SignallerMessage, UserKind, UserMessage,
};
use crate::stream::Direction;
use crate::transfer::FILE_TRANSFER_KIND;

/// Fields of a down stream offer.
#[derive(Debug)]
pub(crate) struct DownOffer {
    pub id: String,
    pub label: String,
    pub replace: Option<String>,
    pub source: String,
    pub username: String,
    pub sdp: String,
    pub kind: Option<String>,
}

struct Joined {
    kind: JoinedKind,
    group: String,
    username: Option<String>,
    permissions: Vec<String>,
    status: Option<Value>,
    data: Option<Value>,
    rtc_configuration: Option<RtcConfigurationMessage>,
    value: Option<Value>,
}

fn value_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

impl Session {
    pub(crate) async fn dispatch(&mut self, message: SignallerMessage) {
        debug!("Received {}", message.kind());
        if !self.joined
            && matches!(
                message,
                SignallerMessage::Offer { .. } | SignallerMessage::Ice { .. }
            )
        {
            debug!("Not joined yet, holding on to {}", message.kind());
            self.pending.push(message);
            return;
        }

        match message {
            SignallerMessage::Handshake { version, .. } => {
                debug!("Server speaks protocol versions {:?}", version);
            }
            SignallerMessage::Ping {} => self.send_or_log(SignallerMessage::Pong {}),
            SignallerMessage::Pong {} => {}
            SignallerMessage::Joined {
                kind,
                group,
                username,
                permissions,
                status,
                data,
                rtc_configuration,
                value,
            } => {
                self.got_joined(Joined {
                    kind,
                    group,
                    username,
                    permissions,
                    status,
                    data,
                    rtc_configuration,
                    value,
                })
                .await
            }
            SignallerMessage::User {
                kind,
                id,
                username,
                permissions,
                data,
            } => self.got_user(kind, id, username, permissions, data),
            SignallerMessage::Offer {
                id,
                label,
                replace,
                source,
                username,
                sdp,
                kind,
            } => {
                self.got_offer(DownOffer {
                    id,
                    label,
                    replace,
                    source,
                    username,
                    sdp,
                    kind,
                })
                .await
            }
            SignallerMessage::Answer { id, sdp } => self.got_answer(&id, sdp).await,
            SignallerMessage::Ice { id, candidate } => self.got_remote_ice(&id, candidate).await,
            SignallerMessage::Renegotiate { id } => self.got_renegotiate(&id).await,
            SignallerMessage::Close { id } => self.got_close(&id).await,
            SignallerMessage::Abort { id } => self.got_abort(&id).await,
            SignallerMessage::Chat(message) => self.events.on_chat.emit(&ChatEvent {
                history: false,
                message,
            }),
            SignallerMessage::ChatHistory(message) => self.events.on_chat.emit(&ChatEvent {
                history: true,
                message,
            }),
            SignallerMessage::UserMessage(message) => self.got_user_message(message).await,
            SignallerMessage::Join { .. }
            | SignallerMessage::Request { .. }
            | SignallerMessage::RequestStream { .. }
            | SignallerMessage::UserAction(_)
            | SignallerMessage::GroupAction(_) => {
                warn!("Unexpected {} message from the server", message.kind());
            }
            SignallerMessage::Unknown => warn!("Dropping message of unknown type"),
        }
    }

    async fn got_joined(&mut self, joined: Joined) {
        let message = value_text(joined.value);
        info!(
            "Joined {} ({:?}): {}",
            joined.group,
            joined.kind,
            message.as_deref().unwrap_or("")
        );
        match joined.kind {
            JoinedKind::Fail => {
                if self.join_outcome.is_none() && !self.joined {
                    self.join_outcome = Some(Err(anyhow!(
                        "couldn't join {}: {}",
                        joined.group,
                        message.as_deref().unwrap_or("refused by server")
                    )));
                }
            }
            JoinedKind::Join | JoinedKind::Change => {
                self.group = Some(joined.group.clone());
                if let Some(username) = &joined.username {
                    self.username = Some(username.clone());
                }
                self.permissions = joined.permissions.iter().cloned().collect();
                if let Some(rtc_configuration) = joined.rtc_configuration {
                    self.rtc_configuration = Some(rtc_configuration);
                }
            }
            JoinedKind::Leave => {
                self.clear_group_state().await;
                self.group = None;
            }
        }

        self.events.on_joined.emit(&JoinedEvent {
            kind: joined.kind,
            group: joined.group,
            username: joined.username,
            permissions: joined.permissions,
            status: joined.status,
            data: joined.data,
            message: message.clone(),
        });

        if joined.kind == JoinedKind::Join {
            let first = !self.joined;
            self.joined = true;
            if self.join_outcome.is_none() {
                self.join_outcome = Some(Ok(message));
            }
            if first {
                self.replay_pending().await;
            }
        }
    }

    /// Handles offers and candidates that arrived before we joined.
    async fn replay_pending(&mut self) {
        let pending = self.pending.drain_fresh();
        if !pending.is_empty() {
            debug!("Replaying {} messages received before joining", pending.len());
        }
        for message in pending {
            match message {
                SignallerMessage::Offer {
                    id,
                    label,
                    replace,
                    source,
                    username,
                    sdp,
                    kind,
                } => {
                    self.got_offer(DownOffer {
                        id,
                        label,
                        replace,
                        source,
                        username,
                        sdp,
                        kind,
                    })
                    .await
                }
                SignallerMessage::Ice { id, candidate } => {
                    self.got_remote_ice(&id, candidate).await
                }
                other => debug!("Not replaying {}", other.kind()),
            }
        }
    }

    fn got_user(
        &mut self,
        kind: UserKind,
        id: String,
        username: Option<String>,
        permissions: Vec<String>,
        data: Option<Value>,
    ) {
        match kind {
            UserKind::Add => {
                if self.users.contains_key(&id) {
                    warn!("Duplicate user {}", id);
                }
                let mut user = User::new(&id);
                user.username = username;
                user.permissions = permissions.into_iter().collect();
                user.data = data;
                self.users.insert(id.clone(), user);
                self.recompute_user_streams(&id, false);
            }
            UserKind::Change => {
                let user = self.users.entry(id.clone()).or_insert_with(|| {
                    warn!("Change for unknown user {}", id);
                    User::new(&id)
                });
                user.username = username;
                user.permissions = permissions.into_iter().collect();
                user.data = data;
            }
            UserKind::Delete => {
                if self.users.remove(&id).is_none() {
                    warn!("Delete for unknown user {}", id);
                }
            }
        }
        self.events.on_user.emit(&UserEvent { id, kind });
    }

    async fn got_user_message(&mut self, message: UserMessage) {
        if message.kind == FILE_TRANSFER_KIND {
            self.got_file_transfer(message).await;
        } else {
            self.events.on_user_message.emit(&message);
        }
    }

    /// Recomputes the media `user_id` sends, notifying subscribers of a
    /// change when `notify` is set and something differs.
    pub(crate) fn recompute_user_streams(&mut self, user_id: &str, notify: bool) {
        let own = user_id == self.id;
        let streams = super::user::derive_streams(
            self.down
                .values()
                .filter(|s| s.source() == user_id)
                .chain(self.up.values().filter(|_| own)),
        );
        let Some(user) = self.users.get_mut(user_id) else {
            return;
        };
        if user.set_streams(streams) && notify {
            self.events.on_user.emit(&UserEvent {
                id: user_id.to_string(),
                kind: UserKind::Change,
            });
        }
    }

    pub(crate) fn stream_owner(&self, direction: Direction, source: &str) -> String {
        match direction {
            Direction::Up => self.id.clone(),
            Direction::Down => source.to_string(),
        }
    }
}
