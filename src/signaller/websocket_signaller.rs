use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use crate::signaller::{Inbound, Signaller, SignallerMessage};
use crate::Result;

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close(String),
}

/// Signalling over one WebSocket, one JSON message per text frame.
#[derive(Debug)]
pub struct WebSocketSignaller {
    send_queue: UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl WebSocketSignaller {
    /// Opens the socket and sends the handshake. Messages read from the
    /// socket arrive on the returned receiver, ending with `Inbound::Closed`.
    pub async fn connect(
        url: &str,
        session_id: &str,
    ) -> Result<(Self, UnboundedReceiver<Inbound>)> {
        let url = url::Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => bail!("unsupported signalling scheme {}", other),
        }

        info!("Establishing websocket connection to {}", url);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        debug!("Websocket connection established");
        let (mut write, mut read) = ws_stream.split();

        let open = Arc::new(AtomicBool::new(true));
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel::<Inbound>();
        let (send_queue, mut send_queue_receiver) = mpsc::unbounded_channel::<Outgoing>();

        // create a task to read all incoming websocket messages
        let open_read = open.clone();
        tokio::spawn(async move {
            let mut code = None;
            let mut reason = String::new();
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Websocket error: {}", e);
                        reason = e.to_string();
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => {
                        trace!("Received websocket message: {}", text);
                        match serde_json::from_str::<SignallerMessage>(&text) {
                            Ok(message) => {
                                if inbound_sender.send(Inbound::Message(message)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropping undecodable message: {}", e),
                        }
                    }
                    Message::Close(frame) => {
                        if let Some(frame) = frame {
                            code = Some(u16::from(frame.code));
                            reason = frame.reason.into_owned();
                        }
                        break;
                    }
                    Message::Binary(_) => warn!("Ignoring binary websocket frame"),
                    _ => {}
                }
            }
            open_read.store(false, Ordering::SeqCst);
            debug!("Websocket closed ({:?}, {:?})", code, reason);
            let _ = inbound_sender.send(Inbound::Closed { code, reason });
        });

        // create a task to handle all outgoing websocket messages
        let open_write = open.clone();
        tokio::spawn(async move {
            while let Some(msg) = send_queue_receiver.recv().await {
                match msg {
                    Outgoing::Text(text) => {
                        trace!("Sending websocket message: {}", text);
                        if let Err(e) = write.send(Message::text(text)).await {
                            warn!("Websocket send failed: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close(reason) => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: Cow::Owned(reason),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!("Websocket close failed: {}", e);
                        }
                        break;
                    }
                }
            }
            open_write.store(false, Ordering::SeqCst);
            debug!("Send queue closed");
        });

        let signaller = Self { send_queue, open };
        signaller.send(SignallerMessage::handshake(session_id))?;
        Ok((signaller, inbound_receiver))
    }
}

#[async_trait]
impl Signaller for WebSocketSignaller {
    fn send(&self, message: SignallerMessage) -> Result<()> {
        if !self.is_open() {
            bail!("signalling channel is not open");
        }
        let text = serde_json::to_string(&message)?;
        self.send_queue
            .send(Outgoing::Text(text))
            .map_err(|_| anyhow!("signalling channel is not open"))
    }

    async fn close(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Closing websocket: {}", reason);
            let _ = self.send_queue.send(Outgoing::Close(reason.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
