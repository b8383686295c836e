use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use tracing::{debug, trace, warn};

use crate::error::LinkError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    Message(String),
    Closed,
    Error(String),
}

/// Event sink handed to a link when it is opened. Every event is tagged with
/// the attempt's generation so the trunk can ignore a superseded link.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send((self.generation, event));
    }

    pub fn message(&self, text: String) {
        self.emit(LinkEvent::Message(text));
    }

    pub fn closed(&self) {
        self.emit(LinkEvent::Closed);
    }

    pub fn error(&self, reason: impl Into<String>) {
        self.emit(LinkEvent::Error(reason.into()));
    }
}

/// An open connection to the signaling backend.
pub trait SignalingLink: Send + Sync {
    fn is_open(&self) -> bool;
    fn send(&self, text: String) -> Result<(), LinkError>;
    fn close(&self);
}

#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Opens a link to `url`. Inbound traffic and the eventual close are
    /// reported through `events`.
    async fn open(
        &self,
        url: &str,
        events: LinkEvents,
    ) -> Result<Arc<dyn SignalingLink>, LinkError>;
}

/// Opens websocket links with tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl LinkConnector for WebSocketConnector {
    async fn open(
        &self,
        url: &str,
        events: LinkEvents,
    ) -> Result<Arc<dyn SignalingLink>, LinkError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| LinkError::Connect(err.to_string()))?;
        debug!(url, generation = events.generation(), "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let open = Arc::new(AtomicBool::new(true));
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();

        let writer_open = Arc::clone(&open);
        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_write.send(message).await {
                    debug!(error = %err, "signaling websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        trace!(len = text.len(), "signaling text frame");
                        events.message(text);
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => events.message(text),
                        Err(_) => debug!("dropping non-utf8 binary signaling frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(error = %err, "signaling websocket closed");
                            }
                            _ => {
                                warn!(error = %err, "signaling websocket error");
                                events.error(err.to_string());
                            }
                        }
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            events.closed();
        });

        Ok(Arc::new(WebSocketLink {
            send_tx,
            open,
            tasks: Mutex::new(vec![writer, reader]),
        }))
    }
}

struct WebSocketLink {
    send_tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingLink for WebSocketLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::Disconnected);
        }
        self.send_tx
            .send(Message::Text(text))
            .map_err(|_| LinkError::Send("writer task has exited".into()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.send_tx.send(Message::Close(None));
        }
        // The writer drains the close frame on its own; the reader would
        // otherwise wait for the peer forever.
        for task in self.tasks.lock().drain(..).skip(1) {
            task.abort();
        }
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
