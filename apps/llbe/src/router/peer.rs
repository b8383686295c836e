use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::RouterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States after which the peer connection is torn down.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

/// Callbacks of a peer connection, delivered to the router as events.
///
/// `peer_id` identifies the peer connection that raised the event; the
/// router drops events whose peer has since been replaced.
pub enum PeerEvent {
    LocalDescription {
        session_id: String,
        peer_id: u64,
        sdp: String,
    },
    LocalCandidate {
        session_id: String,
        peer_id: u64,
        candidate: String,
        sdp_mid: String,
    },
    StateChanged {
        session_id: String,
        peer_id: u64,
        state: PeerState,
    },
    DataChannelOpen {
        session_id: String,
        peer_id: u64,
        channel: Arc<dyn DataChannelHandle>,
    },
    DataChannelMessage {
        session_id: String,
        peer_id: u64,
        payload: ChannelPayload,
    },
    DataChannelClosed {
        session_id: String,
        peer_id: u64,
        channel: Arc<dyn DataChannelHandle>,
    },
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Creates a peer connection for `session_id`. All of its callbacks are
    /// wired to `events` before this returns, so nothing raised while the
    /// remote description is applied can be missed.
    async fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, RouterError>;
}

#[async_trait]
pub trait PeerHandle: Send + Sync {
    fn id(&self) -> u64;

    /// Applies a remote offer and produces the local answer, which is
    /// reported as [`PeerEvent::LocalDescription`].
    async fn accept_offer(&self, sdp: String) -> Result<(), RouterError>;

    /// Adds a remote candidate on media line 0. Offers with more than one
    /// media line are not supported.
    async fn add_remote_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
    ) -> Result<(), RouterError>;

    async fn close(&self);
}

#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    fn label(&self) -> String;
    async fn send_text(&self, text: String) -> Result<(), RouterError>;
    async fn close(&self);
}

pub(crate) fn same_channel(a: &Arc<dyn DataChannelHandle>, b: &Arc<dyn DataChannelHandle>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
