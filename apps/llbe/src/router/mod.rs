//! Turns signaling messages into peer connections and robot commands.

mod factory;
mod peer;

pub use factory::{ice_servers, WebRtcPeerFactory};
pub use peer::{
    ChannelPayload, DataChannelHandle, PeerConnector, PeerEvent, PeerHandle, PeerState,
};

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use robot_wire::{EStop, MotorCommand, WireMessage};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    error::{LinkError, RobotLinkError, RouterError},
    robot::RobotTelemetry,
    signaling::{
        now_millis, ping_response, AuthResult, ControlInput, Envelope, OutboundSignal, Ping,
        RemoteCandidate, RobotAssign, SdpOffer, SignalKind,
    },
};

/// Outbound half of the signaling trunk as seen by the router.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, text: String) -> Result<(), LinkError>;
}

/// Where translated drive commands go.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, command: MotorCommand) -> Result<(), RobotLinkError>;
    async fn send_estop(&self, estop: EStop) -> Result<(), RobotLinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Negotiating,
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub peer_id: u64,
    pub state: SessionState,
    pub data_channel: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub accept_data_channels: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            accept_data_channels: true,
        }
    }
}

#[derive(Clone)]
struct PeerEntry {
    peer: Arc<dyn PeerHandle>,
    state: SessionState,
}

#[derive(Clone)]
struct ChannelEntry {
    peer_id: u64,
    channel: Arc<dyn DataChannelHandle>,
}

/// Owns the session maps.
///
/// Each session id maps to at most one peer connection and one data
/// channel. Both maps have their own lock, and no lock is held while a peer
/// or channel is being talked to: entries are cloned out or removed first.
pub struct SessionRouter {
    connector: Arc<dyn PeerConnector>,
    signals: Arc<dyn SignalSink>,
    robot: Arc<dyn CommandSink>,
    options: RouterOptions,
    peers: RwLock<HashMap<String, PeerEntry>>,
    channels: RwLock<HashMap<String, ChannelEntry>>,
    controller: RwLock<Option<String>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl SessionRouter {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        signals: Arc<dyn SignalSink>,
        robot: Arc<dyn CommandSink>,
        options: RouterOptions,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connector,
            signals,
            robot,
            options,
            peers: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            controller: RwLock::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Serializes backend messages, peer events and robot telemetry through
    /// one task until the signaling subscription ends.
    pub fn spawn(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<String>,
        mut telemetry: broadcast::Receiver<RobotTelemetry>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let events = self.events_rx.lock().take();
        tokio::spawn(async move {
            let Some(mut events) = events else {
                warn!("session router already running");
                return;
            };
            let mut telemetry_open = true;
            loop {
                tokio::select! {
                    message = inbound.recv() => match message {
                        Some(text) => {
                            if let Err(err) = router.handle_signal(&text).await {
                                warn!(error = %err, "dropping signaling message");
                            }
                        }
                        None => {
                            debug!("signaling subscription closed");
                            break;
                        }
                    },
                    Some(event) = events.recv() => router.handle_peer_event(event).await,
                    update = telemetry.recv(), if telemetry_open => match update {
                        Ok(update) => router.publish_telemetry(&update).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "telemetry subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => telemetry_open = false,
                    },
                }
            }
        })
    }

    /// Handles one backend message. Errors mean the message was dropped;
    /// no session is affected by them.
    pub async fn handle_signal(&self, text: &str) -> Result<(), RouterError> {
        let envelope = Envelope::parse(text)?;
        match envelope.kind {
            SignalKind::Ping => {
                let ping: Ping = envelope.decode()?;
                let reply = ping_response(&envelope.body, ping.timestamp, now_millis());
                self.emit_text(reply.to_string());
            }
            SignalKind::PingResponse => trace!("ping response from backend"),
            SignalKind::Control => {
                let input: ControlInput = envelope.decode()?;
                let origin = input.sessionid.clone();
                self.forward_command(origin.as_deref(), input.to_motor_command())
                    .await?;
            }
            SignalKind::Sdp => self.handle_offer(envelope.decode()?).await?,
            SignalKind::Ice => self.handle_remote_candidate(envelope.decode()?).await?,
            SignalKind::RobotAssign => {
                let assign: RobotAssign = envelope.decode()?;
                info!(session_id = %assign.sessionid, "robot control assigned");
                *self.controller.write() = Some(assign.sessionid);
            }
            SignalKind::Auth => {
                let result: AuthResult = envelope.decode()?;
                match result.success {
                    Some(true) => info!("signaling backend accepted authentication"),
                    Some(false) => warn!(
                        reason = result.message.as_deref().unwrap_or(""),
                        "signaling backend rejected authentication"
                    ),
                    None => debug!("signaling backend sent user:auth without a result"),
                }
            }
            SignalKind::Unknown => {
                warn!(message_type = %envelope.type_name, "ignoring unknown signaling message");
            }
        }
        Ok(())
    }

    pub async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalDescription {
                session_id,
                peer_id,
                sdp,
            } => {
                if !self.is_current(&session_id, peer_id) {
                    debug!(%session_id, peer_id, "dropping answer from replaced peer");
                    return;
                }
                self.emit(OutboundSignal::Sdp {
                    sessionid: session_id,
                    sdp,
                });
            }
            PeerEvent::LocalCandidate {
                session_id,
                peer_id,
                candidate,
                sdp_mid,
            } => {
                if !self.is_current(&session_id, peer_id) {
                    return;
                }
                self.emit(OutboundSignal::Ice {
                    sessionid: session_id,
                    candidate,
                    sdp_mid,
                    sdp_mline_index: 0,
                });
            }
            PeerEvent::StateChanged {
                session_id,
                peer_id,
                state,
            } => {
                debug!(%session_id, peer_id, ?state, "peer connection state changed");
                if state == PeerState::Connected {
                    self.mark_open(&session_id, peer_id);
                } else if state.is_terminal() {
                    self.teardown(&session_id, Some(peer_id)).await;
                }
            }
            PeerEvent::DataChannelOpen {
                session_id,
                peer_id,
                channel,
            } => self.install_channel(session_id, peer_id, channel).await,
            PeerEvent::DataChannelMessage {
                session_id,
                peer_id,
                payload,
            } => {
                if !self.is_current(&session_id, peer_id) {
                    return;
                }
                if let Err(err) = self.handle_channel_payload(&session_id, payload).await {
                    warn!(%session_id, error = %err, "dropping data channel message");
                }
            }
            PeerEvent::DataChannelClosed {
                session_id,
                peer_id,
                channel,
            } => {
                let removed = {
                    let mut channels = self.channels.write();
                    let matches = channels.get(&session_id).is_some_and(|entry| {
                        entry.peer_id == peer_id && peer::same_channel(&entry.channel, &channel)
                    });
                    if matches {
                        channels.remove(&session_id)
                    } else {
                        None
                    }
                };
                if removed.is_some() {
                    info!(%session_id, label = %channel.label(), "data channel closed");
                }
            }
        }
    }

    /// Pushes robot telemetry to every open data channel.
    pub async fn publish_telemetry(&self, update: &RobotTelemetry) {
        let message = match update {
            RobotTelemetry::Status(status) => OutboundSignal::telemetry(status),
            RobotTelemetry::EmergencyStop(estop) => OutboundSignal::EStop {
                reason: estop.reason,
            },
        };
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode telemetry");
                return;
            }
        };
        let channels: Vec<(String, Arc<dyn DataChannelHandle>)> = self
            .channels
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.channel)))
            .collect();
        for (session_id, channel) in channels {
            if let Err(err) = channel.send_text(text.clone()).await {
                debug!(%session_id, error = %err, "telemetry not delivered");
            }
        }
    }

    pub fn session_state(&self, session_id: &str) -> SessionState {
        self.peers
            .read()
            .get(session_id)
            .map_or(SessionState::Closed, |entry| entry.state)
    }

    pub fn has_data_channel(&self, session_id: &str) -> bool {
        self.channels.read().contains_key(session_id)
    }

    pub fn peer_id(&self, session_id: &str) -> Option<u64> {
        self.peers.read().get(session_id).map(|entry| entry.peer.id())
    }

    pub fn controller(&self) -> Option<String> {
        self.controller.read().clone()
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let channels: HashMap<String, String> = self
            .channels
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.channel.label()))
            .collect();
        let mut sessions: Vec<SessionSnapshot> = self
            .peers
            .read()
            .iter()
            .map(|(id, entry)| SessionSnapshot {
                session_id: id.clone(),
                peer_id: entry.peer.id(),
                state: entry.state,
                data_channel: channels.get(id).cloned(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Closes every session.
    pub async fn shutdown(&self) {
        let channels: Vec<ChannelEntry> = self.channels.write().drain().map(|(_, e)| e).collect();
        let peers: Vec<PeerEntry> = self.peers.write().drain().map(|(_, e)| e).collect();
        for entry in channels {
            entry.channel.close().await;
        }
        for entry in peers {
            entry.peer.close().await;
        }
        info!("session router stopped");
    }

    async fn handle_offer(&self, offer: SdpOffer) -> Result<(), RouterError> {
        let session_id = offer.sessionid;
        let peer = self
            .connector
            .create(&session_id, self.events_tx.clone())
            .await?;

        let previous = self.peers.write().remove(&session_id);
        let stale_channel = self.channels.write().remove(&session_id);
        if let Some(stale) = stale_channel {
            stale.channel.close().await;
        }
        if let Some(previous) = previous {
            info!(
                %session_id,
                replaced_peer = previous.peer.id(),
                "replacing peer connection"
            );
            previous.peer.close().await;
        }

        self.peers.write().insert(
            session_id.clone(),
            PeerEntry {
                peer: Arc::clone(&peer),
                state: SessionState::Negotiating,
            },
        );
        counter!("llbe_router_sessions_created_total", 1);
        info!(%session_id, peer_id = peer.id(), "peer connection created");

        if let Err(err) = peer.accept_offer(offer.sdp).await {
            self.teardown(&session_id, Some(peer.id())).await;
            return Err(err);
        }
        Ok(())
    }

    async fn handle_remote_candidate(&self, remote: RemoteCandidate) -> Result<(), RouterError> {
        let peer = self
            .peers
            .read()
            .get(&remote.sessionid)
            .map(|entry| Arc::clone(&entry.peer));
        let Some(peer) = peer else {
            return Err(RouterError::SessionNotFound(remote.sessionid));
        };
        if remote.sdp_mline_index.is_some_and(|index| index != 0) {
            debug!(
                session_id = %remote.sessionid,
                "candidate for media line other than 0; applying to line 0"
            );
        }
        peer.add_remote_candidate(remote.candidate, remote.sdp_mid)
            .await
    }

    async fn install_channel(
        &self,
        session_id: String,
        peer_id: u64,
        channel: Arc<dyn DataChannelHandle>,
    ) {
        if !self.options.accept_data_channels {
            info!(%session_id, label = %channel.label(), "data channels disabled; closing");
            channel.close().await;
            return;
        }
        if !self.is_current(&session_id, peer_id) {
            debug!(%session_id, peer_id, "closing data channel of replaced peer");
            channel.close().await;
            return;
        }

        let previous = self.channels.write().remove(&session_id);
        if let Some(previous) = previous {
            warn!(%session_id, label = %previous.channel.label(), "replacing data channel");
            previous.channel.close().await;
        }
        self.channels.write().insert(
            session_id.clone(),
            ChannelEntry {
                peer_id,
                channel: Arc::clone(&channel),
            },
        );
        self.mark_open(&session_id, peer_id);
        info!(%session_id, label = %channel.label(), "data channel open");
    }

    async fn handle_channel_payload(
        &self,
        session_id: &str,
        payload: ChannelPayload,
    ) -> Result<(), RouterError> {
        match payload {
            ChannelPayload::Text(text) => {
                debug!(session_id, len = text.len(), "data channel message");
                let envelope = Envelope::parse(&text)?;
                match envelope.kind {
                    SignalKind::Control => {
                        let input: ControlInput = envelope.decode()?;
                        self.forward_command(Some(session_id), input.to_motor_command())
                            .await
                    }
                    SignalKind::Ping => {
                        let ping: Ping = envelope.decode()?;
                        let reply = ping_response(&envelope.body, ping.timestamp, now_millis());
                        self.reply_on_channel(session_id, reply.to_string()).await
                    }
                    _ => {
                        debug!(session_id, message_type = %envelope.type_name, "ignoring data channel message");
                        Ok(())
                    }
                }
            }
            ChannelPayload::Binary(bytes) => {
                let frame = WireMessage::<MotorCommand>::decode_valid(&bytes).map_err(|err| {
                    counter!("llbe_integrity_rejections_total", 1, "source" => "data_channel");
                    err
                })?;
                self.forward_command(Some(session_id), *frame.payload())
                    .await
            }
        }
    }

    /// Forwards a drive command unless it comes from a session that does not
    /// exist or does not hold control.
    async fn forward_command(
        &self,
        origin: Option<&str>,
        command: MotorCommand,
    ) -> Result<(), RouterError> {
        if let Some(session_id) = origin {
            let known = self.peers.read().contains_key(session_id);
            if !known {
                return Err(RouterError::SessionNotFound(session_id.to_owned()));
            }
            let controller = self.controller.read().clone();
            if let Some(controller) = controller {
                if controller != session_id {
                    warn!(session_id, %controller, "ignoring control from session without authority");
                    return Ok(());
                }
            }
        }

        debug!(
            left = command.left_speed,
            right = command.right_speed,
            "forwarding drive command"
        );
        self.robot.send_command(command).await?;
        counter!("llbe_router_commands_total", 1);
        Ok(())
    }

    async fn reply_on_channel(&self, session_id: &str, text: String) -> Result<(), RouterError> {
        let channel = self
            .channels
            .read()
            .get(session_id)
            .map(|entry| Arc::clone(&entry.channel));
        match channel {
            Some(channel) => channel.send_text(text).await,
            None => Err(RouterError::SessionNotFound(session_id.to_owned())),
        }
    }

    fn is_current(&self, session_id: &str, peer_id: u64) -> bool {
        self.peers
            .read()
            .get(session_id)
            .is_some_and(|entry| entry.peer.id() == peer_id)
    }

    fn mark_open(&self, session_id: &str, peer_id: u64) {
        if let Some(entry) = self.peers.write().get_mut(session_id) {
            if entry.peer.id() == peer_id {
                entry.state = SessionState::Open;
            }
        }
    }

    /// Removes and closes the session's peer connection and data channel.
    /// With `peer_id` set, entries belonging to a different peer are left
    /// alone. Safe to call for sessions that are already gone.
    async fn teardown(&self, session_id: &str, peer_id: Option<u64>) {
        let owned = |id: u64| peer_id.map_or(true, |expected| expected == id);

        let peer = {
            let mut peers = self.peers.write();
            let matches = peers
                .get(session_id)
                .is_some_and(|entry| owned(entry.peer.id()));
            if matches {
                peers.remove(session_id)
            } else {
                None
            }
        };
        let channel = {
            let mut channels = self.channels.write();
            let matches = channels
                .get(session_id)
                .is_some_and(|entry| owned(entry.peer_id));
            if matches {
                channels.remove(session_id)
            } else {
                None
            }
        };

        if let Some(entry) = channel {
            entry.channel.close().await;
        }
        if let Some(entry) = peer {
            entry.peer.close().await;
            counter!("llbe_router_sessions_closed_total", 1);
            info!(session_id, peer_id = entry.peer.id(), "session closed");
        }
    }

    fn emit(&self, message: OutboundSignal) {
        match message.encode() {
            Ok(text) => self.emit_text(text),
            Err(err) => warn!(error = %err, "failed to encode signaling message"),
        }
    }

    fn emit_text(&self, text: String) {
        if let Err(err) = self.signals.send_signal(text) {
            debug!(error = %err, "signaling message dropped");
        }
    }
}
