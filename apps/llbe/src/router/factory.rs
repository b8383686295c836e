use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::peer::{
    ChannelPayload, DataChannelHandle, PeerConnector, PeerEvent, PeerHandle, PeerState,
};
use crate::config::{WebRtcConfig, DEFAULT_STUN_SERVER};
use crate::error::RouterError;

/// Creates answering peer connections with webrtc-rs.
pub struct WebRtcPeerFactory {
    api: API,
    configuration: RTCConfiguration,
    next_id: AtomicU64,
}

impl WebRtcPeerFactory {
    pub fn new(config: &WebRtcConfig) -> Result<Self, RouterError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(RouterError::peer)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(RouterError::peer)?;

        let mut settings = SettingEngine::default();
        let ice_timeout = config.ice_timeout();
        settings.set_ice_timeouts(Some(ice_timeout / 2), Some(ice_timeout), None);

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        Ok(Self {
            api,
            configuration: RTCConfiguration {
                ice_servers: ice_servers(config),
                ..Default::default()
            },
            next_id: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcPeerFactory {
    async fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, RouterError> {
        let peer_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(
            self.api
                .new_peer_connection(self.configuration.clone())
                .await
                .map_err(RouterError::peer)?,
        );

        let tx = events.clone();
        let sid = session_id.to_owned();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            let sid = sid.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate {
                            session_id: sid,
                            peer_id,
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid.unwrap_or_default(),
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to serialize local ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        let sid = session_id.to_owned();
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                let sid = sid.clone();
                Box::pin(async move {
                    let _ = tx.send(PeerEvent::StateChanged {
                        session_id: sid,
                        peer_id,
                        state: peer_state(state),
                    });
                })
            },
        ));

        let tx = events.clone();
        let sid = session_id.to_owned();
        connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            let sid = sid.clone();
            Box::pin(async move {
                debug!(session_id = %sid, label = channel.label(), "remote data channel announced");
                wire_data_channel(channel, sid, peer_id, tx);
            })
        }));

        Ok(Arc::new(WebRtcPeer {
            id: peer_id,
            session_id: session_id.to_owned(),
            connection,
            events,
        }))
    }
}

fn wire_data_channel(
    channel: Arc<RTCDataChannel>,
    session_id: String,
    peer_id: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let handle: Arc<dyn DataChannelHandle> = Arc::new(WebRtcDataChannel {
        inner: Arc::clone(&channel),
    });

    let tx = events.clone();
    let sid = session_id.clone();
    let opened = Arc::clone(&handle);
    channel.on_open(Box::new(move || {
        let tx = tx.clone();
        let sid = sid.clone();
        let opened = Arc::clone(&opened);
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannelOpen {
                session_id: sid,
                peer_id,
                channel: opened,
            });
        })
    }));

    let tx = events.clone();
    let sid = session_id.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = tx.clone();
        let sid = sid.clone();
        let payload = if message.is_string {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => ChannelPayload::Text(text),
                Err(_) => ChannelPayload::Binary(message.data),
            }
        } else {
            ChannelPayload::Binary(message.data)
        };
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannelMessage {
                session_id: sid,
                peer_id,
                payload,
            });
        })
    }));

    let tx = events;
    let sid = session_id;
    let closed = handle;
    channel.on_close(Box::new(move || {
        let tx = tx.clone();
        let sid = sid.clone();
        let closed = Arc::clone(&closed);
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannelClosed {
                session_id: sid,
                peer_id,
                channel: closed,
            });
        })
    }));
}

struct WebRtcPeer {
    id: u64,
    session_id: String,
    connection: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    fn id(&self) -> u64 {
        self.id
    }

    async fn accept_offer(&self, sdp: String) -> Result<(), RouterError> {
        let offer = RTCSessionDescription::offer(sdp).map_err(RouterError::peer)?;
        self.connection
            .set_remote_description(offer)
            .await
            .map_err(RouterError::peer)?;
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(RouterError::peer)?;
        self.connection
            .set_local_description(answer)
            .await
            .map_err(RouterError::peer)?;

        if let Some(local) = self.connection.local_description().await {
            let _ = self.events.send(PeerEvent::LocalDescription {
                session_id: self.session_id.clone(),
                peer_id: self.id,
                sdp: local.sdp,
            });
        }
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
    ) -> Result<(), RouterError> {
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(RouterError::peer)
    }

    async fn close(&self) {
        if let Err(err) = self.connection.close().await {
            debug!(error = %err, session_id = %self.session_id, "peer connection close failed");
        }
    }
}

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannelHandle for WebRtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_owned()
    }

    async fn send_text(&self, text: String) -> Result<(), RouterError> {
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(RouterError::peer)
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            debug!(error = %err, label = self.inner.label(), "data channel close failed");
        }
    }
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

/// STUN servers share one entry; each TURN server gets its own so it can
/// carry credentials written as `turn:user:secret@host:port`.
pub fn ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let mut stun = config.stun_servers.clone();
    if stun.is_empty() && config.turn_servers.is_empty() {
        stun.push(DEFAULT_STUN_SERVER.to_owned());
    }

    let mut servers = Vec::new();
    if !stun.is_empty() {
        servers.push(RTCIceServer {
            urls: stun,
            ..Default::default()
        });
    }
    servers.extend(config.turn_servers.iter().map(|raw| turn_server(raw)));
    servers
}

fn turn_server(raw: &str) -> RTCIceServer {
    let Some((scheme, rest)) = raw.split_once(':') else {
        return RTCIceServer {
            urls: vec![raw.to_owned()],
            ..Default::default()
        };
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let (username, credential) = credentials.split_once(':').unwrap_or((credentials, ""));
            RTCIceServer {
                urls: vec![format!("{scheme}:{host}")],
                username: username.to_owned(),
                credential: credential.to_owned(),
                ..Default::default()
            }
        }
        None => RTCIceServer {
            urls: vec![raw.to_owned()],
            ..Default::default()
        },
    }
}
