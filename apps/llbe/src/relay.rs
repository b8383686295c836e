use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    config::Config,
    robot::{DirectControlHandler, RobotLink},
    router::{RouterOptions, SessionRouter, WebRtcPeerFactory},
    transport::{DatagramServer, EchoHandler},
    trunk::{SignalingTrunk, TrunkSettings, WebSocketConnector},
};

/// Every long-running component of the relay, wired together.
pub struct Relay {
    robot: Arc<RobotLink>,
    trunk: Arc<SignalingTrunk>,
    router: Arc<SessionRouter>,
    router_task: JoinHandle<()>,
    transport: Option<DatagramServer>,
}

impl Relay {
    /// Starts the robot link, the session router, the signaling trunk and,
    /// when enabled, the secure datagram transport. A transport that cannot
    /// load its credentials or bind fails the whole start.
    pub async fn start(config: &Config) -> Result<Self> {
        // Bind the transport first so a bad certificate or a taken port
        // fails before anything else is running.
        let transport = if config.transport.enabled {
            let server = DatagramServer::initialize(&config.transport)
                .await
                .context("failed to initialize secure datagram transport")?;
            Some(server)
        } else {
            None
        };

        let robot = RobotLink::bind(&config.robot)
            .await
            .context("failed to open robot link")?;
        robot.start();

        let factory = WebRtcPeerFactory::new(&config.webrtc)
            .context("failed to build WebRTC peer factory")?;
        let trunk = SignalingTrunk::new(
            TrunkSettings::from(&config.server),
            Arc::new(WebSocketConnector),
        );
        let router = SessionRouter::new(
            Arc::new(factory),
            trunk.clone(),
            robot.clone(),
            RouterOptions {
                accept_data_channels: config.webrtc.enable_datachannel,
            },
        );
        let router_task = router.spawn(trunk.subscribe(), robot.subscribe());
        trunk.start();

        if let Some(server) = &transport {
            if config.transport.echo {
                server.set_handler(Arc::new(EchoHandler));
            } else {
                server.set_handler(Arc::new(DirectControlHandler::new(robot.clone())));
            }
            server.start();
        }

        info!(
            backend = %config.server.address,
            transport = config.transport.enabled,
            "relay started"
        );
        Ok(Self {
            robot,
            trunk,
            router,
            router_task,
            transport,
        })
    }

    pub fn trunk(&self) -> &Arc<SignalingTrunk> {
        &self.trunk
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    pub fn transport(&self) -> Option<&DatagramServer> {
        self.transport.as_ref()
    }

    /// Stops components in reverse start order.
    pub async fn shutdown(self) {
        if let Some(transport) = &self.transport {
            transport.stop().await;
        }
        self.trunk.shutdown().await;
        self.router_task.abort();
        self.router.shutdown().await;
        self.robot.stop().await;
        info!("relay stopped");
    }
}
