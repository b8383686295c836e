//! UDP link to the robot's control board.
//!
//! Every frame in either direction is a sealed [`WireMessage`]. Frames that
//! fail the integrity check are logged and dropped; nothing unverified is
//! acted on.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use robot_wire::{
    peek_type, EStop, Heartbeat, IntegrityError, LogLine, MessageType, MotorCommand, Status,
    WireMessage, WirePayload,
};
use tokio::{
    net::UdpSocket,
    sync::broadcast,
    task::JoinHandle,
    time::{timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::RobotConfig,
    error::{RobotLinkError, RouterError, TransportError},
    router::CommandSink,
    transport::DatagramHandler,
};

const TELEMETRY_CAPACITY: usize = 64;
const RECEIVE_BUFFER: usize = 512;

/// Robot state worth forwarding to operators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RobotTelemetry {
    Status(Status),
    EmergencyStop(EStop),
}

pub struct RobotLink {
    socket: UdpSocket,
    robot_addr: SocketAddr,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    telemetry: broadcast::Sender<RobotTelemetry>,
    last_heartbeat: Mutex<Option<Instant>>,
    last_status: Mutex<Option<Status>>,
    sequence: AtomicU32,
    started_at: Instant,
    stop: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RobotLink {
    pub async fn bind(config: &RobotConfig) -> Result<Arc<Self>, TransportError> {
        let robot_addr: SocketAddr = config
            .robot_address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(config.robot_address.clone()))?;
        let socket = UdpSocket::bind(&config.bind_address)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.bind_address.clone(),
                source,
            })?;
        debug!(local = %socket.local_addr()?, robot = %robot_addr, "robot link bound");

        let (telemetry, _) = broadcast::channel(TELEMETRY_CAPACITY);
        Ok(Arc::new(Self {
            socket,
            robot_addr,
            heartbeat_interval: config.heartbeat_interval(),
            poll_interval: config.poll_interval(),
            telemetry,
            last_heartbeat: Mutex::new(None),
            last_status: Mutex::new(None),
            sequence: AtomicU32::new(0),
            started_at: Instant::now(),
            stop: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn robot_addr(&self) -> SocketAddr {
        self.robot_addr
    }

    /// Spawns the receive loop and the heartbeat loop. A second call is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        tasks.push(tokio::spawn(Arc::clone(self).receive_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).heartbeat_loop()));
        info!(robot = %self.robot_addr, "robot link started");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RobotTelemetry> {
        self.telemetry.subscribe()
    }

    /// Time since the robot last proved it was alive, if it ever did.
    pub fn last_heartbeat_age(&self) -> Option<Duration> {
        self.last_heartbeat.lock().map(|at| at.elapsed())
    }

    pub fn last_status(&self) -> Option<Status> {
        *self.last_status.lock()
    }

    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("robot link stopped");
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    async fn send_frame<T: WirePayload>(&self, payload: T) -> Result<(), RobotLinkError> {
        if self.stopped() {
            return Err(RobotLinkError::Stopped);
        }
        let frame = WireMessage::sealed(payload).to_bytes();
        self.socket.send_to(&frame, self.robot_addr).await?;
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; RECEIVE_BUFFER];
        while !self.stopped() {
            let received = timeout(self.poll_interval, self.socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(err)) => {
                    debug!(error = %err, "robot link receive failed");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };
            if from != self.robot_addr {
                trace!(%from, "ignoring datagram from unknown sender");
                continue;
            }
            if let Err(err) = self.handle_frame(&buf[..len]) {
                counter!("llbe_robot_frames_rejected_total", 1);
                warn!(error = %err, len, "rejected frame from robot");
            }
        }
        debug!("robot receive loop exited");
    }

    fn handle_frame(&self, bytes: &[u8]) -> Result<(), IntegrityError> {
        match peek_type(bytes)? {
            MessageType::Status => {
                let status = WireMessage::<Status>::decode_valid(bytes)?.into_payload();
                *self.last_status.lock() = Some(status);
                if status.is_low_voltage() {
                    warn!(voltage = status.voltage, "robot battery low");
                }
                if status.is_overcurrent() {
                    warn!(current = status.current, "robot overcurrent");
                }
                let _ = self.telemetry.send(RobotTelemetry::Status(status));
            }
            MessageType::EStop => {
                let estop = WireMessage::<EStop>::decode_valid(bytes)?.into_payload();
                warn!(reason = estop.reason, "robot raised an emergency stop");
                let _ = self.telemetry.send(RobotTelemetry::EmergencyStop(estop));
            }
            MessageType::Heartbeat => {
                let beat = WireMessage::<Heartbeat>::decode_valid(bytes)?.into_payload();
                *self.last_heartbeat.lock() = Some(Instant::now());
                trace!(sequence = beat.sequence, uptime_ms = beat.uptime_ms, "robot heartbeat");
            }
            MessageType::Log => {
                let line = WireMessage::<LogLine>::decode_valid(bytes)?.into_payload();
                info!(level = line.level, "robot: {}", line.text());
            }
            other => debug!(?other, "unexpected frame type from robot"),
        }
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !self.stopped() {
            if timeout(self.poll_interval, ticker.tick()).await.is_err() {
                continue;
            }
            let beat = Heartbeat {
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                uptime_ms: self.started_at.elapsed().as_millis() as u32,
            };
            if let Err(err) = self.send_frame(beat).await {
                debug!(error = %err, "robot heartbeat not sent");
            }
        }
    }
}

#[async_trait]
impl CommandSink for RobotLink {
    async fn send_command(&self, command: MotorCommand) -> Result<(), RobotLinkError> {
        trace!(left = command.left_speed, right = command.right_speed, "motor command");
        self.send_frame(command).await
    }

    async fn send_estop(&self, estop: EStop) -> Result<(), RobotLinkError> {
        warn!(reason = estop.reason, "forwarding emergency stop to robot");
        self.send_frame(estop).await
    }
}

/// Datagram handler for clients that speak the wire protocol directly.
/// Verified command and emergency-stop frames go to the robot; nothing is
/// sent back.
pub struct DirectControlHandler {
    robot: Arc<dyn CommandSink>,
}

impl DirectControlHandler {
    pub fn new(robot: Arc<dyn CommandSink>) -> Self {
        Self { robot }
    }

    async fn forward(&self, frame: &[u8]) -> Result<(), RouterError> {
        match peek_type(frame)? {
            MessageType::Command => {
                let command = WireMessage::<MotorCommand>::decode_valid(frame)?.into_payload();
                self.robot.send_command(command).await?;
            }
            MessageType::EStop => {
                let estop = WireMessage::<EStop>::decode_valid(frame)?.into_payload();
                self.robot.send_estop(estop).await?;
            }
            other => debug!(?other, "ignoring non-control frame from client"),
        }
        Ok(())
    }
}

#[async_trait]
impl DatagramHandler for DirectControlHandler {
    async fn on_message(&self, peer: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
        if let Err(err) = self.forward(payload).await {
            counter!("llbe_transport_frames_rejected_total", 1);
            warn!(%peer, error = %err, "rejected client frame");
        }
        None
    }

    async fn on_disconnect(&self, peer: SocketAddr) {
        debug!(%peer, "direct control client left; stopping motors");
        if let Err(err) = self.robot.send_command(MotorCommand::stop()).await {
            debug!(error = %err, "stop command not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn link_with_fake_robot() -> (Arc<RobotLink>, UdpSocket) {
        let robot = UdpSocket::bind("127.0.0.1:0").await.expect("robot socket");
        let config = RobotConfig {
            bind_address: "127.0.0.1:0".into(),
            robot_address: robot.local_addr().expect("addr").to_string(),
            heartbeat_interval_ms: 50,
            poll_interval_ms: 20,
        };
        let link = RobotLink::bind(&config).await.expect("bind");
        (link, robot)
    }

    async fn recv_frame(robot: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), robot.recv_from(&mut buf))
            .await
            .expect("frame arrived")
            .expect("recv");
        buf[..len].to_vec()
    }

    #[tokio::test]
    async fn commands_are_sent_sealed() {
        let (link, robot) = link_with_fake_robot().await;
        link.send_command(MotorCommand::from_drive(60, 40))
            .await
            .expect("send");

        let frame = recv_frame(&robot).await;
        let message = WireMessage::<MotorCommand>::decode_valid(&frame).expect("valid frame");
        assert_eq!(
            *message.payload(),
            MotorCommand {
                left_speed: 100,
                right_speed: 20
            }
        );
    }

    #[tokio::test]
    async fn status_frames_become_telemetry() {
        let (link, robot) = link_with_fake_robot().await;
        let mut updates = link.subscribe();
        link.start();

        let status = Status {
            voltage: 10.2,
            current: 3.0,
            power: 30.6,
            driver_faults: 0,
            power_domains: Status::DOMAIN_COMPUTE,
        };
        let local = link.local_addr().expect("addr");
        let mut tampered = WireMessage::sealed(status).to_bytes();
        tampered[5] ^= 0x01;
        robot.send_to(&tampered, local).await.expect("send tampered");
        robot
            .send_to(&WireMessage::sealed(status).to_bytes(), local)
            .await
            .expect("send");

        let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("telemetry arrived")
            .expect("open channel");
        assert_eq!(update, RobotTelemetry::Status(status));
        assert_eq!(link.last_status(), Some(status));
        link.stop().await;
    }

    #[tokio::test]
    async fn heartbeats_flow_both_ways() {
        let (link, robot) = link_with_fake_robot().await;
        link.start();

        let frame = recv_frame(&robot).await;
        assert_eq!(peek_type(&frame).expect("type"), MessageType::Heartbeat);
        assert!(WireMessage::<Heartbeat>::decode_valid(&frame).is_ok());

        assert!(link.last_heartbeat_age().is_none());
        let beat = Heartbeat {
            sequence: 7,
            uptime_ms: 1_000,
        };
        robot
            .send_to(
                &WireMessage::sealed(beat).to_bytes(),
                link.local_addr().expect("addr"),
            )
            .await
            .expect("send");
        let deadline = Instant::now() + Duration::from_secs(2);
        while link.last_heartbeat_age().is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(link.last_heartbeat_age().is_some());

        link.stop().await;
        assert!(matches!(
            link.send_command(MotorCommand::stop()).await,
            Err(RobotLinkError::Stopped)
        ));
    }

    #[tokio::test]
    async fn direct_control_forwards_only_verified_frames() {
        let (link, robot) = link_with_fake_robot().await;
        let handler = DirectControlHandler::new(link.clone());
        let peer: SocketAddr = "127.0.0.1:40000".parse().expect("addr");

        let mut bad = WireMessage::sealed(MotorCommand::from_drive(127, 70)).to_bytes();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert!(handler.on_message(peer, &bad).await.is_none());

        let good = WireMessage::sealed(MotorCommand::from_drive(127, 70)).to_bytes();
        assert!(handler.on_message(peer, &good).await.is_none());

        let frame = recv_frame(&robot).await;
        assert_eq!(frame, good);
    }
}
