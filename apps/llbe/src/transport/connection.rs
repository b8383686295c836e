use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{
    link::PeerLink,
    security::{SecureAcceptor, SecureSession},
    DatagramHandler,
};
use crate::error::HandshakeError;

/// Largest application record read from a secure session.
pub const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Pending = 0,
    Active = 1,
    Closing = 2,
    Finished = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Finished,
        }
    }
}

/// Shared bookkeeping for one client. The worker task drives the state; the
/// server reads it to enforce the connection cap and to reap.
#[derive(Debug)]
pub struct Connection {
    remote: SocketAddr,
    state: AtomicU8,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    created_at: Instant,
    stop: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub remote: SocketAddr,
    pub state: ConnectionState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub age_ms: u64,
}

impl Connection {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            state: AtomicU8::new(ConnectionState::Pending as u8),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            created_at: Instant::now(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ConnectionState::Finished
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Asks the worker to wind down; it notices within one poll interval.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            remote: self.remote,
            state: self.state(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            age_ms: self.age().as_millis() as u64,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub(crate) struct WorkerContext {
    pub acceptor: Arc<dyn SecureAcceptor>,
    pub handler: Arc<RwLock<Arc<dyn DatagramHandler>>>,
    pub handshake_timeout: Duration,
    pub poll_interval: Duration,
}

/// Drives one client from handshake to close. The connection always ends in
/// `Finished`, whatever path the worker takes.
pub(crate) async fn run(connection: Arc<Connection>, link: Arc<PeerLink>, ctx: WorkerContext) {
    let remote = connection.remote_addr();
    let session = match handshake(&connection, Arc::clone(&link), &ctx).await {
        Ok(session) => session,
        Err(HandshakeError::Cancelled) => {
            debug!(%remote, "handshake cancelled by shutdown");
            link.shutdown();
            connection.set_state(ConnectionState::Finished);
            return;
        }
        Err(err) => {
            counter!("llbe_transport_handshake_failures_total", 1);
            warn!(%remote, error = %err, "secure handshake failed");
            link.shutdown();
            connection.set_state(ConnectionState::Finished);
            return;
        }
    };

    connection.set_state(ConnectionState::Active);
    info!(%remote, "secure session established");
    serve(&connection, session.as_ref(), &ctx).await;

    connection.set_state(ConnectionState::Closing);
    session.close().await;
    link.shutdown();
    let handler = ctx.handler.read().clone();
    handler.on_disconnect(remote).await;
    connection.set_state(ConnectionState::Finished);
    info!(
        %remote,
        bytes_sent = connection.bytes_sent(),
        bytes_received = connection.bytes_received(),
        "connection finished"
    );
}

async fn handshake(
    connection: &Connection,
    link: Arc<PeerLink>,
    ctx: &WorkerContext,
) -> Result<Box<dyn SecureSession>, HandshakeError> {
    let deadline = Instant::now() + ctx.handshake_timeout;
    let mut attempt = ctx.acceptor.accept(link);
    loop {
        if connection.stop_requested() {
            return Err(HandshakeError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(HandshakeError::Timeout(ctx.handshake_timeout));
        }
        let slice = (deadline - now).min(ctx.poll_interval);
        if let Ok(result) = timeout(slice, &mut attempt).await {
            return result;
        }
    }
}

async fn serve(connection: &Connection, session: &dyn SecureSession, ctx: &WorkerContext) {
    let remote = connection.remote_addr();
    let mut buf = vec![0u8; BUFFER_SIZE];
    while !connection.stop_requested() {
        let read = timeout(ctx.poll_interval, session.read(&mut buf)).await;
        let len = match read {
            Err(_) => continue,
            Ok(Ok(0)) => {
                info!(%remote, "client closed the session");
                break;
            }
            Ok(Ok(len)) => len,
            Ok(Err(err)) => {
                warn!(%remote, error = %err, "secure session read failed");
                break;
            }
        };
        connection.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        counter!("llbe_transport_bytes_received_total", len as u64);

        let handler = ctx.handler.read().clone();
        let Some(reply) = handler.on_message(remote, &buf[..len]).await else {
            continue;
        };
        match session.write(&reply).await {
            Ok(written) => {
                connection.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
                counter!("llbe_transport_bytes_sent_total", written as u64);
            }
            Err(err) => {
                warn!(%remote, error = %err, "secure session write failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection_is_pending() {
        let connection = Connection::new("127.0.0.1:9000".parse().expect("addr"));
        assert_eq!(connection.state(), ConnectionState::Pending);
        assert!(!connection.is_finished());
        assert_eq!(connection.info().bytes_received, 0);

        connection.set_state(ConnectionState::Finished);
        assert!(connection.is_finished());
    }
}
