//! Secure datagram server: one UDP socket, one DTLS session per client.
//!
//! The accept loop is the only reader of the socket. It demultiplexes by
//! source address into per-client [`PeerLink`]s and spawns a worker for each
//! new client; a reaper drops finished connections on a fixed interval.

mod connection;
mod link;
pub mod mock;
mod security;

pub use connection::{Connection, ConnectionInfo, ConnectionState, BUFFER_SIZE};
pub use link::PeerLink;
pub use security::{cipher_codes, load_certificate, DtlsAcceptor, SecureAcceptor, SecureSession};

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info, trace, warn};

use self::connection::WorkerContext;
use crate::{config::TransportConfig, error::TransportError};

/// Largest datagram the accept loop will take off the socket.
const MAX_DATAGRAM_SIZE: usize = 65_535;
/// Datagrams buffered per client before the accept loop starts dropping.
const INBOUND_QUEUE_DEPTH: usize = 64;

/// Application logic for decrypted client traffic.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    /// Handles one decrypted message; a returned buffer is sent back over
    /// the same secure session.
    async fn on_message(&self, peer: SocketAddr, payload: &[u8]) -> Option<Vec<u8>>;

    async fn on_disconnect(&self, _peer: SocketAddr) {}
}

/// Sends every message straight back to its sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl DatagramHandler for EchoHandler {
    async fn on_message(&self, _peer: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
        Some(payload.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
}

impl From<&TransportConfig> for ServerSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            handshake_timeout: config.handshake_timeout(),
            poll_interval: config.poll_interval(),
            reap_interval: config.reap_interval(),
        }
    }
}

struct Slot {
    connection: Arc<Connection>,
    inbound: mpsc::Sender<Bytes>,
    worker: JoinHandle<()>,
}

struct ServerInner {
    settings: ServerSettings,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    acceptor: Arc<dyn SecureAcceptor>,
    handler: Arc<RwLock<Arc<dyn DatagramHandler>>>,
    connections: Mutex<HashMap<SocketAddr, Slot>>,
    stop: AtomicBool,
}

pub struct DatagramServer {
    inner: Arc<ServerInner>,
    running: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl DatagramServer {
    /// Loads credentials and cipher policy, then binds the listening socket.
    /// Any failure is returned before a single datagram is read.
    pub async fn initialize(config: &TransportConfig) -> Result<Self, TransportError> {
        let acceptor = DtlsAcceptor::from_config(config)?;
        Self::bind(config, Arc::new(acceptor)).await
    }

    /// Binds with a caller-provided handshake implementation.
    pub async fn bind(
        config: &TransportConfig,
        acceptor: Arc<dyn SecureAcceptor>,
    ) -> Result<Self, TransportError> {
        let addr = config.listen_addr();
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = socket.local_addr()?;
        info!(%local, "secure datagram transport bound");

        let handler: Arc<dyn DatagramHandler> = Arc::new(EchoHandler);
        Ok(Self {
            inner: Arc::new(ServerInner {
                settings: ServerSettings::from(config),
                socket: Arc::new(socket),
                local,
                acceptor,
                handler: Arc::new(RwLock::new(handler)),
                connections: Mutex::new(HashMap::new()),
                stop: AtomicBool::new(false),
            }),
            running: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Replaces the message handler. The last registration wins; sessions
    /// pick up the new handler on their next message.
    pub fn set_handler(&self, handler: Arc<dyn DatagramHandler>) {
        *self.inner.handler.write() = handler;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the accept loop and the reaper. A second call is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("datagram server already running");
            return;
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        let accept = tokio::spawn(Arc::clone(&self.inner).accept_loop());
        let reaper = tokio::spawn(Arc::clone(&self.inner).reap_loop());
        self.loops.lock().extend([accept, reaper]);
        info!(local = %self.inner.local, "secure datagram transport listening");
    }

    /// Stops accepting, asks every worker to finish and waits for them.
    /// Safe to call repeatedly or on a server that never started.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.stop.store(true, Ordering::SeqCst);
        let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }

        let slots: Vec<Slot> = self
            .inner
            .connections
            .lock()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in &slots {
            slot.connection.request_stop();
        }
        for slot in slots {
            let _ = slot.worker.await;
        }
        info!("secure datagram transport stopped");
    }

    /// Connections that have not finished yet.
    pub fn active_connections(&self) -> usize {
        self.inner.active_count(&self.inner.connections.lock())
    }

    /// Every connection still in the table, finished or not.
    pub fn tracked_connections(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .connections
            .lock()
            .values()
            .map(|slot| slot.connection.info())
            .collect()
    }
}

impl ServerInner {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn active_count(&self, connections: &HashMap<SocketAddr, Slot>) -> usize {
        connections
            .values()
            .filter(|slot| !slot.connection.is_finished())
            .count()
    }

    async fn accept_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while !self.stopped() {
            let received = timeout(self.settings.poll_interval, self.socket.recv_from(&mut buf)).await;
            let (len, peer) = match received {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(err)) => {
                    debug!(error = %err, "datagram receive failed");
                    continue;
                }
            };
            self.dispatch(peer, Bytes::copy_from_slice(&buf[..len]));
        }
        debug!("accept loop exited");
    }

    fn dispatch(self: &Arc<Self>, peer: SocketAddr, datagram: Bytes) {
        let mut connections = self.connections.lock();
        let finished = match connections.get(&peer) {
            Some(slot) if !slot.connection.is_finished() => {
                match slot.inbound.try_send(datagram) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        counter!("llbe_transport_datagrams_dropped_total", 1);
                        trace!(%peer, "client queue full; dropping datagram");
                    }
                    Err(TrySendError::Closed(_)) => {
                        trace!(%peer, "client closing; dropping datagram");
                    }
                }
                return;
            }
            Some(_) => true,
            None => false,
        };
        if finished {
            connections.remove(&peer);
        }

        let active = self.active_count(&connections);
        if active >= self.settings.max_connections {
            counter!("llbe_transport_connections_rejected_total", 1);
            warn!(
                %peer,
                active,
                max = self.settings.max_connections,
                "connection limit reached; discarding datagram"
            );
            return;
        }

        let (inbound, queue) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let _ = inbound.try_send(datagram);
        let link = Arc::new(PeerLink::new(Arc::clone(&self.socket), self.local, peer, queue));
        let connection = Arc::new(Connection::new(peer));
        let ctx = WorkerContext {
            acceptor: Arc::clone(&self.acceptor),
            handler: Arc::clone(&self.handler),
            handshake_timeout: self.settings.handshake_timeout,
            poll_interval: self.settings.poll_interval,
        };
        let worker = tokio::spawn(connection::run(Arc::clone(&connection), link, ctx));
        connections.insert(
            peer,
            Slot {
                connection,
                inbound,
                worker,
            },
        );
        counter!("llbe_transport_connections_accepted_total", 1);
        info!(%peer, active = active + 1, "new datagram client");
    }

    async fn reap_loop(self: Arc<Self>) {
        loop {
            let deadline = Instant::now() + self.settings.reap_interval;
            while !self.stopped() && Instant::now() < deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(remaining.min(self.settings.poll_interval)).await;
            }
            if self.stopped() {
                break;
            }

            let (reaped, active) = {
                let mut connections = self.connections.lock();
                let before = connections.len();
                connections.retain(|_, slot| !slot.connection.is_finished());
                (before - connections.len(), connections.len())
            };
            gauge!("llbe_transport_active_connections", active as f64);
            if reaped > 0 {
                debug!(reaped, active, "reaped finished connections");
            }
        }
        debug!("reaper exited");
    }
}

impl Drop for DatagramServer {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        for slot in self.inner.connections.lock().values() {
            slot.connection.request_stop();
        }
    }
}
