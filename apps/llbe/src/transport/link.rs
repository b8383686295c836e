use std::{
    any::Any,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, Mutex as AsyncMutex, Notify},
};
use webrtc::util::conn::Conn;

/// One client's view of the shared listening socket.
///
/// The accept loop owns the socket and routes every datagram from `remote`
/// into this link's queue; replies go out through the shared socket so the
/// client always sees the listening port as the source.
pub struct PeerLink {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    remote: SocketAddr,
    inbound: AsyncMutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl PeerLink {
    pub fn new(
        socket: Arc<UdpSocket>,
        local: SocketAddr,
        remote: SocketAddr,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            socket,
            local,
            remote,
            inbound: AsyncMutex::new(inbound),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits for the next datagram from the client. Fails once the link has
    /// been shut down or the accept loop dropped its queue.
    pub async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return Err(closed());
        }

        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            datagram = inbound.recv() => match datagram {
                Some(datagram) => {
                    let len = datagram.len().min(buf.len());
                    buf[..len].copy_from_slice(&datagram[..len]);
                    Ok(len)
                }
                None => Err(closed()),
            },
            _ = &mut notified => Err(closed()),
        }
    }

    pub async fn send_datagram(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed());
        }
        self.socket.send_to(buf, self.remote).await
    }

    /// Wakes any pending receive and refuses further traffic.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_waiters();
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "peer link closed")
}

fn net_error(err: io::Error) -> webrtc::util::Error {
    webrtc::util::Error::Other(err.to_string())
}

#[async_trait]
impl Conn for PeerLink {
    async fn connect(&self, _addr: SocketAddr) -> Result<(), webrtc::util::Error> {
        Err(webrtc::util::Error::Other(
            "peer link is already bound to its remote".into(),
        ))
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, webrtc::util::Error> {
        self.recv_datagram(buf).await.map_err(net_error)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), webrtc::util::Error> {
        let len = self.recv_datagram(buf).await.map_err(net_error)?;
        Ok((len, self.remote))
    }

    async fn send(&self, buf: &[u8]) -> Result<usize, webrtc::util::Error> {
        self.send_datagram(buf).await.map_err(net_error)
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> Result<usize, webrtc::util::Error> {
        self.send_datagram(buf).await.map_err(net_error)
    }

    fn local_addr(&self) -> Result<SocketAddr, webrtc::util::Error> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn close(&self) -> Result<(), webrtc::util::Error> {
        self.shutdown();
        Ok(())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
