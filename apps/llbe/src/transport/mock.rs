//! Unencrypted stand-in for the DTLS acceptor, for tests and local
//! debugging with plain UDP tools.

use std::{io, sync::Arc};

use async_trait::async_trait;

use super::{
    link::PeerLink,
    security::{SecureAcceptor, SecureSession},
};
use crate::error::HandshakeError;

/// Accepts every client immediately. An empty datagram from the client is
/// treated as a clean close.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextAcceptor;

#[async_trait]
impl SecureAcceptor for PlaintextAcceptor {
    async fn accept(&self, link: Arc<PeerLink>) -> Result<Box<dyn SecureSession>, HandshakeError> {
        Ok(Box::new(PlaintextSession { link }))
    }
}

/// Never completes a handshake. Useful to exercise handshake deadlines.
#[derive(Debug, Default, Clone, Copy)]
pub struct StallingAcceptor;

#[async_trait]
impl SecureAcceptor for StallingAcceptor {
    async fn accept(&self, _link: Arc<PeerLink>) -> Result<Box<dyn SecureSession>, HandshakeError> {
        std::future::pending().await
    }
}

struct PlaintextSession {
    link: Arc<PeerLink>,
}

#[async_trait]
impl SecureSession for PlaintextSession {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.link.recv_datagram(buf).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.link.send_datagram(data).await
    }

    async fn close(&self) {
        self.link.shutdown();
    }
}
