//! Relay between a signaling backend, browser WebRTC sessions and a
//! telepresence robot, plus a DTLS endpoint for direct datagram clients.

pub mod cli;
pub mod config;
pub mod error;
pub mod relay;
pub mod robot;
pub mod router;
pub mod signaling;
pub mod telemetry;
pub mod transport;
pub mod trunk;

pub use config::Config;
pub use relay::Relay;
