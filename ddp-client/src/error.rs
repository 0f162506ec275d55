use thiserror::Error;

use crate::connection::ConnectionState;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Errors returned synchronously by outbound operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DdpError {
    #[error("Not connected")]
    NotConnected,
    #[error("Handshake failed; server requires protocol version {server_version}")]
    HandshakeFailed { server_version: String },
    #[error("Operation not allowed while {0:?}")]
    InvalidState(ConnectionState),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
