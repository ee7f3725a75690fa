//! Transport abstractions.
//!
//! The stack consumes raw byte-stream connections from an underlying
//! transport (TCP, QUIC, in-memory, ...). Only the interfaces live here,
//! plus the in-memory transport used throughout the tests.

pub mod memory;
pub mod prefixed;
pub mod upgrade;

use std::{fmt, io};

use async_trait::async_trait;

use crate::multistream::NegotiationError;

/// Errors surfaced while dialing, listening or upgrading a connection.
#[derive(Debug)]
pub enum TransportError {
    /// An I/O error on the underlying connection.
    IoError(io::Error),
    /// Protocol negotiation failed.
    Negotiation(NegotiationError),
    /// The stream muxer reported a fatal error.
    StreamMuxerError(Box<dyn std::error::Error + Send + Sync>),
    /// The private-network protector rejected the connection.
    ProtectorError(Box<dyn std::error::Error + Send + Sync>),
    /// No route to the given address.
    Unreachable(String),
    /// The listen address is already in use.
    AddressOccupied(String),
    /// An internal invariant was violated.
    Internal(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::IoError(e) => write!(f, "i/o error: {}", e),
            TransportError::Negotiation(e) => write!(f, "negotiation failed: {}", e),
            TransportError::StreamMuxerError(e) => write!(f, "muxer error: {}", e),
            TransportError::ProtectorError(e) => write!(f, "protector error: {}", e),
            TransportError::Unreachable(a) => write!(f, "no listener at {}", a),
            TransportError::AddressOccupied(a) => write!(f, "address {} occupied", a),
            TransportError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::IoError(e) => Some(e),
            TransportError::Negotiation(e) => Some(e),
            TransportError::StreamMuxerError(e) => Some(&**e),
            TransportError::ProtectorError(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::IoError(e)
    }
}

impl From<NegotiationError> for TransportError {
    fn from(e: NegotiationError) -> Self {
        TransportError::Negotiation(e)
    }
}

/// Addressing information carried by every connection.
///
/// Addresses are abstract strings; parsing them is the business of the
/// address layer, not of this crate.
pub trait ConnectionInfo {
    /// The local address, when the transport knows it.
    fn local_addr(&self) -> Option<String>;
    /// The remote address.
    fn remote_addr(&self) -> String;
}

/// A dialer/listener for raw byte-stream connections.
#[async_trait]
pub trait Transport {
    type Output: Send;
    type Listener: TransportListener<Output = Self::Output>;

    /// Start listening on `addr`.
    fn listen_on(self, addr: &str) -> Result<Self::Listener, TransportError>;

    /// Establish an outbound connection to `addr`.
    async fn dial(self, addr: &str) -> Result<Self::Output, TransportError>;
}

/// The accepting side of a [`Transport`].
#[async_trait]
pub trait TransportListener: Send {
    type Output: Send;

    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<Self::Output, TransportError>;

    /// The address this listener is bound to.
    fn listen_addr(&self) -> String;
}
