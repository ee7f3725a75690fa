//! Stream-muxer abstractions.
//!
//! A muxer splits one secured byte stream into many logical streams. The
//! concrete muxers (`rp2p-yamux`, `rp2p-mplex`) implement these traits; the
//! rest of the stack works against the boxed forms.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::io;

use rp2p_traits::{ReadEx, WriteEx};

use crate::secure_io::SecureInfo;
use crate::transport::{ConnectionInfo, TransportError};

/// Identifying information of a logical stream.
pub trait StreamInfo: Send {
    /// The stream id assigned by the muxer.
    fn id(&self) -> u64;
    /// The application protocol negotiated on this stream, if any.
    fn protocol(&self) -> Option<String>;
    /// Record the application protocol negotiated on this stream.
    fn set_protocol(&self, protocol: &str);
}

/// The full surface of a logical stream.
///
/// `close2` (from [`WriteEx`]) half-closes the write side; reading past the
/// remote's half-close yields EOF. `close_read` shuts the read side locally
/// and `reset` tears down both halves abruptly, discarding buffered data.
#[async_trait]
pub trait ReadWriteEx: ReadEx + WriteEx + StreamInfo {
    fn box_clone(&self) -> IReadWrite;

    /// Locally close the read half. Buffered and future inbound data is
    /// discarded; pending readers are woken with EOF.
    async fn close_read(&mut self) -> io::Result<()>;

    /// Abruptly close both halves and discard buffered data.
    async fn reset(&mut self) -> io::Result<()>;

    /// Gracefully close both halves.
    async fn close(&mut self) -> io::Result<()> {
        self.close2().await?;
        self.close_read().await
    }
}

pub type IReadWrite = Box<dyn ReadWriteEx>;

/// A multiplexed connection.
///
/// Inbound streams form a lazy finite sequence: call `accept_stream`
/// repeatedly until it fails with a closed-connection error.
#[async_trait]
pub trait StreamMuxer: Send {
    /// Open an outbound logical stream.
    async fn open_stream(&mut self) -> Result<IReadWrite, TransportError>;

    /// Wait for the next inbound logical stream.
    async fn accept_stream(&mut self) -> Result<IReadWrite, TransportError>;

    /// Gracefully close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// The background task driving the connection, to be spawned by the
    /// caller. Returns `None` once taken.
    fn task(&mut self) -> Option<BoxFuture<'static, ()>>;

    fn box_clone(&self) -> IStreamMuxer;
}

/// A muxer that also exposes identity and addressing information.
pub trait StreamMuxerEx: StreamMuxer + SecureInfo + ConnectionInfo {}

pub type IStreamMuxer = Box<dyn StreamMuxerEx>;
