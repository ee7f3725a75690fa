// Copyright 2020 Netwarps Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Mplex stream multiplexer, wire-compatible with `/mplex/6.7.0`.
//!
//! A simpler cousin of yamux: varint framing, independent stream-id
//! counters per side, and no flow control. Memory is bounded by per-stream
//! and per-connection receive-buffer limits instead of windows.

mod chunks;
pub mod connection;
pub mod error;
mod frame;

use std::fmt;
use std::io;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{info, trace};

use rp2p_core::muxing::{IReadWrite, IStreamMuxer, ReadWriteEx, StreamInfo, StreamMuxer, StreamMuxerEx};
use rp2p_core::secure_io::SecureInfo;
use rp2p_core::transport::{ConnectionInfo, TransportError};
use rp2p_core::upgrade::{UpgradeInfo, Upgrader};
use rp2p_core::PeerId;
use rp2p_traits::{SplitEx, SplittableReadWrite};

pub use crate::connection::{Connection, Control, State, Stream};
pub use crate::error::ConnectionError;
pub use crate::frame::io::FrameDecodeError;
pub use crate::frame::{Frame, StreamKey, Tag};

/// Mplex configuration.
///
/// The default configuration values are as follows:
///
/// - max. frame body size = 1 MiB
/// - max. read buffer per stream = 1 MiB
/// - max. read buffer per connection = 8 MiB
/// - max. number of streams = 1000
/// - max. queued inbound streams = 100
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) max_frame_size: usize,
    pub(crate) max_read_buffer_size: usize,
    pub(crate) max_conn_read_buffer_size: usize,
    pub(crate) max_num_streams: usize,
    pub(crate) max_pending_inbound_streams: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_frame_size: 1024 * 1024,
            max_read_buffer_size: 1024 * 1024,
            max_conn_read_buffer_size: 8 * 1024 * 1024,
            max_num_streams: 1000,
            max_pending_inbound_streams: 100,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Set the max. frame body size.
    pub fn set_max_frame_size(&mut self, n: usize) -> &mut Self {
        self.max_frame_size = n;
        self
    }

    /// Set the max. read buffer per stream. A stream exceeding it is reset.
    pub fn set_max_read_buffer_size(&mut self, n: usize) -> &mut Self {
        self.max_read_buffer_size = n;
        self
    }

    /// Set the max. read buffer per connection. Exceeding it is fatal.
    pub fn set_max_conn_read_buffer_size(&mut self, n: usize) -> &mut Self {
        self.max_conn_read_buffer_size = n;
        self
    }

    /// Set the max. number of concurrent streams.
    pub fn set_max_num_streams(&mut self, n: usize) -> &mut Self {
        self.max_num_streams = n;
        self
    }

    /// Set the max. number of admitted inbound streams awaiting an accept.
    pub fn set_max_pending_inbound_streams(&mut self, n: usize) -> &mut Self {
        self.max_pending_inbound_streams = n;
        self
    }
}

/// An mplex connection bundled with the identity and addressing
/// information of the secured socket it upgrades.
pub struct Mplex<C: SplitEx> {
    connection: Option<Connection<C>>,
    control: Control,
    id: connection::Id,
    la: Option<String>,
    ra: String,
    local_peer: PeerId,
    remote_peer: PeerId,
}

impl<C: ConnectionInfo + SecureInfo + SplittableReadWrite> Mplex<C> {
    /// Create a new mplex connection.
    pub fn new(io: C, cfg: Config) -> Self {
        let la = io.local_addr();
        let ra = io.remote_addr();
        let local_peer = io.local_peer();
        let remote_peer = io.remote_peer();
        let conn = Connection::with_config(io, cfg);
        let id = conn.id();
        let control = conn.control();
        Mplex { connection: Some(conn), control, id, la, ra, local_peer, remote_peer }
    }
}

impl<C: SplitEx> Clone for Mplex<C> {
    fn clone(&self) -> Self {
        Mplex {
            connection: None,
            control: self.control.clone(),
            id: self.id,
            la: self.la.clone(),
            ra: self.ra.clone(),
            local_peer: self.local_peer.clone(),
            remote_peer: self.remote_peer.clone(),
        }
    }
}

impl<C: SplitEx> fmt::Debug for Mplex<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mplex")
            .field("id", &self.id)
            .field("ra", &self.ra)
            .field("remote_peer", &self.remote_peer)
            .finish()
    }
}

impl<C: SplitEx> SecureInfo for Mplex<C> {
    fn local_peer(&self) -> PeerId {
        self.local_peer.clone()
    }

    fn remote_peer(&self) -> PeerId {
        self.remote_peer.clone()
    }
}

impl<C: SplitEx> ConnectionInfo for Mplex<C> {
    fn local_addr(&self) -> Option<String> {
        self.la.clone()
    }

    fn remote_addr(&self) -> String {
        self.ra.clone()
    }
}

impl StreamInfo for Stream {
    fn id(&self) -> u64 {
        Stream::id(self)
    }

    fn protocol(&self) -> Option<String> {
        Stream::protocol(self)
    }

    fn set_protocol(&self, protocol: &str) {
        Stream::set_protocol(self, protocol)
    }
}

#[async_trait]
impl ReadWriteEx for Stream {
    fn box_clone(&self) -> IReadWrite {
        Box::new(self.clone())
    }

    async fn close_read(&mut self) -> io::Result<()> {
        self.close_read_local();
        Ok(())
    }

    async fn reset(&mut self) -> io::Result<()> {
        self.reset_stream().await
    }
}

impl<C: ConnectionInfo + SecureInfo + SplittableReadWrite> StreamMuxerEx for Mplex<C> {}

#[async_trait]
impl<C: ConnectionInfo + SecureInfo + SplittableReadWrite> StreamMuxer for Mplex<C> {
    async fn open_stream(&mut self) -> Result<IReadWrite, TransportError> {
        let s = self.control.open_stream().await?;
        trace!("{:?}: opened outbound substream {}", self, s);
        Ok(Box::new(s))
    }

    async fn accept_stream(&mut self) -> Result<IReadWrite, TransportError> {
        let s = self.control.accept_stream().await?;
        trace!("{:?}: accepted inbound substream {}", self, s);
        Ok(Box::new(s))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.control.close().await?;
        Ok(())
    }

    fn task(&mut self) -> Option<BoxFuture<'static, ()>> {
        if let Some(mut conn) = self.connection.take() {
            return Some(
                async move {
                    while conn.next_stream().await.is_ok() {}
                    info!("{}: connection task exiting", conn.id());
                }
                .boxed(),
            );
        }
        None
    }

    fn box_clone(&self) -> IStreamMuxer {
        Box::new(self.clone())
    }
}

impl UpgradeInfo for Config {
    type Info = &'static [u8];

    fn protocol_info(&self) -> Vec<Self::Info> {
        vec![b"/mplex/6.7.0"]
    }
}

#[async_trait]
impl<T> Upgrader<T> for Config
where
    T: ConnectionInfo + SecureInfo + SplittableReadWrite,
{
    type Output = Mplex<T>;

    async fn upgrade_inbound(
        self,
        socket: T,
        _info: <Self as UpgradeInfo>::Info,
    ) -> Result<Self::Output, TransportError> {
        trace!("upgrading mplex inbound");
        Ok(Mplex::new(socket, self))
    }

    async fn upgrade_outbound(
        self,
        socket: T,
        _info: <Self as UpgradeInfo>::Info,
    ) -> Result<Self::Output, TransportError> {
        trace!("upgrading mplex outbound");
        Ok(Mplex::new(socket, self))
    }
}

impl From<ConnectionError> for TransportError {
    fn from(e: ConnectionError) -> Self {
        TransportError::StreamMuxerError(Box::new(e))
    }
}
