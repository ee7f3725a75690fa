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

//! Yamux stream multiplexer, wire-compatible with `/yamux/1.0.0`.
//!
//! Many bidirectional logical streams are carried over one byte stream,
//! with credit-based per-stream flow control, keep-alive pings and a
//! graceful shutdown handshake.

mod chunks;
pub mod connection;
pub mod error;
mod frame;

use std::fmt;
use std::io;
use std::time::Duration;

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

pub use crate::connection::{Connection, Control, Mode, State, Stream};
pub use crate::error::ConnectionError;
pub use crate::frame::header::{GoAwayCode, HeaderDecodeError, StreamId};
pub use crate::frame::io::FrameDecodeError;

/// The initial per-stream window mandated by the yamux specification.
pub const DEFAULT_CREDIT: u32 = 256 * 1024;

/// Yamux configuration.
///
/// The default configuration values are as follows:
///
/// - initial receive window = 256 KiB
/// - receive window ceiling (auto-tuned) = 16 MiB
/// - max. frame body size = 16 MiB
/// - max. data bytes per emitted frame = 64 KiB
/// - max. buffer size (per stream) = 1 MiB
/// - max. number of streams = 1000
/// - max. queued inbound streams = 100
/// - window update timeout = 30 s
/// - keep-alive = on, every 30 s, timing out after 60 s
/// - lazy open = false
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) receive_window: u32,
    pub(crate) max_window_size: u32,
    pub(crate) max_frame_size: usize,
    pub(crate) max_message_size: usize,
    pub(crate) max_buffer_size: usize,
    pub(crate) max_num_streams: usize,
    pub(crate) max_pending_inbound_streams: usize,
    pub(crate) window_update_timeout: Duration,
    pub(crate) keep_alive: bool,
    pub(crate) keep_alive_interval: Duration,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) lazy_open: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            receive_window: DEFAULT_CREDIT,
            max_window_size: 16 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024,
            max_buffer_size: 1024 * 1024,
            max_num_streams: 1000,
            max_pending_inbound_streams: 100,
            window_update_timeout: Duration::from_secs(30),
            keep_alive: true,
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(60),
            lazy_open: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Set the initial per-stream receive window.
    ///
    /// # Panics
    ///
    /// If `n` is zero or exceeds the window ceiling.
    pub fn set_receive_window(&mut self, n: u32) -> &mut Self {
        assert!(n > 0 && n <= self.max_window_size);
        self.receive_window = n;
        self
    }

    /// Set the ceiling the receive window may be auto-tuned up to.
    pub fn set_max_window_size(&mut self, n: u32) -> &mut Self {
        assert!(n >= self.receive_window);
        self.max_window_size = n;
        self
    }

    /// Set the max. buffer size per stream.
    pub fn set_max_buffer_size(&mut self, n: usize) -> &mut Self {
        self.max_buffer_size = n;
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

    /// Enable or disable keep-alive pings.
    pub fn set_keep_alive(&mut self, enabled: bool) -> &mut Self {
        self.keep_alive = enabled;
        self
    }

    /// Set the keep-alive cadence.
    ///
    /// # Panics
    ///
    /// If `timeout < interval`.
    pub fn set_keep_alive_cadence(&mut self, interval: Duration, timeout: Duration) -> &mut Self {
        assert!(timeout >= interval);
        self.keep_alive_interval = interval;
        self.keep_alive_timeout = timeout;
        self
    }

    /// Set the time a writer waits for a window update before failing.
    pub fn set_window_update_timeout(&mut self, d: Duration) -> &mut Self {
        self.window_update_timeout = d;
        self
    }

    /// When enabled, opening an outbound stream sends no frame by itself;
    /// the first data frame carries the SYN flag instead.
    pub fn set_lazy_open(&mut self, enabled: bool) -> &mut Self {
        self.lazy_open = enabled;
        self
    }
}

/// A yamux connection bundled with the identity and addressing information
/// of the secured socket it upgrades.
pub struct Yamux<C: SplitEx> {
    /// The connection, until its driver task is taken.
    connection: Option<Connection<C>>,
    control: Control,
    id: connection::Id,
    la: Option<String>,
    ra: String,
    local_peer: PeerId,
    remote_peer: PeerId,
}

impl<C: ConnectionInfo + SecureInfo + SplittableReadWrite> Yamux<C> {
    /// Create a new yamux connection.
    pub fn new(io: C, cfg: Config, mode: Mode) -> Self {
        // `io` moves into the connection; copy the identity info first
        let la = io.local_addr();
        let ra = io.remote_addr();
        let local_peer = io.local_peer();
        let remote_peer = io.remote_peer();
        let conn = Connection::new(io, cfg, mode);
        let id = conn.id();
        let control = conn.control();
        Yamux { connection: Some(conn), control, id, la, ra, local_peer, remote_peer }
    }
}

impl<C: SplitEx> Clone for Yamux<C> {
    fn clone(&self) -> Self {
        Yamux {
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

impl<C: SplitEx> fmt::Debug for Yamux<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Yamux")
            .field("id", &self.id)
            .field("ra", &self.ra)
            .field("remote_peer", &self.remote_peer)
            .finish()
    }
}

impl<C: SplitEx> SecureInfo for Yamux<C> {
    fn local_peer(&self) -> PeerId {
        self.local_peer.clone()
    }

    fn remote_peer(&self) -> PeerId {
        self.remote_peer.clone()
    }
}

impl<C: SplitEx> ConnectionInfo for Yamux<C> {
    fn local_addr(&self) -> Option<String> {
        self.la.clone()
    }

    fn remote_addr(&self) -> String {
        self.ra.clone()
    }
}

impl StreamInfo for Stream {
    fn id(&self) -> u64 {
        Stream::id(self).val() as u64
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

impl<C: ConnectionInfo + SecureInfo + SplittableReadWrite> StreamMuxerEx for Yamux<C> {}

#[async_trait]
impl<C: ConnectionInfo + SecureInfo + SplittableReadWrite> StreamMuxer for Yamux<C> {
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
        vec![b"/yamux/1.0.0"]
    }
}

#[async_trait]
impl<T> Upgrader<T> for Config
where
    T: ConnectionInfo + SecureInfo + SplittableReadWrite,
{
    type Output = Yamux<T>;

    async fn upgrade_inbound(
        self,
        socket: T,
        _info: <Self as UpgradeInfo>::Info,
    ) -> Result<Self::Output, TransportError> {
        trace!("upgrading yamux inbound");
        Ok(Yamux::new(socket, self, Mode::Server))
    }

    async fn upgrade_outbound(
        self,
        socket: T,
        _info: <Self as UpgradeInfo>::Info,
    ) -> Result<Self::Output, TransportError> {
        trace!("upgrading yamux outbound");
        Ok(Yamux::new(socket, self, Mode::Client))
    }
}

impl From<ConnectionError> for TransportError {
    fn from(e: ConnectionError) -> Self {
        TransportError::StreamMuxerError(Box::new(e))
    }
}
