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

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::SinkExt;

use rp2p_traits::{ReadEx, WriteEx};

use crate::chunks::Chunks;
use crate::connection::{self, StreamCommand};
use crate::frame::{Frame, StreamKey};
use crate::Config;

/// The state of an mplex stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Open bidirectionally.
    Open,
    /// Open for incoming messages.
    SendClosed,
    /// Open for outgoing messages.
    RecvClosed,
    /// Closed (terminal state).
    Closed,
}

impl State {
    pub fn can_read(self) -> bool {
        !matches!(self, State::RecvClosed | State::Closed)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, State::SendClosed | State::Closed)
    }
}

/// A multiplexed mplex stream; a cheap handle, clones share state.
///
/// Unlike yamux there is no flow control: writes never wait for the peer,
/// and the receive side bounds memory with a hard buffer limit instead.
pub struct Stream {
    key: StreamKey,
    conn: connection::Id,
    config: Arc<Config>,
    sender: mpsc::Sender<StreamCommand>,
    name: Option<String>,
    protocol: Arc<Mutex<Option<String>>>,
    shared: Arc<Mutex<Shared>>,
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Stream {
            key: self.key,
            conn: self.conn,
            config: self.config.clone(),
            sender: self.sender.clone(),
            name: self.name.clone(),
            protocol: self.protocol.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("key", &self.key)
            .field("connection", &self.conn)
            .finish()
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "(Stream {}/{})", self.conn, self.key)
    }
}

impl Stream {
    pub(crate) fn new(
        key: StreamKey,
        conn: connection::Id,
        config: Arc<Config>,
        name: Option<String>,
        sender: mpsc::Sender<StreamCommand>,
        conn_buffered: Arc<AtomicUsize>,
    ) -> Self {
        Stream {
            key,
            conn,
            config,
            sender,
            name,
            protocol: Arc::new(Mutex::new(None)),
            shared: Arc::new(Mutex::new(Shared::new(conn_buffered))),
        }
    }

    /// The identity of this stream: wire id plus the opening side.
    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// The stream id assigned by the opener.
    pub fn id(&self) -> u64 {
        self.key.id()
    }

    /// The name carried by the NewStream frame, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The application protocol negotiated on this stream, if any.
    pub fn protocol(&self) -> Option<String> {
        self.protocol.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record the application protocol negotiated on this stream.
    pub fn set_protocol(&self, protocol: &str) {
        *self.protocol.lock().unwrap_or_else(|e| e.into_inner()) = Some(protocol.to_string());
    }

    pub fn state(&self) -> State {
        self.shared().state()
    }

    pub(crate) fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn strong_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    fn conn_closed_err(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::WriteZero,
            format!("{}/{}: connection is closed", self.conn, self.key),
        )
    }

    async fn read_stream(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let parked = {
                let mut shared = self.shared();
                if !shared.buffer.is_empty() {
                    let mut n = 0;
                    while let Some(chunk) = shared.buffer.front_mut() {
                        if chunk.is_empty() {
                            shared.buffer.pop();
                            continue;
                        }
                        let k = chunk.len().min(buf.len() - n);
                        buf[n..n + k].copy_from_slice(&chunk.as_ref()[..k]);
                        n += k;
                        chunk.advance(k);
                        if n == buf.len() {
                            break;
                        }
                    }
                    shared.conn_buffered.fetch_sub(n, Ordering::Relaxed);
                    log::trace!("{}/{}: read {} bytes", self.conn, self.key, n);
                    return Ok(n);
                }
                if shared.is_reset {
                    if shared.overflowed {
                        return Err(io::Error::new(io::ErrorKind::Other, "read buffer overflow"));
                    }
                    log::debug!("{}/{}: stream reset", self.conn, self.key);
                    return Err(io::ErrorKind::ConnectionReset.into());
                }
                if shared.conn_closed {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connection is closed",
                    ));
                }
                if !shared.state().can_read() {
                    log::debug!("{}/{}: eof", self.conn, self.key);
                    return Ok(0);
                }
                let (tx, rx) = oneshot::channel();
                shared.readers.push_back(tx);
                rx
            };
            let _ = parked.await;
        }
    }

    async fn write_stream(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        {
            let shared = self.shared();
            if shared.is_reset || !shared.state().can_write() {
                log::debug!("{}/{}: can no longer write", self.conn, self.key);
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("{}/{}: stream is closed for writing", self.conn, self.key),
                ));
            }
        }
        let k = buf.len().min(self.config.max_frame_size);
        let frame = Frame::data(self.key, buf[..k].to_vec());
        log::trace!("{}/{}: write {} bytes", self.conn, self.key, k);
        self.sender
            .send(StreamCommand::SendFrame(frame))
            .await
            .map_err(|_| self.conn_closed_err())?;
        Ok(k)
    }

    async fn close_stream(&mut self) -> io::Result<()> {
        {
            let mut shared = self.shared();
            if shared.is_reset || !shared.state().can_write() {
                return Ok(());
            }
            shared.update_state(self.conn, self.key, State::SendClosed);
        }
        log::trace!("{}/{}: close", self.conn, self.key);
        self.sender
            .send(StreamCommand::SendFrame(Frame::close(self.key)))
            .await
            .map_err(|_| self.conn_closed_err())?;
        Ok(())
    }

    /// Locally shut the read half; buffered data is discarded.
    pub(crate) fn close_read_local(&self) {
        let mut shared = self.shared();
        shared.clear_buffer();
        shared.update_state(self.conn, self.key, State::RecvClosed);
        shared.wake_all_readers();
    }

    pub(crate) async fn reset_stream(&mut self) -> io::Result<()> {
        let already_closed = {
            let mut shared = self.shared();
            if shared.is_reset || shared.state() == State::Closed {
                true
            } else {
                shared.reset();
                false
            }
        };
        if !already_closed {
            log::trace!("{}/{}: reset", self.conn, self.key);
            let _ = self.sender.send(StreamCommand::ResetStream { key: self.key }).await;
        }
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        log::trace!("{}/{}: dropping stream handle", self.conn, self.key);
    }
}

#[async_trait]
impl ReadEx for Stream {
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_stream(buf).await
    }
}

#[async_trait]
impl WriteEx for Stream {
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_stream(buf).await
    }

    async fn flush2(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn close2(&mut self) -> io::Result<()> {
        self.close_stream().await
    }
}

/// State shared between all clones of a stream and the connection.
#[derive(Debug)]
pub(crate) struct Shared {
    state: State,
    pub(crate) is_reset: bool,
    pub(crate) overflowed: bool,
    conn_closed: bool,
    pub(crate) buffer: Chunks,
    readers: VecDeque<oneshot::Sender<()>>,
    /// Bytes buffered across the whole connection, shared with the
    /// connection and every sibling stream.
    pub(crate) conn_buffered: Arc<AtomicUsize>,
}

impl Shared {
    fn new(conn_buffered: Arc<AtomicUsize>) -> Self {
        Shared {
            state: State::Open,
            is_reset: false,
            overflowed: false,
            conn_closed: false,
            buffer: Chunks::new(),
            readers: VecDeque::new(),
            conn_buffered,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    /// Update the stream state and return the state before the update.
    pub(crate) fn update_state(
        &mut self,
        cid: connection::Id,
        key: StreamKey,
        next: State,
    ) -> State {
        use self::State::*;

        let current = self.state;

        match (current, next) {
            (Closed, _) => {}
            (Open, _) => self.state = next,
            (RecvClosed, Closed) => self.state = Closed,
            (RecvClosed, Open) => {}
            (RecvClosed, RecvClosed) => {}
            (RecvClosed, SendClosed) => self.state = Closed,
            (SendClosed, Closed) => self.state = Closed,
            (SendClosed, Open) => {}
            (SendClosed, RecvClosed) => self.state = Closed,
            (SendClosed, SendClosed) => {}
        }

        log::trace!("{}/{}: update state: ({:?} {:?} {:?})", cid, key, current, next, self.state);

        current
    }

    pub(crate) fn wake_one_reader(&mut self) {
        while let Some(tx) = self.readers.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
    }

    pub(crate) fn wake_all_readers(&mut self) {
        for tx in self.readers.drain(..) {
            let _ = tx.send(());
        }
    }

    /// Discard buffered data, keeping the connection-wide accounting exact.
    pub(crate) fn clear_buffer(&mut self) {
        let len = self.buffer.len();
        if len > 0 {
            self.conn_buffered.fetch_sub(len, Ordering::Relaxed);
        }
        self.buffer.clear();
    }

    /// Mark the stream reset and discard its buffer.
    pub(crate) fn reset(&mut self) {
        self.is_reset = true;
        self.state = State::Closed;
        self.clear_buffer();
        self.wake_all_readers();
    }

    /// Mark the stream reset because its read buffer overflowed.
    pub(crate) fn overflow(&mut self) {
        self.overflowed = true;
        self.reset();
    }

    /// Mark the stream terminated by an orderly connection close.
    pub(crate) fn closed_by_connection(&mut self) {
        self.state = State::Closed;
        self.conn_closed = true;
        self.wake_all_readers();
    }
}
