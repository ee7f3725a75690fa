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
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::{select, FutureExt, SinkExt};
use futures_timer::Delay;

use rp2p_traits::{ReadEx, WriteEx};

use crate::chunks::Chunks;
use crate::connection::{self, StreamCommand};
use crate::frame::header::StreamId;
use crate::frame::Frame;
use crate::Config;

/// The state of a yamux stream.
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
    /// Can we receive messages over this stream?
    pub fn can_read(self) -> bool {
        !matches!(self, State::RecvClosed | State::Closed)
    }

    /// Can we send messages over this stream?
    pub fn can_write(self) -> bool {
        !matches!(self, State::SendClosed | State::Closed)
    }
}

/// A flag still to be set on the stream's next outbound frame header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Flag {
    None,
    /// The stream was opened lazily; the first frame carries SYN.
    Syn,
    /// The stream was accepted and admitted; the first frame carries ACK.
    Ack,
}

/// Set a pending SYN or ACK flag on an outbound frame.
pub(crate) fn apply_flag(frame: &mut Frame, flag: Flag) {
    match flag {
        Flag::None => {}
        Flag::Syn => frame.header.syn(),
        Flag::Ack => frame.header.ack(),
    }
}

/// A multiplexed yamux stream.
///
/// Streams are created outbound via [`Control::open_stream`][ctl] or
/// inbound via [`Control::accept_stream`][ctl]. A `Stream` is a cheap
/// handle; clones share the same stream state.
///
/// [ctl]: crate::connection::Control
pub struct Stream {
    id: StreamId,
    conn: connection::Id,
    config: Arc<Config>,
    sender: mpsc::Sender<StreamCommand>,
    protocol: Arc<Mutex<Option<String>>>,
    shared: Arc<Mutex<Shared>>,
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Stream {
            id: self.id,
            conn: self.conn,
            config: self.config.clone(),
            sender: self.sender.clone(),
            protocol: self.protocol.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id.val())
            .field("connection", &self.conn)
            .finish()
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "(Stream {}/{})", self.conn, self.id.val())
    }
}

/// Outcome of the synchronous, mutex-guarded portion of `read_stream`.
enum ReadStep {
    Return(io::Result<usize>),
    SendUpdate { n: usize, credit: u32, flag: Flag },
    Park(oneshot::Receiver<()>),
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        conn: connection::Id,
        config: Arc<Config>,
        window: u32,
        credit: u32,
        sender: mpsc::Sender<StreamCommand>,
        rtt: Arc<Mutex<Option<Duration>>>,
    ) -> Self {
        let window_cap = config.max_window_size;
        Stream {
            id,
            conn,
            config,
            sender,
            protocol: Arc::new(Mutex::new(None)),
            shared: Arc::new(Mutex::new(Shared::new(window, credit, window_cap, rtt))),
        }
    }

    /// Get this stream's identifier.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The application protocol negotiated on this stream, if any.
    pub fn protocol(&self) -> Option<String> {
        self.protocol.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record the application protocol negotiated on this stream.
    pub fn set_protocol(&self, protocol: &str) {
        *self.protocol.lock().unwrap_or_else(|e| e.into_inner()) = Some(protocol.to_string());
    }

    /// Get this stream's state.
    pub fn state(&self) -> State {
        self.shared().state()
    }

    pub(crate) fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_flag(&self, flag: Flag) {
        self.shared().flag = flag;
    }

    pub(crate) fn strong_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    fn conn_closed_err(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::WriteZero,
            format!("{}/{}: connection is closed", self.conn, self.id),
        )
    }

    // Split out of `read_stream` so the `MutexGuard` returned by `self.shared()`
    // never appears as a local in the async fn's generator state: holding it
    // across an `.await` would make the future non-`Send`, even though it is
    // always dropped before any `.await` point in practice.
    fn read_stream_sync(&self, buf: &mut [u8]) -> ReadStep {
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
            log::trace!("{}/{}: read {} bytes", self.conn, self.id, n);
            let update = shared.next_window_update();
            let flag = if update.is_some() { shared.take_flag() } else { Flag::None };
            drop(shared);
            if let Some(credit) = update {
                return ReadStep::SendUpdate { n, credit, flag };
            }
            return ReadStep::Return(Ok(n));
        }
        if shared.is_reset {
            if shared.overflowed {
                return ReadStep::Return(Err(io::Error::new(io::ErrorKind::Other, "read buffer overflow")));
            }
            log::debug!("{}/{}: stream reset", self.conn, self.id);
            return ReadStep::Return(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if shared.conn_closed {
            return ReadStep::Return(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection is closed",
            )));
        }
        if !shared.state().can_read() {
            log::debug!("{}/{}: eof", self.conn, self.id);
            return ReadStep::Return(Ok(0));
        }
        let (tx, rx) = oneshot::channel();
        shared.readers.push_back(tx);
        ReadStep::Park(rx)
    }

    async fn read_stream(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.read_stream_sync(buf) {
                ReadStep::Return(result) => return result,
                ReadStep::SendUpdate { n, credit, flag } => {
                    log::trace!("{}/{}: sending window update ({})", self.conn, self.id, credit);
                    let mut frame = Frame::window_update(self.id, credit);
                    apply_flag(&mut frame, flag);
                    self.sender
                        .send(StreamCommand::SendFrame(frame))
                        .await
                        .map_err(|_| self.conn_closed_err())?;
                    return Ok(n);
                }
                ReadStep::Park(parked) => {
                    // Parked until data arrives or the stream ends. A dropped sender
                    // (connection teardown) wakes us as well; the loop re-checks.
                    let _ = parked.await;
                }
            }
        }
    }

    async fn write_stream(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        enum Action {
            Reserved(usize, Flag),
            Park(oneshot::Receiver<()>),
        }
        loop {
            let action = {
                let mut shared = self.shared();
                if shared.is_reset || !shared.state().can_write() {
                    log::debug!("{}/{}: can no longer write", self.conn, self.id);
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("{}/{}: stream is closed for writing", self.conn, self.id),
                    ));
                }
                if shared.credit == 0 {
                    log::debug!("{}/{}: no more credit, awaiting window update", self.conn, self.id);
                    let (tx, rx) = oneshot::channel();
                    shared.writers.push_back(tx);
                    Action::Park(rx)
                } else {
                    // Reservation and decrement happen in one critical
                    // section so concurrent writers cannot oversubscribe.
                    let k = (shared.credit as usize)
                        .min(buf.len())
                        .min(self.config.max_message_size);
                    shared.credit -= k as u32;
                    Action::Reserved(k, shared.take_flag())
                }
            };
            match action {
                Action::Reserved(k, flag) => {
                    let mut frame = Frame::data(self.id, buf[..k].to_vec());
                    apply_flag(&mut frame, flag);
                    log::trace!("{}/{}: write {} bytes", self.conn, self.id, k);
                    self.sender
                        .send(StreamCommand::SendFrame(frame))
                        .await
                        .map_err(|_| self.conn_closed_err())?;
                    return Ok(k);
                }
                Action::Park(rx) => {
                    let mut rx = rx;
                    let mut timeout = Delay::new(self.config.window_update_timeout).fuse();
                    select! {
                        _ = rx => {}
                        _ = timeout => {
                            log::error!("{}/{}: window update timed out", self.conn, self.id);
                            return Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "window update timeout",
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn close_stream(&mut self) -> io::Result<()> {
        let flag = {
            let mut shared = self.shared();
            if shared.is_reset || !shared.state().can_write() {
                return Ok(());
            }
            let flag = shared.take_flag();
            shared.update_state(self.conn, self.id, State::SendClosed);
            flag
        };
        log::trace!("{}/{}: close", self.conn, self.id);
        self.sender
            .send(StreamCommand::CloseStream { id: self.id, flag })
            .await
            .map_err(|_| self.conn_closed_err())?;
        Ok(())
    }

    /// Locally shut the read half. Buffered data is discarded and pending
    /// readers observe EOF; the write half is unaffected.
    pub(crate) fn close_read_local(&self) {
        let mut shared = self.shared();
        shared.buffer.clear();
        shared.update_state(self.conn, self.id, State::RecvClosed);
        shared.wake_all_readers();
    }

    pub(crate) async fn reset_stream(&mut self) -> io::Result<()> {
        let already_closed = {
            let mut shared = self.shared();
            if shared.is_reset || shared.state() == State::Closed {
                true
            } else {
                shared.is_reset = true;
                shared.buffer.clear();
                shared.update_state(self.conn, self.id, State::Closed);
                shared.wake_all_readers();
                shared.wake_all_writers();
                false
            }
        };
        if !already_closed {
            log::trace!("{}/{}: reset", self.conn, self.id);
            // best-effort; the connection may already be gone
            let _ = self.sender.send(StreamCommand::ResetStream { id: self.id }).await;
        }
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        log::trace!("{}/{}: dropping stream handle", self.conn, self.id);
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
    /// The stream was aborted, locally or by the remote.
    pub(crate) is_reset: bool,
    /// The reset was caused by a local read-buffer overflow.
    pub(crate) overflowed: bool,
    /// The whole connection was closed under this stream.
    conn_closed: bool,
    flag: Flag,
    /// Receive window: credit we have extended to the remote.
    pub(crate) window: u32,
    /// Send window: credit the remote has extended to us.
    pub(crate) credit: u32,
    /// Auto-tuned ceiling the receive window is replenished to.
    max_recv_window: u32,
    window_cap: u32,
    last_window_update: Option<Instant>,
    pub(crate) buffer: Chunks,
    readers: VecDeque<oneshot::Sender<()>>,
    writers: VecDeque<oneshot::Sender<()>>,
    rtt: Arc<Mutex<Option<Duration>>>,
}

impl Shared {
    fn new(window: u32, credit: u32, window_cap: u32, rtt: Arc<Mutex<Option<Duration>>>) -> Self {
        Shared {
            state: State::Open,
            is_reset: false,
            overflowed: false,
            conn_closed: false,
            flag: Flag::None,
            window,
            credit,
            max_recv_window: window,
            window_cap,
            last_window_update: None,
            buffer: Chunks::new(),
            readers: VecDeque::new(),
            writers: VecDeque::new(),
            rtt,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn take_flag(&mut self) -> Flag {
        mem::replace(&mut self.flag, Flag::None)
    }

    /// Update the stream state and return the state before the update.
    pub(crate) fn update_state(
        &mut self,
        cid: connection::Id,
        sid: StreamId,
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

        log::trace!("{}/{}: update state: ({:?} {:?} {:?})", cid, sid, current, next, self.state);

        current
    }

    /// Resume the longest-waiting reader, if any.
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

    pub(crate) fn wake_all_writers(&mut self) {
        for tx in self.writers.drain(..) {
            let _ = tx.send(());
        }
    }

    /// Mark the stream reset by the remote or the connection.
    pub(crate) fn reset(&mut self) {
        self.is_reset = true;
        self.state = State::Closed;
        self.buffer.clear();
        self.wake_all_readers();
        self.wake_all_writers();
    }

    /// Mark the stream reset because its read buffer overflowed.
    pub(crate) fn overflow(&mut self) {
        self.overflowed = true;
        self.reset();
    }

    /// Mark the stream terminated by an orderly connection close. Buffered
    /// data remains readable; parked waiters resume with a closed error.
    pub(crate) fn closed_by_connection(&mut self) {
        self.state = State::Closed;
        self.conn_closed = true;
        self.wake_all_readers();
        self.wake_all_writers();
    }

    /// Decide whether a window update is due, per the on-read discipline:
    /// once the consumed-but-unacknowledged byte count reaches half the
    /// ceiling, replenish the window up to the ceiling.
    ///
    /// The ceiling doubles (up to the connection-wide cap) whenever updates
    /// are emitted more often than once every two round trips, so that a
    /// fast link is not throttled by a window sized for a slow one. It
    /// never shrinks.
    pub(crate) fn next_window_update(&mut self) -> Option<u32> {
        if self.is_reset || !self.state.can_read() {
            return None;
        }
        let buffered = self.buffer.len().min(u32::MAX as usize) as u32;
        let mut delta = self.max_recv_window.saturating_sub(buffered).saturating_sub(self.window);
        if delta < self.max_recv_window / 2 {
            return None;
        }
        let now = Instant::now();
        if let Some(last) = self.last_window_update {
            let rtt = *self.rtt.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rtt) = rtt {
                if now.duration_since(last) < rtt * 2 && self.max_recv_window < self.window_cap {
                    let doubled =
                        ((self.max_recv_window as u64) * 2).min(self.window_cap as u64) as u32;
                    log::debug!("receive window ceiling raised to {}", doubled);
                    self.max_recv_window = doubled;
                    delta =
                        self.max_recv_window.saturating_sub(buffered).saturating_sub(self.window);
                }
            }
        }
        self.window += delta;
        self.last_window_update = Some(now);
        Some(delta)
    }
}
