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

//! The yamux connection.
//!
//! A [`Connection`] owns the socket and makes progress through repeated
//! calls to [`Connection::next_stream`], its event loop step: it decodes
//! one frame, or executes one command enqueued by a [`Stream`] or a
//! [`Control`] handle, or runs one keep-alive tick. All frames leave
//! through the single [`FrameWriter`] owned by the loop, so frames of
//! concurrent streams never interleave on the wire.

pub mod control;
pub mod stream;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::{mpsc, oneshot};
use futures::{select, FutureExt, StreamExt};
use futures_timer::Delay;

use rp2p_traits::{SplitEx, SplittableReadWrite};

pub use control::Control;
pub use stream::{State, Stream};

use crate::error::ConnectionError;
use crate::frame::header::{self, GoAwayCode, StreamId, Tag};
use crate::frame::io::{FrameDecodeError, FrameReader, FrameWriter};
use crate::frame::Frame;
use crate::Config;
use stream::Flag;

/// How the connection is used.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Mode {
    /// Client to server connection. Allocates odd stream ids.
    Client,
    /// Server to client connection. Allocates even stream ids.
    Server,
}

/// The connection identifier.
///
/// Randomly generated, this is mainly intended to improve log output.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Id(u32);

impl Id {
    pub(crate) fn random() -> Self {
        Id(rand::random())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// `Stream` to `Connection` commands.
#[derive(Debug)]
pub(crate) enum StreamCommand {
    /// A frame to be sent to the remote.
    SendFrame(Frame),
    /// Half-close a stream, carrying a still-pending SYN/ACK flag.
    CloseStream { id: StreamId, flag: Flag },
    /// Abort a stream.
    ResetStream { id: StreamId },
}

/// `Control` to `Connection` commands.
pub(crate) enum ControlCommand {
    OpenStream(oneshot::Sender<Result<Stream, ConnectionError>>),
    AcceptStream(oneshot::Sender<Result<Stream, ConnectionError>>),
    CloseConnection(oneshot::Sender<()>),
}

/// Capacity of the stream-to-connection command channel.
const MAX_COMMAND_BACKLOG: usize = 32;

pub struct Connection<T: SplitEx> {
    id: Id,
    mode: Mode,
    config: Arc<Config>,
    reader: FrameReader<T::Reader>,
    writer: FrameWriter<T::Writer>,
    is_closed: bool,
    next_id: u32,
    streams: HashMap<u32, Stream>,
    stream_sender: mpsc::Sender<StreamCommand>,
    stream_receiver: mpsc::Receiver<StreamCommand>,
    control_sender: mpsc::Sender<ControlCommand>,
    control_receiver: mpsc::Receiver<ControlCommand>,
    waiting_accepts: VecDeque<oneshot::Sender<Result<Stream, ConnectionError>>>,
    pending_inbound: VecDeque<Stream>,
    rtt: Arc<Mutex<Option<Duration>>>,
    pending_pings: HashMap<u32, Instant>,
    next_ping_nonce: u32,
    next_keep_alive: Delay,
    dropped_streams: Vec<u32>,
}

impl<T: SplitEx> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("streams", &self.streams.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

enum Event {
    Inbound(Result<Option<Frame>, FrameDecodeError>),
    StreamCmd(Option<StreamCommand>),
    ControlCmd(Option<ControlCommand>),
    KeepAlive,
}

impl<T: SplittableReadWrite> Connection<T> {
    /// Create a new connection over `socket`.
    ///
    /// The connection only makes progress while [`Connection::next_stream`]
    /// is driven, typically by a dedicated task.
    pub fn new(socket: T, cfg: Config, mode: Mode) -> Self {
        let id = Id::random();
        log::debug!("new connection: {} ({:?})", id, mode);
        let config = Arc::new(cfg);
        let (reader, writer) = socket.split();
        let (stream_sender, stream_receiver) = mpsc::channel(MAX_COMMAND_BACKLOG);
        let (control_sender, control_receiver) = mpsc::channel(MAX_COMMAND_BACKLOG);
        let keep_alive_interval = config.keep_alive_interval;
        Connection {
            id,
            mode,
            reader: FrameReader::new(id, reader, config.max_frame_size),
            writer: FrameWriter::new(id, writer),
            config,
            is_closed: false,
            next_id: match mode {
                Mode::Client => 1,
                Mode::Server => 2,
            },
            streams: HashMap::new(),
            stream_sender,
            stream_receiver,
            control_sender,
            control_receiver,
            waiting_accepts: VecDeque::new(),
            pending_inbound: VecDeque::new(),
            rtt: Arc::new(Mutex::new(None)),
            pending_pings: HashMap::new(),
            next_ping_nonce: 0,
            next_keep_alive: Delay::new(keep_alive_interval),
            dropped_streams: Vec::new(),
        }
    }

    /// The identifier of this connection, for log correlation.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Get a handle to manipulate this connection from other tasks.
    pub fn control(&self) -> Control {
        Control::new(self.control_sender.clone())
    }

    /// The most recent round-trip-time estimate, if a ping completed.
    pub fn rtt(&self) -> Option<Duration> {
        *self.rtt.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one step of the event loop.
    ///
    /// Drive this in a loop until it returns an error;
    /// [`ConnectionError::Closed`] signals an orderly end.
    pub async fn next_stream(&mut self) -> Result<(), ConnectionError> {
        if self.is_closed {
            return Err(ConnectionError::Closed);
        }
        self.garbage_collect().await?;

        let event = {
            let next_frame = self.reader.recv_frame().fuse();
            futures::pin_mut!(next_frame);
            let mut keep_alive = (&mut self.next_keep_alive).fuse();
            select! {
                res = next_frame => Event::Inbound(res),
                cmd = self.stream_receiver.next() => Event::StreamCmd(cmd),
                cmd = self.control_receiver.next() => Event::ControlCmd(cmd),
                _ = keep_alive => Event::KeepAlive,
            }
        };

        match event {
            Event::Inbound(Ok(Some(frame))) => self.on_frame(frame).await,
            Event::Inbound(Ok(None)) => {
                log::debug!("{}: socket eof", self.id);
                self.abrupt_shutdown(&ConnectionError::Closed).await;
                Err(ConnectionError::Closed)
            }
            Event::Inbound(Err(e)) => {
                let announce = !matches!(e, FrameDecodeError::Io(_));
                let error = ConnectionError::from(e);
                if announce {
                    let _ = self.writer.send_frame(&Frame::go_away(GoAwayCode::ProtocolError)).await;
                }
                self.abrupt_shutdown(&error).await;
                Err(error)
            }
            Event::StreamCmd(Some(cmd)) => self.on_stream_command(cmd).await,
            Event::StreamCmd(None) => {
                // we hold a sender ourselves, so this cannot happen
                debug_assert!(false, "stream command channel closed");
                Ok(())
            }
            Event::ControlCmd(Some(cmd)) => self.on_control_command(cmd).await,
            Event::ControlCmd(None) => {
                debug_assert!(false, "control command channel closed");
                Ok(())
            }
            Event::KeepAlive => self.on_keep_alive().await,
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        match frame.header.tag() {
            Tag::Data => self.on_data(frame).await,
            Tag::WindowUpdate => self.on_window_update(frame).await,
            Tag::Ping => self.on_ping(&frame).await,
            Tag::GoAway => {
                let code = frame.header.go_away_code();
                log::debug!("{}: received go-away ({:?})", self.id, code);
                let error = match code {
                    GoAwayCode::Normal => ConnectionError::Closed,
                    code => {
                        ConnectionError::Protocol(format!("remote terminated connection: {:?}", code))
                    }
                };
                self.abrupt_shutdown(&error).await;
                Err(error)
            }
        }
    }

    async fn on_data(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let stream_id = frame.header.stream_id();
        let flags = frame.header.flags();

        if flags.contains(header::RST) {
            if let Some(s) = self.streams.remove(&stream_id.val()) {
                log::debug!("{}/{}: remote reset the stream", self.id, stream_id);
                s.shared().reset();
            }
            return Ok(());
        }

        if flags.contains(header::SYN) {
            return self.on_inbound_stream(frame).await;
        }

        enum Action {
            None,
            Reset,
            Terminate,
        }
        let is_finish = flags.contains(header::FIN);
        let frame_len = frame.body.len() as u32;
        let action = if let Some(s) = self.streams.get(&stream_id.val()) {
            let mut shared = s.shared();
            if frame_len > shared.window {
                log::error!("{}/{}: frame exceeds the receive window", self.id, stream_id);
                Action::Terminate
            } else if shared.buffer.len() + frame.body.len() > self.config.max_buffer_size {
                log::error!("{}/{}: read buffer overflow", self.id, stream_id);
                shared.overflow();
                Action::Reset
            } else {
                shared.window -= frame_len;
                if !frame.body.is_empty() {
                    shared.buffer.push(frame.body);
                    shared.wake_one_reader();
                }
                if is_finish {
                    shared.update_state(self.id, stream_id, State::RecvClosed);
                    shared.wake_all_readers();
                }
                Action::None
            }
        } else {
            // Not a protocol violation: frames of a stream we dropped and
            // garbage-collected may still be in flight.
            log::trace!("{}/{}: data frame for unknown stream", self.id, stream_id);
            Action::None
        };

        match action {
            Action::None => Ok(()),
            Action::Reset => {
                self.streams.remove(&stream_id.val());
                self.send_frame_checked(Frame::reset_stream(stream_id)).await
            }
            Action::Terminate => {
                self.protocol_violation(format!("stream {} exceeded its receive window", stream_id))
                    .await
            }
        }
    }

    async fn on_window_update(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let stream_id = frame.header.stream_id();
        let flags = frame.header.flags();

        if flags.contains(header::RST) {
            if let Some(s) = self.streams.remove(&stream_id.val()) {
                log::debug!("{}/{}: remote reset the stream", self.id, stream_id);
                s.shared().reset();
            }
            return Ok(());
        }

        if flags.contains(header::SYN) {
            let credit = frame.header.credit();
            self.on_inbound_stream(Frame::new(frame.header)).await?;
            // extra credit the remote grants on top of the initial window
            if let Some(s) = self.streams.get(&stream_id.val()) {
                let mut shared = s.shared();
                shared.credit = ((shared.credit as u64 + credit as u64)
                    .min(self.config.max_window_size as u64)) as u32;
            }
            return Ok(());
        }

        if let Some(s) = self.streams.get(&stream_id.val()) {
            let mut shared = s.shared();
            // saturate in 64 bits, clamped to the window cap
            shared.credit = ((shared.credit as u64 + frame.header.credit() as u64)
                .min(self.config.max_window_size as u64)) as u32;
            if flags.contains(header::FIN) {
                shared.update_state(self.id, stream_id, State::RecvClosed);
                shared.wake_all_readers();
            }
            shared.wake_all_writers();
        } else {
            log::trace!("{}/{}: window update for unknown stream", self.id, stream_id);
        }
        Ok(())
    }

    async fn on_inbound_stream(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let Frame { header, body } = frame;
        let stream_id = header.stream_id();

        if !self.is_valid_remote_id(stream_id, header.tag()) {
            return self
                .protocol_violation(format!("invalid remote stream id {}", stream_id))
                .await;
        }
        if self.streams.contains_key(&stream_id.val()) {
            log::error!("{}/{}: remote reused a live stream id", self.id, stream_id);
            return self.send_frame_checked(Frame::reset_stream(stream_id)).await;
        }
        if self.streams.len() >= self.config.max_num_streams {
            log::error!("{}: maximum number of streams reached", self.id);
            return self.send_frame_checked(Frame::reset_stream(stream_id)).await;
        }
        if self.waiting_accepts.is_empty()
            && self.pending_inbound.len() >= self.config.max_pending_inbound_streams
        {
            log::error!("{}: inbound stream queue is full", self.id);
            return self.send_frame_checked(Frame::reset_stream(stream_id)).await;
        }
        if body.len() as u32 > self.config.receive_window {
            return self
                .protocol_violation(format!(
                    "first frame of inbound stream {} exceeds the initial window",
                    stream_id
                ))
                .await;
        }

        let stream = self.make_stream(stream_id);
        // admission succeeded; our first frame on the stream carries the ACK
        stream.set_flag(Flag::Ack);
        {
            let mut shared = stream.shared();
            shared.window -= body.len() as u32;
            if !body.is_empty() {
                shared.buffer.push(body);
            }
            if header.flags().contains(header::FIN) {
                shared.update_state(self.id, stream_id, State::RecvClosed);
            }
        }
        log::debug!("{}: new inbound stream {}", self.id, stream_id);
        self.streams.insert(stream_id.val(), stream.clone());
        self.deliver_inbound(stream);
        Ok(())
    }

    fn deliver_inbound(&mut self, mut stream: Stream) {
        while let Some(tx) = self.waiting_accepts.pop_front() {
            match tx.send(Ok(stream)) {
                Ok(()) => return,
                // that accept was cancelled; try the next waiter
                Err(returned) => match returned {
                    Ok(s) => stream = s,
                    Err(_) => return,
                },
            }
        }
        self.pending_inbound.push_back(stream);
    }

    async fn on_stream_command(&mut self, cmd: StreamCommand) -> Result<(), ConnectionError> {
        match cmd {
            StreamCommand::SendFrame(frame) => self.send_frame_checked(frame).await,
            StreamCommand::CloseStream { id, flag } => {
                let mut frame = Frame::close_stream(id);
                stream::apply_flag(&mut frame, flag);
                self.send_frame_checked(frame).await
            }
            StreamCommand::ResetStream { id } => {
                self.streams.remove(&id.val());
                self.send_frame_checked(Frame::reset_stream(id)).await
            }
        }
    }

    async fn on_control_command(&mut self, cmd: ControlCommand) -> Result<(), ConnectionError> {
        match cmd {
            ControlCommand::OpenStream(reply) => match self.open_outbound_stream() {
                Ok((stream, syn_frame)) => {
                    let _ = reply.send(Ok(stream));
                    if let Some(frame) = syn_frame {
                        self.send_frame_checked(frame).await?;
                    }
                    Ok(())
                }
                Err(e) => {
                    // a local limit, not a connection failure
                    let _ = reply.send(Err(e));
                    Ok(())
                }
            },
            ControlCommand::AcceptStream(reply) => {
                if let Some(stream) = self.pending_inbound.pop_front() {
                    let _ = reply.send(Ok(stream));
                } else {
                    self.waiting_accepts.push_back(reply);
                }
                Ok(())
            }
            ControlCommand::CloseConnection(reply) => {
                self.graceful_shutdown().await;
                let _ = reply.send(());
                Err(ConnectionError::Closed)
            }
        }
    }

    fn open_outbound_stream(&mut self) -> Result<(Stream, Option<Frame>), ConnectionError> {
        if self.streams.len() >= self.config.max_num_streams {
            log::error!("{}: maximum number of streams reached", self.id);
            return Err(ConnectionError::TooManyStreams);
        }
        let id = self.next_stream_id()?;
        let stream = self.make_stream(id);
        let syn_frame = if self.config.lazy_open {
            stream.set_flag(Flag::Syn);
            None
        } else {
            let mut frame = Frame::data(id, Vec::new());
            frame.header.syn();
            Some(frame)
        };
        self.streams.insert(id.val(), stream.clone());
        log::debug!("{}: new outbound stream {}", self.id, id);
        Ok((stream, syn_frame))
    }

    fn make_stream(&self, id: StreamId) -> Stream {
        Stream::new(
            id,
            self.id,
            self.config.clone(),
            self.config.receive_window,
            self.config.receive_window,
            self.stream_sender.clone(),
            self.rtt.clone(),
        )
    }

    fn next_stream_id(&mut self) -> Result<StreamId, ConnectionError> {
        let proposed = self.next_id;
        self.next_id = self.next_id.checked_add(2).ok_or(ConnectionError::NoMoreStreamIds)?;
        Ok(StreamId::new(proposed))
    }

    // Check if the given stream id is valid w.r.t. the tag and our mode.
    fn is_valid_remote_id(&self, id: StreamId, tag: Tag) -> bool {
        if tag == Tag::Ping || tag == Tag::GoAway {
            return id.is_session();
        }
        match self.mode {
            Mode::Client => id.is_server(),
            Mode::Server => id.is_client(),
        }
    }

    async fn on_ping(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        let header = &frame.header;
        if header.flags().contains(header::ACK) {
            if let Some(sent) = self.pending_pings.remove(&header.nonce()) {
                let rtt = sent.elapsed();
                *self.rtt.lock().unwrap_or_else(|e| e.into_inner()) = Some(rtt);
                log::trace!("{}: pong, rtt {:?}", self.id, rtt);
            }
            return Ok(());
        }
        let stream_id = header.stream_id();
        if stream_id.is_session() || self.streams.contains_key(&stream_id.val()) {
            return self.send_frame_checked(Frame::pong(header.nonce())).await;
        }
        log::trace!("{}/{}: ping for unknown stream", self.id, stream_id);
        Ok(())
    }

    async fn on_keep_alive(&mut self) -> Result<(), ConnectionError> {
        self.next_keep_alive.reset(self.config.keep_alive_interval);
        if !self.config.keep_alive {
            return Ok(());
        }
        if let Some(oldest) = self.pending_pings.values().min() {
            if oldest.elapsed() >= self.config.keep_alive_timeout {
                log::error!("{}: keep-alive timed out", self.id);
                self.abrupt_shutdown(&ConnectionError::KeepAliveTimeout).await;
                return Err(ConnectionError::KeepAliveTimeout);
            }
        }
        let nonce = self.next_ping_nonce;
        self.next_ping_nonce = self.next_ping_nonce.wrapping_add(1);
        self.pending_pings.insert(nonce, Instant::now());
        log::trace!("{}: ping {}", self.id, nonce);
        self.send_frame_checked(Frame::ping(nonce)).await
    }

    async fn send_frame_checked(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if let Err(e) = self.writer.send_frame(&frame).await {
            let error = ConnectionError::Io(e);
            self.abrupt_shutdown(&error).await;
            return Err(error);
        }
        Ok(())
    }

    async fn protocol_violation(&mut self, msg: String) -> Result<(), ConnectionError> {
        let _ = self.writer.send_frame(&Frame::go_away(GoAwayCode::ProtocolError)).await;
        let error = ConnectionError::Protocol(msg);
        self.abrupt_shutdown(&error).await;
        Err(error)
    }

    /// Tear the connection down after a fatal error: every stream is reset,
    /// every waiter resumed, the socket closed. No error is swallowed; the
    /// caller propagates `error` itself.
    async fn abrupt_shutdown(&mut self, error: &ConnectionError) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        log::debug!("{}: shutting down ({})", self.id, error);
        // an orderly end of the connection is not a stream reset
        let reset = !matches!(error, ConnectionError::Closed);
        self.drop_all_streams(reset);
        for tx in self.waiting_accepts.drain(..) {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
        for s in self.pending_inbound.drain(..) {
            if reset {
                s.shared().reset();
            } else {
                s.shared().closed_by_connection();
            }
        }
        let _ = self.writer.close().await;
        self.control_receiver.close();
        self.stream_receiver.close();
    }

    /// Orderly close: flush enqueued stream frames, announce GoAway(0),
    /// mark every stream closed and close the socket.
    async fn graceful_shutdown(&mut self) {
        if self.is_closed {
            return;
        }
        log::debug!("{}: closing connection", self.id);
        while let Ok(Some(cmd)) = self.stream_receiver.try_next() {
            let frame = match cmd {
                StreamCommand::SendFrame(frame) => frame,
                StreamCommand::CloseStream { id, flag } => {
                    let mut frame = Frame::close_stream(id);
                    stream::apply_flag(&mut frame, flag);
                    frame
                }
                StreamCommand::ResetStream { id } => Frame::reset_stream(id),
            };
            if self.writer.send_frame(&frame).await.is_err() {
                break;
            }
        }
        let _ = self.writer.send_frame(&Frame::go_away(GoAwayCode::Normal)).await;
        self.is_closed = true;
        self.drop_all_streams(false);
        for tx in self.waiting_accepts.drain(..) {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
        for s in self.pending_inbound.drain(..) {
            s.shared().closed_by_connection();
        }
        let _ = self.writer.close().await;
        self.control_receiver.close();
        self.stream_receiver.close();
    }

    fn drop_all_streams(&mut self, reset: bool) {
        for (_, s) in self.streams.drain() {
            let mut shared = s.shared();
            if reset {
                shared.reset();
            } else {
                shared.closed_by_connection();
            }
        }
    }

    /// Detect streams whose every user handle was dropped, announce their
    /// end to the remote and remove them.
    async fn garbage_collect(&mut self) -> Result<(), ConnectionError> {
        let mut frames = Vec::new();
        for s in self.streams.values() {
            if s.strong_count() > 1 {
                continue;
            }
            let id = s.id();
            log::trace!("{}/{}: removing dropped stream", self.id, id);
            let frame = {
                let mut shared = s.shared();
                match shared.update_state(self.id, id, State::Closed) {
                    // dropped without close: reset to inform the remote
                    State::Open => Some(Frame::reset_stream(id)),
                    // remote already half-closed; answer with our FIN
                    State::RecvClosed => Some(Frame::close_stream(id)),
                    State::SendClosed | State::Closed => None,
                }
            };
            if let Some(frame) = frame {
                frames.push(frame);
            }
            self.dropped_streams.push(id.val());
        }
        for id in self.dropped_streams.drain(..) {
            self.streams.remove(&id);
        }
        for frame in frames {
            self.send_frame_checked(frame).await?;
        }
        Ok(())
    }
}

impl<T: SplitEx> Drop for Connection<T> {
    fn drop(&mut self) {
        for (_, s) in self.streams.drain() {
            s.shared().reset();
        }
        for tx in self.waiting_accepts.drain(..) {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
    }
}
