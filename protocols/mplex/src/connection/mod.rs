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

//! The mplex connection.
//!
//! Same architecture as the yamux connection: an owned event loop stepped
//! by [`Connection::next_stream`], stream and control command channels, a
//! single write path. What differs is the wire format (varint framing) and
//! the absence of flow control, replaced by hard receive-buffer limits.

pub mod control;
pub mod stream;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use futures::{select, FutureExt, StreamExt};

use rp2p_traits::{SplitEx, SplittableReadWrite};

pub use control::Control;
pub use stream::{State, Stream};

use crate::error::ConnectionError;
use crate::frame::io::{FrameDecodeError, FrameReader, FrameWriter};
use crate::frame::{Frame, StreamKey, Tag, MAX_STREAM_ID};
use crate::Config;

/// The connection identifier, for log correlation.
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
    /// Abort a stream.
    ResetStream { key: StreamKey },
}

/// `Control` to `Connection` commands.
pub(crate) enum ControlCommand {
    OpenStream(oneshot::Sender<Result<Stream, ConnectionError>>),
    AcceptStream(oneshot::Sender<Result<Stream, ConnectionError>>),
    CloseConnection(oneshot::Sender<()>),
}

const MAX_COMMAND_BACKLOG: usize = 32;

pub struct Connection<T: SplitEx> {
    id: Id,
    config: Arc<Config>,
    reader: FrameReader<T::Reader>,
    writer: FrameWriter<T::Writer>,
    is_closed: bool,
    next_id: u64,
    streams: HashMap<StreamKey, Stream>,
    conn_buffered: Arc<AtomicUsize>,
    stream_sender: mpsc::Sender<StreamCommand>,
    stream_receiver: mpsc::Receiver<StreamCommand>,
    control_sender: mpsc::Sender<ControlCommand>,
    control_receiver: mpsc::Receiver<ControlCommand>,
    waiting_accepts: VecDeque<oneshot::Sender<Result<Stream, ConnectionError>>>,
    pending_inbound: VecDeque<Stream>,
    dropped_streams: Vec<StreamKey>,
}

impl<T: SplitEx> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("streams", &self.streams.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

enum Event {
    Inbound(Result<Option<Frame>, FrameDecodeError>),
    StreamCmd(Option<StreamCommand>),
    ControlCmd(Option<ControlCommand>),
}

impl<T: SplittableReadWrite> Connection<T> {
    /// Create a new connection with the default configuration.
    pub fn new(socket: T) -> Self {
        Connection::with_config(socket, Config::default())
    }

    pub fn with_config(socket: T, cfg: Config) -> Self {
        let id = Id::random();
        log::debug!("new connection: {}", id);
        let config = Arc::new(cfg);
        let (reader, writer) = socket.split();
        let (stream_sender, stream_receiver) = mpsc::channel(MAX_COMMAND_BACKLOG);
        let (control_sender, control_receiver) = mpsc::channel(MAX_COMMAND_BACKLOG);
        Connection {
            id,
            reader: FrameReader::new(id, reader, config.max_frame_size),
            writer: FrameWriter::new(id, writer),
            config,
            is_closed: false,
            next_id: 0,
            streams: HashMap::new(),
            conn_buffered: Arc::new(AtomicUsize::new(0)),
            stream_sender,
            stream_receiver,
            control_sender,
            control_receiver,
            waiting_accepts: VecDeque::new(),
            pending_inbound: VecDeque::new(),
            dropped_streams: Vec::new(),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Get a handle to manipulate this connection from other tasks.
    pub fn control(&self) -> Control {
        Control::new(self.control_sender.clone())
    }

    /// Run one step of the event loop.
    pub async fn next_stream(&mut self) -> Result<(), ConnectionError> {
        if self.is_closed {
            return Err(ConnectionError::Closed);
        }
        self.garbage_collect().await?;

        let event = {
            let next_frame = self.reader.recv_frame().fuse();
            futures::pin_mut!(next_frame);
            select! {
                res = next_frame => Event::Inbound(res),
                cmd = self.stream_receiver.next() => Event::StreamCmd(cmd),
                cmd = self.control_receiver.next() => Event::ControlCmd(cmd),
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
                let error = ConnectionError::from(e);
                self.abrupt_shutdown(&error).await;
                Err(error)
            }
            Event::StreamCmd(Some(cmd)) => self.on_stream_command(cmd).await,
            Event::StreamCmd(None) => {
                debug_assert!(false, "stream command channel closed");
                Ok(())
            }
            Event::ControlCmd(Some(cmd)) => self.on_control_command(cmd).await,
            Event::ControlCmd(None) => {
                debug_assert!(false, "control command channel closed");
                Ok(())
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        match frame.tag {
            Tag::NewStream => self.on_new_stream(frame).await,
            Tag::MessageReceiver | Tag::MessageInitiator => self.on_message(frame).await,
            Tag::CloseReceiver | Tag::CloseInitiator => {
                // receiver tags address streams we opened; initiator tags
                // streams the remote opened
                let key = match frame.tag {
                    Tag::CloseReceiver => StreamKey::outbound(frame.id),
                    _ => StreamKey::inbound(frame.id),
                };
                if let Some(s) = self.streams.get(&key) {
                    let mut shared = s.shared();
                    shared.update_state(self.id, key, State::RecvClosed);
                    shared.wake_all_readers();
                } else {
                    log::trace!("{}/{}: close for unknown stream", self.id, key);
                }
                Ok(())
            }
            Tag::ResetReceiver | Tag::ResetInitiator => {
                let key = match frame.tag {
                    Tag::ResetReceiver => StreamKey::outbound(frame.id),
                    _ => StreamKey::inbound(frame.id),
                };
                if let Some(s) = self.streams.remove(&key) {
                    log::debug!("{}/{}: remote reset the stream", self.id, key);
                    s.shared().reset();
                } else {
                    log::trace!("{}/{}: reset for unknown stream", self.id, key);
                }
                Ok(())
            }
        }
    }

    async fn on_new_stream(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let key = StreamKey::inbound(frame.id);
        if self.streams.contains_key(&key) {
            log::error!("{}/{}: remote reused a live stream id", self.id, key);
            return self.send_frame_checked(Frame::reset(key)).await;
        }
        if self.streams.len() >= self.config.max_num_streams {
            log::error!("{}: maximum number of streams reached", self.id);
            return self.send_frame_checked(Frame::reset(key)).await;
        }
        if self.waiting_accepts.is_empty()
            && self.pending_inbound.len() >= self.config.max_pending_inbound_streams
        {
            log::error!("{}: inbound stream queue is full", self.id);
            return self.send_frame_checked(Frame::reset(key)).await;
        }
        let name = if frame.body.is_empty() {
            None
        } else {
            String::from_utf8(frame.body).ok()
        };
        let stream = self.make_stream(key, name);
        log::debug!("{}: new inbound stream {}", self.id, key);
        self.streams.insert(key, stream.clone());
        self.deliver_inbound(stream);
        Ok(())
    }

    async fn on_message(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let key = match frame.tag {
            Tag::MessageReceiver => StreamKey::outbound(frame.id),
            _ => StreamKey::inbound(frame.id),
        };
        enum Action {
            None,
            Reset,
            Terminate,
        }
        let action = if let Some(s) = self.streams.get(&key) {
            let mut shared = s.shared();
            if !shared.state().can_read() || shared.is_reset {
                // data after half-close is dropped, not a violation
                log::trace!("{}/{}: data after close, discarding", self.id, key);
                Action::None
            } else if shared.buffer.len() + frame.body.len() > self.config.max_read_buffer_size {
                log::error!("{}/{}: stream read buffer overflow", self.id, key);
                shared.overflow();
                Action::Reset
            } else if self.conn_buffered.load(Ordering::Relaxed) + frame.body.len()
                > self.config.max_conn_read_buffer_size
            {
                log::error!("{}: connection read buffer overflow", self.id);
                Action::Terminate
            } else {
                if !frame.body.is_empty() {
                    self.conn_buffered.fetch_add(frame.body.len(), Ordering::Relaxed);
                    shared.buffer.push(frame.body);
                    shared.wake_one_reader();
                }
                Action::None
            }
        } else {
            log::trace!("{}/{}: data frame for unknown stream", self.id, key);
            Action::None
        };

        match action {
            Action::None => Ok(()),
            Action::Reset => {
                self.streams.remove(&key);
                self.send_frame_checked(Frame::reset(key)).await
            }
            Action::Terminate => {
                let error = ConnectionError::ReadBufferOverflow;
                self.abrupt_shutdown(&error).await;
                Err(error)
            }
        }
    }

    fn deliver_inbound(&mut self, mut stream: Stream) {
        while let Some(tx) = self.waiting_accepts.pop_front() {
            match tx.send(Ok(stream)) {
                Ok(()) => return,
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
            StreamCommand::ResetStream { key } => {
                self.streams.remove(&key);
                self.send_frame_checked(Frame::reset(key)).await
            }
        }
    }

    async fn on_control_command(&mut self, cmd: ControlCommand) -> Result<(), ConnectionError> {
        match cmd {
            ControlCommand::OpenStream(reply) => match self.open_outbound_stream() {
                Ok((stream, frame)) => {
                    let _ = reply.send(Ok(stream));
                    self.send_frame_checked(frame).await
                }
                Err(e) => {
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

    fn open_outbound_stream(&mut self) -> Result<(Stream, Frame), ConnectionError> {
        if self.streams.len() >= self.config.max_num_streams {
            log::error!("{}: maximum number of streams reached", self.id);
            return Err(ConnectionError::TooManyStreams);
        }
        if self.next_id > MAX_STREAM_ID {
            return Err(ConnectionError::NoMoreStreamIds);
        }
        let id = self.next_id;
        self.next_id += 1;
        let key = StreamKey::outbound(id);
        // outbound streams are named after their id, as js-libp2p does
        let name = id.to_string();
        let stream = self.make_stream(key, Some(name.clone()));
        self.streams.insert(key, stream.clone());
        log::debug!("{}: new outbound stream {}", self.id, key);
        Ok((stream, Frame::new_stream(id, &name)))
    }

    fn make_stream(&self, key: StreamKey, name: Option<String>) -> Stream {
        Stream::new(
            key,
            self.id,
            self.config.clone(),
            name,
            self.stream_sender.clone(),
            self.conn_buffered.clone(),
        )
    }

    async fn send_frame_checked(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if let Err(e) = self.writer.send_frame(&frame).await {
            let error = ConnectionError::Io(e);
            self.abrupt_shutdown(&error).await;
            return Err(error);
        }
        Ok(())
    }

    async fn abrupt_shutdown(&mut self, error: &ConnectionError) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        log::debug!("{}: shutting down ({})", self.id, error);
        // an orderly end of the connection is not a stream reset
        let reset = !matches!(error, ConnectionError::Closed);
        for (_, s) in self.streams.drain() {
            let mut shared = s.shared();
            if reset {
                shared.reset();
            } else {
                shared.closed_by_connection();
            }
        }
        for tx in self.waiting_accepts.drain(..) {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
        for s in self.pending_inbound.drain(..) {
            let mut shared = s.shared();
            if reset {
                shared.reset();
            } else {
                shared.closed_by_connection();
            }
        }
        let _ = self.writer.close().await;
        self.control_receiver.close();
        self.stream_receiver.close();
    }

    async fn graceful_shutdown(&mut self) {
        if self.is_closed {
            return;
        }
        log::debug!("{}: closing connection", self.id);
        // flush whatever the streams already enqueued
        while let Ok(Some(cmd)) = self.stream_receiver.try_next() {
            let frame = match cmd {
                StreamCommand::SendFrame(frame) => frame,
                StreamCommand::ResetStream { key } => Frame::reset(key),
            };
            if self.writer.send_frame(&frame).await.is_err() {
                break;
            }
        }
        self.is_closed = true;
        for (_, s) in self.streams.drain() {
            s.shared().closed_by_connection();
        }
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

    /// Announce and remove streams whose every user handle was dropped.
    async fn garbage_collect(&mut self) -> Result<(), ConnectionError> {
        let mut frames = Vec::new();
        for s in self.streams.values() {
            if s.strong_count() > 1 {
                continue;
            }
            let key = s.key();
            log::trace!("{}/{}: removing dropped stream", self.id, key);
            let frame = {
                let mut shared = s.shared();
                shared.clear_buffer();
                match shared.update_state(self.id, key, State::Closed) {
                    State::Open => Some(Frame::reset(key)),
                    State::RecvClosed => Some(Frame::close(key)),
                    State::SendClosed | State::Closed => None,
                }
            };
            if let Some(frame) = frame {
                frames.push(frame);
            }
            self.dropped_streams.push(key);
        }
        for key in self.dropped_streams.drain(..) {
            self.streams.remove(&key);
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
