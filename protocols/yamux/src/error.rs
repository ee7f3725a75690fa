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

use std::fmt;
use std::io;

use crate::frame::io::FrameDecodeError;

/// Fatal and per-operation errors of a yamux connection.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConnectionError {
    /// An I/O error on the underlying connection.
    Io(io::Error),
    /// A received frame could not be decoded.
    Decode(FrameDecodeError),
    /// The connection is closed.
    Closed,
    /// The remote violated the protocol, or announced a violation of ours.
    Protocol(String),
    /// The maximum number of concurrent streams is reached.
    TooManyStreams,
    /// The local stream id space is exhausted.
    NoMoreStreamIds,
    /// A stream's read buffer exceeded its limit.
    ReadBufferOverflow,
    /// The remote did not answer our pings in time.
    KeepAliveTimeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "i/o error: {}", e),
            ConnectionError::Decode(e) => write!(f, "frame decode error: {}", e),
            ConnectionError::Closed => f.write_str("connection is closed"),
            ConnectionError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ConnectionError::TooManyStreams => f.write_str("maximum number of streams reached"),
            ConnectionError::NoMoreStreamIds => f.write_str("stream id space exhausted"),
            ConnectionError::ReadBufferOverflow => f.write_str("stream read buffer overflow"),
            ConnectionError::KeepAliveTimeout => f.write_str("keep-alive timed out"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<FrameDecodeError> for ConnectionError {
    fn from(e: FrameDecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<futures::channel::oneshot::Canceled> for ConnectionError {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        ConnectionError::Closed
    }
}

impl From<futures::channel::mpsc::SendError> for ConnectionError {
    fn from(_: futures::channel::mpsc::SendError) -> Self {
        ConnectionError::Closed
    }
}
