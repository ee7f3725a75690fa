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

use std::io;

use rp2p_core::varint::{self, VarintDecodeError};
use rp2p_traits::{ReadEx, WriteEx};

use super::{Frame, Tag};
use crate::connection::Id;

/// Consumed-prefix length beyond which the receive buffer is re-based.
const COMPACT_THRESHOLD: usize = 64 * 1024;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Try to parse one frame from the front of `buf`.
///
/// `Ok(None)` means the buffer holds an incomplete frame tail; read more.
pub(crate) fn try_parse(
    buf: &[u8],
    max_frame_size: usize,
) -> Result<Option<(Frame, usize)>, FrameDecodeError> {
    let (header, hdr_len) = match varint::decode(buf) {
        Ok(v) => v,
        Err(VarintDecodeError::InsufficientData) => return Ok(None),
        Err(e) => return Err(FrameDecodeError::Varint(e)),
    };
    let flag = (header & 7) as u8;
    let tag = Tag::from_u8(flag).ok_or(FrameDecodeError::InvalidFlag(flag))?;
    let id = header >> 3;

    let (len, len_len) = match varint::decode_len(&buf[hdr_len..]) {
        Ok(v) => v,
        Err(VarintDecodeError::InsufficientData) => return Ok(None),
        Err(e) => return Err(FrameDecodeError::Varint(e)),
    };
    if len > max_frame_size {
        return Err(FrameDecodeError::FrameTooLarge(len));
    }
    let total = hdr_len + len_len + len;
    if buf.len() < total {
        return Ok(None);
    }
    let body = buf[hdr_len + len_len..total].to_vec();
    Ok(Some((Frame { id, tag, body }, total)))
}

/// The frame-decoding half of a connection.
///
/// Bytes accumulate in one growable buffer; frames are parsed greedily and
/// incomplete tails stay buffered. The consumed prefix is compacted away
/// once it exceeds 64 KiB, keeping memory bounded on long-lived
/// connections. Cancellation at the read await point loses nothing.
pub(crate) struct FrameReader<R> {
    id: Id,
    io: R,
    max_frame_size: usize,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: ReadEx> FrameReader<R> {
    pub(crate) fn new(id: Id, io: R, max_frame_size: usize) -> Self {
        FrameReader { id, io, max_frame_size, buf: Vec::new(), pos: 0 }
    }

    /// Receive the next frame. `Ok(None)` signals a clean EOF at a frame
    /// boundary.
    pub(crate) async fn recv_frame(&mut self) -> Result<Option<Frame>, FrameDecodeError> {
        loop {
            if let Some((frame, consumed)) = try_parse(&self.buf[self.pos..], self.max_frame_size)? {
                self.pos += consumed;
                self.compact();
                log::trace!("{}: received: {}", self.id, frame);
                return Ok(Some(frame));
            }
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = self.io.read2(&mut chunk).await?;
            if n == 0 {
                if self.pos == self.buf.len() {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn compact(&mut self) {
        if self.pos >= COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

/// The frame-encoding half of a connection; the single write path through
/// which every stream's frames are serialized.
pub(crate) struct FrameWriter<W> {
    id: Id,
    io: W,
}

impl<W: WriteEx> FrameWriter<W> {
    pub(crate) fn new(id: Id, io: W) -> Self {
        FrameWriter { id, io }
    }

    pub(crate) async fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        log::trace!("{}: sending: {}", self.id, frame);
        let mut out = Vec::with_capacity(frame.body.len() + 16);
        frame.encode(&mut out);
        self.io.write_all2(&out).await?;
        self.io.flush2().await
    }

    pub(crate) async fn close(&mut self) -> io::Result<()> {
        self.io.close2().await
    }
}

/// Possible errors while decoding an mplex frame.
#[non_exhaustive]
#[derive(Debug)]
pub enum FrameDecodeError {
    /// An I/O error.
    Io(io::Error),
    /// A header or length varint was malformed.
    Varint(VarintDecodeError),
    /// The header carries the reserved flag value 7.
    InvalidFlag(u8),
    /// A frame body exceeds the configured maximum.
    FrameTooLarge(usize),
}

impl std::fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FrameDecodeError::Io(e) => write!(f, "i/o error: {}", e),
            FrameDecodeError::Varint(e) => write!(f, "invalid frame header: {}", e),
            FrameDecodeError::InvalidFlag(flag) => write!(f, "invalid frame flag {}", flag),
            FrameDecodeError::FrameTooLarge(n) => write!(f, "frame body is too large ({})", n),
        }
    }
}

impl std::error::Error for FrameDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameDecodeError::Io(e) => Some(e),
            FrameDecodeError::Varint(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameDecodeError {
    fn from(e: io::Error) -> Self {
        FrameDecodeError::Io(e)
    }
}
