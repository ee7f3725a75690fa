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
use std::mem;

use rp2p_traits::{ReadEx, WriteEx};

use super::header::{self, Header, Tag, HEADER_SIZE};
use super::Frame;
use crate::connection::Id;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// The frame-decoding half of a connection.
///
/// Received bytes accumulate in an internal buffer, so a `recv_frame`
/// future cancelled at an await point (the event loop races it against
/// command channels) never loses partial input.
pub(crate) struct FrameReader<R> {
    id: Id,
    io: R,
    max_frame_size: usize,
    buf: Vec<u8>,
    header: Option<Header>,
}

impl<R: ReadEx> FrameReader<R> {
    pub(crate) fn new(id: Id, io: R, max_frame_size: usize) -> Self {
        FrameReader { id, io, max_frame_size, buf: Vec::new(), header: None }
    }

    /// Receive the next frame. `Ok(None)` signals a clean EOF at a frame
    /// boundary; EOF inside a frame is an error.
    pub(crate) async fn recv_frame(&mut self) -> Result<Option<Frame>, FrameDecodeError> {
        loop {
            if let Some(pending) = &self.header {
                let len = if pending.tag() == Tag::Data { pending.length() as usize } else { 0 };
                if self.buf.len() >= len {
                    let header = self.header.take().expect("header was just matched");
                    let body = if self.buf.len() == len {
                        mem::take(&mut self.buf)
                    } else {
                        self.buf.drain(..len).collect()
                    };
                    return Ok(Some(Frame { header, body }));
                }
            } else if self.buf.len() >= HEADER_SIZE {
                let mut hdr = [0u8; HEADER_SIZE];
                hdr.copy_from_slice(&self.buf[..HEADER_SIZE]);
                self.buf.drain(..HEADER_SIZE);
                let header = header::decode(&hdr)?;
                log::trace!("{}: received: {}", self.id, header);
                if header.tag() == Tag::Data && header.length() as usize > self.max_frame_size {
                    return Err(FrameDecodeError::FrameTooLarge(header.length() as usize));
                }
                self.header = Some(header);
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = self.io.read2(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() && self.header.is_none() {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// The frame-encoding half of a connection.
///
/// This is the single write path of the connection: every frame of every
/// stream is serialized here, so frames never interleave on the wire.
pub(crate) struct FrameWriter<W> {
    id: Id,
    io: W,
}

impl<W: WriteEx> FrameWriter<W> {
    pub(crate) fn new(id: Id, io: W) -> Self {
        FrameWriter { id, io }
    }

    pub(crate) async fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        log::trace!("{}: sending: {}", self.id, frame.header);
        let hdr = header::encode(&frame.header);
        self.io.write_all2(&hdr).await?;
        if !frame.body.is_empty() {
            self.io.write_all2(&frame.body).await?;
        }
        self.io.flush2().await
    }

    pub(crate) async fn close(&mut self) -> io::Result<()> {
        self.io.close2().await
    }
}

/// Possible errors while decoding a frame.
#[non_exhaustive]
#[derive(Debug)]
pub enum FrameDecodeError {
    /// An I/O error.
    Io(io::Error),
    /// Decoding the frame header failed.
    Header(header::HeaderDecodeError),
    /// A data frame body exceeds the configured maximum.
    FrameTooLarge(usize),
}

impl std::fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FrameDecodeError::Io(e) => write!(f, "i/o error: {}", e),
            FrameDecodeError::Header(e) => write!(f, "decode error: {}", e),
            FrameDecodeError::FrameTooLarge(n) => write!(f, "frame body is too large ({})", n),
        }
    }
}

impl std::error::Error for FrameDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameDecodeError::Io(e) => Some(e),
            FrameDecodeError::Header(e) => Some(e),
            FrameDecodeError::FrameTooLarge(_) => None,
        }
    }
}

impl From<io::Error> for FrameDecodeError {
    fn from(e: io::Error) -> Self {
        FrameDecodeError::Io(e)
    }
}

impl From<header::HeaderDecodeError> for FrameDecodeError {
    fn from(e: header::HeaderDecodeError) -> Self {
        FrameDecodeError::Header(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::header::StreamId;
    use async_std::task;
    use rp2p_core::transport::memory;
    use rp2p_traits::SplitEx;

    #[test]
    fn frame_roundtrip_over_a_pipe() {
        task::block_on(async {
            let (a, b) = memory::pipe("/memory/1", "/memory/2");
            let (_ar, aw) = a.split();
            let (br, _bw) = b.split();
            let id = Id::random();
            let mut writer = FrameWriter::new(id, aw);
            let mut reader = FrameReader::new(id, br, 1024 * 1024);

            let frames = vec![
                Frame::data(StreamId::new(1), b"hello".to_vec()),
                Frame::window_update(StreamId::new(1), 4096),
                Frame::ping(7),
                Frame::close_stream(StreamId::new(1)),
            ];
            for frame in &frames {
                writer.send_frame(frame).await.unwrap();
            }
            for frame in &frames {
                assert_eq!(&reader.recv_frame().await.unwrap().unwrap(), frame);
            }

            writer.close().await.unwrap();
            assert!(reader.recv_frame().await.unwrap().is_none());
        });
    }

    #[test]
    fn oversized_data_frame_is_rejected() {
        task::block_on(async {
            let (a, b) = memory::pipe("/memory/1", "/memory/2");
            let (_ar, aw) = a.split();
            let (br, _bw) = b.split();
            let id = Id::random();
            let mut writer = FrameWriter::new(id, aw);
            let mut reader = FrameReader::new(id, br, 16);

            writer.send_frame(&Frame::data(StreamId::new(1), vec![0u8; 32])).await.unwrap();
            assert!(matches!(
                reader.recv_frame().await,
                Err(FrameDecodeError::FrameTooLarge(32))
            ));
        });
    }
}
