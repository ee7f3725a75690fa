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

//! Asynchronous byte-stream traits used throughout the rp2p stack.
//!
//! Every layer of the stack — raw transport connections, the private-network
//! wrapper, secured connections, and the logical streams produced by a
//! multiplexer — speaks [`ReadEx`] and [`WriteEx`]. They are `async-trait`
//! traits rather than poll-based ones, so implementations are plain `async fn`
//! bodies and composition is ordinary function calls.

use async_trait::async_trait;
use std::io;

/// The read half of an asynchronous byte stream.
///
/// `read2` suspends until at least one byte is available, the remote closed
/// its write half (`Ok(0)`), or an error occurred.
#[async_trait]
pub trait ReadEx: Send {
    /// Read some bytes into `buf`, returning how many were read.
    ///
    /// A return value of `Ok(0)` means EOF, unless `buf` is empty.
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read the exact number of bytes required to fill `buf`.
    ///
    /// EOF before `buf` is full yields `ErrorKind::UnexpectedEof`.
    async fn read_exact2(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let n = self.read2(&mut buf[offset..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            offset += n;
        }
        Ok(())
    }
}

/// The write half of an asynchronous byte stream.
#[async_trait]
pub trait WriteEx: Send {
    /// Write some bytes from `buf`, returning how many were written.
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Write all of `buf`.
    async fn write_all2(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let n = self.write2(&buf[offset..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            offset += n;
        }
        Ok(())
    }

    /// Flush buffered data down to the underlying transport.
    async fn flush2(&mut self) -> io::Result<()>;

    /// Close the write half. Idempotent.
    async fn close2(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<T: ReadEx + Send + ?Sized> ReadEx for &mut T {
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read2(buf).await
    }
}

#[async_trait]
impl<T: WriteEx + Send + ?Sized> WriteEx for &mut T {
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write2(buf).await
    }

    async fn flush2(&mut self) -> io::Result<()> {
        (**self).flush2().await
    }

    async fn close2(&mut self) -> io::Result<()> {
        (**self).close2().await
    }
}

#[async_trait]
impl<T: ReadEx + Send + ?Sized> ReadEx for Box<T> {
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read2(buf).await
    }
}

#[async_trait]
impl<T: WriteEx + Send + ?Sized> WriteEx for Box<T> {
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write2(buf).await
    }

    async fn flush2(&mut self) -> io::Result<()> {
        (**self).flush2().await
    }

    async fn close2(&mut self) -> io::Result<()> {
        (**self).close2().await
    }
}

/// Splitting a duplex stream into independently owned halves.
///
/// Muxer connections split their socket so that the frame-receiving future
/// and the frame-sending path can be owned by different parts of the event
/// loop without sharing a borrow.
pub trait SplitEx {
    type Reader: ReadEx + Unpin + Send + 'static;
    type Writer: WriteEx + Unpin + Send + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Convenience umbrella for a duplex, splittable byte stream.
pub trait SplittableReadWrite: ReadEx + WriteEx + SplitEx + Unpin + Send + 'static {}

impl<T: ReadEx + WriteEx + SplitEx + Unpin + Send + 'static> SplittableReadWrite for T {}

/// Copy all bytes from `reader` to `writer` until EOF.
///
/// Returns the number of bytes copied. The writer is flushed but not closed.
pub async fn copy<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: ReadEx,
    W: WriteEx,
{
    let mut buf = vec![0u8; 8 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read2(&mut buf).await?;
        if n == 0 {
            writer.flush2().await?;
            return Ok(total);
        }
        writer.write_all2(&buf[..n]).await?;
        total += n as u64;
    }
}
