//! A byte-stream wrapper serving pushed-back bytes before the real stream.
//!
//! Multistream-select may read past the final negotiation message when the
//! remote coalesces writes. The surplus is handed to the next layer by
//! wrapping the connection in a [`PrefixedIo`].

use std::io;

use async_trait::async_trait;

use rp2p_traits::{ReadEx, SplitEx, WriteEx};

use super::ConnectionInfo;
use crate::secure_io::SecureInfo;
use crate::PeerId;

/// A connection with bytes to be replayed in front of its read stream.
pub struct PrefixedIo<T> {
    inner: T,
    prefix: Vec<u8>,
    pos: usize,
}

impl<T> PrefixedIo<T> {
    pub fn new(inner: T, prefix: Vec<u8>) -> Self {
        PrefixedIo { inner, prefix, pos: 0 }
    }

    /// Whether pushed-back bytes are still pending.
    pub fn has_prefix(&self) -> bool {
        self.pos < self.prefix.len()
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T: ReadEx> ReadEx for PrefixedIo<T> {
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.prefix[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read2(buf).await
    }
}

#[async_trait]
impl<T: WriteEx> WriteEx for PrefixedIo<T> {
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write2(buf).await
    }

    async fn flush2(&mut self) -> io::Result<()> {
        self.inner.flush2().await
    }

    async fn close2(&mut self) -> io::Result<()> {
        self.inner.close2().await
    }
}

impl<T: SplitEx> SplitEx for PrefixedIo<T> {
    type Reader = PrefixedReader<T::Reader>;
    type Writer = T::Writer;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (r, w) = self.inner.split();
        (PrefixedReader { inner: r, prefix: self.prefix, pos: self.pos }, w)
    }
}

impl<T: ConnectionInfo> ConnectionInfo for PrefixedIo<T> {
    fn local_addr(&self) -> Option<String> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> String {
        self.inner.remote_addr()
    }
}

impl<T: SecureInfo> SecureInfo for PrefixedIo<T> {
    fn local_peer(&self) -> PeerId {
        self.inner.local_peer()
    }

    fn remote_peer(&self) -> PeerId {
        self.inner.remote_peer()
    }
}

/// Read half of a split [`PrefixedIo`].
pub struct PrefixedReader<R> {
    inner: R,
    prefix: Vec<u8>,
    pos: usize,
}

#[async_trait]
impl<R: ReadEx> ReadEx for PrefixedReader<R> {
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.prefix[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read2(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use async_std::task;

    #[test]
    fn prefix_then_stream() {
        task::block_on(async {
            let (a, mut b) = memory::pipe("/memory/1", "/memory/2");
            let mut io = PrefixedIo::new(a, b"head".to_vec());
            b.write_all2(b"tail").await.unwrap();

            let mut buf = [0u8; 8];
            io.read_exact2(&mut buf).await.unwrap();
            assert_eq!(&buf, b"headtail");
            assert!(!io.has_prefix());
        });
    }
}
