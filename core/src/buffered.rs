//! Length-prefixed message I/O over a byte stream.
//!
//! [`BufferedStreamReader`] accumulates bytes across `read2` calls so that a
//! message and its successor arriving in one chunk (the common case with
//! 0-RTT negotiation) are both consumed in order. Bytes buffered beyond the
//! last consumed message can be drained and handed to the next protocol
//! layer.

use std::{fmt, io};

use rp2p_traits::ReadEx;

use crate::varint::{self, VarintDecodeError};

/// Consumed-prefix length beyond which the internal buffer is re-based.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Granularity of reads from the underlying stream.
const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Possible errors while reading a length-prefixed message.
#[derive(Debug)]
pub enum MessageReadError {
    /// An I/O error on the underlying stream.
    Io(io::Error),
    /// The length prefix is not a valid varint.
    Varint(VarintDecodeError),
    /// The announced message length exceeds the caller's maximum.
    MessageTooLarge { size: u64, max: usize },
    /// The stream ended before a complete message was read.
    StreamClosed,
}

impl fmt::Display for MessageReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageReadError::Io(e) => write!(f, "i/o error: {}", e),
            MessageReadError::Varint(e) => write!(f, "invalid length prefix: {}", e),
            MessageReadError::MessageTooLarge { size, max } => {
                write!(f, "message of {} bytes exceeds maximum of {} bytes", size, max)
            }
            MessageReadError::StreamClosed => f.write_str("stream closed mid-message"),
        }
    }
}

impl std::error::Error for MessageReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MessageReadError::Io(e) => Some(e),
            MessageReadError::Varint(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MessageReadError {
    fn from(e: io::Error) -> Self {
        MessageReadError::Io(e)
    }
}

/// A reader of varint-length-prefixed messages which retains excess bytes.
pub struct BufferedStreamReader<S> {
    io: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S> BufferedStreamReader<S> {
    pub fn new(io: S) -> Self {
        BufferedStreamReader { io, buf: Vec::new(), pos: 0 }
    }

    /// Access the underlying stream, e.g. to write replies.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    /// Take any bytes buffered beyond the last consumed message.
    pub fn drain_remainder(&mut self) -> Vec<u8> {
        let rest = self.buf[self.pos..].to_vec();
        self.buf.clear();
        self.pos = 0;
        rest
    }

    /// Dissolve the reader into the stream and the unconsumed bytes.
    pub fn into_inner(mut self) -> (S, Vec<u8>) {
        let rest = self.drain_remainder();
        (self.io, rest)
    }

    fn compact(&mut self) {
        if self.pos >= COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

impl<S: ReadEx> BufferedStreamReader<S> {
    /// Read one message, enforcing `max_len` on the announced length before
    /// waiting for (or allocating) the body.
    pub async fn read_message(&mut self, max_len: usize) -> Result<Vec<u8>, MessageReadError> {
        loop {
            match varint::decode(&self.buf[self.pos..]) {
                Ok((len, prefix_len)) => {
                    if len > max_len as u64 {
                        return Err(MessageReadError::MessageTooLarge { size: len, max: max_len });
                    }
                    let len = len as usize;
                    if self.buf.len() - self.pos >= prefix_len + len {
                        let start = self.pos + prefix_len;
                        let msg = self.buf[start..start + len].to_vec();
                        self.pos = start + len;
                        self.compact();
                        return Ok(msg);
                    }
                }
                Err(VarintDecodeError::InsufficientData) => {}
                Err(e) => return Err(MessageReadError::Varint(e)),
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), MessageReadError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = self.io.read2(&mut chunk).await?;
        if n == 0 {
            return Err(MessageReadError::StreamClosed);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint;

    /// A reader handing out a canned byte sequence in fixed-size chunks.
    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    #[async_trait::async_trait]
    impl ReadEx for Chunked {
        async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = (self.data.len() - self.pos).min(self.chunk).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn message(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        varint::encode(payload.len() as u64, &mut out);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn reads_messages_across_chunk_boundaries() {
        async_std::task::block_on(async {
            let mut data = message(b"hello");
            data.extend(message(b"world!"));
            for chunk in [1usize, 2, 3, 7, 64] {
                let mut reader =
                    BufferedStreamReader::new(Chunked { data: data.clone(), pos: 0, chunk });
                assert_eq!(reader.read_message(1024).await.unwrap(), b"hello");
                assert_eq!(reader.read_message(1024).await.unwrap(), b"world!");
            }
        });
    }

    #[test]
    fn remainder_is_preserved() {
        async_std::task::block_on(async {
            let mut data = message(b"msg");
            data.extend_from_slice(b"tail bytes for the next layer");
            // a single large chunk delivers message and tail together
            let mut reader = BufferedStreamReader::new(Chunked { data, pos: 0, chunk: 1024 });
            assert_eq!(reader.read_message(1024).await.unwrap(), b"msg");
            assert_eq!(reader.drain_remainder(), b"tail bytes for the next layer");
            assert_eq!(reader.drain_remainder(), b"");
        });
    }

    #[test]
    fn eof_mid_message() {
        async_std::task::block_on(async {
            let mut data = message(b"truncated");
            data.truncate(data.len() - 3);
            let mut reader = BufferedStreamReader::new(Chunked { data, pos: 0, chunk: 1024 });
            assert!(matches!(
                reader.read_message(1024).await,
                Err(MessageReadError::StreamClosed)
            ));
        });
    }

    #[test]
    fn oversized_length_is_rejected_before_body_arrives() {
        async_std::task::block_on(async {
            let mut data = Vec::new();
            varint::encode(1 << 20, &mut data);
            let mut reader = BufferedStreamReader::new(Chunked { data, pos: 0, chunk: 1024 });
            assert!(matches!(
                reader.read_message(64 * 1024).await,
                Err(MessageReadError::MessageTooLarge { size, max: 65536 }) if size == 1 << 20
            ));
        });
    }
}
