//! In-memory transport.
//!
//! A [`MemoryConnection`] is one endpoint of a duplex pipe built from two
//! unbounded channels of byte chunks. The transport keeps a process-wide
//! registry of listeners keyed by port, so dialing `/memory/<port>` connects
//! to the listener bound to that port. Tests for every layer of the stack
//! run over this transport.

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use log::trace;

use rp2p_traits::{ReadEx, SplitEx, WriteEx};

use super::{ConnectionInfo, Transport, TransportError, TransportListener};

type Hub = Mutex<HashMap<u64, mpsc::UnboundedSender<MemoryConnection>>>;

fn hub() -> &'static Hub {
    static HUB: OnceLock<Hub> = OnceLock::new();
    HUB.get_or_init(|| Mutex::new(HashMap::new()))
}

fn parse_memory_addr(addr: &str) -> Result<u64, TransportError> {
    addr.strip_prefix("/memory/")
        .and_then(|p| p.parse::<u64>().ok())
        .ok_or_else(|| TransportError::Unreachable(addr.to_string()))
}

/// Create a connected pair of in-memory duplex connections.
pub fn pipe(local: &str, remote: &str) -> (MemoryConnection, MemoryConnection) {
    let (a_tx, b_rx) = mpsc::unbounded();
    let (b_tx, a_rx) = mpsc::unbounded();
    let a = MemoryConnection {
        reader: MemoryReader { incoming: a_rx, leftover: Vec::new(), pos: 0 },
        writer: MemoryWriter { outgoing: a_tx },
        local_addr: local.to_string(),
        remote_addr: remote.to_string(),
    };
    let b = MemoryConnection {
        reader: MemoryReader { incoming: b_rx, leftover: Vec::new(), pos: 0 },
        writer: MemoryWriter { outgoing: b_tx },
        local_addr: remote.to_string(),
        remote_addr: local.to_string(),
    };
    (a, b)
}

/// The read half of an in-memory connection.
pub struct MemoryReader {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: Vec<u8>,
    pos: usize,
}

/// The write half of an in-memory connection.
pub struct MemoryWriter {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl ReadEx for MemoryReader {
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.leftover.len() {
            match self.incoming.next().await {
                Some(chunk) => {
                    self.leftover = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = (self.leftover.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[async_trait]
impl WriteEx for MemoryWriter {
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing
            .unbounded_send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    async fn flush2(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn close2(&mut self) -> io::Result<()> {
        self.outgoing.close_channel();
        Ok(())
    }
}

/// One endpoint of an in-memory duplex pipe.
pub struct MemoryConnection {
    reader: MemoryReader,
    writer: MemoryWriter,
    local_addr: String,
    remote_addr: String,
}

#[async_trait]
impl ReadEx for MemoryConnection {
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read2(buf).await
    }
}

#[async_trait]
impl WriteEx for MemoryConnection {
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write2(buf).await
    }

    async fn flush2(&mut self) -> io::Result<()> {
        self.writer.flush2().await
    }

    async fn close2(&mut self) -> io::Result<()> {
        self.writer.close2().await
    }
}

impl SplitEx for MemoryConnection {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (MemoryReader, MemoryWriter) {
        (self.reader, self.writer)
    }
}

impl ConnectionInfo for MemoryConnection {
    fn local_addr(&self) -> Option<String> {
        Some(self.local_addr.clone())
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }
}

/// The in-memory transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryTransport;

pub struct MemoryListener {
    port: u64,
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

#[async_trait]
impl Transport for MemoryTransport {
    type Output = MemoryConnection;
    type Listener = MemoryListener;

    fn listen_on(self, addr: &str) -> Result<Self::Listener, TransportError> {
        let mut port = parse_memory_addr(addr)?;
        let mut registry = hub().lock().expect("memory transport registry poisoned");
        if port == 0 {
            loop {
                port = rand::random::<u64>().saturating_add(1);
                if !registry.contains_key(&port) {
                    break;
                }
            }
        } else if registry.contains_key(&port) {
            return Err(TransportError::AddressOccupied(addr.to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        registry.insert(port, tx);
        trace!("memory transport listening on /memory/{}", port);
        Ok(MemoryListener { port, incoming: rx })
    }

    async fn dial(self, addr: &str) -> Result<Self::Output, TransportError> {
        let port = parse_memory_addr(addr)?;
        let sender = {
            let registry = hub().lock().expect("memory transport registry poisoned");
            registry
                .get(&port)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(addr.to_string()))?
        };
        let dialer_addr = format!("/memory/{}", rand::random::<u64>());
        let (local, remote) = pipe(&dialer_addr, addr);
        sender
            .unbounded_send(remote)
            .map_err(|_| TransportError::Unreachable(addr.to_string()))?;
        Ok(local)
    }
}

#[async_trait]
impl TransportListener for MemoryListener {
    type Output = MemoryConnection;

    async fn accept(&mut self) -> Result<Self::Output, TransportError> {
        self.incoming
            .next()
            .await
            .ok_or_else(|| TransportError::Internal("listener channel closed".to_string()))
    }

    fn listen_addr(&self) -> String {
        format!("/memory/{}", self.port)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut registry = hub().lock().expect("memory transport registry poisoned");
        registry.remove(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    #[test]
    fn pipe_roundtrip() {
        task::block_on(async {
            let (mut a, mut b) = pipe("/memory/1", "/memory/2");
            a.write_all2(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            b.read_exact2(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");

            b.write_all2(b"pong").await.unwrap();
            a.read_exact2(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });
    }

    #[test]
    fn half_close_still_delivers_buffered_data() {
        task::block_on(async {
            let (mut a, mut b) = pipe("/memory/1", "/memory/2");
            a.write_all2(b"last words").await.unwrap();
            a.close2().await.unwrap();

            let mut buf = [0u8; 10];
            b.read_exact2(&mut buf).await.unwrap();
            assert_eq!(&buf, b"last words");
            assert_eq!(b.read2(&mut buf).await.unwrap(), 0);

            // the other direction stays open
            b.write_all2(b"ok").await.unwrap();
            let mut buf = [0u8; 2];
            a.read_exact2(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ok");
        });
    }

    #[test]
    fn dial_and_accept() {
        task::block_on(async {
            let mut listener = MemoryTransport.listen_on("/memory/0").unwrap();
            let addr = listener.listen_addr();

            let dial = task::spawn(async move {
                let mut conn = MemoryTransport.dial(&addr).await.unwrap();
                conn.write_all2(b"hi").await.unwrap();
            });

            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            conn.read_exact2(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hi");
            dial.await;
        });
    }

    #[test]
    fn dialing_nobody() {
        task::block_on(async {
            let err = MemoryTransport.dial("/memory/271828182845").await.err().unwrap();
            assert!(matches!(err, TransportError::Unreachable(_)));
        });
    }
}
