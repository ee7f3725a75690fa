//! Identities carried by secured connections.
//!
//! Security upgrades (noise, TLS, ...) are external to this crate. Whatever
//! they produce exposes the two peer identities through [`SecureInfo`];
//! [`SecuredStream`] is the plain adapter tying a byte stream to the
//! identities an external handshake established.

use std::io;

use async_trait::async_trait;

use rp2p_traits::{ReadEx, SplitEx, WriteEx};

use crate::transport::ConnectionInfo;
use crate::PeerId;

/// Identity information of a secured connection.
pub trait SecureInfo {
    fn local_peer(&self) -> PeerId;
    fn remote_peer(&self) -> PeerId;
}

/// A byte stream paired with the peer identities established by an external
/// security upgrade.
pub struct SecuredStream<T> {
    io: T,
    local_peer: PeerId,
    remote_peer: PeerId,
}

impl<T> SecuredStream<T> {
    pub fn new(io: T, local_peer: PeerId, remote_peer: PeerId) -> Self {
        SecuredStream { io, local_peer, remote_peer }
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

impl<T> SecureInfo for SecuredStream<T> {
    fn local_peer(&self) -> PeerId {
        self.local_peer.clone()
    }

    fn remote_peer(&self) -> PeerId {
        self.remote_peer.clone()
    }
}

impl<T: ConnectionInfo> ConnectionInfo for SecuredStream<T> {
    fn local_addr(&self) -> Option<String> {
        self.io.local_addr()
    }

    fn remote_addr(&self) -> String {
        self.io.remote_addr()
    }
}

#[async_trait]
impl<T: ReadEx> ReadEx for SecuredStream<T> {
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.read2(buf).await
    }
}

#[async_trait]
impl<T: WriteEx> WriteEx for SecuredStream<T> {
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io.write2(buf).await
    }

    async fn flush2(&mut self) -> io::Result<()> {
        self.io.flush2().await
    }

    async fn close2(&mut self) -> io::Result<()> {
        self.io.close2().await
    }
}

impl<T: SplitEx> SplitEx for SecuredStream<T> {
    type Reader = T::Reader;
    type Writer = T::Writer;

    fn split(self) -> (Self::Reader, Self::Writer) {
        self.io.split()
    }
}
