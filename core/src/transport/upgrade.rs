//! Transport upgrader.
//!
//! A [`TransportUpgrade`] wraps another [`Transport`] and applies an upgrade
//! — negotiated with multistream-select — to every inbound and outbound
//! connection.

use async_trait::async_trait;
use log::trace;

use rp2p_traits::SplittableReadWrite;

use super::prefixed::PrefixedIo;
use super::{Transport, TransportError, TransportListener};
use crate::upgrade::{Multistream, Upgrader};

#[derive(Debug, Copy, Clone)]
pub struct TransportUpgrade<InnerTrans, U> {
    inner: InnerTrans,
    up: U,
}

impl<InnerTrans, U> TransportUpgrade<InnerTrans, U> {
    /// Wrap a transport, adding upgrade capabilities to its connections.
    pub fn new(inner: InnerTrans, up: U) -> Self {
        TransportUpgrade { inner, up }
    }
}

#[async_trait]
impl<InnerTrans, U> Transport for TransportUpgrade<InnerTrans, U>
where
    InnerTrans: Transport + Send,
    InnerTrans::Output: SplittableReadWrite,
    U: Upgrader<PrefixedIo<InnerTrans::Output>> + Send + Clone + 'static,
{
    type Output = U::Output;
    type Listener = ListenerUpgrade<InnerTrans::Listener, U>;

    fn listen_on(self, addr: &str) -> Result<Self::Listener, TransportError> {
        let inner_listener = self.inner.listen_on(addr)?;
        Ok(ListenerUpgrade { inner: inner_listener, up: self.up })
    }

    async fn dial(self, addr: &str) -> Result<Self::Output, TransportError> {
        let socket = self.inner.dial(addr).await?;
        Multistream::new(self.up).select_outbound(socket).await
    }
}

pub struct ListenerUpgrade<InnerListener, U> {
    inner: InnerListener,
    up: U,
}

#[async_trait]
impl<InnerListener, U> TransportListener for ListenerUpgrade<InnerListener, U>
where
    InnerListener: TransportListener + Send,
    InnerListener::Output: SplittableReadWrite,
    U: Upgrader<PrefixedIo<InnerListener::Output>> + Send + Clone + 'static,
{
    type Output = U::Output;

    async fn accept(&mut self) -> Result<Self::Output, TransportError> {
        let socket = self.inner.accept().await?;
        trace!("got a new connection, upgrading...");
        Multistream::new(self.up.clone()).select_inbound(socket).await
    }

    fn listen_addr(&self) -> String {
        self.inner.listen_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use crate::upgrade::DummyUpgrader;
    use async_std::task;
    use rp2p_traits::{ReadEx, WriteEx};

    #[test]
    fn communicating_between_dialer_and_listener() {
        let msg = [1u8, 2, 3];

        task::block_on(async move {
            let t1 = TransportUpgrade::new(MemoryTransport, DummyUpgrader::new());
            let mut listener = t1.listen_on("/memory/0").unwrap();
            let addr = listener.listen_addr();

            let listener_side = task::spawn(async move {
                let mut socket = listener.accept().await.unwrap();
                let mut buf = [0u8; 3];
                socket.read_exact2(&mut buf).await.unwrap();
                buf
            });

            let t2 = TransportUpgrade::new(MemoryTransport, DummyUpgrader::new());
            let mut socket = t2.dial(&addr).await.unwrap();
            socket.write_all2(&msg).await.unwrap();

            assert_eq!(listener_side.await, msg);
        });
    }
}
