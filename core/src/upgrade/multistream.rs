use log::trace;

use rp2p_traits::SplittableReadWrite;

use super::{ProtocolName, UpgradeInfo, Upgrader};
use crate::multistream::Negotiator;
use crate::transport::prefixed::PrefixedIo;
use crate::transport::TransportError;

/// Drive multistream-select on behalf of an [`Upgrader`].
///
/// Inbound connections are handled with the responder state machine;
/// outbound connections use v1-lazy negotiation. Bytes the negotiation read
/// past its last message are replayed in front of the upgraded stream via
/// [`PrefixedIo`].
#[derive(Debug, Clone)]
pub struct Multistream<U> {
    inner: U,
}

impl<U> Multistream<U> {
    /// Add multistream-select on top of any [`Upgrader`].
    ///
    /// The protocols advertised first have the higher priority.
    pub fn new(inner: U) -> Self {
        Self { inner }
    }
}

impl<U: UpgradeInfo> Multistream<U> {
    fn negotiator(&self) -> (Vec<U::Info>, Negotiator) {
        let infos = self.inner.protocol_info();
        let protocols: Vec<String> =
            infos.iter().map(|i| i.protocol_name_str().into_owned()).collect();
        (infos, Negotiator::new_with_protocols(protocols))
    }

    fn match_info(
        infos: Vec<U::Info>,
        protocol: &str,
    ) -> Result<U::Info, TransportError> {
        infos
            .into_iter()
            .find(|i| i.protocol_name() == protocol.as_bytes())
            .ok_or_else(|| TransportError::Internal("negotiated an unadvertised protocol".into()))
    }
}

impl<U> Multistream<U> {
    pub async fn select_inbound<C>(self, mut socket: C) -> Result<U::Output, TransportError>
    where
        C: SplittableReadWrite,
        U: Upgrader<PrefixedIo<C>> + Send,
    {
        trace!("starting multistream select for inbound...");
        let (infos, negotiator) = self.negotiator();
        let result = negotiator.handle(&mut socket).await?;
        let info = Self::match_info(infos, &result.protocol)?;
        self.inner.upgrade_inbound(PrefixedIo::new(socket, result.remainder), info).await
    }

    pub async fn select_outbound<C>(self, mut socket: C) -> Result<U::Output, TransportError>
    where
        C: SplittableReadWrite,
        U: Upgrader<PrefixedIo<C>> + Send,
    {
        trace!("starting multistream select for outbound...");
        let (infos, negotiator) = self.negotiator();
        let result = negotiator.negotiate_lazy(&mut socket).await?;
        let info = Self::match_info(infos, &result.protocol)?;
        self.inner.upgrade_outbound(PrefixedIo::new(socket, result.remainder), info).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use crate::upgrade::{DummyUpgrader, Selector};
    use async_std::task;

    #[test]
    fn select_between_peers() {
        task::block_on(async {
            let (a, b) = memory::pipe("/memory/1", "/memory/2");

            let listener = task::spawn(async move {
                Multistream::new(DummyUpgrader::new()).select_inbound(b).await.unwrap()
            });

            let _out = Multistream::new(DummyUpgrader::new()).select_outbound(a).await.unwrap();
            let _in = listener.await;
        });
    }

    #[test]
    fn selector_dispatches_by_name() {
        task::block_on(async {
            let (a, b) = memory::pipe("/memory/1", "/memory/2");

            let listener = task::spawn(async move {
                let sel = Selector::new(DummyUpgrader::new(), DummyUpgrader::new());
                Multistream::new(sel).select_inbound(b).await.unwrap()
            });

            let sel = Selector::new(DummyUpgrader::new(), DummyUpgrader::new());
            let out = Multistream::new(sel).select_outbound(a).await.unwrap();
            assert!(matches!(out, crate::either::EitherOutput::A(_)));
            let _in = listener.await;
        });
    }
}
