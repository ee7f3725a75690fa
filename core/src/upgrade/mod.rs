//! Connection upgrades.
//!
//! An [`Upgrader`] turns a connection into a richer one: a security upgrade
//! yields an authenticated stream, a muxer upgrade yields a multiplexed
//! connection. Which upgrade runs is decided by multistream-select, driven
//! by the [`Multistream`] wrapper.

mod dummy;
mod multistream;
mod select;

pub use dummy::DummyUpgrader;
pub use multistream::Multistream;
pub use select::Selector;

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;

use crate::transport::TransportError;

/// The name a protocol advertises during negotiation.
pub trait ProtocolName {
    /// The raw protocol id, e.g. `b"/yamux/1.0.0"`.
    fn protocol_name(&self) -> &[u8];

    /// The protocol id as a string, for negotiation and logging.
    fn protocol_name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.protocol_name())
    }
}

impl ProtocolName for &'static [u8] {
    fn protocol_name(&self) -> &[u8] {
        *self
    }
}

impl ProtocolName for &'static str {
    fn protocol_name(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ProtocolName for String {
    fn protocol_name(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ProtocolName for Vec<u8> {
    fn protocol_name(&self) -> &[u8] {
        self
    }
}

/// Advertisement of the protocols an upgrade supports, in preference order.
pub trait UpgradeInfo: Send {
    type Info: ProtocolName + Clone + Send + Sync + fmt::Debug;

    fn protocol_info(&self) -> Vec<Self::Info>;
}

/// One step of the connection upgrade pipeline.
#[async_trait]
pub trait Upgrader<C>: UpgradeInfo {
    type Output: Send;

    async fn upgrade_inbound(
        self,
        socket: C,
        info: <Self as UpgradeInfo>::Info,
    ) -> Result<Self::Output, TransportError>;

    async fn upgrade_outbound(
        self,
        socket: C,
        info: <Self as UpgradeInfo>::Info,
    ) -> Result<Self::Output, TransportError>;
}
