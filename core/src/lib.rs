//! Core abstractions of the rp2p stack.
//!
//! The stack is organised as layers over a raw byte stream:
//!
//! - [`varint`] and [`buffered`] provide the length-delimited framing every
//!   higher protocol is built on.
//! - [`multistream`] negotiates which protocol runs on a fresh stream.
//! - [`transport`] and [`upgrade`] define how raw connections are obtained
//!   and upgraded; [`muxing`] defines what a stream multiplexer provides.
//! - [`secure_io`] carries the peer identities established by an external
//!   security handshake. A [`PeerId`] is treated as an opaque identifier;
//!   deriving it from key material is the identity layer's business.

pub mod buffered;
pub mod either;
pub mod multistream;
pub mod muxing;
mod peer_id;
pub mod secure_io;
pub mod transport;
pub mod upgrade;
pub mod varint;

pub use peer_id::PeerId;
