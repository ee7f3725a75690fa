//! Multistream-select protocol negotiation (v1 and v1-lazy).
//!
//! Two peers holding a fresh byte stream agree on exactly one protocol
//! identifier from a prioritized list. Every message on the wire is a
//! varint-length-prefixed payload terminated by `'\n'`:
//!
//! ```text
//! initiator                       responder
//!   | encode("/multistream/1.0.0")  |
//!   |------------------------------>|
//!   |<------------------------------|  header echo
//!   | encode("/noise")              |
//!   |------------------------------>|
//!   |<------------------------------|  "na"
//!   | encode("/yamux/1.0.0")        |
//!   |------------------------------>|
//!   |<------------------------------|  "/yamux/1.0.0"
//! ```
//!
//! The v1-lazy variant sends the header and the first preference in one
//! contiguous write, succeeding in a single round trip when the responder
//! accepts. Reads are coalesced through a [`BufferedStreamReader`] so bytes
//! arriving after the final negotiation message are preserved and returned
//! as the [`NegotiationResult::remainder`].

use std::{fmt, io};

use log::{debug, trace};

use rp2p_traits::{ReadEx, WriteEx};

use crate::buffered::{BufferedStreamReader, MessageReadError};
use crate::varint;

/// The multistream-select protocol identifier.
pub const PROTOCOL_ID: &str = "/multistream/1.0.0";

/// Reserved reply: the proposed protocol is not available.
const MSG_NA: &str = "na";

/// Reserved request: list the supported protocols.
const MSG_LS: &str = "ls";

/// Hard cap on a single negotiation message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Responder-side cap on negotiation rounds, against unbounded "na" cycling.
const MAX_NEGOTIATION_ROUNDS: usize = 1000;

/// Possible multistream-select failures.
#[derive(Debug)]
pub enum NegotiationError {
    /// An I/O error on the underlying stream.
    IoError(io::Error),
    /// The peer did not speak `/multistream/1.0.0`.
    ProtocolMismatch,
    /// The peer rejected every proposed protocol.
    NoAgreement,
    /// The peer replied with something other than an echo or `na`.
    UnexpectedResponse(String),
    /// A message violated the framing rules (missing `'\n'`, embedded
    /// newline, empty, or a malformed length prefix).
    InvalidMessage,
    /// A message was not strict UTF-8.
    InvalidUtf8,
    /// A message exceeded [`MAX_MESSAGE_SIZE`].
    MessageTooLarge { size: u64, max: usize },
    /// The responder gave up after too many rounds.
    TooManyAttempts,
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NegotiationError::IoError(e) => write!(f, "i/o error: {}", e),
            NegotiationError::ProtocolMismatch => f.write_str("peer does not speak multistream-select"),
            NegotiationError::NoAgreement => f.write_str("no protocol agreed upon"),
            NegotiationError::UnexpectedResponse(s) => write!(f, "unexpected response {:?}", s),
            NegotiationError::InvalidMessage => f.write_str("invalid negotiation message"),
            NegotiationError::InvalidUtf8 => f.write_str("negotiation message is not valid utf-8"),
            NegotiationError::MessageTooLarge { size, max } => {
                write!(f, "negotiation message of {} bytes exceeds {} bytes", size, max)
            }
            NegotiationError::TooManyAttempts => f.write_str("too many negotiation attempts"),
        }
    }
}

impl std::error::Error for NegotiationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NegotiationError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NegotiationError {
    fn from(e: io::Error) -> Self {
        NegotiationError::IoError(e)
    }
}

impl From<MessageReadError> for NegotiationError {
    fn from(e: MessageReadError) -> Self {
        match e {
            MessageReadError::Io(e) => NegotiationError::IoError(e),
            MessageReadError::Varint(_) => NegotiationError::InvalidMessage,
            MessageReadError::MessageTooLarge { size, max } => {
                NegotiationError::MessageTooLarge { size, max }
            }
            MessageReadError::StreamClosed => {
                NegotiationError::IoError(io::ErrorKind::UnexpectedEof.into())
            }
        }
    }
}

/// The outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationResult {
    /// The agreed protocol identifier.
    pub protocol: String,
    /// Bytes that arrived after the last negotiation message. They belong to
    /// the next protocol layer and must be replayed in front of the stream.
    pub remainder: Vec<u8>,
}

/// Append the wire encoding of a protocol id to `out`: a varint length
/// prefix covering the id plus its terminating `'\n'`.
pub fn encode(protocol: &str, out: &mut Vec<u8>) {
    varint::encode(protocol.len() as u64 + 1, out);
    out.extend_from_slice(protocol.as_bytes());
    out.push(b'\n');
}

/// Decode one protocol id from the front of `buf`, returning the id and the
/// total number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(String, usize), NegotiationError> {
    let (len, prefix_len) = varint::decode(buf).map_err(|_| NegotiationError::InvalidMessage)?;
    if len > MAX_MESSAGE_SIZE as u64 {
        return Err(NegotiationError::MessageTooLarge { size: len, max: MAX_MESSAGE_SIZE });
    }
    let len = len as usize;
    if buf.len() < prefix_len + len {
        return Err(NegotiationError::InvalidMessage);
    }
    let id = parse_message(&buf[prefix_len..prefix_len + len])?;
    Ok((id, prefix_len + len))
}

/// Validate a raw negotiation payload and strip the trailing `'\n'`.
fn parse_message(raw: &[u8]) -> Result<String, NegotiationError> {
    match raw.split_last() {
        Some((b'\n', body)) => {
            if body.is_empty() || body.contains(&b'\n') {
                return Err(NegotiationError::InvalidMessage);
            }
            let s = std::str::from_utf8(body).map_err(|_| NegotiationError::InvalidUtf8)?;
            if s.contains('\u{FFFD}') {
                return Err(NegotiationError::InvalidUtf8);
            }
            Ok(s.to_string())
        }
        _ => Err(NegotiationError::InvalidMessage),
    }
}

async fn send_message<W: WriteEx>(io: &mut W, protocol: &str) -> Result<(), NegotiationError> {
    let mut out = Vec::with_capacity(protocol.len() + 3);
    encode(protocol, &mut out);
    io.write_all2(&out).await?;
    io.flush2().await?;
    Ok(())
}

async fn read_protocol_message<S: ReadEx>(
    reader: &mut BufferedStreamReader<S>,
) -> Result<String, NegotiationError> {
    let raw = reader.read_message(MAX_MESSAGE_SIZE).await?;
    parse_message(&raw)
}

async fn expect_header<S: ReadEx>(
    reader: &mut BufferedStreamReader<S>,
) -> Result<(), NegotiationError> {
    let header = read_protocol_message(reader).await?;
    if header != PROTOCOL_ID {
        debug!("unexpected multistream header {:?}", header);
        return Err(NegotiationError::ProtocolMismatch);
    }
    Ok(())
}

/// Driver of one multistream-select exchange over a borrowed stream.
#[derive(Debug, Clone, Default)]
pub struct Negotiator {
    protocols: Vec<String>,
}

impl Negotiator {
    pub fn new() -> Self {
        Negotiator { protocols: Vec::new() }
    }

    pub fn new_with_protocols<I>(protocols: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Negotiator { protocols: protocols.into_iter().map(Into::into).collect() }
    }

    /// Add a protocol at the end of the preference list.
    pub fn add_protocol(&mut self, protocol: impl Into<String>) {
        self.protocols.push(protocol.into());
    }

    /// Initiator-side negotiation, one round trip per candidate.
    ///
    /// Proposes each protocol in preference order until the responder echoes
    /// one back. A `na` reply moves on to the next candidate; anything else
    /// is an [`NegotiationError::UnexpectedResponse`].
    pub async fn negotiate<S>(&self, io: &mut S) -> Result<NegotiationResult, NegotiationError>
    where
        S: ReadEx + WriteEx + Send,
    {
        let mut reader = BufferedStreamReader::new(io);
        send_message(reader.get_mut(), PROTOCOL_ID).await?;
        expect_header(&mut reader).await?;
        self.propose(&mut reader, &self.protocols).await
    }

    /// Initiator-side 0-RTT negotiation.
    ///
    /// The header and the first preference go out in one contiguous write.
    /// If the responder accepts the first preference the exchange completes
    /// in a single round trip; otherwise the remaining candidates are
    /// proposed sequentially as in [`Negotiator::negotiate`].
    pub async fn negotiate_lazy<S>(&self, io: &mut S) -> Result<NegotiationResult, NegotiationError>
    where
        S: ReadEx + WriteEx + Send,
    {
        let first = match self.protocols.first() {
            Some(p) => p,
            None => return Err(NegotiationError::NoAgreement),
        };
        let mut reader = BufferedStreamReader::new(io);
        let mut out = Vec::new();
        encode(PROTOCOL_ID, &mut out);
        encode(first, &mut out);
        reader.get_mut().write_all2(&out).await?;
        reader.get_mut().flush2().await?;

        expect_header(&mut reader).await?;
        let reply = read_protocol_message(&mut reader).await?;
        if reply == *first {
            trace!("negotiated {} lazily", reply);
            return Ok(NegotiationResult { protocol: reply, remainder: reader.drain_remainder() });
        }
        if reply != MSG_NA {
            return Err(NegotiationError::UnexpectedResponse(reply));
        }
        self.propose(&mut reader, &self.protocols[1..]).await
    }

    async fn propose<S>(
        &self,
        reader: &mut BufferedStreamReader<&mut S>,
        candidates: &[String],
    ) -> Result<NegotiationResult, NegotiationError>
    where
        S: ReadEx + WriteEx + Send,
    {
        for protocol in candidates {
            send_message(reader.get_mut(), protocol).await?;
            let reply = read_protocol_message(reader).await?;
            if reply == *protocol {
                trace!("negotiated {}", reply);
                return Ok(NegotiationResult {
                    protocol: reply,
                    remainder: reader.drain_remainder(),
                });
            }
            if reply != MSG_NA {
                return Err(NegotiationError::UnexpectedResponse(reply));
            }
            trace!("{} not available, trying next candidate", protocol);
        }
        Err(NegotiationError::NoAgreement)
    }

    /// Responder-side negotiation.
    ///
    /// Echoes any supported proposal, answers `ls` with a listing, and
    /// replies `na` to everything else, for at most 1000 rounds.
    pub async fn handle<S>(&self, io: &mut S) -> Result<NegotiationResult, NegotiationError>
    where
        S: ReadEx + WriteEx + Send,
    {
        let mut reader = BufferedStreamReader::new(io);
        expect_header(&mut reader).await?;
        send_message(reader.get_mut(), PROTOCOL_ID).await?;

        for _ in 0..MAX_NEGOTIATION_ROUNDS {
            let message = read_protocol_message(&mut reader).await?;
            if message == MSG_LS {
                self.send_listing(reader.get_mut()).await?;
                continue;
            }
            if self.protocols.iter().any(|p| *p == message) {
                send_message(reader.get_mut(), &message).await?;
                trace!("accepted {}", message);
                return Ok(NegotiationResult {
                    protocol: message,
                    remainder: reader.drain_remainder(),
                });
            }
            trace!("{} not supported, replying na", message);
            send_message(reader.get_mut(), MSG_NA).await?;
        }
        Err(NegotiationError::TooManyAttempts)
    }

    /// Write the `ls` listing: one outer varint length prefix over the
    /// concatenation of `"<id>\n"` for every protocol plus a terminating
    /// `'\n'`. The inner ids are deliberately not length-prefixed.
    async fn send_listing<W: WriteEx>(&self, io: &mut W) -> Result<(), NegotiationError> {
        let mut payload = Vec::new();
        for protocol in &self.protocols {
            payload.extend_from_slice(protocol.as_bytes());
            payload.push(b'\n');
        }
        payload.push(b'\n');
        let mut out = Vec::new();
        varint::encode(payload.len() as u64, &mut out);
        out.extend_from_slice(&payload);
        io.write_all2(&out).await?;
        io.flush2().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use async_std::task;
    use quickcheck::{QuickCheck, TestResult};

    #[test]
    fn encode_decode_roundtrip() {
        fn prop(id: String) -> TestResult {
            if id.is_empty() || id.contains('\n') || id.contains('\u{FFFD}') || id.len() >= MAX_MESSAGE_SIZE {
                return TestResult::discard();
            }
            let mut buf = Vec::new();
            encode(&id, &mut buf);
            let total = buf.len();
            TestResult::from_bool(decode(&buf).unwrap() == (id, total))
        }
        QuickCheck::new().tests(500).quickcheck(prop as fn(String) -> TestResult);
    }

    #[test]
    fn rejects_bad_messages() {
        // no trailing newline
        let mut buf = Vec::new();
        varint::encode(3, &mut buf);
        buf.extend_from_slice(b"abc");
        assert!(matches!(decode(&buf), Err(NegotiationError::InvalidMessage)));

        // invalid utf-8
        let mut buf = Vec::new();
        varint::encode(3, &mut buf);
        buf.extend_from_slice(&[0xff, 0xfe, b'\n']);
        assert!(matches!(decode(&buf), Err(NegotiationError::InvalidUtf8)));

        // replacement character is rejected as well
        let msg = "a\u{FFFD}\n";
        let mut buf = Vec::new();
        varint::encode(msg.len() as u64, &mut buf);
        buf.extend_from_slice(msg.as_bytes());
        assert!(matches!(decode(&buf), Err(NegotiationError::InvalidUtf8)));
    }

    #[test]
    fn initiator_with_fallback() {
        task::block_on(async {
            let (mut a, mut b) = memory::pipe("/memory/1", "/memory/2");

            let responder = task::spawn(async move {
                let negotiator = Negotiator::new_with_protocols(vec!["/yamux/1.0.0"]);
                negotiator.handle(&mut b).await.unwrap()
            });

            // nonsense preference order, on purpose
            let negotiator = Negotiator::new_with_protocols(vec!["/noise", "/yamux/1.0.0"]);
            let result = negotiator.negotiate(&mut a).await.unwrap();
            assert_eq!(result.protocol, "/yamux/1.0.0");
            assert_eq!(result.remainder, b"");

            let server_side = responder.await;
            assert_eq!(server_side.protocol, "/yamux/1.0.0");
            assert_eq!(server_side.remainder, b"");
        });
    }

    #[test]
    fn lazy_single_round_trip() {
        task::block_on(async {
            let (mut a, mut b) = memory::pipe("/memory/1", "/memory/2");

            let responder = task::spawn(async move {
                let negotiator = Negotiator::new_with_protocols(vec!["/yamux/1.0.0"]);
                let result = negotiator.handle(&mut b).await.unwrap();
                (result, b)
            });

            let negotiator = Negotiator::new_with_protocols(vec!["/yamux/1.0.0"]);
            let result = negotiator.negotiate_lazy(&mut a).await.unwrap();
            assert_eq!(result.protocol, "/yamux/1.0.0");
            assert_eq!(result.remainder, b"");

            let (server_side, _b) = responder.await;
            assert_eq!(server_side.protocol, "/yamux/1.0.0");
        });
    }

    #[test]
    fn lazy_remainder_is_surfaced() {
        task::block_on(async {
            let (mut a, mut b) = memory::pipe("/memory/1", "/memory/2");

            // A lazy initiator may pipeline bytes of the next protocol after
            // its proposal. The responder must surface them as remainder.
            let initiator = task::spawn(async move {
                let negotiator = Negotiator::new_with_protocols(vec!["/echo/1.0.0"]);
                let result = negotiator.negotiate_lazy(&mut a).await.unwrap();
                (result, a)
            });

            let negotiator = Negotiator::new_with_protocols(vec!["/echo/1.0.0"]);
            let result = negotiator.handle(&mut b).await.unwrap();
            assert_eq!(result.protocol, "/echo/1.0.0");

            let ((initiated, mut a), remainder) = (initiator.await, result.remainder);
            assert_eq!(initiated.protocol, "/echo/1.0.0");
            // nothing was pipelined here, so the remainder is empty
            assert_eq!(remainder, b"");

            // pipelined bytes written before the responder drains arrive intact
            a.write_all2(b"early").await.unwrap();
            let mut buf = [0u8; 5];
            b.read_exact2(&mut buf).await.unwrap();
            assert_eq!(&buf, b"early");
        });
    }

    #[test]
    fn no_agreement() {
        task::block_on(async {
            let (mut a, mut b) = memory::pipe("/memory/1", "/memory/2");

            let responder = task::spawn(async move {
                let negotiator = Negotiator::new_with_protocols(vec!["/yamux/1.0.0"]);
                let _ = negotiator.handle(&mut b).await;
            });

            let negotiator = Negotiator::new_with_protocols(vec!["/noise", "/mplex/6.7.0"]);
            let err = negotiator.negotiate(&mut a).await.err().unwrap();
            assert!(matches!(err, NegotiationError::NoAgreement));
            drop(a);
            responder.await;
        });
    }

    #[test]
    fn header_mismatch() {
        task::block_on(async {
            let (mut a, mut b) = memory::pipe("/memory/1", "/memory/2");

            let fake_peer = task::spawn(async move {
                send_message(&mut b, "/gibberish/9.9.9").await.unwrap();
                b
            });

            let negotiator = Negotiator::new_with_protocols(vec!["/yamux/1.0.0"]);
            let err = negotiator.negotiate(&mut a).await.err().unwrap();
            assert!(matches!(err, NegotiationError::ProtocolMismatch));
            fake_peer.await;
        });
    }

    #[test]
    fn ls_listing_bytes() {
        task::block_on(async {
            let (mut a, mut b) = memory::pipe("/memory/1", "/memory/2");

            let responder = task::spawn(async move {
                let negotiator =
                    Negotiator::new_with_protocols(vec!["/echo/1.0.0", "/yamux/1.0.0"]);
                let _ = negotiator.handle(&mut b).await;
            });

            // speak the protocol by hand: header, then ls
            send_message(&mut a, PROTOCOL_ID).await.unwrap();
            let mut reader = BufferedStreamReader::new(&mut a);
            expect_header(&mut reader).await.unwrap();
            send_message(reader.get_mut(), MSG_LS).await.unwrap();
            let listing = reader.read_message(MAX_MESSAGE_SIZE).await.unwrap();
            assert_eq!(listing, b"/echo/1.0.0\n/yamux/1.0.0\n\n");
            drop(reader);
            drop(a);
            responder.await;
        });
    }

    #[test]
    fn ls_with_zero_protocols() {
        task::block_on(async {
            let (mut a, mut b) = memory::pipe("/memory/1", "/memory/2");

            let responder = task::spawn(async move {
                let negotiator = Negotiator::new();
                let _ = negotiator.handle(&mut b).await;
            });

            send_message(&mut a, PROTOCOL_ID).await.unwrap();
            let mut reader = BufferedStreamReader::new(&mut a);
            expect_header(&mut reader).await.unwrap();
            send_message(reader.get_mut(), MSG_LS).await.unwrap();
            // outer varint 1 wrapping a single newline, bit-for-bit
            let listing = reader.read_message(MAX_MESSAGE_SIZE).await.unwrap();
            assert_eq!(listing, b"\n");
            drop(reader);
            drop(a);
            responder.await;
        });
    }

    #[test]
    fn responder_gives_up_after_na_cycling() {
        task::block_on(async {
            let (mut a, mut b) = memory::pipe("/memory/1", "/memory/2");

            let flooder = task::spawn(async move {
                send_message(&mut a, PROTOCOL_ID).await.unwrap();
                for i in 0..1001 {
                    send_message(&mut a, &format!("/bogus/{}", i)).await.unwrap();
                }
                a
            });

            let negotiator = Negotiator::new_with_protocols(vec!["/yamux/1.0.0"]);
            let err = negotiator.handle(&mut b).await.err().unwrap();
            assert!(matches!(err, NegotiationError::TooManyAttempts));
            flooder.await;
        });
    }

    #[test]
    fn oversized_message_is_fatal() {
        task::block_on(async {
            let (mut a, mut b) = memory::pipe("/memory/1", "/memory/2");

            let flooder = task::spawn(async move {
                let mut out = Vec::new();
                varint::encode(MAX_MESSAGE_SIZE as u64 + 1, &mut out);
                a.write_all2(&out).await.unwrap();
                a
            });

            let negotiator = Negotiator::new_with_protocols(vec!["/yamux/1.0.0"]);
            let err = negotiator.handle(&mut b).await.err().unwrap();
            assert!(matches!(err, NegotiationError::MessageTooLarge { .. }));
            flooder.await;
        });
    }
}
