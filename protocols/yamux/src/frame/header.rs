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

//! The 12-byte big-endian Yamux frame header:
//! `version(1) | type(1) | flags(2) | stream id(4) | length(4)`.

use std::fmt;

/// Size of an encoded header on the wire.
pub const HEADER_SIZE: usize = 12;

/// The yamux protocol version. Always zero.
const VERSION: u8 = 0;

/// A yamux stream identifier.
///
/// Dialers allocate odd ids, listeners even ones; id 0 addresses the
/// connection itself (ping, go-away).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

/// The stream id used for connection-level control frames.
pub const CONNECTION_ID: StreamId = StreamId(0);

impl StreamId {
    pub(crate) fn new(val: u32) -> Self {
        StreamId(val)
    }

    /// Is this the connection-control id?
    pub fn is_session(self) -> bool {
        self.0 == 0
    }

    /// Was this stream opened by the dialer?
    pub fn is_client(self) -> bool {
        self.0 % 2 == 1
    }

    /// Was this stream opened by the listener?
    pub fn is_server(self) -> bool {
        self.0 != 0 && self.0 % 2 == 0
    }

    pub fn val(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The frame type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Data = 0,
    WindowUpdate = 1,
    Ping = 2,
    GoAway = 3,
}

/// Header flags, a bitmask of SYN/ACK/FIN/RST.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(u16);

/// Open a new stream.
pub const SYN: Flags = Flags(1);
/// Acknowledge a new stream.
pub const ACK: Flags = Flags(2);
/// Half-close the sender's side of the stream.
pub const FIN: Flags = Flags(4);
/// Abort the stream.
pub const RST: Flags = Flags(8);

impl Flags {
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn val(self) -> u16 {
        self.0
    }
}

/// The reason code carried by a GoAway frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GoAwayCode {
    /// Normal termination.
    Normal,
    /// A protocol violation was detected.
    ProtocolError,
    /// An internal error occurred.
    InternalError,
    /// A code this implementation does not know.
    Unknown(u32),
}

impl GoAwayCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => GoAwayCode::Normal,
            1 => GoAwayCode::ProtocolError,
            2 => GoAwayCode::InternalError,
            c => GoAwayCode::Unknown(c),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            GoAwayCode::Normal => 0,
            GoAwayCode::ProtocolError => 1,
            GoAwayCode::InternalError => 2,
            GoAwayCode::Unknown(c) => c,
        }
    }
}

/// A decoded frame header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    tag: Tag,
    flags: Flags,
    stream_id: StreamId,
    length: u32,
}

impl Header {
    pub fn data(id: StreamId, len: u32) -> Self {
        Header { tag: Tag::Data, flags: Flags::default(), stream_id: id, length: len }
    }

    pub fn window_update(id: StreamId, credit: u32) -> Self {
        Header { tag: Tag::WindowUpdate, flags: Flags::default(), stream_id: id, length: credit }
    }

    pub fn ping(nonce: u32) -> Self {
        Header { tag: Tag::Ping, flags: Flags::default(), stream_id: CONNECTION_ID, length: nonce }
    }

    pub fn go_away(code: GoAwayCode) -> Self {
        Header {
            tag: Tag::GoAway,
            flags: Flags::default(),
            stream_id: CONNECTION_ID,
            length: code.to_u32(),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// The `length` word. Payload byte count for Data frames, credit delta
    /// for WindowUpdate, opaque nonce for Ping, reason code for GoAway.
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn credit(&self) -> u32 {
        self.length
    }

    pub fn nonce(&self) -> u32 {
        self.length
    }

    pub fn go_away_code(&self) -> GoAwayCode {
        GoAwayCode::from_u32(self.length)
    }

    pub fn syn(&mut self) {
        self.flags.set(SYN)
    }

    pub fn ack(&mut self) {
        self.flags.set(ACK)
    }

    pub fn fin(&mut self) {
        self.flags.set(FIN)
    }

    pub fn rst(&mut self) {
        self.flags.set(RST)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(Header {:?} {} (len {}) (flags {:04b}))",
            self.tag, self.stream_id, self.length, self.flags.val()
        )
    }
}

/// Encode a header into its 12-byte wire form.
pub fn encode(hdr: &Header) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0] = VERSION;
    buf[1] = hdr.tag as u8;
    buf[2..4].copy_from_slice(&hdr.flags.val().to_be_bytes());
    buf[4..8].copy_from_slice(&hdr.stream_id.0.to_be_bytes());
    buf[8..12].copy_from_slice(&hdr.length.to_be_bytes());
    buf
}

/// Decode a header from its 12-byte wire form.
pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Header, HeaderDecodeError> {
    if buf[0] != VERSION {
        return Err(HeaderDecodeError::Version(buf[0]));
    }
    let tag = match buf[1] {
        0 => Tag::Data,
        1 => Tag::WindowUpdate,
        2 => Tag::Ping,
        3 => Tag::GoAway,
        t => return Err(HeaderDecodeError::Type(t)),
    };
    Ok(Header {
        tag,
        flags: Flags(u16::from_be_bytes([buf[2], buf[3]])),
        stream_id: StreamId(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]])),
        length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    })
}

/// Possible errors while decoding a frame header.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDecodeError {
    /// Unknown protocol version.
    Version(u8),
    /// Unknown frame type.
    Type(u8),
}

impl fmt::Display for HeaderDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderDecodeError::Version(v) => write!(f, "unknown version {}", v),
            HeaderDecodeError::Type(t) => write!(f, "unknown frame type {}", t),
        }
    }
}

impl std::error::Error for HeaderDecodeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    impl Arbitrary for Header {
        fn arbitrary(g: &mut Gen) -> Header {
            let tag = match u8::arbitrary(g) % 4 {
                0 => Tag::Data,
                1 => Tag::WindowUpdate,
                2 => Tag::Ping,
                _ => Tag::GoAway,
            };
            Header {
                tag,
                flags: Flags(u16::arbitrary(g) % 16),
                stream_id: StreamId(u32::arbitrary(g)),
                length: u32::arbitrary(g),
            }
        }
    }

    #[test]
    fn roundtrip() {
        fn prop(hdr: Header) -> bool {
            decode(&encode(&hdr)) == Ok(hdr)
        }
        QuickCheck::new().tests(1000).quickcheck(prop as fn(Header) -> bool);
    }

    #[test]
    fn wire_layout() {
        let mut hdr = Header::data(StreamId(0x01020304), 0x0a0b0c0d);
        hdr.syn();
        hdr.fin();
        assert_eq!(
            encode(&hdr),
            [0, 0, 0, 5, 0x01, 0x02, 0x03, 0x04, 0x0a, 0x0b, 0x0c, 0x0d]
        );
    }

    #[test]
    fn rejects_bad_version_and_type() {
        let mut buf = encode(&Header::ping(42));
        buf[0] = 7;
        assert_eq!(decode(&buf), Err(HeaderDecodeError::Version(7)));
        let mut buf = encode(&Header::ping(42));
        buf[1] = 9;
        assert_eq!(decode(&buf), Err(HeaderDecodeError::Type(9)));
    }
}
