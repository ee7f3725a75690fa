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

//! The mplex wire format: `varint((id << 3) | flag)`, a varint payload
//! length, then the payload.

pub(crate) mod io;

use std::fmt;

use rp2p_core::varint;

/// The largest stream id the header encoding can carry.
pub const MAX_STREAM_ID: u64 = u64::MAX >> 3;

/// The frame type, the low three bits of the header varint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    /// Open a new stream. The payload is an optional name.
    NewStream = 0,
    /// Data, sent by the side that received the stream.
    MessageReceiver = 1,
    /// Data, sent by the side that opened the stream.
    MessageInitiator = 2,
    /// Half-close, sent by the receiver.
    CloseReceiver = 3,
    /// Half-close, sent by the initiator.
    CloseInitiator = 4,
    /// Reset, sent by the receiver.
    ResetReceiver = 5,
    /// Reset, sent by the initiator.
    ResetInitiator = 6,
}

impl Tag {
    fn from_u8(flag: u8) -> Option<Tag> {
        match flag {
            0 => Some(Tag::NewStream),
            1 => Some(Tag::MessageReceiver),
            2 => Some(Tag::MessageInitiator),
            3 => Some(Tag::CloseReceiver),
            4 => Some(Tag::CloseInitiator),
            5 => Some(Tag::ResetReceiver),
            6 => Some(Tag::ResetInitiator),
            _ => None,
        }
    }
}

/// A stream's local identity.
///
/// Both peers number their outbound streams independently from zero, so the
/// wire id alone is ambiguous; a stream is keyed by the id *and* by which
/// side opened it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub(crate) id: u64,
    pub(crate) initiated_locally: bool,
}

impl StreamKey {
    pub(crate) fn outbound(id: u64) -> Self {
        StreamKey { id, initiated_locally: true }
    }

    pub(crate) fn inbound(id: u64) -> Self {
        StreamKey { id, initiated_locally: false }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The data tag our side uses on this stream.
    pub(crate) fn message_tag(&self) -> Tag {
        if self.initiated_locally {
            Tag::MessageInitiator
        } else {
            Tag::MessageReceiver
        }
    }

    pub(crate) fn close_tag(&self) -> Tag {
        if self.initiated_locally {
            Tag::CloseInitiator
        } else {
            Tag::CloseReceiver
        }
    }

    pub(crate) fn reset_tag(&self) -> Tag {
        if self.initiated_locally {
            Tag::ResetInitiator
        } else {
            Tag::ResetReceiver
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.initiated_locally {
            write!(f, "{}(out)", self.id)
        } else {
            write!(f, "{}(in)", self.id)
        }
    }
}

/// An mplex frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub tag: Tag,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(id: u64, tag: Tag) -> Self {
        Frame { id, tag, body: Vec::new() }
    }

    pub fn data(key: StreamKey, body: Vec<u8>) -> Self {
        Frame { id: key.id, tag: key.message_tag(), body }
    }

    pub fn new_stream(id: u64, name: &str) -> Self {
        Frame { id, tag: Tag::NewStream, body: name.as_bytes().to_vec() }
    }

    pub fn close(key: StreamKey) -> Self {
        Frame::new(key.id, key.close_tag())
    }

    pub fn reset(key: StreamKey) -> Self {
        Frame::new(key.id, key.reset_tag())
    }

    /// Append the wire encoding of this frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        debug_assert!(self.id <= MAX_STREAM_ID);
        varint::encode((self.id << 3) | self.tag as u64, out);
        varint::encode(self.body.len() as u64, out);
        out.extend_from_slice(&self.body);
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(Frame {:?} stream {} (len {}))", self.tag, self.id, self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::io::try_parse;
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

    impl Arbitrary for Frame {
        fn arbitrary(g: &mut Gen) -> Frame {
            let tag = Tag::from_u8(u8::arbitrary(g) % 7).unwrap();
            Frame {
                id: u64::arbitrary(g) & MAX_STREAM_ID,
                tag,
                body: Vec::<u8>::arbitrary(g),
            }
        }
    }

    #[test]
    fn roundtrip() {
        fn prop(frame: Frame) -> TestResult {
            let mut buf = Vec::new();
            frame.encode(&mut buf);
            let total = buf.len();
            match try_parse(&buf, usize::MAX) {
                Ok(Some((parsed, consumed))) => {
                    TestResult::from_bool(parsed == frame && consumed == total)
                }
                _ => TestResult::failed(),
            }
        }
        QuickCheck::new().tests(500).quickcheck(prop as fn(Frame) -> TestResult);
    }

    #[test]
    fn known_wire_form() {
        // stream 1, MessageInitiator, payload "hi": header (1<<3)|2 = 0x0a
        let frame = Frame { id: 1, tag: Tag::MessageInitiator, body: b"hi".to_vec() };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf, [0x0a, 0x02, b'h', b'i']);
    }

    #[test]
    fn reserved_flag_is_rejected() {
        // header (0<<3)|7: flag 7 is not assigned
        let err = try_parse(&[0x07, 0x00], usize::MAX).unwrap_err();
        assert!(matches!(err, super::io::FrameDecodeError::InvalidFlag(7)));
    }
}
