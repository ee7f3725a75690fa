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

pub mod header;
pub(crate) mod io;

use header::{GoAwayCode, Header, StreamId};

/// A yamux frame: a header plus, for Data frames, a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(header: Header) -> Self {
        Frame { header, body: Vec::new() }
    }

    pub fn data(id: StreamId, body: Vec<u8>) -> Self {
        debug_assert!(body.len() <= u32::MAX as usize);
        Frame { header: Header::data(id, body.len() as u32), body }
    }

    pub fn window_update(id: StreamId, credit: u32) -> Self {
        Frame::new(Header::window_update(id, credit))
    }

    pub fn ping(nonce: u32) -> Self {
        Frame::new(Header::ping(nonce))
    }

    pub fn pong(nonce: u32) -> Self {
        let mut header = Header::ping(nonce);
        header.ack();
        Frame::new(header)
    }

    pub fn go_away(code: GoAwayCode) -> Self {
        Frame::new(Header::go_away(code))
    }

    /// An empty Data frame with FIN, half-closing our side of the stream.
    pub fn close_stream(id: StreamId) -> Self {
        let mut header = Header::data(id, 0);
        header.fin();
        Frame::new(header)
    }

    /// An empty Data frame with RST, aborting the stream.
    pub fn reset_stream(id: StreamId) -> Self {
        let mut header = Header::data(id, 0);
        header.rst();
        Frame::new(header)
    }
}
