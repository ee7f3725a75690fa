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

use std::{collections::VecDeque, io};

/// A receive buffer of frame bodies, consumed front to back.
///
/// Bodies are kept as received; a cursor per chunk lets readers take bytes
/// in arbitrary amounts without copying the backlog around.
#[derive(Debug, Default)]
pub(crate) struct Chunks {
    seq: VecDeque<Chunk>,
}

impl Chunks {
    pub(crate) fn new() -> Self {
        Chunks { seq: VecDeque::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.seq.iter().all(|c| c.is_empty())
    }

    /// The total number of unconsumed bytes.
    pub(crate) fn len(&self) -> usize {
        self.seq.iter().map(Chunk::len).sum()
    }

    pub(crate) fn push(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.seq.push_back(Chunk { cursor: io::Cursor::new(bytes) })
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Chunk> {
        self.seq.pop_front()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut Chunk> {
        self.seq.front_mut()
    }

    /// Discard everything, e.g. on reset.
    pub(crate) fn clear(&mut self) {
        self.seq.clear()
    }
}

/// One frame body with a consumption cursor.
#[derive(Debug)]
pub(crate) struct Chunk {
    cursor: io::Cursor<Vec<u8>>,
}

impl Chunk {
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.cursor.get_ref().len() - self.offset()
    }

    fn offset(&self) -> usize {
        self.cursor.position() as usize
    }

    /// Move the cursor forward by `amount` bytes.
    pub(crate) fn advance(&mut self, amount: usize) {
        debug_assert!(self.offset() + amount <= self.cursor.get_ref().len());
        self.cursor.set_position(self.cursor.position() + amount as u64);
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.cursor.get_ref()[self.offset()..]
    }
}
