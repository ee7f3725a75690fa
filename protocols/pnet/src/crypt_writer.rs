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

//! The per-direction cipher halves of a protected connection.
//!
//! A stream cipher produces one keystream per direction; each byte of
//! traffic consumes keystream exactly once, in order. The writer therefore
//! encrypts into a scratch buffer and writes it out completely before
//! returning, so a short write can never desynchronize the keystream.

use std::io;

use async_trait::async_trait;
use salsa20::cipher::StreamCipher;
use salsa20::XSalsa20;

use rp2p_traits::{ReadEx, WriteEx};

/// The decrypting read half.
pub(crate) struct CryptReader<R> {
    inner: R,
    cipher: XSalsa20,
}

impl<R> CryptReader<R> {
    pub(crate) fn new(inner: R, cipher: XSalsa20) -> Self {
        CryptReader { inner, cipher }
    }
}

#[async_trait]
impl<R: ReadEx> ReadEx for CryptReader<R> {
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read2(buf).await?;
        self.cipher.apply_keystream(&mut buf[..n]);
        log::trace!("decrypted {} bytes", n);
        Ok(n)
    }
}

/// The encrypting write half.
pub(crate) struct CryptWriter<W> {
    inner: W,
    cipher: XSalsa20,
}

impl<W> CryptWriter<W> {
    pub(crate) fn new(inner: W, cipher: XSalsa20) -> Self {
        CryptWriter { inner, cipher }
    }
}

#[async_trait]
impl<W: WriteEx> WriteEx for CryptWriter<W> {
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut ciphertext = buf.to_vec();
        self.cipher.apply_keystream(&mut ciphertext);
        // all or nothing: a partial write would skip keystream bytes
        self.inner.write_all2(&ciphertext).await?;
        log::trace!("encrypted {} bytes", buf.len());
        Ok(buf.len())
    }

    async fn flush2(&mut self) -> io::Result<()> {
        self.inner.flush2().await
    }

    async fn close2(&mut self) -> io::Result<()> {
        self.inner.close2().await
    }
}
