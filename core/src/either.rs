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

use std::io;

use async_trait::async_trait;
use futures::future::BoxFuture;

use rp2p_traits::{ReadEx, WriteEx};

use crate::muxing::{IReadWrite, IStreamMuxer, StreamMuxer, StreamMuxerEx};
use crate::secure_io::SecureInfo;
use crate::transport::{ConnectionInfo, TransportError};
use crate::upgrade::ProtocolName;
use crate::PeerId;

/// The output of combining two upgrades with a
/// [`Selector`](crate::upgrade::Selector).
#[derive(Debug, Copy, Clone)]
pub enum EitherOutput<A, B> {
    A(A),
    B(B),
}

#[async_trait]
impl<A, B> ReadEx for EitherOutput<A, B>
where
    A: ReadEx + Send,
    B: ReadEx + Send,
{
    async fn read2(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            EitherOutput::A(a) => a.read2(buf).await,
            EitherOutput::B(b) => b.read2(buf).await,
        }
    }
}

#[async_trait]
impl<A, B> WriteEx for EitherOutput<A, B>
where
    A: WriteEx + Send,
    B: WriteEx + Send,
{
    async fn write2(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EitherOutput::A(a) => a.write2(buf).await,
            EitherOutput::B(b) => b.write2(buf).await,
        }
    }

    async fn flush2(&mut self) -> io::Result<()> {
        match self {
            EitherOutput::A(a) => a.flush2().await,
            EitherOutput::B(b) => b.flush2().await,
        }
    }

    async fn close2(&mut self) -> io::Result<()> {
        match self {
            EitherOutput::A(a) => a.close2().await,
            EitherOutput::B(b) => b.close2().await,
        }
    }
}

impl<A, B> SecureInfo for EitherOutput<A, B>
where
    A: SecureInfo,
    B: SecureInfo,
{
    fn local_peer(&self) -> PeerId {
        match self {
            EitherOutput::A(a) => a.local_peer(),
            EitherOutput::B(b) => b.local_peer(),
        }
    }

    fn remote_peer(&self) -> PeerId {
        match self {
            EitherOutput::A(a) => a.remote_peer(),
            EitherOutput::B(b) => b.remote_peer(),
        }
    }
}

impl<A, B> ConnectionInfo for EitherOutput<A, B>
where
    A: ConnectionInfo,
    B: ConnectionInfo,
{
    fn local_addr(&self) -> Option<String> {
        match self {
            EitherOutput::A(a) => a.local_addr(),
            EitherOutput::B(b) => b.local_addr(),
        }
    }

    fn remote_addr(&self) -> String {
        match self {
            EitherOutput::A(a) => a.remote_addr(),
            EitherOutput::B(b) => b.remote_addr(),
        }
    }
}

impl<A, B> StreamMuxerEx for EitherOutput<A, B>
where
    A: StreamMuxerEx + Clone + 'static,
    B: StreamMuxerEx + Clone + 'static,
{
}

#[async_trait]
impl<A, B> StreamMuxer for EitherOutput<A, B>
where
    A: StreamMuxerEx + Clone + 'static,
    B: StreamMuxerEx + Clone + 'static,
{
    async fn open_stream(&mut self) -> Result<IReadWrite, TransportError> {
        match self {
            EitherOutput::A(a) => a.open_stream().await,
            EitherOutput::B(b) => b.open_stream().await,
        }
    }

    async fn accept_stream(&mut self) -> Result<IReadWrite, TransportError> {
        match self {
            EitherOutput::A(a) => a.accept_stream().await,
            EitherOutput::B(b) => b.accept_stream().await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self {
            EitherOutput::A(a) => a.close().await,
            EitherOutput::B(b) => b.close().await,
        }
    }

    fn task(&mut self) -> Option<BoxFuture<'static, ()>> {
        match self {
            EitherOutput::A(a) => a.task(),
            EitherOutput::B(b) => b.task(),
        }
    }

    fn box_clone(&self) -> IStreamMuxer {
        Box::new(self.clone())
    }
}

/// A protocol name drawn from one of two upgrades.
#[derive(Debug, Clone)]
pub enum EitherName<A, B> {
    A(A),
    B(B),
}

impl<A: ProtocolName, B: ProtocolName> ProtocolName for EitherName<A, B> {
    fn protocol_name(&self) -> &[u8] {
        match self {
            EitherName::A(a) => a.protocol_name(),
            EitherName::B(b) => b.protocol_name(),
        }
    }
}
