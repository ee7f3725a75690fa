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

//! A hundred concurrent echo streams over one yamux connection.

use async_std::task;
use log::info;
use std::sync::Arc;

use rp2p_core::transport::memory;
use rp2p_traits::{ReadEx, WriteEx};
use rp2p_yamux::{Config, Connection, ConnectionError, Mode};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    task::block_on(async {
        let (client_socket, server_socket) = memory::pipe("/memory/1", "/memory/2");

        // server: echo every inbound stream
        let server = Connection::new(server_socket, Config::default(), Mode::Server);
        let mut server_ctrl = server.control();
        task::spawn(async move {
            let mut server = server;
            while server.next_stream().await.is_ok() {}
            info!("server connection is closed");
        });
        task::spawn(async move {
            while let Ok(mut stream) = server_ctrl.accept_stream().await {
                info!("S: accepted new stream {}", stream.id());
                task::spawn(async move {
                    let mut len = [0u8; 4];
                    stream.read_exact2(&mut len).await?;
                    let mut buf = vec![0; u32::from_be_bytes(len) as usize];
                    stream.read_exact2(&mut buf).await?;
                    stream.write_all2(&buf).await?;
                    stream.close2().await?;
                    Ok::<(), std::io::Error>(())
                });
            }
        });

        // client: a hundred concurrent streams
        let client = Connection::new(client_socket, Config::default(), Mode::Client);
        let mut ctrl = client.control();
        let loop_handle = task::spawn(async move {
            let mut client = client;
            while client.next_stream().await.is_ok() {}
            info!("client connection is closed");
        });

        let data = Arc::new(vec![0x42u8; 100 * 1024]);
        let mut handles = Vec::new();
        for _ in 0..100 {
            let mut stream = ctrl.open_stream().await.unwrap();
            let data = data.clone();
            info!("C: opened new stream {}", stream.id());
            handles.push(task::spawn(async move {
                stream.write_all2(&(data.len() as u32).to_be_bytes()).await.unwrap();
                stream.write_all2(&data).await.unwrap();
                info!("C: {}: wrote {} bytes", stream.id(), data.len());

                let mut frame = vec![0; data.len()];
                stream.read_exact2(&mut frame).await.unwrap();
                assert_eq!(&data[..], &frame[..]);

                stream.close2().await.expect("close stream");
            }));
        }

        for handle in handles {
            handle.await;
        }

        ctrl.close().await.expect("close connection");
        loop_handle.await;
        info!("shutdown is completed");

        Ok::<(), ConnectionError>(())
    })
    .unwrap();
}
