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

//! Ten echo streams over one mplex connection.

use async_std::task;
use log::info;

use rp2p_core::transport::memory;
use rp2p_mplex::Connection;
use rp2p_traits::{copy, ReadEx, WriteEx};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    task::block_on(async {
        let (client_socket, server_socket) = memory::pipe("/memory/1", "/memory/2");

        let server = Connection::new(server_socket);
        let mut server_ctrl = server.control();
        task::spawn(async move {
            let mut server = server;
            while server.next_stream().await.is_ok() {}
            info!("server connection is closed");
        });
        task::spawn(async move {
            while let Ok(stream) = server_ctrl.accept_stream().await {
                info!("S: accepted new stream {}", stream.key());
                task::spawn(async move {
                    let (r, w) = (stream.clone(), stream);
                    let _ = copy(r, w).await;
                });
            }
        });

        let client = Connection::new(client_socket);
        let mut ctrl = client.control();
        let loop_handle = task::spawn(async move {
            let mut client = client;
            while client.next_stream().await.is_ok() {}
            info!("client connection is closed");
        });

        let mut handles = Vec::new();
        for _ in 0..10 {
            let mut stream = ctrl.open_stream().await.unwrap();
            info!("C: opened new stream {}", stream.key());
            handles.push(task::spawn(async move {
                let data = b"hello world";

                stream.write_all2(data).await.unwrap();
                info!("C: {}: wrote {} bytes", stream.key(), data.len());

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
    });
}
