use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_std::task;
use futures::channel::oneshot;

use rp2p_core::transport::memory::{self, MemoryConnection};
use rp2p_traits::{ReadEx, WriteEx};
use rp2p_yamux::{Config, Connection, ConnectionError, Mode};

fn connected_pair(
    client_cfg: Config,
    server_cfg: Config,
) -> (Connection<MemoryConnection>, Connection<MemoryConnection>) {
    let (a, b) = memory::pipe("/memory/1", "/memory/2");
    (
        Connection::new(a, client_cfg, Mode::Client),
        Connection::new(b, server_cfg, Mode::Server),
    )
}

#[test]
fn echo_roundtrip_with_half_close() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let (client, server) = connected_pair(Config::default(), Config::default());
        let mut cc = client.control();
        let mut sc = server.control();

        let client_loop = task::spawn(async move {
            let mut client = client;
            while client.next_stream().await.is_ok() {}
        });
        let server_loop = task::spawn(async move {
            let mut server = server;
            while server.next_stream().await.is_ok() {}
        });

        let payload: Vec<u8> = (0..4096).map(|_| rand::random()).collect();

        let echo_server = task::spawn({
            let mut sc = sc.clone();
            async move {
                let mut stream = sc.accept_stream().await.unwrap();
                let mut data = Vec::new();
                let mut buf = [0u8; 1000];
                loop {
                    let n = stream.read2(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                }
                stream.write_all2(&data).await.unwrap();
                stream.close2().await.unwrap();
            }
        });

        let mut stream = cc.open_stream().await.unwrap();
        stream.write_all2(&payload).await.unwrap();
        stream.close2().await.unwrap();

        // writing past our own half-close fails
        assert!(stream.write2(b"x").await.is_err());

        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact2(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        // remote finished as well: EOF after the echo
        let mut tail = [0u8; 1];
        assert_eq!(stream.read2(&mut tail).await.unwrap(), 0);

        echo_server.await;
        cc.close().await.unwrap();
        client_loop.await;
        // the remote loop ends upon receiving GoAway(0)
        server_loop.await;
        let _ = sc.close().await;
    });
}

#[test]
fn window_exhaustion_suspends_writer_until_update() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let mut cfg = Config::default();
        cfg.set_receive_window(1024);
        let (client, server) = connected_pair(cfg.clone(), cfg);
        let mut cc = client.control();
        let mut sc = server.control();

        let _client_loop = task::spawn(async move {
            let mut client = client;
            while client.next_stream().await.is_ok() {}
        });
        let _server_loop = task::spawn(async move {
            let mut server = server;
            while server.next_stream().await.is_ok() {}
        });

        let (read_go, read_gate) = oneshot::channel::<()>();
        let server_task = task::spawn(async move {
            let mut stream = sc.accept_stream().await.unwrap();
            read_gate.await.unwrap();
            let mut buf = vec![0u8; 1024];
            stream.read_exact2(&mut buf).await.unwrap();
            assert!(buf.iter().all(|&b| b == 1));
            let mut buf = vec![0u8; 1024];
            stream.read_exact2(&mut buf).await.unwrap();
            assert!(buf.iter().all(|&b| b == 2));
        });

        let mut stream = cc.open_stream().await.unwrap();
        // the first kibibyte exactly exhausts the send window
        stream.write_all2(&vec![1u8; 1024]).await.unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let second_write = task::spawn({
            let mut stream = stream.clone();
            let done = done.clone();
            async move {
                stream.write_all2(&vec![2u8; 1024]).await.unwrap();
                done.store(true, Ordering::SeqCst);
            }
        });

        // with zero credit the writer must stay suspended
        task::sleep(Duration::from_millis(250)).await;
        assert!(!done.load(Ordering::SeqCst));

        // consuming on the receive side emits a window update and resumes it
        read_go.send(()).unwrap();
        second_write.await;
        assert!(done.load(Ordering::SeqCst));
        server_task.await;
    });
}

#[test]
fn inbound_streams_beyond_limit_are_reset() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let mut server_cfg = Config::default();
        server_cfg.set_max_num_streams(2);
        let (client, server) = connected_pair(Config::default(), server_cfg);
        let mut cc = client.control();
        let mut sc = server.control();

        let _client_loop = task::spawn(async move {
            let mut client = client;
            while client.next_stream().await.is_ok() {}
        });
        let _server_loop = task::spawn(async move {
            let mut server = server;
            while server.next_stream().await.is_ok() {}
        });

        let mut s1 = cc.open_stream().await.unwrap();
        let mut s2 = cc.open_stream().await.unwrap();
        let mut s3 = cc.open_stream().await.unwrap();

        let _a1 = sc.accept_stream().await.unwrap();
        let _a2 = sc.accept_stream().await.unwrap();

        // the third SYN violates the limit and is answered with RST
        let mut buf = [0u8; 1];
        let err = s3.read2(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        // the admitted streams keep working
        s1.write_all2(b"ok").await.unwrap();
        s2.write_all2(b"ok").await.unwrap();
    });
}

#[test]
fn keep_alive_times_out_against_unresponsive_peer() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let (a, b) = memory::pipe("/memory/1", "/memory/2");
        let mut cfg = Config::default();
        cfg.set_keep_alive_cadence(Duration::from_millis(100), Duration::from_millis(300));
        let mut client = Connection::new(a, cfg, Mode::Client);

        // `b` stays open but never answers pings
        let error = loop {
            if let Err(e) = client.next_stream().await {
                break e;
            }
        };
        assert!(matches!(error, ConnectionError::KeepAliveTimeout));
        drop(b);
    });
}

#[test]
fn reset_discards_data_and_resumes_reader() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let (client, server) = connected_pair(Config::default(), Config::default());
        let mut cc = client.control();
        let mut sc = server.control();

        let _client_loop = task::spawn(async move {
            let mut client = client;
            while client.next_stream().await.is_ok() {}
        });
        let _server_loop = task::spawn(async move {
            let mut server = server;
            while server.next_stream().await.is_ok() {}
        });

        let mut stream = cc.open_stream().await.unwrap();
        let mut accepted = sc.accept_stream().await.unwrap();

        let reader = task::spawn(async move {
            let mut buf = [0u8; 16];
            let err = accepted.read2(&mut buf).await.unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        });

        // give the reader a moment to park
        task::sleep(Duration::from_millis(100)).await;
        use rp2p_core::muxing::ReadWriteEx;
        stream.reset().await.unwrap();
        reader.await;

        // writing on a reset stream fails locally
        assert!(stream.write2(b"x").await.is_err());
    });
}

#[test]
fn pending_operations_resume_on_connection_close() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let (client, server) = connected_pair(Config::default(), Config::default());
        let mut cc = client.control();
        let mut sc = server.control();

        let _client_loop = task::spawn(async move {
            let mut client = client;
            while client.next_stream().await.is_ok() {}
        });
        let _server_loop = task::spawn(async move {
            let mut server = server;
            while server.next_stream().await.is_ok() {}
        });

        let mut stream = cc.open_stream().await.unwrap();

        // a reader parked on a stream and a pending accept must both resume
        let reader = task::spawn({
            let mut stream = stream.clone();
            async move {
                let mut buf = [0u8; 8];
                stream.read2(&mut buf).await
            }
        });
        let acceptor = task::spawn(async move { sc.accept_stream().await });

        task::sleep(Duration::from_millis(100)).await;
        cc.close().await.unwrap();

        assert!(reader.await.is_err());
        assert!(matches!(acceptor.await, Err(ConnectionError::Closed)));
    });
}

#[test]
fn lazy_open_carries_syn_on_first_frame() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let mut client_cfg = Config::default();
        client_cfg.set_lazy_open(true);
        let (client, server) = connected_pair(client_cfg, Config::default());
        let mut cc = client.control();
        let mut sc = server.control();

        let _client_loop = task::spawn(async move {
            let mut client = client;
            while client.next_stream().await.is_ok() {}
        });
        let _server_loop = task::spawn(async move {
            let mut server = server;
            while server.next_stream().await.is_ok() {}
        });

        let mut stream = cc.open_stream().await.unwrap();
        stream.write_all2(b"hello lazily").await.unwrap();

        let mut accepted = sc.accept_stream().await.unwrap();
        let mut buf = [0u8; 12];
        accepted.read_exact2(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello lazily");
    });
}
