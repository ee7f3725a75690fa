use std::time::Duration;

use async_std::task;

use rp2p_core::transport::memory::{self, MemoryConnection};
use rp2p_traits::{ReadEx, WriteEx};
use rp2p_mplex::{Config, Connection, ConnectionError};

fn connected_pair(
    client_cfg: Config,
    server_cfg: Config,
) -> (Connection<MemoryConnection>, Connection<MemoryConnection>) {
    let (a, b) = memory::pipe("/memory/1", "/memory/2");
    (
        Connection::with_config(a, client_cfg),
        Connection::with_config(b, server_cfg),
    )
}

#[test]
fn many_streams_echo() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let (client, server) = connected_pair(Config::default(), Config::default());
        let mut cc = client.control();
        let sc = server.control();

        let _client_loop = task::spawn(async move {
            let mut client = client;
            while client.next_stream().await.is_ok() {}
        });
        let _server_loop = task::spawn(async move {
            let mut server = server;
            while server.next_stream().await.is_ok() {}
        });

        let echo_server = task::spawn({
            let mut sc = sc.clone();
            async move {
                for _ in 0..10 {
                    let stream = sc.accept_stream().await.unwrap();
                    task::spawn(async move {
                        let (r, w) = (stream.clone(), stream);
                        let _ = rp2p_traits::copy(r, w).await;
                    });
                }
            }
        });

        let mut handles = Vec::new();
        for i in 0..10u32 {
            let mut stream = cc.open_stream().await.unwrap();
            handles.push(task::spawn(async move {
                let payload = vec![i as u8; 1024];
                stream.write_all2(&payload).await.unwrap();
                let mut echoed = vec![0u8; payload.len()];
                stream.read_exact2(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
                stream.close2().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await;
        }
        echo_server.await;
        cc.close().await.unwrap();
    });
}

#[test]
fn both_sides_use_independent_stream_counters() {
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

        // both sides open their own stream 0; the composite key keeps them apart
        let mut c_out = cc.open_stream().await.unwrap();
        let mut s_out = sc.open_stream().await.unwrap();
        assert_eq!(c_out.id(), 0);
        assert_eq!(s_out.id(), 0);

        let mut s_in = sc.accept_stream().await.unwrap();
        let mut c_in = cc.accept_stream().await.unwrap();

        c_out.write_all2(b"from client").await.unwrap();
        s_out.write_all2(b"from server").await.unwrap();

        let mut buf = [0u8; 11];
        s_in.read_exact2(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from client");
        c_in.read_exact2(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from server");
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

        // the third NewStream is answered with a reset
        let mut buf = [0u8; 1];
        let err = s3.read2(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        s1.write_all2(b"ok").await.unwrap();
        s2.write_all2(b"ok").await.unwrap();
    });
}

#[test]
fn slow_reader_overflows_and_is_reset() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let mut server_cfg = Config::default();
        server_cfg.set_max_read_buffer_size(1024);
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

        let mut stream = cc.open_stream().await.unwrap();
        let mut accepted = sc.accept_stream().await.unwrap();

        // nobody reads on the server side while the client floods
        stream.write_all2(&vec![1u8; 600]).await.unwrap();
        stream.write_all2(&vec![2u8; 600]).await.unwrap();

        // the overflowing stream is locally reset and readers learn why
        let mut buf = [0u8; 16];
        let err = accepted.read2(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("read buffer overflow"));

        // the client eventually observes the reset
        task::sleep(Duration::from_millis(100)).await;
        let err = stream.read2(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    });
}

#[test]
fn half_close_keeps_the_other_direction_usable() {
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

        stream.write_all2(b"closing now").await.unwrap();
        stream.close2().await.unwrap();
        assert!(stream.write2(b"x").await.is_err());

        let mut buf = [0u8; 11];
        accepted.read_exact2(&mut buf).await.unwrap();
        assert_eq!(&buf, b"closing now");
        assert_eq!(accepted.read2(&mut buf).await.unwrap(), 0);

        // the reverse direction still works
        accepted.write_all2(b"still alive").await.unwrap();
        stream.read_exact2(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still alive");
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

        let stream = cc.open_stream().await.unwrap();

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
