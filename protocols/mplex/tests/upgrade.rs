use async_std::task;

use rp2p_core::muxing::StreamMuxer;
use rp2p_core::secure_io::SecuredStream;
use rp2p_core::transport::memory;
use rp2p_core::upgrade::Multistream;
use rp2p_core::PeerId;
use rp2p_traits::{ReadEx, WriteEx};
use rp2p_mplex::Config;

#[test]
fn negotiate_and_multiplex() {
    let _ = env_logger::try_init();
    task::block_on(async {
        let (a, b) = memory::pipe("/memory/1", "/memory/2");
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();
        let sa = SecuredStream::new(a, peer_a.clone(), peer_b.clone());
        let sb = SecuredStream::new(b, peer_b, peer_a);

        let listener = task::spawn(async move {
            let mut muxer =
                Multistream::new(Config::default()).select_inbound(sb).await.unwrap();
            task::spawn(muxer.task().unwrap());
            let mut stream = muxer.accept_stream().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact2(&mut buf).await.unwrap();
            stream.write_all2(&buf).await.unwrap();
            buf
        });

        let mut muxer = Multistream::new(Config::default()).select_outbound(sa).await.unwrap();
        task::spawn(muxer.task().unwrap());

        let mut stream = muxer.open_stream().await.unwrap();
        stream.write_all2(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact2(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(listener.await, *b"ping");
        muxer.close().await.unwrap();
    });
}
