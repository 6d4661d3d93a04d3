//! End-to-end drivers over real sockets.

use std::sync::Arc;
use std::time::Duration;

use marionette_core::{Acceptor, Config, Dialer, Error, StreamSet};
use marionette_harness::{docs, StubSuite};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const MSG_LEN: i64 = 128;

fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

#[tokio::test]
async fn dialer_and_acceptor_exchange_stream_bytes() {
    let doc = Arc::new(docs::relay(free_port(), MSG_LEN));

    let server_set = Arc::new(StreamSet::new());
    let acceptor = Arc::new(
        Acceptor::bind(
            Arc::clone(&doc),
            "127.0.0.1",
            Arc::clone(&server_set),
            StubSuite::new(),
            Config::default(),
        )
        .await
        .unwrap(),
    );
    let serving = Arc::clone(&acceptor);
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    let client_set = Arc::new(StreamSet::new());
    let mut dialer = Dialer::new(
        doc,
        "127.0.0.1",
        Arc::clone(&client_set),
        StubSuite::new(),
        Config::default(),
    );
    dialer.open().await.unwrap();

    let stream = dialer.dial().unwrap();
    stream.write(b"ping").await.unwrap();

    let peer = timeout(Duration::from_secs(5), server_set.accept()).await.unwrap();
    assert_eq!(peer.id(), stream.id());
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), peer.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");

    dialer.close().await.unwrap();
    assert!(dialer.closed());
    acceptor.close();
}

#[tokio::test]
async fn udp_dialer_emits_shaped_datagrams() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = peer.local_addr().unwrap().port();
    let doc = Arc::new(docs::relay_udp(port, MSG_LEN));

    let mut dialer = Dialer::new(
        doc,
        "127.0.0.1",
        Arc::new(StreamSet::new()),
        StubSuite::new(),
        Config::default(),
    );
    dialer.open().await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, _from) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, MSG_LEN as usize);
    assert!(buf[..n].iter().all(|b| b.is_ascii_hexdigit() || *b == b'x'));

    dialer.close().await.unwrap();
}

#[tokio::test]
async fn dial_after_close_fails() {
    let doc = Arc::new(docs::relay(8081, MSG_LEN));
    let mut dialer = Dialer::new(
        doc,
        "127.0.0.1",
        Arc::new(StreamSet::new()),
        StubSuite::new(),
        Config::default(),
    );

    dialer.close().await.unwrap();
    let result = dialer.dial();
    assert!(matches!(result, Err(Error::DialerClosed)));
}
