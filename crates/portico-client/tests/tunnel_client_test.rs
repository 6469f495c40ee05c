//! Client agent tests against a scripted relay: a raw TCP listener that
//! speaks just enough of the wire protocol to drive the client through
//! handshake, ready, task dispatch, and reconnection.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use portico_client::{Client, ClientConfig, ServiceConfig};
use portico_proto::frame::{encode_services_data_header, Signal, TaskOption};
use portico_proto::{Handshake, ServiceOption};

fn test_config(id: &str, relay: std::net::SocketAddr, local: std::net::SocketAddr) -> ClientConfig {
    ClientConfig {
        id: id.to_owned(),
        secret: "secret".to_owned(),
        remotes: vec![format!("tcp://{relay}")],
        reconnect_delay: Duration::from_millis(100),
        services: vec![ServiceConfig {
            local: format!("http://{local}"),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Read and decode the client's handshake off a raw socket.
async fn read_handshake(stream: &mut TcpStream) -> Handshake {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match Handshake::decode(&buf, 30) {
            Ok((handshake, _)) => return handshake,
            Err(portico_proto::HandshakeError::Incomplete) => {
                let n = stream.read(&mut chunk).await.expect("handshake read");
                assert!(n > 0, "client closed before finishing the handshake");
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(err) => panic!("bad handshake: {err}"),
        }
    }
}

#[tokio::test]
async fn client_handshakes_and_declares_services() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();

    let client = Client::new(test_config("scripted", relay_addr, local_addr)).unwrap();
    client.start().unwrap();

    let (mut stream, _) = relay.accept().await.unwrap();
    let handshake = read_handshake(&mut stream).await;
    assert_eq!(handshake.id, "scripted");
    assert_eq!(handshake.secret, "secret");
    assert_eq!(
        handshake.options,
        vec![ServiceOption::OpenHost {
            prefix: "scripted".into(),
            tls: false,
        }]
    );

    // The tunnel is not usable until the relay says so.
    assert_eq!(client.tunnel_count(), 0);
    stream.write_all(&Signal::Ready.to_bytes()).await.unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(client.tunnel_count(), 1);

    client.close().await;
}

#[tokio::test]
async fn task_round_trip_through_the_local_service() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();

    // One-shot local service: consume the request, answer, close.
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = local.accept().await.unwrap();
        let mut request = [0u8; 5];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"hello");
        stream.write_all(b"world").await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let client = Client::new(test_config("rt", relay_addr, local_addr)).unwrap();
    client.start().unwrap();

    let (mut stream, _) = relay.accept().await.unwrap();
    read_handshake(&mut stream).await;
    stream.write_all(&Signal::Ready.to_bytes()).await.unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    // First frame of task 7: service index 0, five payload bytes.
    let header = encode_services_data_header(7, 0, 5);
    stream.write_all(&header).await.unwrap();
    stream.write_all(b"hello").await.unwrap();

    // Expect the response as data frames for task 7, then the task close.
    let mut response = Vec::new();
    loop {
        let mut head = [0u8; 6];
        stream.read_exact(&mut head).await.unwrap();
        let task_id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
        let option = u16::from_be_bytes([head[4], head[5]]);
        assert_eq!(task_id, 7);
        if option == TaskOption::Close.wire_value() {
            break;
        }
        assert_eq!(option, TaskOption::Data.wire_value());
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let len = u32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        response.extend_from_slice(&payload);
    }
    assert_eq!(response, b"world");

    client.close().await;
}

#[tokio::test]
async fn client_reconnects_after_the_tunnel_drops() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();

    let client = Client::new(test_config("again", relay_addr, local_addr)).unwrap();
    client.start().unwrap();

    let (mut first, _) = relay.accept().await.unwrap();
    read_handshake(&mut first).await;
    first.write_all(&Signal::Ready.to_bytes()).await.unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    // Kill the tunnel; the connect loop must come back on its own.
    drop(first);
    let (mut second, _) = tokio::time::timeout(Duration::from_secs(5), relay.accept())
        .await
        .expect("client should reconnect")
        .unwrap();
    read_handshake(&mut second).await;
    second.write_all(&Signal::Ready.to_bytes()).await.unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(client.tunnel_count(), 1);

    client.close().await;
}

#[tokio::test]
async fn client_probes_a_quiet_wire_with_pings() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();

    let mut config = test_config("pong", relay_addr, local_addr);
    // Short remote timeout so the client's own ping fires quickly too.
    config.remote_timeout = Duration::from_secs(2);
    let client = Client::new(config).unwrap();
    client.start().unwrap();

    let (mut stream, _) = relay.accept().await.unwrap();
    read_handshake(&mut stream).await;
    stream.write_all(&Signal::Ready.to_bytes()).await.unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    // A quiet wire makes the client probe with a ping of its own.
    let mut probe = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut probe))
        .await
        .expect("client should ping on a quiet wire")
        .unwrap();
    assert_eq!(probe, Signal::Ping.to_bytes());

    client.close().await;
}
