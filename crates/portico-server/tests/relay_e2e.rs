//! End-to-end relay tests: a real server and real clients over loopback,
//! with plain TCP listeners standing in for the local services.

use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use portico_client::{Client, ClientConfig, ServiceConfig};
use portico_server::{Server, ServerConfig, TcpRangeConfig, UserConfig};

/// A local HTTP-ish service: answers every request with a fixed body after
/// an optional delay, then closes.
async fn spawn_local_http(body: &'static str, delay: Duration) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                // Read until the header block ends.
                loop {
                    match stream.read(&mut buf[read..]).await {
                        Ok(0) => return,
                        Ok(n) => read += n,
                        Err(_) => return,
                    }
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// A local TCP echo service.
async fn spawn_local_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn server_config(users: &[(&str, &str)]) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.addr = "127.0.0.1:0".to_owned();
    for (id, secret) in users {
        config.users.insert(
            (*id).to_owned(),
            UserConfig {
                secret: (*secret).to_owned(),
                ..Default::default()
            },
        );
    }
    config
}

async fn start_server(config: ServerConfig) -> (Server, std::net::SocketAddr) {
    let server = Server::new(config).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

fn client_config(
    id: &str,
    secret: &str,
    server_addr: std::net::SocketAddr,
    services: Vec<ServiceConfig>,
) -> ClientConfig {
    ClientConfig {
        id: id.to_owned(),
        secret: secret.to_owned(),
        remotes: vec![format!("tcp://{server_addr}")],
        reconnect_delay: Duration::from_millis(200),
        services,
        ..Default::default()
    }
}

async fn http_get(server_addr: std::net::SocketAddr, host: &str) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(server_addr).await?;
    let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(response)
}

fn body_of(response: &[u8]) -> &[u8] {
    let pos = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header block");
    &response[pos + 4..]
}

#[tokio::test]
async fn http_request_is_relayed_by_host_prefix() {
    let local = spawn_local_http("hello from local", Duration::ZERO).await;
    let (server, server_addr) = start_server(server_config(&[("myid", "s")])).await;

    let client = Client::new(client_config(
        "myid",
        "s",
        server_addr,
        vec![ServiceConfig {
            local: format!("http://{local}"),
            ..Default::default()
        }],
    ))
    .unwrap();
    client.start().unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    let response = http_get(server_addr, "myid.example.com").await.unwrap();
    assert_eq!(body_of(&response), b"hello from local");

    // Unknown prefixes are dropped without reaching any client.
    let response = http_get(server_addr, "ghost.example.com").await.unwrap();
    assert!(response.is_empty());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn host_rewrite_replaces_the_forwarded_host_header() {
    // The local service echoes the request's Host header back as the body.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                loop {
                    match stream.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => read += n,
                    }
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&buf[..read]).to_string();
                let host = text
                    .lines()
                    .find_map(|l| l.strip_prefix("Host: "))
                    .unwrap_or("none")
                    .to_owned();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    host.len(),
                    host
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    let (server, server_addr) = start_server(server_config(&[("rw", "s")])).await;
    let client = Client::new(client_config(
        "rw",
        "s",
        server_addr,
        vec![ServiceConfig {
            local: format!("http://{local}"),
            use_local_as_http_host: true,
            ..Default::default()
        }],
    ))
    .unwrap();
    client.start().unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    let response = http_get(server_addr, "rw.example.com").await.unwrap();
    assert_eq!(body_of(&response), local.to_string().as_bytes());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn leased_tcp_port_relays_and_quota_rejects_the_second_client() {
    let echo = spawn_local_echo().await;

    let mut config = server_config(&[("ida", "s"), ("idb", "s")]);
    config.tcp_ranges = vec![TcpRangeConfig {
        range: "41380-41389".into(),
        number: 1,
    }];
    let (server, server_addr) = start_server(config).await;

    let client_a = Client::new(client_config(
        "ida",
        "s",
        server_addr,
        vec![ServiceConfig {
            local: format!("tcp://{echo}"),
            remote_tcp_port: Some(41380),
            ..Default::default()
        }],
    ))
    .unwrap();
    client_a.start().unwrap();
    client_a
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    // The second client asks for the same port under a 1-lease quota: its
    // service stays unserved but the tunnel itself survives.
    let client_b = Client::new(client_config(
        "idb",
        "s",
        server_addr,
        vec![ServiceConfig {
            local: format!("tcp://{echo}"),
            remote_tcp_port: Some(41380),
            ..Default::default()
        }],
    ))
    .unwrap();
    client_b.start().unwrap();
    client_b
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(client_b.tunnel_count(), 1);

    // The leased port still routes to the first client.
    let mut stream = TcpStream::connect(("127.0.0.1", 41380)).await.unwrap();
    stream.write_all(b"ping over the tunnel").await.unwrap();
    let mut buf = vec![0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping over the tunnel");

    client_a.close().await;
    client_b.close().await;
    server.close().await;
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_tasks() {
    let local = spawn_local_http("slow but complete", Duration::from_millis(400)).await;
    let (server, server_addr) = start_server(server_config(&[("drain", "s")])).await;

    let client = Client::new(client_config(
        "drain",
        "s",
        server_addr,
        vec![ServiceConfig {
            local: format!("http://{local}"),
            ..Default::default()
        }],
    ))
    .unwrap();
    client.start().unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    // Two requests in flight while the server begins shutting down.
    let r1 = tokio::spawn(http_get(server_addr, "drain.example.com"));
    let r2 = tokio::spawn(http_get(server_addr, "drain.example.com"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let shutdown = tokio::spawn(async move {
        server.shutdown().await;
        server
    });

    let response1 = r1.await.unwrap().unwrap();
    let response2 = r2.await.unwrap().unwrap();
    assert_eq!(body_of(&response1), b"slow but complete");
    assert_eq!(body_of(&response2), b"slow but complete");

    let server = tokio::time::timeout(Duration::from_secs(15), shutdown)
        .await
        .expect("shutdown should settle")
        .unwrap();
    let stats = server.stats();
    assert_eq!(
        stats.accepted,
        stats.served + stats.failed + stats.tunneling
    );

    client.close().await;
}

#[tokio::test]
async fn wrong_secret_is_throttled_silently_after_the_limit() {
    let mut config = server_config(&[("legit", "right")]);
    config.reconnect_times = 1;
    config.reconnect_duration = Duration::from_secs(60);
    let (server, server_addr) = start_server(config).await;

    // Raw handshakes so each attempt is observable. The first two failures
    // receive an error frame; once the counter passes the limit, attempts
    // are dropped without a byte in response.
    for attempt in 0..4u32 {
        let handshake = portico_proto::Handshake {
            id: "legit".to_owned(),
            secret: "wrong".to_owned(),
            options: vec![portico_proto::ServiceOption::OpenHost {
                prefix: "legit".into(),
                tls: false,
            }],
        };
        let mut stream = TcpStream::connect(server_addr).await.unwrap();
        stream.write_all(&handshake.encode().unwrap()).await.unwrap();

        let mut response = Vec::new();
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            stream.read_to_end(&mut response),
        )
        .await;

        if attempt < 2 {
            // Error signal + InvalidIdAndSecret code.
            assert_eq!(
                response,
                vec![0xFF, 0xFF, 0xFF, 0xFC, 0x00, 0x01],
                "attempt {attempt} should be answered"
            );
        } else {
            assert!(
                response.is_empty(),
                "attempt {attempt} should be dropped silently"
            );
        }
    }

    server.close().await;
}

#[tokio::test]
async fn second_claim_of_a_host_prefix_conflicts() {
    let local = spawn_local_http("owner", Duration::ZERO).await;
    let (server, server_addr) = start_server(server_config(&[("one", "s"), ("two", "s")])).await;

    let owner = Client::new(client_config(
        "one",
        "s",
        server_addr,
        vec![ServiceConfig {
            local: format!("http://{local}"),
            host_prefix: Some("shared".into()),
            ..Default::default()
        }],
    ))
    .unwrap();
    owner.start().unwrap();
    owner
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    let intruder = Client::new(client_config(
        "two",
        "s",
        server_addr,
        vec![ServiceConfig {
            local: format!("http://{local}"),
            host_prefix: Some("shared".into()),
            ..Default::default()
        }],
    ))
    .unwrap();
    intruder.start().unwrap();
    // The conflicting handshake is rejected; no tunnel ever becomes ready.
    assert!(intruder
        .wait_until_ready(Duration::from_secs(2))
        .await
        .is_err());

    // The prefix still routes to its owner.
    let response = http_get(server_addr, "shared.example.com").await.unwrap();
    assert_eq!(body_of(&response), b"owner");

    owner.close().await;
    intruder.close().await;
    server.close().await;
}

#[tokio::test]
async fn pool_keeps_the_configured_number_of_warm_tunnels() {
    let local = spawn_local_http("pooled", Duration::ZERO).await;
    let (server, server_addr) = start_server(server_config(&[("pool", "s")])).await;

    let mut config = client_config(
        "pool",
        "s",
        server_addr,
        vec![ServiceConfig {
            local: format!("http://{local}"),
            ..Default::default()
        }],
    );
    config.remote_connections = 3;
    config.remote_idle_connections = 1;

    let client = Client::new(config).unwrap();
    client.start().unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Only the floor is kept warm; the surplus loops are parked.
    assert_eq!(client.tunnel_count(), 1);
    assert_eq!(server.stats().tunneling, 1);

    let response = http_get(server_addr, "pool.example.com").await.unwrap();
    assert_eq!(body_of(&response), b"pooled");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn reload_registers_new_prefixes_without_reconnecting() {
    let local_a = spawn_local_http("first service", Duration::ZERO).await;
    let local_b = spawn_local_http("second service", Duration::ZERO).await;
    let (server, server_addr) = start_server(server_config(&[("reload", "s")])).await;

    let mut config = client_config(
        "reload",
        "s",
        server_addr,
        vec![ServiceConfig {
            local: format!("http://{local_a}"),
            ..Default::default()
        }],
    );
    let client = Client::new(config.clone()).unwrap();
    client.start().unwrap();
    client
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    let response = http_get(server_addr, "reload.example.com").await.unwrap();
    assert_eq!(body_of(&response), b"first service");

    // Declare an extra service over the live tunnel.
    config.services.push(ServiceConfig {
        local: format!("http://{local_b}"),
        host_prefix: Some("extra".into()),
        ..Default::default()
    });
    client.reload_services(&config).await.unwrap();

    let response = http_get(server_addr, "extra.example.com").await.unwrap();
    assert_eq!(body_of(&response), b"second service");
    let response = http_get(server_addr, "reload.example.com").await.unwrap();
    assert_eq!(body_of(&response), b"first service");

    client.close().await;
    server.close().await;
}
