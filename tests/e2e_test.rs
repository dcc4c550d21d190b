//! End-to-end integration tests for htunnel.
//!
//! These tests stand up real mock upstream proxies on 127.0.0.1 and
//! drive full sessions through the client.

use bytes::Bytes;
use http::Method;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use htunnel::{
    Client, Destination, Dialer, Error, Policy, PolicyManager, ServerList, ServerSpec, TcpDialer,
    TlsDialer, UserCredential,
};

/// Short budgets so half-closed sessions wind down quickly.
fn test_policies() -> PolicyManager {
    PolicyManager::new(Policy {
        idle_timeout: Duration::from_secs(5),
        downlink_only_timeout: Duration::from_millis(300),
        uplink_only_timeout: Duration::from_millis(300),
    })
}

fn client_for(port: u16, users: Vec<UserCredential>) -> Client {
    let servers =
        ServerList::new(vec![ServerSpec::new(Destination::tcp("127.0.0.1", port), users)]).unwrap();
    Client::new(servers, test_policies())
}

/// Reads from the stream until the end of an HTTP head, returning all
/// bytes read (head included).
async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    head
}

/// HTTP/1.1 happy path: CONNECT succeeds, the first payload rides right
/// behind it, and downlink bytes come back to the local stream.
#[tokio::test]
async fn test_http1_connect_with_first_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let upstream = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("CONNECT 1.2.3.4:443 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Connection: Keep-Alive\r\n"));

        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();

        // The first payload must be the first application bytes.
        let mut payload = [0u8; 5];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"HELLO");

        stream.write_all(b"WORLD").await.unwrap();
    });

    let client = client_for(port, Vec::new());
    let dialer = TcpDialer::new();
    let (mut local_io, local_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(local_side);

    local_io.write_all(b"HELLO").await.unwrap();

    let session = tokio::spawn(async move {
        client
            .process(
                &Destination::tcp("1.2.3.4", 443),
                reader,
                writer,
                &dialer,
                &CancellationToken::new(),
            )
            .await
    });

    let mut world = [0u8; 5];
    local_io.read_exact(&mut world).await.unwrap();
    assert_eq!(&world, b"WORLD");

    drop(local_io);
    upstream.await.unwrap();
    // The upstream socket may close before the half-closed budgets
    // expire, so either a clean end or "connection ends" is fine here.
    let _ = session.await.unwrap();
}

/// Proxy-Authorization is attached when the picked user has credentials.
#[tokio::test]
async fn test_http1_connect_sends_basic_auth() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let upstream = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = String::from_utf8(read_head(&mut stream).await).unwrap();
        // base64("alice:secret")
        assert!(head.contains("Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n"));
        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
    });

    let users = vec![UserCredential {
        username: "alice".to_string(),
        password: "secret".to_string(),
        level: 0,
    }];
    let client = client_for(port, users);
    let dialer = TcpDialer::new();
    let (local_io, local_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(local_side);

    let session = tokio::spawn(async move {
        client
            .process(
                &Destination::tcp("1.2.3.4", 443),
                reader,
                writer,
                &dialer,
                &CancellationToken::new(),
            )
            .await
    });

    upstream.await.unwrap();
    drop(local_io);
    let _ = session.await.unwrap();
}

/// A non-200 CONNECT response fails the attempt; the retry driver tries
/// twice before giving up.
#[tokio::test]
async fn test_http1_non_200_retried_then_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicU32::new(0));

    let upstream_accepts = accepts.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            upstream_accepts.fetch_add(1, Ordering::SeqCst);
            let _ = read_head(&mut stream).await;
            let _ = stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        }
    });

    let client = client_for(port, Vec::new());
    let dialer = TcpDialer::new();
    let (_local_io, local_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(local_side);

    let err = client
        .process(
            &Destination::tcp("1.2.3.4", 443),
            reader,
            writer,
            &dialer,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoAvailableDestination(_)));
    let source = std::error::Error::source(&err).unwrap();
    assert!(source.to_string().contains("non 200 code: 407"));
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
}

/// Server-speaks-first: no local payload arrives, negotiation proceeds
/// with an empty payload, and downlink bytes flow before any uplink.
#[tokio::test]
async fn test_http1_server_speaks_first() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_head(&mut stream).await;
        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        // Greet immediately, like a MySQL server behind the proxy.
        stream.write_all(b"PSST").await.unwrap();
    });

    let client = client_for(port, Vec::new());
    let dialer = TcpDialer::new();
    let (mut local_io, local_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(local_side);

    let session = tokio::spawn(async move {
        client
            .process(
                &Destination::tcp("db.internal", 3306),
                reader,
                writer,
                &dialer,
                &CancellationToken::new(),
            )
            .await
    });

    let mut greeting = [0u8; 4];
    local_io.read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting, b"PSST");

    drop(local_io);
    let _ = session.await.unwrap();
}

/// The branded header rewrite lands on the wire: port stripped from the
/// Host line, sentinel replaced by the hostname token.
#[tokio::test]
async fn test_http1_t5_rewrite_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let upstream = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = String::from_utf8(read_head(&mut stream).await).unwrap();

        assert!(head.contains("Host: m.example.com\r\n"));
        assert!(!head.contains("Host: m.example.com:8443"));
        assert!(head.contains(&format!(
            "X-T5-Auth: {}\r\n",
            htunnel::x_t5_auth_token("m.example.com")
        )));
        assert!(!head.contains("bd_x_t5_auth"));
        assert!(head.contains("User-Agent: okhttp/4.9.0 Dalvik/2.1.0 baiduboxapp\r\n"));

        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
    });

    let client = client_for(port, Vec::new());
    let dialer = TcpDialer::new();
    let (local_io, local_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(local_side);

    let session = tokio::spawn(async move {
        client
            .process(
                &Destination::tcp("m.example.com", 8443),
                reader,
                writer,
                &dialer,
                &CancellationToken::new(),
            )
            .await
    });

    upstream.await.unwrap();
    drop(local_io);
    let _ = session.await.unwrap();
}

/// Dialer that opens plain TCP but reports a fixed ALPN, standing in
/// for a TLS session that already negotiated it.
struct FixedAlpnDialer {
    alpn: &'static str,
}

#[async_trait::async_trait]
impl Dialer for FixedAlpnDialer {
    async fn dial(&self, dest: &Destination) -> htunnel::Result<htunnel::DialedTransport> {
        let stream = TcpStream::connect((dest.host.as_str(), dest.port))
            .await
            .map_err(|e| Error::Dial(e.to_string()))?;
        Ok(htunnel::DialedTransport {
            stream: Box::new(stream),
            alpn: Some(self.alpn.to_string()),
        })
    }
}

/// Serves HTTP/2 CONNECT streams that echo their request body into the
/// response body, counting accepted TCP connections.
fn spawn_h2_echo_upstream(listener: TcpListener, accepts: Arc<AtomicU32>) {
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            accepts.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut conn = h2::server::handshake(stream).await.unwrap();
                while let Some(result) = conn.accept().await {
                    let (request, mut respond) = match result {
                        Ok(pair) => pair,
                        Err(_) => return,
                    };
                    tokio::spawn(async move {
                        assert_eq!(request.method(), Method::CONNECT);
                        let mut body = request.into_body();

                        let response = http::Response::builder().status(200).body(()).unwrap();
                        let mut send = respond.send_response(response, false).unwrap();

                        while let Some(data) = body.data().await {
                            let data = match data {
                                Ok(data) => data,
                                Err(_) => break,
                            };
                            let _ = body.flow_control().release_capacity(data.len());
                            if send.send_data(data, false).is_err() {
                                break;
                            }
                        }
                        let _ = send.send_data(Bytes::new(), true);
                    });
                }
            });
        }
    });
}

/// HTTP/2 CONNECT: the first payload rides in the request body and the
/// echoed bytes come back through the stream.
#[tokio::test]
async fn test_h2_connect_echoes_first_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicU32::new(0));
    spawn_h2_echo_upstream(listener, accepts.clone());

    let client = client_for(port, Vec::new());
    let dialer = FixedAlpnDialer { alpn: "h2" };
    let (mut local_io, local_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(local_side);

    local_io.write_all(b"HELLO").await.unwrap();

    let session = tokio::spawn(async move {
        client
            .process(
                &Destination::tcp("1.2.3.4", 443),
                reader,
                writer,
                &dialer,
                &CancellationToken::new(),
            )
            .await
    });

    let mut echoed = [0u8; 5];
    local_io.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"HELLO");

    drop(local_io);
    let _ = session.await.unwrap();
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

/// Two back-to-back sessions to the same upstream share one HTTP/2
/// connection: the second rides the cached multiplexed client.
#[tokio::test]
async fn test_h2_connection_reused_across_sessions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicU32::new(0));
    spawn_h2_echo_upstream(listener, accepts.clone());

    let client = Arc::new(client_for(port, Vec::new()));
    let dialer = Arc::new(FixedAlpnDialer { alpn: "h2" });

    for round in 0..2u32 {
        let (mut local_io, local_side) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local_side);

        let payload = format!("PING{}", round);
        local_io.write_all(payload.as_bytes()).await.unwrap();

        let session = {
            let client = client.clone();
            let dialer = dialer.clone();
            tokio::spawn(async move {
                client
                    .process(
                        &Destination::tcp("1.2.3.4", 443),
                        reader,
                        writer,
                        dialer.as_ref(),
                        &CancellationToken::new(),
                    )
                    .await
            })
        };

        let mut echoed = [0u8; 5];
        local_io.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed[..], payload.as_bytes());

        drop(local_io);
        let _ = session.await.unwrap();
    }

    // A single TCP connection carried both sessions.
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

/// An ALPN value outside {"", "http/1.1", "h2"} is rejected.
#[tokio::test]
async fn test_unsupported_alpn_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((_stream, _)) = listener.accept().await else {
                return;
            };
        }
    });

    let client = client_for(port, Vec::new());
    let dialer = FixedAlpnDialer { alpn: "spdy/3" };
    let (_local_io, local_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(local_side);

    let err = client
        .process(
            &Destination::tcp("1.2.3.4", 443),
            reader,
            writer,
            &dialer,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoAvailableDestination(_)));
    let source = std::error::Error::source(&err).unwrap();
    assert!(source
        .to_string()
        .contains("unsupported application layer protocol: spdy/3"));
}

/// Full TLS path: the upstream only speaks h2, the dialer reports the
/// negotiated ALPN, and the CONNECT stream carries data both ways.
#[tokio::test]
async fn test_tls_alpn_selects_h2() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = rustls::pki_types::CertificateDer::from(cert.cert);
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()),
    );

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    server_config.alpn_protocols = vec![b"h2".to_vec()];
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let stream = acceptor.accept(stream).await.unwrap();
        let mut conn = h2::server::handshake(stream).await.unwrap();
        while let Some(result) = conn.accept().await {
            let (request, mut respond) = result.unwrap();
            assert_eq!(request.method(), Method::CONNECT);
            let mut body = request.into_body();
            let response = http::Response::builder().status(200).body(()).unwrap();
            let mut send = respond.send_response(response, false).unwrap();
            while let Some(Ok(data)) = body.data().await {
                let _ = body.flow_control().release_capacity(data.len());
                if send.send_data(data, false).is_err() {
                    break;
                }
            }
            let _ = send.send_data(Bytes::new(), true);
        }
    });

    let tls_config = htunnel::build_client_config_insecure(htunnel::DEFAULT_ALPN_PROTOCOLS).unwrap();
    let dialer = TlsDialer::new(Arc::new(tls_config), Some("localhost".to_string()));

    let client = client_for(port, Vec::new());
    let (mut local_io, local_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(local_side);

    local_io.write_all(b"OVER TLS").await.unwrap();

    let session = tokio::spawn(async move {
        client
            .process(
                &Destination::tcp("1.2.3.4", 443),
                reader,
                writer,
                &dialer,
                &CancellationToken::new(),
            )
            .await
    });

    let mut echoed = [0u8; 8];
    local_io.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"OVER TLS");

    drop(local_io);
    let _ = session.await.unwrap();
}

/// A non-200 from an h2 upstream surfaces the same status error as the
/// HTTP/1.1 flow.
#[tokio::test]
async fn test_h2_non_200_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut conn = h2::server::handshake(stream).await.unwrap();
                while let Some(Ok((_request, mut respond))) = conn.accept().await {
                    let response = http::Response::builder().status(502).body(()).unwrap();
                    let _ = respond.send_response(response, true);
                }
            });
        }
    });

    let client = client_for(port, Vec::new());
    let dialer = FixedAlpnDialer { alpn: "h2" };
    let (_local_io, local_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(local_side);

    let err = client
        .process(
            &Destination::tcp("1.2.3.4", 443),
            reader,
            writer,
            &dialer,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoAvailableDestination(_)));
    let source = std::error::Error::source(&err).unwrap();
    assert!(source.to_string().contains("non 200 code: 502"));
}
