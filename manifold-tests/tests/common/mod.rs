//! Shared fixtures: a proxy on an ephemeral port, a counting HTTP backend
//! that echoes the path it observed (and speaks WebSocket upgrades), and a
//! TLS echo backend for pass-through scenarios.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use boring::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use manifold::server::http1::Http1Conn;
use manifold::tls::self_signed::{self, SelfSignedCertificateSource};
use manifold::{Config, Server};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Starts a proxy for `yaml` on an ephemeral port, with a self-signed
/// certificate source covering `domains`.
pub async fn spawn_proxy(yaml: &str, domains: &[&str]) -> (SocketAddr, Arc<Server>) {
    let config = Config::load_str(yaml).expect("test config must parse");
    let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
    let certs = Arc::new(SelfSignedCertificateSource::new(&domains).unwrap());

    let server = Arc::new(Server::new(config, certs).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).serve(listener));

    (addr, server)
}

/// A plain HTTP/1.1 backend that answers `200 OK` with body
/// `path:<request target>` and counts the requests it served. WebSocket
/// upgrade requests get `101 Switching Protocols` and a byte echo loop.
pub struct HttpBackend {
    pub addr: SocketAddr,
    requests: Arc<AtomicUsize>,
}

impl HttpBackend {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_http(stream, Arc::clone(&counter)));
            }
        });

        Self { addr, requests }
    }

    pub fn requests_served(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn serve_http(stream: TcpStream, counter: Arc<AtomicUsize>) {
    let mut conn = Http1Conn::new(stream);

    while let Ok(Some(request)) = conn.read_request_head().await {
        counter.fetch_add(1, Ordering::SeqCst);

        let framing = request.body_framing().unwrap();
        let mut sink = tokio::io::sink();
        if conn.copy_body(&mut sink, framing).await.is_err() {
            return;
        }

        if request.is_websocket_upgrade() {
            let upgrade = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
            if conn.stream_mut().write_all(upgrade).await.is_err() {
                return;
            }
            let (leftover, stream) = conn.into_parts();
            echo(&leftover, stream).await;
            return;
        }

        let close = request.connection_contains("close");
        let body = format!("path:{}", request.target);
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        if conn.stream_mut().write_all(response.as_bytes()).await.is_err() || close {
            return;
        }
    }
}

async fn echo<S: AsyncRead + AsyncWrite + Unpin>(leftover: &[u8], mut stream: S) {
    if !leftover.is_empty() && stream.write_all(leftover).await.is_err() {
        return;
    }
    let mut buf = [0u8; 1024];
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
}

/// A TLS echo server presenting a self-signed certificate for `domain`.
/// Bytes received after its own handshake are written straight back.
pub async fn spawn_tls_echo_backend(domain: &str) -> SocketAddr {
    let (cert, key) = self_signed::generate(&[domain.to_string()]).unwrap();
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    builder.set_certificate(&cert).unwrap();
    builder.set_private_key(&key).unwrap();
    let acceptor = Arc::new(builder.build());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = Arc::clone(&acceptor);
            tokio::spawn(async move {
                if let Ok(tls) = tokio_boring::accept(&acceptor, stream).await {
                    echo(&[], tls).await;
                }
            });
        }
    });

    addr
}

/// Opens a TLS connection to `addr` with the given SNI, skipping
/// certificate verification.
pub async fn tls_connect(
    addr: SocketAddr,
    sni: &str,
) -> tokio_boring::SslStream<TcpStream> {
    let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
    builder.set_verify(SslVerifyMode::NONE);
    let mut config = builder.build().configure().unwrap();
    config.set_verify_hostname(false);

    let tcp = TcpStream::connect(addr).await.unwrap();
    tokio_boring::connect(config, sni, tcp).await.unwrap()
}

/// Issues one GET over `stream` and returns `(status, body)`.
pub async fn http_get<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Http1Conn<S>,
    host: &str,
    path: &str,
) -> (u16, String) {
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n\r\n");
    conn.stream_mut()
        .write_all(request.as_bytes())
        .await
        .unwrap();

    let response = conn.read_response_head().await.unwrap();
    let framing = response.body_framing("GET").unwrap();
    let mut body = Vec::new();
    conn.copy_body(&mut body, framing).await.unwrap();

    (response.status, String::from_utf8_lossy(&body).into_owned())
}
