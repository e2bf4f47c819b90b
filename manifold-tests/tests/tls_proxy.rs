//! TLS branches: local termination and ciphertext pass-through.

mod common;

use common::{spawn_proxy, spawn_tls_echo_backend, tls_connect, HttpBackend};
use manifold::server::http1::Http1Conn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn terminated_https_relays_to_a_plain_backend() {
    let backend = HttpBackend::spawn().await;
    let yaml = format!(
        r#"
proxies:
  app.com:
    target: "{}"
    terminate: true
    proto: http
"#,
        backend.addr
    );
    let (proxy, _server) = spawn_proxy(&yaml, &["app.com"]).await;

    let tls = tls_connect(proxy, "app.com").await;
    let mut conn = Http1Conn::new(tls);
    let (status, body) = common::http_get(&mut conn, "app.com", "/").await;

    assert_eq!(status, 200);
    assert_eq!(body, "path:/");
}

#[tokio::test]
async fn terminated_https_keep_alive_works() {
    let backend = HttpBackend::spawn().await;
    let yaml = format!(
        r#"
proxies:
  app.com:
    target: "{}"
    terminate: true
    proto: http
"#,
        backend.addr
    );
    let (proxy, _server) = spawn_proxy(&yaml, &["app.com"]).await;

    let tls = tls_connect(proxy, "app.com").await;
    let mut conn = Http1Conn::new(tls);
    for _ in 0..2 {
        let (status, _) = common::http_get(&mut conn, "app.com", "/").await;
        assert_eq!(status, 200);
    }
    assert_eq!(backend.requests_served(), 2);
}

#[tokio::test]
async fn pass_through_forwards_ciphertext_to_the_backend() {
    // The backend, not the proxy, terminates TLS here.
    let backend = spawn_tls_echo_backend("app.com").await;
    let yaml = format!(
        "proxies:\n  app.com:\n    target: \"{backend}\"\n"
    );
    let (proxy, server) = spawn_proxy(&yaml, &[]).await;

    let mut tls = tls_connect(proxy, "app.com").await;
    tls.write_all(b"hello from client").await.unwrap();

    let mut buf = [0u8; 17];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello from client");

    // The proxy only saw ciphertext, but it did meter it.
    let entry = server.config().entry("app.com").unwrap();
    assert!(entry.metrics.ingress_bytes() > 0);
}

#[tokio::test]
async fn unknown_sni_is_closed_silently() {
    let (proxy, _server) = spawn_proxy("proxies: {}", &[]).await;

    let mut builder =
        boring::ssl::SslConnector::builder(boring::ssl::SslMethod::tls_client()).unwrap();
    builder.set_verify(boring::ssl::SslVerifyMode::NONE);
    let mut config = builder.build().configure().unwrap();
    config.set_verify_hostname(false);

    let tcp = tokio::net::TcpStream::connect(proxy).await.unwrap();
    // The proxy closes the socket instead of answering the hello.
    assert!(tokio_boring::connect(config, "unknown.test", tcp).await.is_err());
}
