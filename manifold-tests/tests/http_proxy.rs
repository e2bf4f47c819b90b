//! Plain HTTP proxying: host routing, path rewrites, keep-alive.

mod common;

use common::{spawn_proxy, HttpBackend};
use manifold::server::http1::Http1Conn;
use rstest::rstest;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing_test::traced_test;

#[tokio::test]
async fn http_passthrough_reaches_the_backend() {
    let backend = HttpBackend::spawn().await;
    let yaml = format!(
        "proxies:\n  app.com:\n    target: \"{}\"\n",
        backend.addr
    );
    let (proxy, _server) = spawn_proxy(&yaml, &[]).await;

    let mut conn = Http1Conn::new(TcpStream::connect(proxy).await.unwrap());
    let (status, body) = common::http_get(&mut conn, "app.com", "/").await;

    assert_eq!(status, 200);
    assert_eq!(body, "path:/");
    assert_eq!(backend.requests_served(), 1);
}

#[rstest]
#[case("/api/users", "path:/users")]
#[case("/api", "path:/")]
#[case("/other", "path:/other")]
#[tokio::test]
async fn path_rewrite_strips_the_api_prefix(#[case] path: &str, #[case] expected: &str) {
    let api_backend = HttpBackend::spawn().await;
    let default_backend = HttpBackend::spawn().await;
    let yaml = format!(
        r#"
proxies:
  app.com:
    target: "{}"
    routes:
      - pattern: "/api/*"
        target: "{}"
        rewrite:
          from: "^/api"
          to: ""
"#,
        default_backend.addr, api_backend.addr
    );
    let (proxy, _server) = spawn_proxy(&yaml, &[]).await;

    let mut conn = Http1Conn::new(TcpStream::connect(proxy).await.unwrap());
    let (status, body) = common::http_get(&mut conn, "app.com", path).await;

    assert_eq!(status, 200);
    assert_eq!(body, expected);
}

#[tokio::test]
async fn query_strings_survive_the_rewrite() {
    let backend = HttpBackend::spawn().await;
    let yaml = format!(
        r#"
proxies:
  app.com:
    target: "127.0.0.1:9"
    routes:
      - pattern: "/api/*"
        target: "{}"
        rewrite:
          from: "^/api"
          to: ""
"#,
        backend.addr
    );
    let (proxy, _server) = spawn_proxy(&yaml, &[]).await;

    let mut conn = Http1Conn::new(TcpStream::connect(proxy).await.unwrap());
    let (_, body) = common::http_get(&mut conn, "app.com", "/api/users?limit=5").await;
    assert_eq!(body, "path:/users?limit=5");
}

#[tokio::test]
async fn keep_alive_reuses_the_client_connection() {
    let backend = HttpBackend::spawn().await;
    let yaml = format!(
        "proxies:\n  app.com:\n    target: \"{}\"\n",
        backend.addr
    );
    let (proxy, server) = spawn_proxy(&yaml, &[]).await;

    let mut conn = Http1Conn::new(TcpStream::connect(proxy).await.unwrap());
    for _ in 0..3 {
        let (status, _) = common::http_get(&mut conn, "app.com", "/").await;
        assert_eq!(status, 200);
    }

    assert_eq!(backend.requests_served(), 3);
    // All three requests shared one accepted connection.
    assert_eq!(server.metrics().connection_count(), 1);
}

#[tokio::test]
#[traced_test]
async fn unknown_host_is_rejected_with_404() {
    let (proxy, _server) = spawn_proxy("proxies: {}", &[]).await;

    let mut conn = Http1Conn::new(TcpStream::connect(proxy).await.unwrap());
    let request = b"GET / HTTP/1.1\r\nHost: unknown.test\r\n\r\n";
    conn.stream_mut().write_all(request).await.unwrap();

    let response = conn.read_response_head().await.unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.header("connection"), Some("close"));

    assert!(logs_contain("Host not found"));
}

#[tokio::test]
async fn entry_metrics_account_relayed_bytes() {
    let backend = HttpBackend::spawn().await;
    let yaml = format!(
        "proxies:\n  app.com:\n    target: \"{}\"\n",
        backend.addr
    );
    let (proxy, server) = spawn_proxy(&yaml, &[]).await;

    let mut conn = Http1Conn::new(TcpStream::connect(proxy).await.unwrap());
    let (status, _) = common::http_get(&mut conn, "app.com", "/").await;
    assert_eq!(status, 200);
    drop(conn);

    let entry = server.config().entry("app.com").unwrap();
    assert!(entry.metrics.ingress_bytes() > 0);
    assert!(entry.metrics.egress_bytes() > 0);
    assert_eq!(entry.metrics.connection_count(), 1);
}
