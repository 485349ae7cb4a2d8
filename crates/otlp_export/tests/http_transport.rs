//! HTTP transport against a minimal in-process collector.

use bytes::Bytes;
use flate2::read::GzDecoder;
use otlp_export::transport::HttpTransport;
use otlp_export::{
    Compression, ExportDelegate, ExportError, ExporterConfig, HeaderProvider, Resource, RetryPolicy, Signal,
    Span, SpanKind, Transport,
};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
struct CapturedRequest {
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Answers each connection with the next scripted response, then 200.
struct StubCollector {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl StubCollector {
    async fn start(responses: Vec<(&'static str, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&requests);

        tokio::spawn(async move {
            let mut responses = responses.into_iter();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (head, body) = responses.next().unwrap_or(("HTTP/1.1 200 OK\r\n", ""));
                let captured = Arc::clone(&captured);
                tokio::spawn(async move {
                    if let Some(request) = read_request(stream, head, body).await {
                        captured.lock().unwrap().push(request);
                    }
                });
            }
        });

        Self { addr, requests }
    }

    fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(mut stream: TcpStream, head: &str, body: &str) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let text = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let path = lines.next()?.split_whitespace().nth(1)?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut request_body = buf[header_end..].to_vec();
    while request_body.len() < length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        request_body.extend_from_slice(&chunk[..n]);
    }

    let response = format!(
        "{head}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.ok()?;
    stream.shutdown().await.ok()?;

    Some(CapturedRequest {
        path,
        headers,
        body: request_body,
    })
}

fn transport(config: &ExporterConfig) -> HttpTransport {
    HttpTransport::new(config, Signal::Traces, "application/json").unwrap()
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_success_sets_protocol_headers() {
    let stub = StubCollector::start(vec![]).await;
    let config = ExporterConfig::default().with_endpoint(stub.endpoint());

    let body = transport(&config)
        .send(Bytes::from_static(b"{}"), TIMEOUT)
        .await
        .unwrap();

    assert!(body.is_empty());
    let request = &stub.requests()[0];
    assert_eq!(request.path, "/v1/traces");
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert!(request.header("user-agent").unwrap().starts_with("otlp-export-rust/"));
    assert_eq!(request.header("content-encoding"), None);
    assert_eq!(request.body, b"{}");
}

#[tokio::test]
async fn test_bad_request_is_terminal() {
    let stub = StubCollector::start(vec![("HTTP/1.1 400 Bad Request\r\n", "invalid span")]).await;
    let config = ExporterConfig::default().with_endpoint(stub.endpoint());

    let err = transport(&config).send(Bytes::new(), TIMEOUT).await.unwrap_err();

    assert_eq!(
        err,
        ExportError::NonRetryableStatus {
            status: 400,
            message: "invalid span".into()
        }
    );
}

#[tokio::test]
async fn test_unavailable_carries_retry_after() {
    let stub = StubCollector::start(vec![("HTTP/1.1 503 Service Unavailable\r\nRetry-After: 2\r\n", "")]).await;
    let config = ExporterConfig::default().with_endpoint(stub.endpoint());

    let err = transport(&config).send(Bytes::new(), TIMEOUT).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
}

#[tokio::test]
async fn test_gzip_body_and_header() {
    let stub = StubCollector::start(vec![]).await;
    let config = ExporterConfig::default()
        .with_endpoint(stub.endpoint())
        .with_compression(Compression::Gzip);
    let payload = Bytes::from(r#"{"resourceSpans":[]}"#.repeat(20));

    transport(&config).send(payload.clone(), TIMEOUT).await.unwrap();

    let request = &stub.requests()[0];
    assert_eq!(request.header("content-encoding"), Some("gzip"));
    let mut decoded = Vec::new();
    GzDecoder::new(&request.body[..]).read_to_end(&mut decoded).unwrap();
    assert_eq!(decoded, payload);
}

#[tokio::test]
async fn test_header_provider_evaluated_per_send() {
    let stub = StubCollector::start(vec![]).await;
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let config = ExporterConfig::default()
        .with_endpoint(stub.endpoint())
        .with_header("authorization", "static")
        .with_header_provider(HeaderProvider::new(move || {
            let mut n = counter.lock().unwrap();
            *n += 1;
            vec![("authorization".to_string(), format!("Bearer {n}"))]
        }));
    let transport = transport(&config);

    transport.send(Bytes::new(), TIMEOUT).await.unwrap();
    transport.send(Bytes::new(), TIMEOUT).await.unwrap();

    let mut seen: Vec<_> = stub
        .requests()
        .iter()
        .map(|r| r.header("authorization").unwrap().to_string())
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["Bearer 1", "Bearer 2"]);
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hold = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    let config = ExporterConfig::default().with_endpoint(format!("http://{addr}"));

    let err = transport(&config)
        .send(Bytes::new(), Duration::from_millis(200))
        .await
        .unwrap_err();

    assert_eq!(err, ExportError::Timeout(Duration::from_millis(200)));
    hold.abort();
}

#[tokio::test]
async fn test_refused_connection_is_retryable() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = ExporterConfig::default().with_endpoint(format!("http://{addr}"));

    let err = transport(&config).send(Bytes::new(), TIMEOUT).await.unwrap_err();

    assert!(matches!(err, ExportError::Network(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_delegate_retries_against_collector() {
    let stub = StubCollector::start(vec![
        ("HTTP/1.1 503 Service Unavailable\r\n", ""),
        ("HTTP/1.1 429 Too Many Requests\r\nRetry-After: 0\r\n", ""),
        (
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n",
            r#"{"partialSuccess":{"rejectedSpans":1,"errorMessage":"too old"}}"#,
        ),
    ])
    .await;
    let config = ExporterConfig::default()
        .with_endpoint(stub.endpoint())
        .with_retry(
            RetryPolicy::default()
                .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
                .with_jitter(0.0),
        );
    let delegate = ExportDelegate::<Span>::from_config(&config, &Resource::empty()).unwrap();

    delegate
        .export_records(vec![Span::new(3, 4, 0, "checkout", SpanKind::Server)])
        .await
        .unwrap();

    let requests = stub.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.body == requests[0].body));
    delegate.shutdown().await;
}
