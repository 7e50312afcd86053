//! Observability middleware.
//!
//! Wraps the router: buffers the request body so retries see the same bytes,
//! tees the response body on its way to the client, and assembles one
//! `LogRecord` per request once the response finishes streaming. The record
//! is handed to the hub from a spawned task, so the client response never
//! waits on observability.

use bytes::Bytes;
use hyper::body::HttpBody as _;
use hyper::{Body, Request, Response};
use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::models::{format_duration, record_timestamp, LogRecord, SharedRequestMeta};
use crate::hub::Hub;
use crate::proxy::{CachedBody, ProxyHandler};

/// Recorded request bodies are cut off here; the forwarded bytes never are.
const REQUEST_BODY_RECORD_CAP: usize = 64 * 1024;
/// Response capture buffer cap; the stream to the client is unaffected.
const RESPONSE_CAPTURE_CAP: usize = 256 * 1024;

const TRUNCATED_MARKER: &str = "... [TRUNCATED]";

#[derive(Clone)]
pub struct LoggerMiddleware {
    handler: ProxyHandler,
    hub: Arc<Hub>,
}

impl LoggerMiddleware {
    pub fn new(handler: ProxyHandler, hub: Arc<Hub>) -> Self {
        Self { handler, hub }
    }

    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let start = Instant::now();
        let timestamp = record_timestamp();

        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let remote_addr = req
            .extensions()
            .get::<SocketAddr>()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let original_headers = first_value_headers(req.headers());

        let (mut parts, body) = req.into_parts();
        let body_bytes = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Failed to read request body: {}", e);
                Bytes::new()
            }
        };

        let meta = SharedRequestMeta::default();
        parts.extensions.insert(meta.clone());
        parts.extensions.insert(CachedBody(body_bytes.clone()));
        let req = Request::from_parts(parts, Body::from(body_bytes.clone()));

        let response = self.handler.handle_request(req).await?;

        let (resp_parts, mut resp_body) = response.into_parts();
        let status_code = resp_parts.status.as_u16();
        let response_headers = first_value_headers(&resp_parts.headers);
        let streaming = is_streaming(&response_headers);

        let (mut tx, client_body) = Body::channel();
        let hub = Arc::clone(&self.hub);

        tokio::spawn(async move {
            let (captured, total_bytes) = async {
                let mut captured: Vec<u8> = Vec::new();
                let mut total = 0usize;

                loop {
                    match resp_body.data().await {
                        Some(Ok(chunk)) => {
                            total += chunk.len();
                            if captured.len() < RESPONSE_CAPTURE_CAP {
                                let room = RESPONSE_CAPTURE_CAP - captured.len();
                                captured.extend_from_slice(&chunk[..chunk.len().min(room)]);
                            }
                            if tx.send_data(chunk).await.is_err() {
                                debug!("Client disconnected before response completed");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!("Response body copy failed: {}", e);
                            tx.abort();
                            return (captured, total);
                        }
                        None => break,
                    }
                }
                (captured, total)
            }
            .await;

            let duration = start.elapsed();

            let (target_url, timings, sent_headers, forward_error) = {
                match meta.lock() {
                    Ok(guard) => (
                        guard.target_url.clone(),
                        guard.timings,
                        guard.sent_headers.clone(),
                        guard.error.clone(),
                    ),
                    Err(_) => (String::new(), None, None, String::new()),
                }
            };

            let mut response_body = process_response_body(&captured, &response_headers);
            if total_bytes > captured.len() {
                response_body.push('\n');
                response_body.push_str(TRUNCATED_MARKER);
            }
            if streaming && !response_body.is_empty() {
                response_body =
                    format!("[STREAMING RESPONSE - {} bytes]\n{}", total_bytes, response_body);
            }

            let mut record = LogRecord {
                timestamp,
                method,
                path,
                query,
                request_headers: sent_headers.unwrap_or(original_headers),
                response_headers,
                remote_addr,
                status_code,
                duration: format_duration(duration),
                target_url,
                request_body: record_request_body(&body_bytes),
                response_body,
                error: forward_error,
                stats: None,
                total_latency: format_duration(duration),
                upstream_latency: format_duration(duration),
                ..Default::default()
            };

            if let Some(t) = timings {
                if let Some(d) = t.dns_duration() {
                    record.dns_lookup_duration = format_duration(d);
                }
                if let Some(d) = t.connect_duration() {
                    record.connect_duration = format_duration(d);
                }
                if let Some(d) = t.tls_duration() {
                    record.tls_handshake_duration = format_duration(d);
                }
                if let Some(d) = t.first_byte_duration() {
                    record.first_byte_duration = format_duration(d);
                }
                if let Some(d) = t.upstream_duration() {
                    record.upstream_latency = format_duration(d);
                }
                record.connection_reused = t.connection_reused;
            }

            hub.broadcast(record).await;
        });

        Ok(Response::from_parts(resp_parts, client_body))
    }
}

/// First value per header name, the shape both record header maps use.
fn first_value_headers(headers: &hyper::HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.entry(name.to_string()).or_insert_with(|| v.to_string());
        }
    }
    map
}

/// Streaming detection mirrors the forwarder's latency-biased strategies:
/// event streams, ndjson and chunked responses are recorded as streams.
fn is_streaming(headers: &HashMap<String, String>) -> bool {
    let content_type = headers.get("content-type").map(String::as_str).unwrap_or("");
    if content_type.contains("text/event-stream") || content_type.contains("application/x-ndjson")
    {
        return true;
    }
    headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn record_request_body(body: &Bytes) -> String {
    if body.len() <= REQUEST_BODY_RECORD_CAP {
        return String::from_utf8_lossy(body).into_owned();
    }
    let mut s = String::from_utf8_lossy(&body[..REQUEST_BODY_RECORD_CAP]).into_owned();
    s.push_str(TRUNCATED_MARKER);
    s
}

/// Decode the captured response body for the record. Compressed payloads are
/// decompressed; when that fails the raw bytes are kept behind a marker. The
/// bytes already sent to the client are never altered.
fn process_response_body(body: &[u8], headers: &HashMap<String, String>) -> String {
    if body.is_empty() {
        return String::new();
    }

    let content_encoding = headers
        .get("content-encoding")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();

    if content_encoding.contains("gzip") {
        return match decompress_gzip(body) {
            Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
            Err(_) => format!(
                "[GZIP COMPRESSED DATA - Failed to decompress]\n{}",
                String::from_utf8_lossy(body)
            ),
        };
    }

    if content_encoding.contains("deflate") {
        return match decompress_deflate(body) {
            Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
            Err(_) => format!(
                "[DEFLATE COMPRESSED DATA - Failed to decompress]\n{}",
                String::from_utf8_lossy(body)
            ),
        };
    }

    String::from_utf8_lossy(body).into_owned()
}

fn decompress_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn decompress_deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_process_plain_body() {
        let out = process_response_body(b"hello", &HashMap::new());
        assert_eq!(out, "hello");
        assert_eq!(process_response_body(b"", &HashMap::new()), "");
    }

    #[test]
    fn test_process_gzip_body() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let out = process_response_body(&compressed, &headers(&[("content-encoding", "gzip")]));
        assert_eq!(out, "compressed payload");
    }

    #[test]
    fn test_process_deflate_body() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"zlib payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let out = process_response_body(&compressed, &headers(&[("content-encoding", "deflate")]));
        assert_eq!(out, "zlib payload");
    }

    #[test]
    fn test_process_broken_gzip_keeps_raw_with_marker() {
        let out = process_response_body(b"not gzip", &headers(&[("content-encoding", "gzip")]));
        assert!(out.starts_with("[GZIP COMPRESSED DATA - Failed to decompress]"));
        assert!(out.contains("not gzip"));
    }

    #[test]
    fn test_is_streaming() {
        assert!(is_streaming(&headers(&[(
            "content-type",
            "text/event-stream"
        )])));
        assert!(is_streaming(&headers(&[(
            "content-type",
            "application/x-ndjson"
        )])));
        assert!(is_streaming(&headers(&[(
            "transfer-encoding",
            "chunked"
        )])));
        assert!(!is_streaming(&headers(&[(
            "content-type",
            "application/json"
        )])));
    }

    #[test]
    fn test_request_body_truncation() {
        let small = Bytes::from(vec![b'a'; 100]);
        assert_eq!(record_request_body(&small).len(), 100);

        let large = Bytes::from(vec![b'a'; REQUEST_BODY_RECORD_CAP + 10]);
        let recorded = record_request_body(&large);
        assert!(recorded.ends_with(TRUNCATED_MARKER));
        assert_eq!(
            recorded.len(),
            REQUEST_BODY_RECORD_CAP + TRUNCATED_MARKER.len()
        );
    }

    #[tokio::test]
    async fn test_middleware_records_completed_request() {
        use crate::config::{Config, RouteConfig};
        use crate::health::HealthMonitor;
        use std::sync::Arc;

        // Upstream that answers 200 "pong"
        let make_svc = hyper::service::make_service_fn(|_| async {
            Ok::<_, Infallible>(hyper::service::service_fn(|_req| async {
                Ok::<_, Infallible>(Response::new(Body::from("pong")))
            }))
        });
        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let upstream = server.local_addr();
        tokio::spawn(server);

        let mut config = Config::default();
        config.proxy.targets = vec![RouteConfig {
            path: "/ping".to_string(),
            target_url: format!("http://{}/", upstream),
            target_urls: Vec::new(),
            methods: vec!["GET".to_string()],
            headers: HashMap::new(),
            http_proxy: None,
            health_check_path: String::new(),
            health_check_delay: 0,
        }];
        config.proxy.max_retries = 0;
        config.normalize();

        let hub = Hub::new(16, None);
        let handler = ProxyHandler::new(Arc::new(config), Arc::new(HealthMonitor::new()));
        let middleware = LoggerMiddleware::new(handler, Arc::clone(&hub));

        let req = Request::builder()
            .method("GET")
            .uri("http://proxy/ping?x=1")
            .body(Body::empty())
            .unwrap();

        let resp = middleware.handle(req).await.unwrap();
        assert_eq!(resp.status(), hyper::StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"pong");

        // The record lands after the body finishes; poll briefly
        let mut history = Vec::new();
        for _ in 0..50 {
            history = hub.get_history(10).await.unwrap();
            if !history.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(history.len(), 1);
        let record = &history[0];
        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/ping");
        assert_eq!(record.query, "x=1");
        assert_eq!(record.status_code, 200);
        assert!(!record.duration.is_empty());
        let stats = record.stats.as_ref().unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.method_counts.get("GET"), Some(&1));
    }
}
