//! Transparent upstream forwarding with streaming preservation.
//!
//! The forwarder copies the client request to the chosen upstream, captures
//! connection-phase timings through the timing connector, and streams the
//! response back. Response bodies are handled by one of three strategies
//! picked from the upstream's content negotiation: event streams and other
//! latency-sensitive payloads are re-chunked and pushed through immediately,
//! everything else passes through hyper's normal buffered copy.

use bytes::Bytes;
use hyper::body::HttpBody as _;
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Body, Request, Response, Uri};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

use super::http_client::{self, ConnectInfo};
use crate::config::RouteConfig;
use crate::error::{WiretapError, WiretapResult};
use crate::logger::models::{ConnectionTimings, SharedRequestMeta};

/// SSE read-buffer cap: one event at a time, flushed per chunk
const SSE_CHUNK: usize = 1024;
/// Latency-biased cap for ndjson/chunked/unknown-length/plain-text bodies
const LOW_LATENCY_CHUNK: usize = 64;

/// How the upstream response body is copied to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStrategy {
    /// `text/event-stream`: re-chunk at 1 KiB, send each chunk immediately
    Sse,
    /// ndjson, chunked, unknown length or plain text: re-chunk at 64 bytes
    LowLatency,
    /// Everything else: pass the body through untouched
    Buffered,
}

/// Pick the copy strategy from the upstream response headers.
pub fn choose_strategy(headers: &hyper::HeaderMap) -> StreamStrategy {
    let content_type = headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.contains("text/event-stream") {
        return StreamStrategy::Sse;
    }

    let chunked = headers
        .get(hyper::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let has_length = headers.contains_key(hyper::header::CONTENT_LENGTH);

    if content_type.contains("application/x-ndjson")
        || chunked
        || !has_length
        || content_type.contains("text/plain")
    {
        return StreamStrategy::LowLatency;
    }

    StreamStrategy::Buffered
}

/// Build the final upstream URL for a request.
///
/// Wildcard routes append the full client path to the upstream base path;
/// exact routes use the upstream base path as-is. The client's raw query
/// string is always preserved.
pub fn build_target_url(
    client_path: &str,
    raw_query: Option<&str>,
    route: &RouteConfig,
    target_base: &str,
) -> WiretapResult<Uri> {
    let base: Uri = target_base
        .parse()
        .map_err(|e| WiretapError::upstream(format!("invalid target url {}: {}", target_base, e)))?;

    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base.authority().ok_or_else(|| {
        WiretapError::upstream(format!("target URI missing authority: {}", target_base))
    })?;

    let path = if route.is_wildcard() {
        let base_path = base.path().trim_end_matches('/');
        if base_path.is_empty() {
            client_path.to_string()
        } else {
            format!("{}{}", base_path, client_path)
        }
    } else {
        let p = base.path();
        if p.is_empty() {
            "/".to_string()
        } else {
            p.to_string()
        }
    };

    let mut url = format!("{}://{}{}", scheme, authority, path);
    if let Some(q) = raw_query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }

    url.parse()
        .map_err(|e| WiretapError::upstream(format!("invalid upstream uri {}: {}", url, e)))
}

/// Forward one attempt to `target_base` and stream the response back.
///
/// `body` is the fully-buffered client body so the router can retry with
/// identical bytes. Timings are deposited into `meta` once the response
/// head arrives; the router has already published the chosen target there.
pub async fn forward(
    parts: &Parts,
    body: Bytes,
    route: &RouteConfig,
    target_base: &str,
    outbound_proxy: Option<&str>,
    meta: &SharedRequestMeta,
) -> WiretapResult<Response<Body>> {
    let url = build_target_url(parts.uri.path(), parts.uri.query(), route, target_base)?;

    let mut builder = Request::builder().method(parts.method.clone()).uri(url);

    // Copy client headers except Host (hyper derives it from the URI), then
    // apply the route's overrides with set semantics.
    {
        let headers = builder
            .headers_mut()
            .ok_or_else(|| WiretapError::internal("request builder has no headers"))?;
        for (name, value) in parts.headers.iter() {
            if name == hyper::header::HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in &route.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WiretapError::config(format!("bad override header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| WiretapError::config(format!("bad override value: {}", e)))?;
            headers.insert(name, value);
        }

        let mut sent = HashMap::new();
        for (name, value) in headers.iter() {
            if let Ok(v) = value.to_str() {
                sent.entry(name.to_string()).or_insert_with(|| v.to_string());
            }
        }
        if let Ok(mut guard) = meta.lock() {
            guard.sent_headers = Some(sent);
        }
    }

    let out_req = builder.body(Body::from(body))?;

    let mut timings = ConnectionTimings {
        request_start: Some(Instant::now()),
        ..Default::default()
    };

    // No total timeout here: streaming responses and long uploads must be
    // allowed to run for as long as the peers keep the connection alive.
    let client = http_client::get_client(outbound_proxy)?;
    let response = client.request(out_req).await.map_err(WiretapError::from)?;

    let head_at = Instant::now();
    timings.first_byte = Some(head_at);
    timings.request_end = Some(head_at);

    if let Some(info) = response.extensions().get::<ConnectInfo>() {
        apply_connect_info(&mut timings, info);
    }

    if let Ok(mut guard) = meta.lock() {
        guard.timings = Some(timings);
    }

    let (mut resp_parts, upstream_body) = response.into_parts();
    let strategy = choose_strategy(&resp_parts.headers);

    if strategy == StreamStrategy::Sse {
        let headers = &mut resp_parts.headers;
        headers
            .entry(hyper::header::CACHE_CONTROL)
            .or_insert_with(|| HeaderValue::from_static("no-cache"));
        headers
            .entry(hyper::header::CONNECTION)
            .or_insert_with(|| HeaderValue::from_static("keep-alive"));
        headers
            .entry(hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .or_insert_with(|| HeaderValue::from_static("*"));
    }

    let body = match strategy {
        StreamStrategy::Buffered => upstream_body,
        StreamStrategy::Sse => rechunk(upstream_body, SSE_CHUNK),
        StreamStrategy::LowLatency => rechunk(upstream_body, LOW_LATENCY_CHUNK),
    };

    Ok(Response::from_parts(resp_parts, body))
}

/// Merge connector phase instants into the per-request timings. A response
/// served over a connection established before this request started is a
/// reused connection; the connect phases belong to whichever request opened
/// it and are not recorded again here.
fn apply_connect_info(timings: &mut ConnectionTimings, info: &ConnectInfo) {
    let Some(request_start) = timings.request_start else {
        return;
    };
    let reused = info
        .established
        .map(|established| established < request_start)
        .unwrap_or(false);

    timings.connection_reused = reused;
    if !reused {
        timings.dns_start = info.dns_start;
        timings.dns_end = info.dns_end;
        timings.connect_start = info.connect_start;
        timings.connect_end = info.connect_end;
        timings.tls_start = info.tls_start;
        timings.tls_end = info.tls_end;
    }
}

/// Forward the upstream body chunk by chunk, splitting anything larger than
/// `max_chunk` so each piece is written out as soon as it is available. The
/// first failed write to the client aborts the upstream stream.
fn rechunk(mut upstream: Body, max_chunk: usize) -> Body {
    let (mut tx, body) = Body::channel();

    tokio::spawn(async move {
        while let Some(next) = upstream.data().await {
            match next {
                Ok(mut chunk) => {
                    while !chunk.is_empty() {
                        let take = chunk.split_to(chunk.len().min(max_chunk));
                        if tx.send_data(take).await.is_err() {
                            debug!("client went away during streaming copy, aborting upstream");
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!("upstream body error during streaming copy: {}", e);
                    tx.abort();
                    return;
                }
            }
        }
    });

    body
}
