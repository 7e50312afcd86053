//! Shared upstream HTTP client with connection-phase timing.
//!
//! hyper's stock connectors cannot tell us when DNS, TCP and TLS happened,
//! so the connector here dials by hand: resolve with the tokio resolver,
//! connect, optionally tunnel through an outbound HTTP proxy, optionally
//! wrap in rustls. Each phase boundary is stamped with an `Instant` and the
//! whole set rides into every `Response`'s extensions via
//! `Connected::extra`, where the forwarder picks it up.
//!
//! Clients are pooled per outbound proxy (including "no proxy") so
//! connection reuse works the same whether a route goes direct or through a
//! corporate proxy.

use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::{Body, Client, Request, Uri};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{WiretapError, WiretapResult};

/// Connection-phase instants recorded by the connector, delivered to the
/// forwarder through response extensions. `established` is when the
/// connection became usable; a response arriving over a connection
/// established before its request started was served by a reused connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectInfo {
    pub dns_start: Option<Instant>,
    pub dns_end: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_end: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_end: Option<Instant>,
    pub established: Option<Instant>,
}

static TLS_CONFIG: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

/// One pooled client per outbound proxy. Keyed by the proxy URL, with the
/// empty string standing for direct connections.
static CLIENTS: Lazy<RwLock<HashMap<String, Client<TimedConnector>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Get (or lazily build) the pooled client for the given outbound proxy.
pub fn get_client(proxy: Option<&str>) -> WiretapResult<Client<TimedConnector>> {
    let key = proxy.unwrap_or("").to_string();

    if let Ok(guard) = CLIENTS.read() {
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
    }

    let proxy_uri = match proxy {
        Some(p) => Some(
            p.parse::<Uri>()
                .map_err(|e| WiretapError::config(format!("invalid http_proxy {}: {}", p, e)))?,
        ),
        None => None,
    };

    let connector = TimedConnector::new(proxy_uri);
    let client = Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(32)
        .build::<_, Body>(connector);

    if let Ok(mut guard) = CLIENTS.write() {
        guard.entry(key).or_insert_with(|| client.clone());
    }

    Ok(client)
}

/// Lightweight GET that returns only the status code, bounded by `timeout`.
/// Used by the health monitor; forwarded traffic never goes through here.
pub async fn get_status(url: &str, timeout: Duration) -> WiretapResult<hyper::StatusCode> {
    let uri: Uri = url.parse()?;
    let req = Request::builder()
        .method(hyper::Method::GET)
        .uri(uri)
        .body(Body::empty())?;

    let client = get_client(None)?;
    let resp = tokio::time::timeout(timeout, client.request(req)).await??;
    Ok(resp.status())
}

/// Connector that performs DNS / TCP / proxy CONNECT / TLS by hand, timing
/// each phase.
#[derive(Clone)]
pub struct TimedConnector {
    proxy: Option<Uri>,
    tls: TlsConnector,
}

impl TimedConnector {
    pub fn new(proxy: Option<Uri>) -> Self {
        Self {
            proxy,
            tls: TlsConnector::from(Arc::clone(&TLS_CONFIG)),
        }
    }
}

impl Service<Uri> for TimedConnector {
    type Response = TimedStream;
    type Error = WiretapError;
    type Future = Pin<Box<dyn Future<Output = WiretapResult<TimedStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<WiretapResult<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let proxy = self.proxy.clone();
        let tls = self.tls.clone();
        Box::pin(async move { dial(dst, proxy, tls).await })
    }
}

fn default_port(uri: &Uri) -> u16 {
    match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    }
}

async fn dial(dst: Uri, proxy: Option<Uri>, tls: TlsConnector) -> WiretapResult<TimedStream> {
    let host = dst
        .host()
        .ok_or_else(|| WiretapError::upstream(format!("target URI missing host: {}", dst)))?
        .to_string();
    let port = dst.port_u16().unwrap_or_else(|| default_port(&dst));
    let use_tls = dst.scheme_str() == Some("https");

    let (dial_host, dial_port) = match &proxy {
        Some(p) => {
            let proxy_host = p
                .host()
                .ok_or_else(|| WiretapError::config(format!("proxy URI missing host: {}", p)))?;
            (proxy_host.to_string(), p.port_u16().unwrap_or(3128))
        }
        None => (host.clone(), port),
    };

    let mut info = ConnectInfo::default();

    info.dns_start = Some(Instant::now());
    let addrs: Vec<std::net::SocketAddr> =
        tokio::net::lookup_host((dial_host.as_str(), dial_port))
            .await
            .map_err(|e| WiretapError::upstream(format!("no such host {}: {}", dial_host, e)))?
            .collect();
    info.dns_end = Some(Instant::now());

    if addrs.is_empty() {
        return Err(WiretapError::upstream(format!(
            "no such host: {} resolved to no addresses",
            dial_host
        )));
    }

    info.connect_start = Some(Instant::now());
    let mut tcp = None;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = match tcp {
        Some(t) => t,
        None => {
            let cause = last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no reachable address".to_string());
            return Err(WiretapError::upstream(format!(
                "connect to {}: {}",
                dial_host, cause
            )));
        }
    };
    info.connect_end = Some(Instant::now());
    tcp.set_nodelay(true).ok();

    // Through a proxy, plain-HTTP requests ride the proxy connection in
    // absolute form (Connected::proxy below); TLS targets get a CONNECT
    // tunnel first so the handshake happens end to end.
    let mut via_proxy = proxy.is_some();
    let tcp = if via_proxy && use_tls {
        via_proxy = false;
        connect_tunnel(tcp, &host, port).await?
    } else {
        tcp
    };

    let io = if use_tls {
        info.tls_start = Some(Instant::now());
        let server_name = rustls::ServerName::try_from(host.as_str())
            .map_err(|_| WiretapError::upstream(format!("invalid TLS server name: {}", host)))?;
        let stream = tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| WiretapError::upstream(format!("TLS handshake with {}: {}", host, e)))?;
        info.tls_end = Some(Instant::now());
        MaybeTls::Tls(Box::new(stream))
    } else {
        MaybeTls::Plain(tcp)
    };

    info.established = Some(Instant::now());

    Ok(TimedStream {
        io,
        info,
        via_proxy,
    })
}

/// Open an HTTP CONNECT tunnel through an already-connected proxy stream.
async fn connect_tunnel(mut tcp: TcpStream, host: &str, port: u16) -> WiretapResult<TcpStream> {
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
        host = host,
        port = port
    );
    tcp.write_all(request.as_bytes())
        .await
        .map_err(|e| WiretapError::upstream(format!("proxy CONNECT write: {}", e)))?;

    // Read the proxy's response head; 8 KiB is plenty for a status line and
    // a handful of headers.
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= 8192 {
            return Err(WiretapError::upstream(
                "proxy CONNECT response exceeded 8 KiB",
            ));
        }
        let n = tcp
            .read(&mut byte)
            .await
            .map_err(|e| WiretapError::upstream(format!("proxy CONNECT read: {}", e)))?;
        if n == 0 {
            return Err(WiretapError::upstream(
                "unexpected EOF reading proxy CONNECT response",
            ));
        }
        buf.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&buf);
    let status_line = head.lines().next().unwrap_or("");
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .map(|code| code.starts_with('2'))
        .unwrap_or(false);
    if !ok {
        return Err(WiretapError::upstream(format!(
            "proxy CONNECT refused: {}",
            status_line
        )));
    }

    Ok(tcp)
}

pub enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// A connected upstream stream carrying its phase timings.
pub struct TimedStream {
    io: MaybeTls,
    info: ConnectInfo,
    via_proxy: bool,
}

impl Connection for TimedStream {
    fn connected(&self) -> Connected {
        let mut connected = Connected::new().extra(self.info);
        if self.via_proxy {
            connected = connected.proxy(true);
        }
        connected
    }
}

impl AsyncRead for TimedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.io {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TimedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.io {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.io {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.io {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
