pub mod forwarder;
pub mod handler;
pub mod http_client;
pub mod server;

use bytes::Bytes;

pub use handler::ProxyHandler;
pub use server::ProxyServer;

/// Fully-buffered client request body, stashed in request extensions so
/// every retry attempt reads the same bytes.
#[derive(Debug, Clone, Default)]
pub struct CachedBody(pub Bytes);
