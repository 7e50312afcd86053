pub mod config;
pub mod error;
pub mod health;
pub mod hub;
pub mod journal;
pub mod logger;
pub mod proxy;
pub mod web;

// Re-export commonly used types
pub use config::{Config, RouteConfig};
pub use error::{WiretapError, WiretapResult};
pub use health::{HealthMonitor, UrlHealth};
pub use hub::Hub;
pub use journal::Journal;
pub use logger::{LogRecord, LoggerMiddleware, Statistics};
pub use proxy::{ProxyHandler, ProxyServer};
pub use web::WebServer;
