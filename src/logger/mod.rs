pub mod middleware;
pub mod models;

pub use middleware::LoggerMiddleware;
pub use models::{
    format_duration, ConnectionTimings, LogRecord, RequestMeta, SharedRequestMeta, Statistics,
};
