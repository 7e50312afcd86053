//! Route matching and retry orchestration.

use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::forwarder;
use super::CachedBody;
use crate::config::{Config, RouteConfig};
use crate::error::{WiretapError, WiretapResult};
use crate::health::HealthMonitor;
use crate::logger::models::SharedRequestMeta;

/// Matches requests against the route table, resolves the upstream through
/// the health monitor, and drives the forwarder with retry.
#[derive(Clone)]
pub struct ProxyHandler {
    config: Arc<Config>,
    health: Arc<HealthMonitor>,
}

impl ProxyHandler {
    pub fn new(config: Arc<Config>, health: Arc<HealthMonitor>) -> Self {
        Self { config, health }
    }

    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        match self.process_request(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Request processing error: {}", e);
                Ok(plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                ))
            }
        }
    }

    async fn process_request(&self, req: Request<Body>) -> WiretapResult<Response<Body>> {
        let request_id = Uuid::new_v4();
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();

        debug!("Request {} {} {}", request_id, method, path);

        let route = match self.find_route(&path, &method) {
            Some(route) => route,
            None => {
                info!("No matching route for {} {}", method, path);
                return Ok(plain_response(StatusCode::NOT_FOUND, "Not Found"));
            }
        };

        let (parts, body) = req.into_parts();
        let meta: SharedRequestMeta = parts
            .extensions
            .get::<SharedRequestMeta>()
            .cloned()
            .unwrap_or_default();

        let target = match self.health.select_fastest_healthy(&route.target_urls).await {
            Some(url) => url,
            None => {
                let err = WiretapError::no_healthy_upstream(format!(
                    "route {} has no upstream URLs",
                    route.path
                ));
                warn!("{}", err);
                record_error(&meta, &err);
                return Ok(plain_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service Unavailable",
                ));
            }
        };

        // Publish the chosen target before forwarding so the record carries
        // it even when every attempt fails.
        if let Ok(mut guard) = meta.lock() {
            guard.target_url = target.clone();
        }

        info!("Routing {} {} {} -> {}", request_id, method, path, target);

        let body_bytes = match parts.extensions.get::<CachedBody>() {
            Some(cached) => cached.0.clone(),
            None => hyper::body::to_bytes(body)
                .await
                .map_err(|e| WiretapError::body_copy(format!("reading request body: {}", e)))?,
        };

        let max_retries = self.config.proxy.max_retries;
        let retry_delay = Duration::from_millis(self.config.proxy.retry_delay);
        let outbound_proxy = route
            .http_proxy
            .as_deref()
            .or(self.config.proxy.http_proxy.as_deref());

        let mut last_err: Option<WiretapError> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                warn!(
                    "Retrying {} to {} (attempt {}/{}) after {}ms",
                    request_id,
                    target,
                    attempt,
                    max_retries,
                    retry_delay.as_millis()
                );
                tokio::time::sleep(retry_delay).await;
            }

            match forwarder::forward(&parts, body_bytes.clone(), route, &target, outbound_proxy, &meta)
                .await
            {
                Ok(response) => {
                    if attempt > 0 {
                        info!("Request {} succeeded on retry {}", request_id, attempt);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(
                        "Forward attempt {}/{} for {} failed: {}",
                        attempt + 1,
                        max_retries + 1,
                        request_id,
                        e
                    );
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let err = last_err
            .unwrap_or_else(|| WiretapError::upstream("request failed with no recorded error"));
        warn!(
            "Request {} to {} failed after retries: {}",
            request_id, target, err
        );
        record_error(&meta, &err);

        Ok(plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
    }

    /// First matching route wins, in declared order.
    fn find_route(&self, path: &str, method: &str) -> Option<&RouteConfig> {
        self.config
            .proxy
            .targets
            .iter()
            .find(|route| route.matches_path(path) && route.matches_method(method))
    }
}

fn record_error(meta: &SharedRequestMeta, err: &WiretapError) {
    if let Ok(mut guard) = meta.lock() {
        guard.error = err.to_string();
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config(routes: Vec<RouteConfig>) -> Arc<Config> {
        let mut config = Config::default();
        config.proxy.targets = routes;
        config.proxy.max_retries = 0;
        config.normalize();
        Arc::new(config)
    }

    fn route(path: &str, target_url: &str, methods: &[&str]) -> RouteConfig {
        RouteConfig {
            path: path.to_string(),
            target_url: target_url.to_string(),
            target_urls: Vec::new(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            headers: HashMap::new(),
            http_proxy: None,
            health_check_path: String::new(),
            health_check_delay: 0,
        }
    }

    fn handler(routes: Vec<RouteConfig>) -> ProxyHandler {
        ProxyHandler::new(test_config(routes), Arc::new(HealthMonitor::new()))
    }

    #[tokio::test]
    async fn test_no_route_returns_404() {
        let h = handler(vec![route("/api/*", "http://127.0.0.1:9", &[])]);

        let req = Request::builder()
            .method("GET")
            .uri("http://proxy/other")
            .body(Body::empty())
            .unwrap();

        let resp = h.handle_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"Not Found");
    }

    #[tokio::test]
    async fn test_method_mismatch_returns_404() {
        let h = handler(vec![route("/ping", "http://127.0.0.1:9", &["GET"])]);

        let req = Request::builder()
            .method("POST")
            .uri("http://proxy/ping")
            .body(Body::empty())
            .unwrap();

        let resp = h.handle_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let h = handler(vec![
            route("/api/special", "http://127.0.0.1:9", &[]),
            route("/api/*", "http://127.0.0.2:9", &[]),
        ]);

        let found = h.find_route("/api/special", "GET").unwrap();
        assert_eq!(found.target_url, "http://127.0.0.1:9");

        let found = h.find_route("/api/other", "GET").unwrap();
        assert_eq!(found.target_url, "http://127.0.0.2:9");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_returns_502() {
        // Port 9 (discard) refuses connections; retries are off
        let h = handler(vec![route("/x", "http://127.0.0.1:9", &[])]);

        let req = Request::builder()
            .method("GET")
            .uri("http://proxy/x")
            .body(Body::empty())
            .unwrap();

        let resp = h.handle_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"Bad Gateway");
    }

    #[tokio::test]
    async fn test_target_published_to_meta_on_failure() {
        let h = handler(vec![route("/x", "http://127.0.0.1:9", &[])]);

        let meta = SharedRequestMeta::default();
        let mut req = Request::builder()
            .method("GET")
            .uri("http://proxy/x")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(meta.clone());

        let resp = h.handle_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let guard = meta.lock().unwrap();
        assert_eq!(guard.target_url, "http://127.0.0.1:9");
        assert!(!guard.error.is_empty());
    }
}
