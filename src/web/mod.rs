//! Control listener: the embedded inspection UI, the live push channel, the
//! configuration endpoints, and the history query endpoints.

use hyper::{Body, Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::hub::{frame, Hub};

const INDEX_HTML: &str = include_str!("static/index.html");
const APP_JS: &str = include_str!("static/app.js");
const STYLE_CSS: &str = include_str!("static/style.css");

pub struct WebServer {
    hub: Arc<Hub>,
    config: Arc<Config>,
    config_path: PathBuf,
}

impl WebServer {
    pub fn new(hub: Arc<Hub>, config: Arc<Config>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            hub,
            config,
            config_path: config_path.into(),
        }
    }

    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match path.as_str() {
            "/" => match method {
                Method::GET => html_response(INDEX_HTML),
                _ => method_not_allowed(),
            },
            "/app.js" => asset_response(APP_JS, "application/javascript; charset=utf-8"),
            "/ws" => self.handle_ws(req),
            "/api/config" => match method {
                Method::GET => self.get_config().await,
                Method::POST => self.save_config(req).await,
                _ => method_not_allowed(),
            },
            "/api/history" => match method {
                Method::GET => self.get_history(req.uri().query()).await,
                _ => method_not_allowed(),
            },
            "/api/clear-history" => match method {
                Method::POST | Method::DELETE => self.clear_history().await,
                _ => method_not_allowed(),
            },
            _ if path.starts_with("/static/") => serve_static(&path),
            _ => not_found(),
        };

        Ok(response)
    }

    /// Upgrade handshake for the live channel. The response goes out first;
    /// the upgraded stream is handed to the hub from a spawned task once
    /// hyper completes the switch.
    fn handle_ws(&self, req: Request<Body>) -> Response<Body> {
        let headers = req.headers();
        let is_upgrade = headers
            .get(hyper::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let client_key = headers
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (true, Some(client_key)) = (is_upgrade, client_key) else {
            return plain_response(StatusCode::BAD_REQUEST, "Could not upgrade connection");
        };

        let accept = frame::accept_key(&client_key);
        let hub = Arc::clone(&self.hub);
        let buffer_size = self.config.websocket.buffer_size;
        let on_upgrade = hyper::upgrade::on(req);

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => hub.add_subscriber(upgraded, buffer_size).await,
                Err(e) => warn!("WebSocket upgrade failed: {}", e),
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(hyper::header::UPGRADE, "websocket")
            .header(hyper::header::CONNECTION, "Upgrade")
            .header("Sec-WebSocket-Accept", accept)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    /// The raw configuration file bytes, not a re-serialization.
    async fn get_config(&self) -> Response<Body> {
        match tokio::fs::read(&self.config_path).await {
            Ok(data) => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .header("X-Config-Path", self.config_path.to_string_lossy().as_ref())
                .body(Body::from(data))
                .unwrap_or_else(|_| Response::new(Body::empty())),
            Err(e) => plain_status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to read config file {:?}: {}", self.config_path, e),
            ),
        }
    }

    /// Validate a candidate configuration document syntactically and write
    /// it atomically over the config file. Takes effect on restart.
    async fn save_config(&self, req: Request<Body>) -> Response<Body> {
        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(_) => {
                return plain_response(StatusCode::BAD_REQUEST, "Failed to read request body")
            }
        };

        if let Err(e) = serde_yaml::from_slice::<serde_yaml::Value>(&body) {
            return plain_status_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid YAML format: {}", e),
            );
        }

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return plain_status_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Failed to create config directory {:?}: {}", parent, e),
                    );
                }
            }
        }

        // Write-then-rename so a crash mid-save never leaves a torn file
        let tmp_path = self.config_path.with_extension("yaml.tmp");
        let write_result = async {
            tokio::fs::write(&tmp_path, &body).await?;
            tokio::fs::rename(&tmp_path, &self.config_path).await
        }
        .await;

        if let Err(e) = write_result {
            return plain_status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to save config file to {:?}: {}", self.config_path, e),
            );
        }

        info!("Configuration saved to {:?}", self.config_path);
        json_response(&serde_json::json!({
            "status": "success",
            "message": "Configuration saved successfully",
            "config_path": self.config_path.to_string_lossy(),
        }))
    }

    async fn get_history(&self, query: Option<&str>) -> Response<Body> {
        let limit = parse_limit(query);
        match self.hub.get_history(limit).await {
            Ok(history) => json_response(&history),
            Err(e) => {
                warn!("Failed to get history: {}", e);
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get history")
            }
        }
    }

    async fn clear_history(&self) -> Response<Body> {
        match self.hub.clear_history().await {
            Ok(()) => json_response(&serde_json::json!({
                "success": true,
                "message": "History cleared successfully",
            })),
            Err(e) => {
                warn!("Failed to clear history: {}", e);
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to clear history")
            }
        }
    }
}

/// History limit: default 50, clamped to [1, 100].
fn parse_limit(query: Option<&str>) -> usize {
    query
        .unwrap_or("")
        .split('&')
        .find_map(|pair| pair.strip_prefix("limit="))
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .map(|n| n.min(100))
        .unwrap_or(50)
}

fn serve_static(path: &str) -> Response<Body> {
    match path.trim_start_matches("/static/") {
        "index.html" => html_response(INDEX_HTML),
        "app.js" => asset_response(APP_JS, "application/javascript; charset=utf-8"),
        "style.css" => asset_response(STYLE_CSS, "text/css; charset=utf-8"),
        _ => not_found(),
    }
}

fn html_response(content: &'static str) -> Response<Body> {
    asset_response(content, "text/html; charset=utf-8")
}

fn asset_response(content: &'static str, content_type: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .body(Body::from(content))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn json_response<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(
                hyper::header::CONTENT_TYPE,
                "application/json; charset=utf-8",
            )
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(_) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn plain_status_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn not_found() -> Response<Body> {
    plain_response(StatusCode::NOT_FOUND, "Not Found")
}

fn method_not_allowed() -> Response<Body> {
    plain_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn web_server(dir: &TempDir) -> WebServer {
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "server:\n  port: 9727\n").unwrap();
        WebServer::new(
            Hub::new(16, None),
            Arc::new(Config::default()),
            config_path,
        )
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(format!("http://web{}", path))
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None), 50);
        assert_eq!(parse_limit(Some("limit=10")), 10);
        assert_eq!(parse_limit(Some("limit=0")), 50);
        assert_eq!(parse_limit(Some("limit=500")), 100);
        assert_eq!(parse_limit(Some("limit=abc")), 50);
        assert_eq!(parse_limit(Some("a=1&limit=7")), 7);
    }

    #[tokio::test]
    async fn test_index_and_assets() {
        let dir = TempDir::new().unwrap();
        let server = web_server(&dir);

        let resp = server.handle(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = server.handle(get("/app.js")).await.unwrap();
        assert_eq!(
            resp.headers()[hyper::header::CONTENT_TYPE],
            "application/javascript; charset=utf-8"
        );

        let resp = server.handle(get("/static/style.css")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = server.handle(get("/static/missing.png")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = server.handle(get("/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_config_returns_raw_bytes() {
        let dir = TempDir::new().unwrap();
        let server = web_server(&dir);

        let resp = server.handle(get("/api/config")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"server:\n  port: 9727\n");
    }

    #[tokio::test]
    async fn test_save_config_rejects_bad_yaml() {
        let dir = TempDir::new().unwrap();
        let server = web_server(&dir);

        let req = Request::builder()
            .method(Method::POST)
            .uri("http://web/api/config")
            .body(Body::from("{unbalanced: [yaml"))
            .unwrap();
        let resp = server.handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_save_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let server = web_server(&dir);

        let req = Request::builder()
            .method(Method::POST)
            .uri("http://web/api/config")
            .body(Body::from("server:\n  port: 9999\n"))
            .unwrap();
        let resp = server.handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = server.handle(get("/api/config")).await.unwrap();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"server:\n  port: 9999\n");
    }

    #[tokio::test]
    async fn test_history_endpoint_shape() {
        let dir = TempDir::new().unwrap();
        let server = web_server(&dir);

        server
            .hub
            .broadcast(crate::logger::models::LogRecord {
                method: "GET".to_string(),
                path: "/a".to_string(),
                status_code: 200,
                ..Default::default()
            })
            .await;

        let resp = server.handle(get("/api/history?limit=10")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let parsed: Vec<crate::logger::models::LogRecord> =
            serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].path, "/a");
    }

    #[tokio::test]
    async fn test_clear_history_methods() {
        let dir = TempDir::new().unwrap();
        let server = web_server(&dir);

        let req = Request::builder()
            .method(Method::POST)
            .uri("http://web/api/clear-history")
            .body(Body::empty())
            .unwrap();
        let resp = server.handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], true);

        let resp = server.handle(get("/api/clear-history")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_ws_rejects_plain_request() {
        let dir = TempDir::new().unwrap();
        let server = web_server(&dir);

        let resp = server.handle(get("/ws")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ws_handshake_headers() {
        let dir = TempDir::new().unwrap();
        let server = web_server(&dir);

        let req = Request::builder()
            .method(Method::GET)
            .uri("http://web/ws")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
            .body(Body::empty())
            .unwrap();

        let resp = server.handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            resp.headers()["sec-websocket-accept"],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(resp.headers()[hyper::header::UPGRADE], "websocket");
    }
}
