//! The two listeners: proxy traffic on one port, the control surface on the
//! other, both driven by the same hub and shut down by one signal.

use anyhow::Result;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use super::handler::ProxyHandler;
use crate::config::Config;
use crate::health::HealthMonitor;
use crate::hub::Hub;
use crate::logger::LoggerMiddleware;
use crate::web::WebServer;

pub struct ProxyServer {
    config: Arc<Config>,
    hub: Arc<Hub>,
    health: Arc<HealthMonitor>,
    config_path: PathBuf,
}

impl ProxyServer {
    pub fn new(config: Arc<Config>, hub: Arc<Hub>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            hub,
            health: Arc::new(HealthMonitor::new()),
            config_path: config_path.into(),
        }
    }

    pub fn health_handle(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    /// Run both listeners until the shutdown signal fires. Health probers
    /// start first so selection data begins accumulating immediately.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.health
            .start(&self.config.proxy.targets, shutdown.clone())
            .await;

        let handler = ProxyHandler::new(Arc::clone(&self.config), Arc::clone(&self.health));
        let middleware = LoggerMiddleware::new(handler, Arc::clone(&self.hub));

        let proxy_addr = resolve_bind_addr(&self.config.server.host, self.config.server.port)?;
        let make_proxy_service = make_service_fn(move |conn: &AddrStream| {
            let middleware = middleware.clone();
            let remote = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |mut req| {
                    let middleware = middleware.clone();
                    req.extensions_mut().insert(remote);
                    async move { middleware.handle(req).await }
                }))
            }
        });

        let mut proxy_shutdown = shutdown.clone();
        let proxy_server = Server::try_bind(&proxy_addr)?
            .serve(make_proxy_service)
            .with_graceful_shutdown(async move {
                let _ = proxy_shutdown.changed().await;
            });
        info!("Proxy listener on {}", proxy_addr);

        if !self.config.web.enabled {
            info!("Control listener disabled by configuration");
            if let Err(e) = proxy_server.await {
                error!("Proxy server error: {}", e);
                return Err(e.into());
            }
            return Ok(());
        }

        let web_addr = resolve_bind_addr(self.config.web_host(), self.config.web.port)?;
        let web = Arc::new(WebServer::new(
            Arc::clone(&self.hub),
            Arc::clone(&self.config),
            self.config_path.clone(),
        ));
        let make_web_service = make_service_fn(move |conn: &AddrStream| {
            let web = Arc::clone(&web);
            let remote = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |mut req| {
                    let web = Arc::clone(&web);
                    req.extensions_mut().insert(remote);
                    async move { web.handle(req).await }
                }))
            }
        });

        let mut web_shutdown = shutdown.clone();
        let web_server = Server::try_bind(&web_addr)?
            .serve(make_web_service)
            .with_graceful_shutdown(async move {
                let _ = web_shutdown.changed().await;
            });
        info!("Control listener on {}", web_addr);

        let (proxy_result, web_result) = tokio::join!(proxy_server, web_server);
        if let Err(e) = proxy_result {
            error!("Proxy server error: {}", e);
            return Err(e.into());
        }
        if let Err(e) = web_result {
            error!("Web server error: {}", e);
            return Err(e.into());
        }

        Ok(())
    }
}

fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;

    let spec = format!("{}:{}", host, port);
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }

    spec.to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve bind address {}", spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(proxy_port: u16, web_port: u16, web_enabled: bool) -> Arc<Config> {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = proxy_port;
        config.web.port = web_port;
        config.web.enabled = web_enabled;
        config.normalize();
        Arc::new(config)
    }

    #[test]
    fn test_resolve_bind_addr() {
        assert_eq!(
            resolve_bind_addr("127.0.0.1", 8080).unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve_bind_addr("localhost", 8080).is_ok());
        assert!(resolve_bind_addr("no.such.host.invalid", 8080).is_err());
    }

    #[tokio::test]
    async fn test_server_starts_and_shuts_down() {
        let config = test_config(0, 0, false);
        let hub = Hub::new(16, None);
        let server = ProxyServer::new(config, hub, "config.yaml");

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished(), "server should be running");

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("graceful shutdown timed out")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_both_listeners_shut_down() {
        let config = test_config(0, 0, true);
        let hub = Hub::new(16, None);
        let server = ProxyServer::new(config, hub, "config.yaml");

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("graceful shutdown timed out")
            .unwrap()
            .unwrap();
    }
}
