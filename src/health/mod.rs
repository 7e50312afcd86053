//! Active health and latency probing of upstream URLs.
//!
//! One prober task runs per configured upstream URL. Each probe walks an
//! escalation ladder of paths until something answers, keeps a rolling
//! average over successful probes, and the router asks
//! `select_fastest_healthy` for the best URL at dispatch time.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::RouteConfig;
use crate::proxy::http_client;

/// Per-attempt probe timeout
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);
/// Whole-cycle budget per URL
const CYCLE_BUDGET: Duration = Duration::from_secs(5);
/// Paths tried when the configured health check path yields nothing
const WELL_KNOWN_PATHS: &[&str] = &["/health", "/ping", "/status", "/api/health"];

/// Health and response-time statistics for one upstream URL.
/// Mutated only by the health monitor; read by the router.
#[derive(Debug, Clone)]
pub struct UrlHealth {
    pub url: String,
    pub healthy: bool,
    pub last_response_time: Duration,
    /// Rolling average over successful probes only
    pub average_time: Duration,
    pub min_time: Duration,
    pub max_time: Duration,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub consecutive_errors: u32,
    pub last_check: DateTime<Utc>,
}

impl UrlHealth {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            // Optimistic until the first probe says otherwise
            healthy: true,
            last_response_time: Duration::ZERO,
            average_time: Duration::ZERO,
            min_time: Duration::ZERO,
            max_time: Duration::ZERO,
            total_checks: 0,
            successful_checks: 0,
            consecutive_errors: 0,
            last_check: Utc::now(),
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        self.successful_checks as f64 / self.total_checks as f64 * 100.0
    }
}

/// Process-wide health monitor.
pub struct HealthMonitor {
    url_health: RwLock<HashMap<String, UrlHealth>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            url_health: RwLock::new(HashMap::new()),
        }
    }

    /// Initialize health entries and launch one prober per URL. Probers run
    /// until the shutdown signal fires.
    pub async fn start(self: &Arc<Self>, routes: &[RouteConfig], shutdown: watch::Receiver<bool>) {
        for route in routes {
            for url in &route.target_urls {
                {
                    let mut map = self.url_health.write().await;
                    map.entry(url.clone())
                        .or_insert_with(|| UrlHealth::new(url));
                }

                let monitor = Arc::clone(self);
                let url = url.clone();
                let health_path = route.health_check_path.clone();
                let delay = Duration::from_secs(route.health_check_delay.max(1));
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    monitor.run_prober(url, health_path, delay, shutdown).await;
                });
            }
        }
    }

    async fn run_prober(
        &self,
        url: String,
        health_path: String,
        delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (healthy, response_time, error) = self.perform_probe(&url, &health_path).await;
                    self.record_probe(&url, healthy, response_time, error.as_deref()).await;
                }
                _ = shutdown.changed() => {
                    debug!("Health prober for {} stopping", url);
                    return;
                }
            }
        }
    }

    /// Walk the probe ladder for one URL. Returns the verdict, the elapsed
    /// time at the moment of the verdict, and an error message on failure.
    async fn perform_probe(
        &self,
        base: &str,
        health_path: &str,
    ) -> (bool, Duration, Option<String>) {
        let start = Instant::now();

        let mut candidates: Vec<&str> = Vec::new();
        if !health_path.is_empty() && health_path != "/" {
            candidates.push(health_path);
        }
        candidates.push("/");
        for &path in WELL_KNOWN_PATHS {
            if !candidates.contains(&path) {
                candidates.push(path);
            }
        }

        let mut saw_response = false;
        let mut all_not_found = true;

        for path in candidates {
            let remaining = CYCLE_BUDGET.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }

            let probe_url = join_probe_url(base, path);
            match http_client::get_status(&probe_url, ATTEMPT_TIMEOUT.min(remaining)).await {
                Ok(status) => {
                    saw_response = true;
                    if (200..400).contains(&status.as_u16()) {
                        return (true, start.elapsed(), None);
                    }
                    if status.as_u16() != 404 {
                        all_not_found = false;
                    }
                }
                Err(e) => {
                    debug!("Probe {} failed: {}", probe_url, e);
                }
            }
        }

        // A server that answers 404 everywhere is reachable, it just has no
        // health endpoint.
        if saw_response && all_not_found {
            return (true, start.elapsed(), None);
        }

        (
            false,
            start.elapsed(),
            Some("all health check strategies failed".to_string()),
        )
    }

    /// Apply one probe result to the health map.
    pub async fn record_probe(
        &self,
        url: &str,
        healthy: bool,
        response_time: Duration,
        error: Option<&str>,
    ) {
        let mut map = self.url_health.write().await;
        let health = map
            .entry(url.to_string())
            .or_insert_with(|| UrlHealth::new(url));

        let was_healthy = health.healthy;
        health.healthy = healthy;
        health.last_response_time = response_time;
        health.last_check = Utc::now();
        health.total_checks += 1;

        if !response_time.is_zero() {
            if health.min_time.is_zero() || response_time < health.min_time {
                health.min_time = response_time;
            }
            if response_time > health.max_time {
                health.max_time = response_time;
            }

            if healthy {
                health.successful_checks += 1;
                let n = health.successful_checks;
                health.average_time = if n == 1 {
                    response_time
                } else {
                    let total =
                        health.average_time.as_nanos() * (n as u128 - 1) + response_time.as_nanos();
                    Duration::from_nanos((total / n as u128) as u64)
                };
            }
        }

        if healthy {
            health.consecutive_errors = 0;
            if !was_healthy {
                info!(
                    "URL {} recovered (success rate: {:.1}%, avg: {:?}, min: {:?}, max: {:?})",
                    url,
                    health.success_rate(),
                    health.average_time,
                    health.min_time,
                    health.max_time
                );
            }
        } else {
            health.consecutive_errors += 1;
            // First failure always, then every 10th, to keep the log quiet
            if was_healthy || health.consecutive_errors % 10 == 0 {
                match error {
                    Some(msg) => warn!(
                        "URL {} unhealthy: {} (failure #{}, success rate: {:.1}%)",
                        url,
                        msg,
                        health.consecutive_errors,
                        health.success_rate()
                    ),
                    None => warn!(
                        "URL {} unhealthy (failure #{}, success rate: {:.1}%)",
                        url,
                        health.consecutive_errors,
                        health.success_rate()
                    ),
                }
            }
        }
    }

    /// Pick the fastest healthy URL from a route's list.
    ///
    /// A single-URL route never consults health. A URL with no record yet is
    /// returned optimistically. When nothing is healthy the first URL is the
    /// fallback, with a warning. `None` only for an empty list.
    pub async fn select_fastest_healthy(&self, urls: &[String]) -> Option<String> {
        if urls.is_empty() {
            return None;
        }
        if urls.len() == 1 {
            return Some(urls[0].clone());
        }

        let map = self.url_health.read().await;

        let mut fastest: Option<(&String, Duration)> = None;
        let mut healthy_count = 0usize;

        for url in urls {
            let health = match map.get(url) {
                Some(h) => h,
                None => {
                    info!("No health data for {} yet, using as default", url);
                    return Some(url.clone());
                }
            };

            if !health.healthy {
                continue;
            }
            healthy_count += 1;

            let preferred = if health.successful_checks > 0 && !health.average_time.is_zero() {
                health.average_time
            } else {
                health.last_response_time
            };

            if fastest.map_or(true, |(_, best)| preferred < best) {
                fastest = Some((url, preferred));
            }
        }

        if healthy_count == 0 {
            warn!(
                "No healthy URLs among {} candidates, using first as fallback: {}",
                urls.len(),
                urls[0]
            );
            return Some(urls[0].clone());
        }

        if healthy_count > 1 {
            if let Some((url, time)) = fastest {
                debug!(
                    "Selected fastest of {} healthy URLs: {} ({:?})",
                    healthy_count, url, time
                );
            }
        }

        fastest.map(|(url, _)| url.clone())
    }

    /// Snapshot of one URL's health
    pub async fn url_health(&self, url: &str) -> Option<UrlHealth> {
        self.url_health.read().await.get(url).cloned()
    }

    /// Snapshot of the whole health map
    pub async fn all_health(&self) -> HashMap<String, UrlHealth> {
        self.url_health.read().await.clone()
    }
}

fn join_probe_url(base: &str, path: &str) -> String {
    if path.is_empty() || path == "/" {
        return base.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_join_probe_url() {
        assert_eq!(join_probe_url("http://u", "/"), "http://u");
        assert_eq!(join_probe_url("http://u", ""), "http://u");
        assert_eq!(join_probe_url("http://u/", "/health"), "http://u/health");
        assert_eq!(join_probe_url("http://u", "health"), "http://u/health");
    }

    #[tokio::test]
    async fn test_rolling_average_over_successes_only() {
        let monitor = HealthMonitor::new();
        let url = "http://a";

        monitor.record_probe(url, true, ms(100), None).await;
        monitor.record_probe(url, true, ms(200), None).await;
        monitor.record_probe(url, false, ms(900), Some("down")).await;
        monitor.record_probe(url, true, ms(300), None).await;

        let h = monitor.url_health(url).await.unwrap();
        assert_eq!(h.total_checks, 4);
        assert_eq!(h.successful_checks, 3);
        // (100 + 200 + 300) / 3; failed probes do not pollute the average
        assert_eq!(h.average_time, ms(200));
        assert_eq!(h.min_time, ms(100));
        assert_eq!(h.max_time, ms(900));
        assert!(h.successful_checks <= h.total_checks);
        assert!(h.average_time <= h.max_time);
    }

    #[tokio::test]
    async fn test_consecutive_errors_reset_on_success() {
        let monitor = HealthMonitor::new();
        let url = "http://a";

        monitor.record_probe(url, false, ms(10), Some("x")).await;
        monitor.record_probe(url, false, ms(10), Some("x")).await;
        assert_eq!(monitor.url_health(url).await.unwrap().consecutive_errors, 2);
        assert!(!monitor.url_health(url).await.unwrap().healthy);

        monitor.record_probe(url, true, ms(10), None).await;
        let h = monitor.url_health(url).await.unwrap();
        assert_eq!(h.consecutive_errors, 0);
        assert!(h.healthy);
    }

    #[tokio::test]
    async fn test_select_single_url_skips_health() {
        let monitor = HealthMonitor::new();
        let urls = vec!["http://only".to_string()];
        monitor.record_probe("http://only", false, ms(5), Some("down")).await;

        // Single-URL routes always dispatch
        assert_eq!(
            monitor.select_fastest_healthy(&urls).await,
            Some("http://only".to_string())
        );
    }

    #[tokio::test]
    async fn test_select_empty_list() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.select_fastest_healthy(&[]).await, None);
    }

    #[tokio::test]
    async fn test_select_unknown_url_is_optimistic() {
        let monitor = HealthMonitor::new();
        monitor.record_probe("http://a", true, ms(50), None).await;
        let urls = vec!["http://a".to_string(), "http://new".to_string()];

        assert_eq!(
            monitor.select_fastest_healthy(&urls).await,
            Some("http://new".to_string())
        );
    }

    #[tokio::test]
    async fn test_select_fastest_by_average() {
        let monitor = HealthMonitor::new();
        monitor.record_probe("http://a", true, ms(50), None).await;
        monitor.record_probe("http://b", true, ms(200), None).await;
        let urls = vec!["http://a".to_string(), "http://b".to_string()];

        for _ in 0..10 {
            assert_eq!(
                monitor.select_fastest_healthy(&urls).await,
                Some("http://a".to_string())
            );
        }

        // A goes down; B takes over
        monitor.record_probe("http://a", false, ms(50), Some("down")).await;
        assert_eq!(
            monitor.select_fastest_healthy(&urls).await,
            Some("http://b".to_string())
        );
    }

    #[tokio::test]
    async fn test_select_falls_back_to_first_when_all_unhealthy() {
        let monitor = HealthMonitor::new();
        monitor.record_probe("http://a", false, ms(5), Some("x")).await;
        monitor.record_probe("http://b", false, ms(5), Some("x")).await;
        let urls = vec!["http://a".to_string(), "http://b".to_string()];

        assert_eq!(
            monitor.select_fastest_healthy(&urls).await,
            Some("http://a".to_string())
        );
    }

    #[tokio::test]
    async fn test_select_prefers_smaller_average() {
        let monitor = HealthMonitor::new();
        monitor.record_probe("http://a", true, ms(400), None).await;
        monitor.record_probe("http://b", true, ms(30), None).await;
        let urls = vec!["http://a".to_string(), "http://b".to_string()];

        assert_eq!(
            monitor.select_fastest_healthy(&urls).await,
            Some("http://b".to_string())
        );
    }

    #[tokio::test]
    async fn test_probe_ladder_accepts_well_known_path() {
        // Upstream that 404s everywhere except /ping
        let make_svc = hyper::service::make_service_fn(|_| async {
            Ok::<_, std::convert::Infallible>(hyper::service::service_fn(|req| async move {
                let status = if req.uri().path() == "/ping" {
                    hyper::StatusCode::OK
                } else {
                    hyper::StatusCode::NOT_FOUND
                };
                Ok::<_, std::convert::Infallible>(
                    hyper::Response::builder()
                        .status(status)
                        .body(hyper::Body::empty())
                        .unwrap(),
                )
            }))
        });
        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);

        let monitor = HealthMonitor::new();
        let (healthy, _, error) = monitor
            .perform_probe(&format!("http://{}", addr), "")
            .await;
        assert!(healthy, "{:?}", error);
    }

    #[tokio::test]
    async fn test_probe_treats_all_404_as_reachable() {
        let make_svc = hyper::service::make_service_fn(|_| async {
            Ok::<_, std::convert::Infallible>(hyper::service::service_fn(|_req| async move {
                Ok::<_, std::convert::Infallible>(
                    hyper::Response::builder()
                        .status(hyper::StatusCode::NOT_FOUND)
                        .body(hyper::Body::empty())
                        .unwrap(),
                )
            }))
        });
        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);

        let monitor = HealthMonitor::new();
        let (healthy, _, _) = monitor
            .perform_probe(&format!("http://{}", addr), "/")
            .await;
        assert!(healthy);
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_unhealthy() {
        let monitor = HealthMonitor::new();
        let (healthy, _, error) = monitor.perform_probe("http://127.0.0.1:1", "/").await;
        assert!(!healthy);
        assert!(error.is_some());
    }
}
