use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One entry in the route table.
///
/// `target_url` accepts a comma-separated list; `normalize()` splits it into
/// `target_urls`, which is the list the health monitor probes and the router
/// selects from. The route itself is immutable after configuration load.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Literal match, or prefix match when the path ends in `*`
    pub path: String,
    /// One upstream base URL, or several separated by commas
    pub target_url: String,
    /// Parsed upstream URLs; populated by `normalize()`
    #[serde(skip)]
    pub target_urls: Vec<String>,
    /// Allowed methods; empty matches any method
    #[serde(default)]
    pub methods: Vec<String>,
    /// Header overrides applied after copying client headers (set semantics)
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Outbound HTTP proxy for this route only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    /// Health probe path; empty means auto-detect
    #[serde(default)]
    pub health_check_path: String,
    /// Health probe interval in seconds
    #[serde(default)]
    pub health_check_delay: u64,
}

impl RouteConfig {
    /// Split the comma-separated `target_url` and fill health check defaults.
    pub fn normalize(&mut self) {
        self.target_urls = self
            .target_url
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if let Some(first) = self.target_urls.first() {
            self.target_url = first.clone();
        }

        if self.health_check_path.is_empty() {
            // API-shaped upstreams often have no page at "/"; leave the path
            // empty so the prober runs its auto-detect ladder instead.
            if !self.target_url.contains("api") {
                self.health_check_path = "/".to_string();
            }
        }

        if self.health_check_delay == 0 {
            self.health_check_delay = 30;
        }
        self.health_check_delay = self.health_check_delay.max(1);
    }

    /// Validate the route
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.path.is_empty() {
            return Err(anyhow::anyhow!("Route path cannot be empty"));
        }

        if self.target_urls.is_empty() {
            return Err(anyhow::anyhow!(
                "Route {} has no upstream URLs after parsing target_url",
                self.path
            ));
        }

        for url in &self.target_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(anyhow::anyhow!(
                    "Route {} upstream must be an HTTP/HTTPS URL: {}",
                    self.path,
                    url
                ));
            }
        }

        Ok(())
    }

    /// Whether this route matches the request path
    pub fn matches_path(&self, request_path: &str) -> bool {
        if let Some(prefix) = self.path.strip_suffix('*') {
            request_path.starts_with(prefix)
        } else {
            request_path == self.path
        }
    }

    /// Whether this route allows the request method.
    /// An empty method list matches every method.
    pub fn matches_method(&self, method: &str) -> bool {
        if self.methods.is_empty() {
            return true;
        }
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Whether the route path is a wildcard (`prefix/*`) match
    pub fn is_wildcard(&self) -> bool {
        self.path.ends_with('*')
    }
}
