/// HTTP client for forwarding MCP calls to backends.
///
/// No automatic retries here: proxied POSTs execute tools with side effects,
/// so a transient-failure retry could double-execute. Per-call deadlines are
/// enforced by the transport adapter; this client only bounds connect time.
use std::time::Duration;

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}
