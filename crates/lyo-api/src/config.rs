//! Pipeline configuration

use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.lyo.app";

/// Settings for the shared HTTP client.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// API origin without the version segment, e.g. `https://api.lyo.app`
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Whole-request deadline, including the response body
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Build the HTTP client shared by the pipeline and the session manager.
pub fn build_http_client(config: &PipelineConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .user_agent(concat!("lyo-session/", env!("CARGO_PKG_VERSION")))
        .build()
}
