use std::time::Duration;

use axum::http::{header, HeaderMap, Method, StatusCode};
use bytes::Bytes;

use super::config::UpstreamConfig;

/// The two supported upstreams. The agent is deliberately not a
/// general-purpose router; anything else 404s at the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
        }
    }

    /// Inbound route prefix stripped before forwarding.
    pub fn route_prefix(&self) -> &'static str {
        match self {
            Provider::Anthropic => "/anthropic",
            Provider::OpenAi => "/openai",
        }
    }
}

/// Fully buffered upstream response, ready to relay verbatim.
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Raw byte forwarder. Headers and bodies pass through opaquely; this client
/// never parses, logs, or stores authorization headers or body content.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    anthropic_base: String,
    openai_base: String,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(cfg: &UpstreamConfig, timeout_seconds: u64) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("agentcost-agent/0.1")
            // Avoid hanging forever on broken upstream TCP handshakes.
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            client,
            anthropic_base: cfg.anthropic_base_url.trim_end_matches('/').to_string(),
            openai_base: cfg.openai_base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    fn base_url(&self, provider: Provider) -> &str {
        match provider {
            Provider::Anthropic => &self.anthropic_base,
            Provider::OpenAi => &self.openai_base,
        }
    }

    /// Forward one buffered request and buffer the full response.
    ///
    /// `path_and_query` is the upstream path (route prefix already stripped),
    /// including any query string. Host and content-length are recomputed by
    /// the client from the buffered body; every other inbound header is
    /// forwarded unchanged.
    pub async fn forward(
        &self,
        provider: Provider,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ForwardedResponse, reqwest::Error> {
        let url = format!("{}{}", self.base_url(provider), path_and_query);

        let mut forwarded = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if name == header::HOST
                || name == header::CONTENT_LENGTH
                || name == header::TRANSFER_ENCODING
                || name == header::CONNECTION
            {
                continue;
            }
            forwarded.append(name.clone(), value.clone());
        }

        let resp = self
            .client
            .request(method, url)
            .headers(forwarded)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }
}
