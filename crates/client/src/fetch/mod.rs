//! HTTP fetch pipeline for the network edge.
//!
//! ### Response classification
//! - Any HTTP status is a response; only transport failures are errors.
//! - Connection failures and timeouts map to `NETWORK_UNAVAILABLE`.
//! - Responses from the page origin are `basic`, cross-origin `no-cors`
//!   loads are `opaque`, everything else cross-origin is `cors`.
//!
//! ### Limits
//! - Max redirects: 5
//! - Max body bytes: 5MB (configurable)

pub mod url;

use async_trait::async_trait;
use posa_core::{AppConfig, Error, ResponseSnapshot, ResponseType};
use reqwest::{Client, header};
use std::time::{Duration, Instant};

pub use self::url::{UrlError, require_http, resolve};

use crate::network::Network;
use crate::request::{CacheMode, Request, RequestMode};

/// Configuration for the fetch client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "posa-offline/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 5MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,

    /// Origin of the page issuing requests. When unset, each request's own
    /// origin is used.
    pub origin: Option<::url::Url>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "posa-offline/0.1".to_string(),
            max_bytes: 5 * 1024 * 1024,
            timeout: Duration::from_millis(20000),
            max_redirects: 5,
            origin: None,
        }
    }
}

impl FetchConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout: config.fetch_timeout(),
            origin: ::url::Url::parse(&config.origin).ok(),
            ..Self::default()
        }
    }
}

/// reqwest-backed [`Network`].
pub struct FetchClient {
    http: Client,
    config: FetchConfig,
}

impl FetchClient {
    /// Create a new fetch client with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::HttpError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }
}

/// Response type a page on `origin` would observe for `request` answered from `final_url`.
pub fn classify(origin: &::url::Url, request: &Request, final_url: &::url::Url) -> ResponseType {
    if origin.origin() == final_url.origin() {
        ResponseType::Basic
    } else if request.mode == RequestMode::NoCors {
        ResponseType::Opaque
    } else {
        ResponseType::Cors
    }
}

fn transport_error(url: &::url::Url, err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::NetworkUnavailable(format!("{url}: timed out"))
    } else {
        Error::NetworkUnavailable(format!("{url}: {err}"))
    }
}

#[async_trait]
impl Network for FetchClient {
    async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, Error> {
        require_http(&request.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let start = Instant::now();
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::InvalidInput(format!("method '{}': {e}", request.method)))?;

        let mut builder = self.http.request(method, request.url.as_str());
        if request.cache == CacheMode::NoStore {
            builder = builder.header(header::CACHE_CONTROL, "no-store");
        }

        let response = builder.send().await.map_err(|e| transport_error(&request.url, &e))?;

        let status = response.status();
        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::HttpError(format!("{} bytes exceeds {}", len, self.config.max_bytes)));
        }

        let final_url = response.url().clone();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect();

        let bytes = response.bytes().await.map_err(|e| transport_error(&request.url, &e))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::HttpError(format!("{} bytes exceeds {}", bytes.len(), self.config.max_bytes)));
        }

        let origin = self.config.origin.as_ref().unwrap_or(&request.url);
        let response_type = classify(origin, request, &final_url);
        let fetch_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            "fetched {} -> {} {} in {}ms ({} bytes)",
            request.url,
            final_url,
            status.as_u16(),
            fetch_ms,
            bytes.len()
        );

        let mut snapshot = ResponseSnapshot::new(final_url.as_str(), status.as_u16(), response_type, bytes);
        snapshot.headers = headers;
        Ok(snapshot)
    }
}
