//! Page fetching.
//!
//! [`HttpFetcher`] performs a single GET per call. It never retries: every
//! failure is reported as a [`FetchError`] and the runner's retry policy
//! decides what happens next.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use reqwest::{header::CONTENT_TYPE, redirect::Policy, Client};
use tracing::debug;

use vibevault_core::{defaults, parse_link_url, FetchError};

/// Retrieves the HTML of a page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<String, FetchError>;
}

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Whole-request timeout, including redirects and body.
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Bytes of body kept; the rest is discarded.
    pub max_body_bytes: usize,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(defaults::FETCH_TIMEOUT_SECS),
            max_redirects: defaults::FETCH_MAX_REDIRECTS,
            max_body_bytes: defaults::FETCH_MAX_BODY_BYTES,
            user_agent: defaults::FETCH_USER_AGENT.to_string(),
        }
    }
}

impl FetcherConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `FETCH_TIMEOUT_SECS` | `10` |
    /// | `FETCH_MAX_REDIRECTS` | `10` |
    /// | `FETCH_MAX_BODY_BYTES` | `2097152` |
    /// | `FETCH_USER_AGENT` | browser-like `VibeVaultBot/1.0` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_redirects: std::env::var("FETCH_MAX_REDIRECTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_redirects),
            max_body_bytes: std::env::var("FETCH_MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_body_bytes),
            user_agent: std::env::var("FETCH_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> vibevault_core::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| {
                vibevault_core::Error::Config(format!("Failed to create HTTP client: {e}"))
            })?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> vibevault_core::Result<Self> {
        Self::new(FetcherConfig::from_env())
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn map_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.config.timeout.as_secs())
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<String, FetchError> {
        let parsed = parse_link_url(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let start = Instant::now();

        let mut response = self
            .client
            .get(parsed)
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let encoding = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(charset_label)
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(UTF_8);

        let cap = self.config.max_body_bytes;
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.config.timeout.as_secs())
            } else {
                FetchError::Body(e.to_string())
            }
        })? {
            let room = cap.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= cap {
                break;
            }
        }

        let html = decode_truncated(body, encoding);
        debug!(
            subsystem = "jobs",
            component = "fetcher",
            op = "fetch",
            url,
            status = status.as_u16(),
            charset = encoding.name(),
            body_len = html.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Fetched page"
        );
        Ok(html)
    }
}

/// The `charset` parameter of a `Content-Type` value.
fn charset_label(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Decode the body in its declared charset. For UTF-8, a character cut off
/// by the body cap is dropped.
fn decode_truncated(mut bytes: Vec<u8>, encoding: &'static Encoding) -> String {
    if encoding == UTF_8 {
        if let Err(e) = std::str::from_utf8(&bytes) {
            if e.error_len().is_none() {
                bytes.truncate(e.valid_up_to());
            }
        }
    }
    let (text, _, _) = encoding.decode(&bytes);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(config: FetcherConfig) -> HttpFetcher {
        HttpFetcher::new(config).expect("client should build")
    }

    #[tokio::test]
    async fn test_fetch_returns_html_with_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .and(header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<title>Hi</title>"))
            .expect(1)
            .mount(&server)
            .await;

        let html = fetcher(FetcherConfig::default())
            .fetch(&format!("{}/article", server.uri()))
            .await
            .unwrap();
        assert_eq!(html, "<title>Hi</title>");
    }

    #[tokio::test]
    async fn test_fetch_follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", format!("{}/new", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let html = fetcher(FetcherConfig::default())
            .fetch(&format!("{}/old", server.uri()))
            .await
            .unwrap();
        assert_eq!(html, "moved");
    }

    #[tokio::test]
    async fn test_redirect_loop_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}/loop", server.uri())),
            )
            .mount(&server)
            .await;

        let err = fetcher(FetcherConfig::default())
            .fetch(&format!("{}/loop", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = fetcher(FetcherConfig::default())
            .fetch(&server.uri())
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Status(503));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let config = FetcherConfig::default().with_timeout(Duration::from_millis(200));
        let err = fetcher(config).fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_body_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(10_000)))
            .mount(&server)
            .await;

        let config = FetcherConfig::default().with_max_body_bytes(1_000);
        let html = fetcher(config).fetch(&server.uri()).await.unwrap();
        assert_eq!(html.len(), 1_000);
    }

    #[tokio::test]
    async fn test_invalid_urls_rejected_without_request() {
        let f = fetcher(FetcherConfig::default());
        for url in ["ftp://example.com/file", "not a url", "javascript:alert(1)"] {
            let err = f.fetch(url).await.unwrap_err();
            assert!(matches!(err, FetchError::InvalidUrl(_)), "{url}: {err:?}");
            assert!(!err.is_retryable());
        }
    }

    #[tokio::test]
    async fn test_declared_charset_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                b"<title>Caf\xe9 cr\xe8me</title>".to_vec(),
                "text/html; charset=ISO-8859-1",
            ))
            .mount(&server)
            .await;

        let html = fetcher(FetcherConfig::default())
            .fetch(&server.uri())
            .await
            .unwrap();
        assert_eq!(html, "<title>Café crème</title>");
    }

    #[test]
    fn test_charset_label() {
        assert_eq!(charset_label("text/html; charset=utf-8"), Some("utf-8"));
        assert_eq!(
            charset_label("text/html;Charset=\"windows-1252\""),
            Some("windows-1252")
        );
        assert_eq!(charset_label("text/html"), None);
        assert_eq!(charset_label("charset=utf-8"), None);
    }

    #[test]
    fn test_decode_truncated_drops_partial_char() {
        let mut bytes = "héllo".as_bytes().to_vec();
        bytes.truncate(2); // 'h' + first byte of 'é'
        assert_eq!(decode_truncated(bytes, UTF_8), "h");
    }
}
