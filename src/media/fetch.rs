//! Remote fetch
//!
//! [`RemoteFetcher`] performs the two network steps of URL ingestion:
//!
//! 1. [`preflight`](RemoteFetcher::preflight): a `HEAD` request whose
//!    Content-Type and Content-Length are checked before any body is read
//! 2. [`download`](RemoteFetcher::download): a streaming `GET` that stops as
//!    soon as the body exceeds the size limit
//!
//! Both run the [`UrlPolicy`] checks first, resolve the host and verify
//! every resolved address, then pin the connection to a verified address.
//! Redirects are not followed.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

use super::classify::RemoteMetadata;
use super::context::{IngestContext, Interrupted};
use super::ssrf::{UrlPolicy, UrlPolicyError};

/// Default request timeout in milliseconds (30s)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Maximum request timeout in milliseconds (5 minutes)
pub const MAX_FETCH_TIMEOUT_MS: u64 = 300_000;

/// Filename used when a URL has no usable last path segment
pub const DEFAULT_FILENAME: &str = "download";

const USER_AGENT: &str = concat!("mediagate/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Policy(#[from] UrlPolicyError),

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("remote server returned status {code}")]
    Status { code: u16 },

    #[error("response too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("stream read error: {0}")]
    StreamRead(String),

    #[error("fetch interrupted: {0}")]
    Interrupted(#[from] Interrupted),
}

impl FetchError {
    /// Whether repeating the request could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::DnsResolution(_) | FetchError::Request(_) | FetchError::StreamRead(_) => {
                true
            }
            FetchError::Status { code } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// Network settings for remote ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchConfig {
    /// Per-request timeout in milliseconds (default 30s, capped at 5min)
    pub timeout_ms: u64,

    /// Permit plain `http://` URLs
    pub allow_http: bool,

    /// Permit loopback and private-network destinations
    pub allow_private_networks: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            allow_http: false,
            allow_private_networks: false,
        }
    }
}

impl FetchConfig {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms.min(MAX_FETCH_TIMEOUT_MS);
        self
    }

    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    pub fn with_allow_private_networks(mut self, allow: bool) -> Self {
        self.allow_private_networks = allow;
        self
    }

    pub fn policy(&self) -> UrlPolicy {
        UrlPolicy {
            allow_http: self.allow_http,
            allow_private_networks: self.allow_private_networks,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.min(MAX_FETCH_TIMEOUT_MS))
    }
}

/// Body of a completed download
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: Bytes,

    /// Last path segment of the URL
    pub filename: String,

    /// Content-Length reported by the server, if any
    pub declared_size: Option<u64>,
}

/// HTTP client for pre-flight checks and bounded downloads
#[derive(Debug, Clone, Default)]
pub struct RemoteFetcher {
    config: FetchConfig,
}

impl RemoteFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Check a URL against the destination policy without touching the network
    pub fn check_url(&self, raw: &str) -> Result<Url, FetchError> {
        Ok(self.config.policy().check_url(raw)?)
    }

    /// Issue a `HEAD` request and report the declared type and length.
    ///
    /// A non-2xx status is an error.
    pub async fn preflight(
        &self,
        raw_url: &str,
        ctx: &IngestContext,
    ) -> Result<RemoteMetadata, FetchError> {
        let url = self.check_url(raw_url)?;
        let client = ctx.guard(self.client_for(&url)).await??;

        let response = ctx
            .guard(client.head(url.clone()).send())
            .await?
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
            });
        }

        let headers = response.headers();
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        // HEAD responses carry no body, so read the header rather than
        // Response::content_length().
        let content_length = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        tracing::debug!(
            url = %url,
            status = status.as_u16(),
            content_type = ?content_type,
            content_length = ?content_length,
            "pre-flight check complete"
        );

        Ok(RemoteMetadata {
            content_type,
            content_length,
        })
    }

    /// Download the body of `raw_url`, failing once it exceeds `max_size`.
    pub async fn download(
        &self,
        raw_url: &str,
        max_size: u64,
        ctx: &IngestContext,
    ) -> Result<Downloaded, FetchError> {
        let url = self.check_url(raw_url)?;
        let client = ctx.guard(self.client_for(&url)).await??;

        let response = ctx
            .guard(client.get(url.clone()).send())
            .await?
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
            });
        }

        let declared_size = response.content_length();
        if let Some(declared) = declared_size {
            if declared > max_size {
                return Err(FetchError::TooLarge {
                    size: declared,
                    max: max_size,
                });
            }
        }

        let bytes = ctx
            .guard(read_with_limit(response, max_size))
            .await??;

        tracing::debug!(url = %url, size = bytes.len(), "download complete");

        Ok(Downloaded {
            bytes,
            filename: filename_from_url(&url),
            declared_size,
        })
    }

    /// Build a client pinned to a verified address of `url`'s host.
    async fn client_for(&self, url: &Url) -> Result<Client, FetchError> {
        let mut builder = Client::builder()
            .timeout(self.config.timeout())
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none());

        if let Some(Host::Domain(domain)) = url.host() {
            let port = url.port_or_known_default().unwrap_or(443);
            let ip = self.resolve_checked(domain).await?;
            builder = builder.resolve(domain, SocketAddr::new(ip, port));
            tracing::debug!(host = %domain, resolved_ip = %ip, "pinned resolved address");
        }

        builder
            .build()
            .map_err(|e| FetchError::Request(format!("failed to build HTTP client: {}", e)))
    }

    /// Resolve `host` and verify every address it maps to.
    async fn resolve_checked(&self, host: &str) -> Result<IpAddr, FetchError> {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let lookup = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| FetchError::DnsResolution(format!("{}: {}", host, e)))?;

        let policy = self.config.policy();
        let mut first = None;
        for ip in lookup.iter() {
            policy.check_resolved(host, ip)?;
            first.get_or_insert(ip);
        }
        first.ok_or_else(|| FetchError::DnsResolution(format!("no addresses for {}", host)))
    }
}

async fn read_with_limit(response: reqwest::Response, max_size: u64) -> Result<Bytes, FetchError> {
    let mut body = BytesMut::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::StreamRead(e.to_string()))?;
        let size = (body.len() + chunk.len()) as u64;
        if size > max_size {
            return Err(FetchError::TooLarge {
                size,
                max: max_size,
            });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body.freeze())
}

/// Last non-empty path segment of `url`, or [`DEFAULT_FILENAME`]
pub fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .filter(|name| !name.contains('/') && name != "." && name != "..")
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
}
