use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod manifest;
pub mod storyboard;

pub use manifest::*;
pub use storyboard::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("pdf unreadable: {0}")]
    PdfUnreadable(String),
    #[error("ocr fallback selected but no engine is available")]
    OcrUnavailable,
    #[error("fetch disallowed by policy: {0}")]
    PolicyDisallowed(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("could not extract a numeric BGG id from {0:?}")]
    InvalidBggId(String),
    #[error("no rules page found after trying {} candidate urls", tried.len())]
    RulesPageNotFound { tried: Vec<String> },
    #[error("manifest contract violation: {}", missing.join(", "))]
    ContractViolation { missing: Vec<String> },
    #[error("operation canceled")]
    Canceled,
}

impl Error {
    /// Stable machine-readable error kind for hosts and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadInput(_) => "INGEST_BAD_INPUT",
            Error::PdfUnreadable(_) => "INGEST_PDF_UNREADABLE",
            Error::OcrUnavailable => "INGEST_OCR_UNAVAILABLE",
            Error::PolicyDisallowed(_) => "FETCH_POLICY_DISALLOWED",
            Error::Network(_) => "FETCH_NETWORK",
            Error::HttpStatus(_) => "FETCH_NON_2XX",
            Error::Cache(_) => "CACHE_WRITE",
            Error::InvalidBggId(_) => "BGG_INVALID_ID",
            Error::RulesPageNotFound { .. } => "HARVEST_NOT_FOUND",
            Error::ContractViolation { .. } => "STORYBOARD_CONTRACT_VIOLATION",
            Error::Canceled => "CANCELED",
        }
    }

    /// Transient failures are worth a bounded retry; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::HttpStatus(s) => *s >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Injectable time source.
///
/// Production uses the system wall clock; tests inject a stepped fake so
/// freshness windows and governor gaps are exact.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Wall-clock milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
    async fn sleep(&self, dur: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Head,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            timeout_ms: None,
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Head,
            ..Self::get(url)
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub final_url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_2xx(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Transport abstraction over GET/HEAD so tests can fake the network.
#[async_trait::async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse>;
}

/// Pluggable outbound-URL policy hook. Every fetch passes through it.
///
/// The default allows everything; hosts install their own allowlisting.
pub trait FetchPolicy: Send + Sync {
    fn check(&self, url: &url::Url) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

impl FetchPolicy for AllowAllPolicy {
    fn check(&self, _url: &url::Url) -> Result<()> {
        Ok(())
    }
}

/// In-process OCR worker, used when no rasterizer/OCR binary is on PATH.
#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize_png(&self, png: &[u8]) -> Result<String>;
}

/// One persisted fetch response.
///
/// The on-disk form is this struct as JSON at `<cacheRoot>/<host>/<safeKey>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub body: String,
    pub status: u16,
    /// RFC3339 wall-clock fetch time.
    #[serde(rename = "fetchedAt")]
    pub fetched_at: String,
    pub sha256: String,
}

impl CacheEntry {
    pub fn fetched_at_ms(&self) -> Option<u64> {
        chrono::DateTime::parse_from_rfc3339(&self.fetched_at)
            .ok()
            .and_then(|d| u64::try_from(d.timestamp_millis()).ok())
    }

    /// Elapsed wall time since `fetchedAt`. An unparsable timestamp reads as
    /// maximally old so freshness checks fail closed.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        match self.fetched_at_ms() {
            Some(t) => now_ms.saturating_sub(t),
            None => u64::MAX,
        }
    }

    pub fn is_fresh(&self, ttl_ms: u64, now_ms: u64) -> bool {
        self.age_ms(now_ms) < ttl_ms
    }
}

pub fn iso_from_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Exactly one outcome per fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchOutcome {
    Hit,
    Revalidated,
    Miss,
    Fallback,
    Fail,
}

/// A successful outcome-typed HTML fetch. `Fail` travels on the error path.
#[derive(Debug, Clone)]
pub struct HtmlFetch {
    pub outcome: FetchOutcome,
    pub body: String,
    pub final_url: String,
}
