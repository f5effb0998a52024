use rulecast_core::{
    iso_from_ms, CacheEntry, Clock, Error, HttpBackend, HttpMethod, HttpRequest, HttpResponse,
    Result,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod bgg;
pub mod fetch;
pub mod governor;
pub mod harvest;
pub mod pdf;
pub mod pipeline;
pub mod shellout;
pub mod slug;
pub mod storyboard;

/// Production clock: system wall time + tokio sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Persistent, content-addressed store of fetch responses.
///
/// One JSON file per entry at `<root>/<host>/<safeKey>.json`. The cache is
/// advisory: write failures are logged and swallowed, unreadable or
/// colliding entries read as absent.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
}

impl FsCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Root from `DATA_DIR` when set, else a user-owned temp dir.
    pub fn from_env() -> Self {
        let root = std::env::var("DATA_DIR")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(|s| PathBuf::from(s).join("cache"))
            .unwrap_or_else(|| std::env::temp_dir().join("rulecast-cache"));
        Self::new(root)
    }

    /// Deterministic (host, safeKey) for a request URL.
    ///
    /// The key keeps a readable sanitized prefix and appends a short hash so
    /// distinct URLs never share a file in practice; a genuine collision is
    /// still detected at read time by comparing the stored URL.
    pub fn key_for(url_str: &str) -> (String, String) {
        let host = url::Url::parse(url_str)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_else(|| "no-host".to_string());
        let host = sanitize_component(&host);

        let mut key: String = sanitize_component(url_str);
        key.truncate(100);
        let digest = sha256_hex(url_str.as_bytes());
        let key = format!("{key}-{}", &digest[..12]);
        (host, key)
    }

    fn path_for(&self, url_str: &str) -> PathBuf {
        let (host, key) = Self::key_for(url_str);
        self.root.join(host).join(format!("{key}.json"))
    }

    /// Returns the entry if present and parsable; malformed entries and key
    /// collisions read as absent.
    pub fn get(&self, url_str: &str) -> Option<CacheEntry> {
        let bytes = fs::read(self.path_for(url_str)).ok()?;
        let entry: CacheEntry = serde_json::from_slice(&bytes).ok()?;
        if entry.url != url_str {
            // Different URL stored under the same key: treat as a miss.
            return None;
        }
        Some(entry)
    }

    /// Atomic write: temp file in the target directory, then rename.
    /// Readers never observe a partial file.
    pub fn put(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.path_for(&entry.url);
        let dir = path
            .parent()
            .ok_or_else(|| Error::Cache("cache path has no parent".to_string()))?;
        fs::create_dir_all(dir).map_err(|e| Error::Cache(e.to_string()))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::Cache(e.to_string()))?;
        let json = serde_json::to_vec(entry).map_err(|e| Error::Cache(e.to_string()))?;
        tmp.write_all(&json).map_err(|e| Error::Cache(e.to_string()))?;
        tmp.persist(&path)
            .map_err(|e| Error::Cache(e.to_string()))?;
        Ok(())
    }

    /// Advisory put: failures are logged, never surfaced to callers.
    pub fn put_logged(&self, entry: &CacheEntry) {
        if let Err(e) = self.put(entry) {
            tracing::warn!(kind = e.kind(), url = %entry.url, "cache write failed: {e}");
        }
    }

    /// Delete entries older than `ttl_ms`. Idempotent; returns the number of
    /// entries removed. Unreadable files are removed too.
    pub fn sweep(&self, ttl_ms: u64, now_ms: u64) -> usize {
        let mut removed = 0usize;
        let Ok(hosts) = fs::read_dir(&self.root) else {
            return 0;
        };
        for host in hosts.flatten() {
            let Ok(entries) = fs::read_dir(host.path()) else {
                continue;
            };
            for f in entries.flatten() {
                let p = f.path();
                if p.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                let expired = match fs::read(&p)
                    .ok()
                    .and_then(|b| serde_json::from_slice::<CacheEntry>(&b).ok())
                {
                    Some(e) => !e.is_fresh(ttl_ms, now_ms),
                    None => true,
                };
                if expired && fs::remove_file(&p).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Build a well-formed entry for a body fetched now.
    pub fn entry(url: &str, body: String, status: u16, now_ms: u64) -> CacheEntry {
        let sha256 = sha256_hex(body.as_bytes());
        CacheEntry {
            url: url.to_string(),
            body,
            status,
            fetched_at: iso_from_ms(now_ms),
            sha256,
        }
    }
}

fn sanitize_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = false;
    for c in s.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// reqwest-backed transport with the teacher-grade safety defaults:
/// bounded redirects, connect/read timeouts, rustls.
#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse> {
        let url =
            reqwest::Url::parse(&req.url).map_err(|e| Error::BadInput(e.to_string()))?;
        let mut rb = match req.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Head => self.client.head(url),
        };
        if let Some(to) = req.timeout() {
            rb = rb.timeout(to);
        }
        for (k, v) in &req.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(v),
            ) {
                rb = rb.header(name, value);
            }
        }

        let resp = rb.send().await.map_err(|e| Error::Network(e.to_string()))?;
        let final_url = resp.url().to_string();
        let status = resp.status().as_u16();
        let mut headers = BTreeMap::new();
        for (k, v) in resp.headers().iter() {
            if let Ok(s) = v.to_str() {
                headers.insert(k.as_str().to_string(), s.to_string());
            }
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Network(e.to_string()))?
            .to_vec();
        Ok(HttpResponse {
            final_url,
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use rulecast_core::{Clock, HttpBackend, HttpRequest, HttpResponse, Result};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Deterministic clock: `sleep` advances time instantly.
    #[derive(Debug, Default)]
    pub struct FakeClock {
        now_ms: AtomicU64,
    }

    impl FakeClock {
        pub fn at(ms: u64) -> Arc<Self> {
            let c = Self::default();
            c.now_ms.store(ms, Ordering::SeqCst);
            Arc::new(c)
        }

        pub fn advance(&self, ms: u64) {
            self.now_ms.fetch_add(ms, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }

        async fn sleep(&self, dur: Duration) {
            self.now_ms
                .fetch_add(dur.as_millis() as u64, Ordering::SeqCst);
            tokio::task::yield_now().await;
        }
    }

    /// URL-routed fake transport: exact-match routes reply, everything else
    /// is a 404. Records every request URL in order.
    #[derive(Default)]
    pub struct RoutedHttp {
        routes: Mutex<BTreeMap<String, (u16, String)>>,
        seen: Mutex<Vec<String>>,
    }

    impl RoutedHttp {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn route(&self, url: &str, status: u16, body: &str) {
            self.routes
                .lock()
                .unwrap()
                .insert(url.to_string(), (status, body.to_string()));
        }

        pub fn requested(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl HttpBackend for RoutedHttp {
        async fn send(&self, req: &HttpRequest) -> Result<HttpResponse> {
            self.seen.lock().unwrap().push(req.url.clone());
            let routes = self.routes.lock().unwrap();
            match routes.get(&req.url) {
                Some((status, body)) => Ok(HttpResponse {
                    final_url: req.url.clone(),
                    status: *status,
                    headers: BTreeMap::new(),
                    body: body.as_bytes().to_vec(),
                }),
                None => Ok(HttpResponse {
                    final_url: req.url.clone(),
                    status: 404,
                    headers: BTreeMap::new(),
                    body: Vec::new(),
                }),
            }
        }
    }

    /// Convenience: an `HtmlFetcher` wired with fakes and a zero-gap,
    /// zero-jitter governor so tests run instantly.
    pub fn instant_fetcher(
        http: Arc<dyn HttpBackend>,
        clock: Arc<FakeClock>,
        cache_root: &std::path::Path,
    ) -> Arc<crate::fetch::HtmlFetcher> {
        let gov = Arc::new(crate::governor::Governor::new(
            clock.clone(),
            crate::governor::GovernorConfig {
                global_min_gap_ms: 0,
                jitter_ms: 0,
                ..Default::default()
            },
        ));
        Arc::new(crate::fetch::HtmlFetcher::new(
            http,
            crate::FsCache::new(cache_root.to_path_buf()),
            gov,
            Arc::new(rulecast_core::AllowAllPolicy),
            clock,
            crate::fetch::FetcherConfig::default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trips_and_unknown_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FsCache::new(tmp.path().to_path_buf());

        let e = FsCache::entry("https://example.com/a?x=1", "<html/>".into(), 200, 1_000);
        cache.put(&e).unwrap();
        assert_eq!(cache.get("https://example.com/a?x=1"), Some(e));
        assert_eq!(cache.get("https://example.com/other"), None);
    }

    #[test]
    fn corrupted_entry_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FsCache::new(tmp.path().to_path_buf());

        let url = "https://example.com/broken";
        let e = FsCache::entry(url, "x".into(), 200, 0);
        cache.put(&e).unwrap();

        // Corrupt the file in place.
        let (host, key) = FsCache::key_for(url);
        let path = tmp.path().join(host).join(format!("{key}.json"));
        fs::write(&path, b"{ not json").unwrap();
        assert_eq!(cache.get(url), None);
    }

    #[test]
    fn colliding_url_reads_as_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FsCache::new(tmp.path().to_path_buf());

        let e = FsCache::entry("https://example.com/a", "body".into(), 200, 0);
        cache.put(&e).unwrap();

        // Force a different URL into the same file.
        let (host, key) = FsCache::key_for("https://example.com/a");
        let path = tmp.path().join(host).join(format!("{key}.json"));
        let mut stored: CacheEntry =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        stored.url = "https://example.com/b".to_string();
        fs::write(&path, serde_json::to_vec(&stored).unwrap()).unwrap();

        assert_eq!(cache.get("https://example.com/a"), None);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FsCache::new(tmp.path().to_path_buf());

        cache
            .put(&FsCache::entry("https://example.com/old", "o".into(), 200, 0))
            .unwrap();
        cache
            .put(&FsCache::entry(
                "https://example.com/new",
                "n".into(),
                200,
                90_000,
            ))
            .unwrap();

        let removed = cache.sweep(60_000, 100_000);
        assert_eq!(removed, 1);
        assert!(cache.get("https://example.com/old").is_none());
        assert!(cache.get("https://example.com/new").is_some());

        // Idempotent.
        assert_eq!(cache.sweep(60_000, 100_000), 0);
    }

    #[test]
    fn keys_are_stable_and_filesystem_safe() {
        let (host, key) = FsCache::key_for("https://www.ultraboardgames.com/catan/game-rules.php");
        assert_eq!(host, "www.ultraboardgames.com");
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'));
        let (_, key2) = FsCache::key_for("https://www.ultraboardgames.com/catan/game-rules.php");
        assert_eq!(key, key2);
    }
}
