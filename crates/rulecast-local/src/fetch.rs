//! Outcome-typed HTML fetching: cache + governor + transport + policy hook.
//!
//! Every fetch resolves to exactly one of HIT / REVALIDATED / MISS /
//! FALLBACK on the success path; FAIL travels as the error. Non-2xx bodies
//! are never cached, and a canceled fetch leaves the cache untouched.

use crate::governor::Governor;
use crate::FsCache;
use rulecast_core::{
    iso_from_ms, CacheEntry, Clock, Error, FetchOutcome, FetchPolicy, HtmlFetch, HttpBackend,
    HttpRequest, Result,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Entries younger than this are served without touching the network.
    pub fresh_window_ms: u64,
    /// Entries younger than this (but past the fresh window) are
    /// revalidated with a conditional HEAD.
    pub hard_ttl_ms: u64,
    /// Per-request timeout for rules-site fetches.
    pub timeout_ms: u64,
    pub accept_language: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            fresh_window_ms: 24 * 60 * 60 * 1000,
            hard_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            timeout_ms: 10_000,
            accept_language: "en-US,en;q=0.9".to_string(),
        }
    }
}

pub struct HtmlFetcher {
    http: Arc<dyn HttpBackend>,
    cache: FsCache,
    governor: Arc<Governor>,
    policy: Arc<dyn FetchPolicy>,
    clock: Arc<dyn Clock>,
    cfg: FetcherConfig,
}

impl HtmlFetcher {
    pub fn new(
        http: Arc<dyn HttpBackend>,
        cache: FsCache,
        governor: Arc<Governor>,
        policy: Arc<dyn FetchPolicy>,
        clock: Arc<dyn Clock>,
        cfg: FetcherConfig,
    ) -> Self {
        Self {
            http,
            cache,
            governor,
            policy,
            clock,
            cfg,
        }
    }

    pub fn cache(&self) -> &FsCache {
        &self.cache
    }

    fn standard_headers(&self) -> BTreeMap<String, String> {
        let mut h = BTreeMap::new();
        h.insert("User-Agent".to_string(), self.governor.user_agent());
        h.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        );
        h.insert(
            "Accept-Language".to_string(),
            self.cfg.accept_language.clone(),
        );
        h.insert("Accept-Encoding".to_string(), "gzip, deflate, br".to_string());
        h.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
        h
    }

    /// Governed send with bounded retries on transient failures.
    async fn send_governed(
        &self,
        req: &HttpRequest,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<rulecast_core::HttpResponse> {
        let max = self.governor.config().max_retries;
        let mut attempt = 0u32;
        loop {
            self.governor.acquire(host, cancel).await?;
            match self.http.send(req).await {
                Ok(resp) if resp.status >= 500 && attempt < max => {
                    tracing::debug!(url = %req.url, status = resp.status, attempt, "retrying");
                    self.governor.backoff(attempt, cancel).await?;
                    attempt += 1;
                }
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < max => {
                    tracing::debug!(url = %req.url, attempt, "retrying after {e}");
                    self.governor.backoff(attempt, cancel).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn fetch_html(
        &self,
        url_str: &str,
        cancel: &CancellationToken,
    ) -> Result<HtmlFetch> {
        let parsed =
            url::Url::parse(url_str).map_err(|e| Error::BadInput(format!("{url_str}: {e}")))?;
        self.policy.check(&parsed)?;
        let host = parsed.host_str().unwrap_or("no-host").to_string();

        let entry = self.cache.get(url_str);
        let now = self.clock.now_ms();

        if let Some(e) = &entry {
            if e.is_fresh(self.cfg.fresh_window_ms, now) {
                return Ok(HtmlFetch {
                    outcome: FetchOutcome::Hit,
                    body: e.body.clone(),
                    final_url: e.url.clone(),
                });
            }
            if e.is_fresh(self.cfg.hard_ttl_ms, now) {
                match self.revalidate(e, &host, cancel).await {
                    Ok(Some(fetch)) => return Ok(fetch),
                    Ok(None) => {} // HEAD said the body changed; refetch below
                    Err(Error::Canceled) => return Err(Error::Canceled),
                    Err(e) => {
                        tracing::debug!(url = %url_str, "revalidation failed, refetching: {e}");
                    }
                }
            }
        }

        match self.get_fresh(url_str, &host, cancel).await {
            Ok(fetch) => Ok(fetch),
            Err(Error::Canceled) => Err(Error::Canceled),
            Err(err) => match entry {
                // Stale-but-present beats failing the caller.
                Some(e) => {
                    tracing::warn!(url = %url_str, kind = err.kind(), "serving stale cache after fetch failure");
                    Ok(HtmlFetch {
                        outcome: FetchOutcome::Fallback,
                        body: e.body,
                        final_url: e.url,
                    })
                }
                None => Err(err),
            },
        }
    }

    /// Conditional HEAD. `Ok(Some)` on 304 (entry refreshed), `Ok(None)`
    /// when the origin reports a changed body.
    async fn revalidate(
        &self,
        entry: &CacheEntry,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<HtmlFetch>> {
        let mut req = HttpRequest::head(&entry.url);
        req.headers = self.standard_headers();
        if let Some(ms) = entry.fetched_at_ms() {
            req.headers
                .insert("If-Modified-Since".to_string(), httpdate_from_ms(ms));
        }
        req.timeout_ms = Some(self.cfg.timeout_ms);

        let resp = self.send_governed(&req, host, cancel).await?;
        if resp.status != 304 {
            return Ok(None);
        }
        let refreshed = CacheEntry {
            fetched_at: iso_from_ms(self.clock.now_ms()),
            ..entry.clone()
        };
        if !cancel.is_cancelled() {
            self.cache.put_logged(&refreshed);
        }
        Ok(Some(HtmlFetch {
            outcome: FetchOutcome::Revalidated,
            body: refreshed.body,
            final_url: refreshed.url,
        }))
    }

    async fn get_fresh(
        &self,
        url_str: &str,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<HtmlFetch> {
        let mut req = HttpRequest::get(url_str);
        req.headers = self.standard_headers();
        req.timeout_ms = Some(self.cfg.timeout_ms);

        let resp = self.send_governed(&req, host, cancel).await?;
        if !resp.is_2xx() {
            return Err(Error::HttpStatus(resp.status));
        }
        let body = resp.text_lossy();
        if !cancel.is_cancelled() {
            let entry = FsCache::entry(url_str, body.clone(), resp.status, self.clock.now_ms());
            self.cache.put_logged(&entry);
        }
        Ok(HtmlFetch {
            outcome: FetchOutcome::Miss,
            body,
            final_url: resp.final_url,
        })
    }
}

/// RFC 7231 HTTP-date (always GMT).
pub fn httpdate_from_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::GovernorConfig;
    use crate::testutil::FakeClock;
    use rulecast_core::{AllowAllPolicy, HttpMethod, HttpResponse};
    use std::sync::Mutex;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    /// Scripted transport: pops one canned reply per request and records
    /// what was sent.
    #[derive(Default)]
    struct FakeBackend {
        replies: Mutex<Vec<Result<HttpResponse>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl FakeBackend {
        fn reply(status: u16, body: &str) -> Result<HttpResponse> {
            Ok(HttpResponse {
                final_url: "https://rules.example/page".to_string(),
                status,
                headers: BTreeMap::new(),
                body: body.as_bytes().to_vec(),
            })
        }

        fn push(&self, r: Result<HttpResponse>) {
            self.replies.lock().unwrap().push(r);
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl HttpBackend for FakeBackend {
        async fn send(&self, req: &HttpRequest) -> Result<HttpResponse> {
            self.seen.lock().unwrap().push(req.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(Error::Network("no scripted reply".to_string()));
            }
            replies.remove(0)
        }
    }

    fn fetcher_with(
        backend: Arc<FakeBackend>,
        clock: Arc<FakeClock>,
        cache: FsCache,
    ) -> HtmlFetcher {
        let gov = Arc::new(Governor::new(
            clock.clone(),
            GovernorConfig {
                global_min_gap_ms: 0,
                jitter_ms: 0,
                ..GovernorConfig::default()
            },
        ));
        HtmlFetcher::new(
            backend,
            cache,
            gov,
            Arc::new(AllowAllPolicy),
            clock,
            FetcherConfig::default(),
        )
    }

    fn seeded_cache(dir: &std::path::Path, url: &str, age_ms: u64, now_ms: u64) -> FsCache {
        let cache = FsCache::new(dir.to_path_buf());
        cache
            .put(&FsCache::entry(
                url,
                "<html>cached</html>".into(),
                200,
                now_ms - age_ms,
            ))
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn fresh_entry_is_a_hit_without_network() {
        let tmp = tempfile::tempdir().unwrap();
        let now = 30 * DAY_MS;
        let url = "https://rules.example/page";
        let cache = seeded_cache(tmp.path(), url, 12 * 60 * 60 * 1000, now);
        let backend = Arc::new(FakeBackend::default());
        let f = fetcher_with(backend.clone(), FakeClock::at(now), cache);

        let r = f.fetch_html(url, &CancellationToken::new()).await.unwrap();
        assert_eq!(r.outcome, FetchOutcome::Hit);
        assert_eq!(r.body, "<html>cached</html>");
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn stale_entry_with_304_head_is_revalidated() {
        let tmp = tempfile::tempdir().unwrap();
        let now = 30 * DAY_MS;
        let url = "https://rules.example/page";
        let cache = seeded_cache(tmp.path(), url, 2 * DAY_MS, now);
        let backend = Arc::new(FakeBackend::default());
        backend.push(FakeBackend::reply(304, ""));
        let f = fetcher_with(backend.clone(), FakeClock::at(now), cache.clone());

        let r = f.fetch_html(url, &CancellationToken::new()).await.unwrap();
        assert_eq!(r.outcome, FetchOutcome::Revalidated);
        assert_eq!(r.body, "<html>cached</html>");

        let reqs = backend.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, HttpMethod::Head);
        assert!(reqs[0].headers.contains_key("If-Modified-Since"));

        // The entry's fetchedAt was refreshed: a second fetch is a plain HIT.
        let r2 = f.fetch_html(url, &CancellationToken::new()).await.unwrap();
        assert_eq!(r2.outcome, FetchOutcome::Hit);
    }

    #[tokio::test]
    async fn head_200_forces_refetch() {
        let tmp = tempfile::tempdir().unwrap();
        let now = 30 * DAY_MS;
        let url = "https://rules.example/page";
        let cache = seeded_cache(tmp.path(), url, 2 * DAY_MS, now);
        let backend = Arc::new(FakeBackend::default());
        backend.push(FakeBackend::reply(200, ""));
        backend.push(FakeBackend::reply(200, "<html>new</html>"));
        let f = fetcher_with(backend.clone(), FakeClock::at(now), cache);

        let r = f.fetch_html(url, &CancellationToken::new()).await.unwrap();
        assert_eq!(r.outcome, FetchOutcome::Miss);
        assert_eq!(r.body, "<html>new</html>");
        let reqs = backend.requests();
        assert_eq!(reqs[0].method, HttpMethod::Head);
        assert_eq!(reqs[1].method, HttpMethod::Get);
    }

    #[tokio::test]
    async fn very_old_entry_skips_revalidation_and_refetches() {
        let tmp = tempfile::tempdir().unwrap();
        let now = 30 * DAY_MS;
        let url = "https://rules.example/page";
        let cache = seeded_cache(tmp.path(), url, 8 * DAY_MS, now);
        let backend = Arc::new(FakeBackend::default());
        backend.push(FakeBackend::reply(200, "<html>new</html>"));
        let f = fetcher_with(backend.clone(), FakeClock::at(now), cache);

        let r = f.fetch_html(url, &CancellationToken::new()).await.unwrap();
        assert_eq!(r.outcome, FetchOutcome::Miss);
        let reqs = backend.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, HttpMethod::Get);
    }

    #[tokio::test]
    async fn no_entry_miss_writes_cache_on_2xx() {
        let tmp = tempfile::tempdir().unwrap();
        let url = "https://rules.example/page";
        let cache = FsCache::new(tmp.path().to_path_buf());
        let backend = Arc::new(FakeBackend::default());
        backend.push(FakeBackend::reply(200, "<html>fresh</html>"));
        let f = fetcher_with(backend, FakeClock::at(DAY_MS), cache.clone());

        let r = f.fetch_html(url, &CancellationToken::new()).await.unwrap();
        assert_eq!(r.outcome, FetchOutcome::Miss);
        let stored = cache.get(url).expect("2xx body cached");
        assert_eq!(stored.body, "<html>fresh</html>");
    }

    #[tokio::test]
    async fn non_2xx_is_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let url = "https://rules.example/page";
        let cache = FsCache::new(tmp.path().to_path_buf());
        let backend = Arc::new(FakeBackend::default());
        backend.push(FakeBackend::reply(404, "nope"));
        let f = fetcher_with(backend, FakeClock::at(DAY_MS), cache.clone());

        let err = f
            .fetch_html(url, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "FETCH_NON_2XX");
        assert!(cache.get(url).is_none());
    }

    #[tokio::test]
    async fn fetch_failure_with_stale_cache_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let now = 30 * DAY_MS;
        let url = "https://rules.example/page";
        let cache = seeded_cache(tmp.path(), url, 8 * DAY_MS, now);
        let backend = Arc::new(FakeBackend::default());
        // All attempts (initial + retries) fail.
        for _ in 0..3 {
            backend.push(Err(Error::Network("connection reset".into())));
        }
        let f = fetcher_with(backend, FakeClock::at(now), cache);

        let r = f.fetch_html(url, &CancellationToken::new()).await.unwrap();
        assert_eq!(r.outcome, FetchOutcome::Fallback);
        assert_eq!(r.body, "<html>cached</html>");
    }

    #[tokio::test]
    async fn fetch_failure_without_cache_fails_with_cause() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FsCache::new(tmp.path().to_path_buf());
        let backend = Arc::new(FakeBackend::default());
        for _ in 0..3 {
            backend.push(Err(Error::Network("dns failure".into())));
        }
        let f = fetcher_with(backend, FakeClock::at(DAY_MS), cache);

        let err = f
            .fetch_html("https://rules.example/page", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "FETCH_NETWORK");
    }

    #[tokio::test]
    async fn transient_5xx_is_retried_then_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FsCache::new(tmp.path().to_path_buf());
        let backend = Arc::new(FakeBackend::default());
        backend.push(FakeBackend::reply(503, ""));
        backend.push(FakeBackend::reply(200, "<html>ok</html>"));
        let f = fetcher_with(backend.clone(), FakeClock::at(DAY_MS), cache);

        let r = f
            .fetch_html("https://rules.example/page", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(r.outcome, FetchOutcome::Miss);
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn standard_headers_are_attached() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FsCache::new(tmp.path().to_path_buf());
        let backend = Arc::new(FakeBackend::default());
        backend.push(FakeBackend::reply(200, "<html/>"));
        let f = fetcher_with(backend.clone(), FakeClock::at(DAY_MS), cache);

        f.fetch_html("https://rules.example/page", &CancellationToken::new())
            .await
            .unwrap();
        let req = &backend.requests()[0];
        for k in [
            "User-Agent",
            "Accept",
            "Accept-Language",
            "Accept-Encoding",
            "Upgrade-Insecure-Requests",
        ] {
            assert!(req.headers.contains_key(k), "missing header {k}");
        }
    }

    #[test]
    fn httpdate_formatting() {
        assert_eq!(httpdate_from_ms(0), "Thu, 01 Jan 1970 00:00:00 GMT");
    }
}
