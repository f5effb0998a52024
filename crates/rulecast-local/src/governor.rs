//! Politeness governor: minimum spacing between outbound requests, globally
//! and per host, plus the retry/backoff policy and the rotating UA pool.
//!
//! The governor owns the last-call map; nothing else in the process tracks
//! request timing. All waits are cancellable, and a canceled wait consumes
//! no slot.

use rand::Rng;
use rulecast_core::{Clock, Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

/// Translate a QPS ceiling into a minimum inter-request gap.
pub fn qps_to_min_gap_ms(qps: f64) -> u64 {
    if qps <= 0.0 {
        return 0;
    }
    (1000.0 / qps).round() as u64
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Minimum gap between any two outbound requests.
    pub global_min_gap_ms: u64,
    /// Minimum gap between requests to the same host (defaults to the
    /// global gap when no override is present).
    pub per_host_min_gap_ms: BTreeMap<String, u64>,
    pub user_agents: Vec<String>,
    /// Retry policy for transient failures.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// Upper bound on random backoff jitter; 0 makes retries deterministic.
    pub jitter_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            global_min_gap_ms: 1000,
            per_host_min_gap_ms: BTreeMap::new(),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            max_retries: 2,
            backoff_base_ms: 250,
            jitter_ms: 100,
        }
    }
}

impl GovernorConfig {
    pub fn min_gap_for(&self, host: &str) -> u64 {
        self.per_host_min_gap_ms
            .get(host)
            .copied()
            .unwrap_or(self.global_min_gap_ms)
    }

    /// Register a per-host QPS ceiling (translated to a min gap).
    pub fn with_host_qps(mut self, host: &str, qps: f64) -> Self {
        self.per_host_min_gap_ms
            .insert(host.to_string(), qps_to_min_gap_ms(qps));
        self
    }
}

#[derive(Debug, Default)]
struct GovState {
    last_call: BTreeMap<String, u64>,
    last_global: Option<u64>,
}

pub struct Governor {
    clock: Arc<dyn Clock>,
    cfg: GovernorConfig,
    state: tokio::sync::Mutex<GovState>,
    ua_cursor: AtomicUsize,
}

impl Governor {
    pub fn new(clock: Arc<dyn Clock>, cfg: GovernorConfig) -> Self {
        Self {
            clock,
            cfg,
            state: tokio::sync::Mutex::new(GovState::default()),
            ua_cursor: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.cfg
    }

    /// One UA from the rotating pool.
    pub fn user_agent(&self) -> String {
        let pool = &self.cfg.user_agents;
        if pool.is_empty() {
            return "rulecast/0.1".to_string();
        }
        let i = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        pool[i % pool.len()].clone()
    }

    /// Sleep (if needed) so that both the per-host and global gaps hold,
    /// then stamp both timestamps. Returns the total time waited.
    ///
    /// The lock is never held across a sleep, so independent hosts only
    /// contend on the map itself. A canceled wait leaves both timestamps
    /// untouched.
    pub async fn acquire(&self, host: &str, cancel: &CancellationToken) -> Result<Duration> {
        let mut waited = Duration::ZERO;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let wait_ms = {
                let mut st = self.state.lock().await;
                let now = self.clock.now_ms();
                let host_gap = self.cfg.min_gap_for(host);
                let host_wait = st
                    .last_call
                    .get(host)
                    .map(|t| (t + host_gap).saturating_sub(now))
                    .unwrap_or(0);
                let global_wait = st
                    .last_global
                    .map(|t| (t + self.cfg.global_min_gap_ms).saturating_sub(now))
                    .unwrap_or(0);
                let wait = host_wait.max(global_wait);
                if wait == 0 {
                    st.last_call.insert(host.to_string(), now);
                    st.last_global = Some(now);
                    return Ok(waited);
                }
                wait
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = self.clock.sleep(Duration::from_millis(wait_ms)) => {}
            }
            waited += Duration::from_millis(wait_ms);
        }
    }

    /// Exponential backoff with bounded jitter for transient-retry attempt
    /// `attempt` (0-based).
    pub async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        let base = self
            .cfg
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(10));
        let jitter = if self.cfg.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.cfg.jitter_ms)
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Canceled),
            _ = self.clock.sleep(Duration::from_millis(base + jitter)) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeClock;

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        let clock = FakeClock::at(10_000);
        let gov = Governor::new(clock, GovernorConfig::default());
        let waited = gov
            .acquire("example.com", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn consecutive_acquires_observe_min_gap() {
        let clock = FakeClock::at(0);
        let gov = Governor::new(clock.clone(), GovernorConfig::default());
        let cancel = CancellationToken::new();

        gov.acquire("example.com", &cancel).await.unwrap();
        let t0 = clock.now_ms();
        gov.acquire("example.com", &cancel).await.unwrap();
        let t1 = clock.now_ms();
        assert!(t1 - t0 >= 1000, "gap was {}ms", t1 - t0);
    }

    #[tokio::test]
    async fn per_host_override_and_global_gap_both_apply() {
        let clock = FakeClock::at(0);
        let cfg = GovernorConfig {
            global_min_gap_ms: 100,
            ..GovernorConfig::default()
        }
        .with_host_qps("bgg.example", 2.0);
        let gov = Governor::new(clock.clone(), cfg);
        let cancel = CancellationToken::new();

        gov.acquire("bgg.example", &cancel).await.unwrap();
        let t0 = clock.now_ms();
        gov.acquire("bgg.example", &cancel).await.unwrap();
        // 2 qps -> 500ms gap, which dominates the 100ms global gap.
        assert!(clock.now_ms() - t0 >= 500);

        // A different host only owes the global gap.
        let t1 = clock.now_ms();
        gov.acquire("other.example", &cancel).await.unwrap();
        assert!(clock.now_ms() - t1 < 500);
    }

    #[tokio::test]
    async fn concurrent_same_host_acquires_are_spaced() {
        let clock = FakeClock::at(0);
        let gov = Arc::new(Governor::new(clock.clone(), GovernorConfig::default()));
        let cancel = CancellationToken::new();

        let mut stamps = Vec::new();
        for _ in 0..3 {
            gov.acquire("example.com", &cancel).await.unwrap();
            stamps.push(clock.now_ms());
        }
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= 1000, "stamps: {stamps:?}");
        }
    }

    #[tokio::test]
    async fn canceled_wait_consumes_no_slot() {
        let clock = FakeClock::at(0);
        let gov = Governor::new(clock.clone(), GovernorConfig::default());
        let cancel = CancellationToken::new();

        gov.acquire("example.com", &cancel).await.unwrap();
        assert_eq!(clock.now_ms(), 0);

        let canceled = CancellationToken::new();
        canceled.cancel();
        let err = gov.acquire("example.com", &canceled).await.unwrap_err();
        assert_eq!(err.kind(), "CANCELED");

        // The failed acquire must not have moved the host stamp: a fresh
        // acquire still owes the full gap from the first call.
        let waited = gov
            .acquire("example.com", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(waited, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn user_agents_rotate() {
        let clock = FakeClock::at(0);
        let gov = Governor::new(clock, GovernorConfig::default());
        let a = gov.user_agent();
        let b = gov.user_agent();
        assert_ne!(a, b);
    }

    #[test]
    fn qps_translation() {
        assert_eq!(qps_to_min_gap_ms(2.0), 500);
        assert_eq!(qps_to_min_gap_ms(1.0), 1000);
        assert_eq!(qps_to_min_gap_ms(0.0), 0);
    }
}
