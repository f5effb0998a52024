//! The ingestion pipeline: PDF + BGG + component harvest merged into one
//! deterministic, contract-validated manifest.
//!
//! Degradation policy: BGG failures (unusable ids included) become
//! Partial snapshots, a missing rules page leaves components empty with
//! the tried URLs recorded, and an exhausted global time budget yields a
//! partial manifest with the reason recorded. Only an empty request,
//! unreadable PDFs, and cancellation are errors.

use crate::bgg::{extract_bgg_id, BggClient, BggConfig};
use crate::fetch::{FetcherConfig, HtmlFetcher};
use crate::governor::{Governor, GovernorConfig};
use crate::harvest::{DefaultFocus, HarvestOptions, HarvestReport, Harvester};
use crate::pdf::{PdfIngest, PdfIngestOptions, PdfIngestor};
use crate::slug::{normalize_slug, ResolverConfig, SlugResolver};
use crate::{FsCache, ReqwestBackend, SystemClock};
use rulecast_core::{
    iso_from_ms, AllowAllPolicy, BggPartial, BggSnapshot, Clock, Error, FetchPolicy,
    GameIdentity, HttpBackend, IngestionManifest, Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub title: Option<String>,
    pub bgg_id_or_url: Option<String>,
    pub pdf_path: Option<PathBuf>,
}

#[derive(Clone, Default)]
pub struct PipelineOptions {
    /// External harvesting toggle; when off, titles only seed identity.
    pub disable_harvest: bool,
    /// Wall-clock ceiling for one run; exceeding it yields a partial
    /// manifest, not an error.
    pub global_timeout_ms: Option<u64>,
    pub pdf: PdfIngestOptions,
    pub harvest: HarvestOptions,
}

impl PipelineOptions {
    /// Defaults with the environment knobs applied (`UBG_PROBE_SIZE`).
    pub fn from_env() -> Self {
        Self {
            harvest: HarvestOptions::from_env(),
            ..Self::default()
        }
    }
}

pub struct IngestionPipeline {
    pdf: PdfIngestor,
    bgg: BggClient,
    harvester: Harvester,
    clock: Arc<dyn Clock>,
    opts: PipelineOptions,
}

impl IngestionPipeline {
    pub fn new(
        pdf: PdfIngestor,
        bgg: BggClient,
        harvester: Harvester,
        clock: Arc<dyn Clock>,
        opts: PipelineOptions,
    ) -> Self {
        Self {
            pdf,
            bgg,
            harvester,
            clock,
            opts,
        }
    }

    /// Production wiring: reqwest transport, `DATA_DIR` cache, system
    /// clock, env-tuned BGG limits, allow-all fetch policy.
    pub fn with_local_backends(opts: PipelineOptions) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let http: Arc<dyn HttpBackend> = Arc::new(ReqwestBackend::new()?);
        let cache = FsCache::from_env();
        let bgg_cfg = BggConfig::from_env();
        let governor = Arc::new(Governor::new(
            clock.clone(),
            GovernorConfig::default().with_host_qps(&bgg_cfg.host(), bgg_cfg.qps),
        ));
        let policy: Arc<dyn FetchPolicy> = Arc::new(AllowAllPolicy);
        let fetcher = Arc::new(HtmlFetcher::new(
            http.clone(),
            cache.clone(),
            governor.clone(),
            policy,
            clock.clone(),
            FetcherConfig::default(),
        ));
        let resolver = SlugResolver::new(fetcher.clone(), ResolverConfig::default());
        let harvester = Harvester::new(
            resolver,
            fetcher,
            http.clone(),
            governor.clone(),
            Arc::new(DefaultFocus),
        );
        let bgg = BggClient::new(http, cache, governor, clock.clone(), bgg_cfg);
        let pdf = PdfIngestor::new(opts.pdf.clone());
        Ok(Self::new(pdf, bgg, harvester, clock, opts))
    }

    pub async fn run(
        &self,
        req: &IngestRequest,
        cancel: &CancellationToken,
    ) -> Result<IngestionManifest> {
        if req.title.is_none() && req.bgg_id_or_url.is_none() && req.pdf_path.is_none() {
            return Err(Error::BadInput(
                "at least one of title, bggIdOrUrl, pdfPath is required".to_string(),
            ));
        }

        let deadline = self
            .opts
            .global_timeout_ms
            .map(|t| self.clock.now_ms().saturating_add(t));
        let mut warnings: Vec<String> = Vec::new();
        let mut partial_reason: Option<String> = None;

        let budget_left = |clock: &dyn Clock, stage: &str, reason: &mut Option<String>| {
            match deadline {
                Some(d) if clock.now_ms() >= d => {
                    if reason.is_none() {
                        *reason = Some(format!("global time budget exhausted before {stage}"));
                    }
                    false
                }
                _ => true,
            }
        };

        // Stage 1: PDF. Unreadable files are hard errors (bad input class).
        let mut pdf_result: Option<PdfIngest> = None;
        if let Some(path) = &req.pdf_path {
            if budget_left(self.clock.as_ref(), "pdf ingest", &mut partial_reason) {
                pdf_result = Some(self.pdf.ingest(path, cancel).await?);
            }
        }

        // Stage 2: BGG. Partial results are fine, and an id we cannot
        // parse degrades the same way so title/PDF stages still complete.
        let mut bgg_snapshot: Option<BggSnapshot> = None;
        if let Some(id_or_url) = &req.bgg_id_or_url {
            if budget_left(self.clock.as_ref(), "bgg fetch", &mut partial_reason) {
                match self.bgg.fetch(id_or_url, cancel).await {
                    Ok(s) => bgg_snapshot = Some(s),
                    Err(Error::Canceled) => return Err(Error::Canceled),
                    Err(e @ Error::InvalidBggId(_)) => {
                        tracing::warn!(input = %id_or_url, "unusable bgg id: {e}");
                        warnings.push("bgg_invalid_id".to_string());
                        bgg_snapshot = Some(BggSnapshot::Partial(BggPartial {
                            id: id_or_url.clone(),
                            error: e.to_string(),
                            fetched_at: iso_from_ms(self.clock.now_ms()),
                        }));
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Stage 3: component harvest. A missing rules page degrades.
        let mut harvest: Option<HarvestReport> = None;
        let mut tried_urls: Vec<String> = Vec::new();
        if let Some(title) = &req.title {
            if !self.opts.disable_harvest
                && budget_left(self.clock.as_ref(), "component harvest", &mut partial_reason)
            {
                match self.harvester.harvest(title, &self.opts.harvest, cancel).await {
                    Ok(r) => harvest = Some(r),
                    Err(Error::Canceled) => return Err(Error::Canceled),
                    Err(Error::RulesPageNotFound { tried }) => {
                        tracing::debug!(%title, "no rules page found");
                        warnings.push("rules_page_not_found".to_string());
                        tried_urls = tried;
                    }
                    Err(e) => {
                        tracing::warn!(%title, kind = e.kind(), "harvest failed: {e}");
                        warnings.push(format!("harvest_failed:{}", e.kind()));
                    }
                }
            }
        }

        let game = resolve_identity(req, bgg_snapshot.as_ref());
        let mut m = IngestionManifest::new(game);

        if let Some(h) = harvest {
            m.outline = h.outline;
            m.components = h.components;
            m.assets.images = h.images;
            m.rules_url = Some(h.rules_url);
            m.tried_urls = h.tried_urls;
            m.cache_status = Some(h.cache_status);
            warnings.extend(h.warnings.iter().map(|w| w.to_string()));
        } else {
            m.tried_urls = tried_urls;
        }

        if let Some(p) = pdf_result {
            m.assets.pages = p.pages;
            m.ocr = p.ocr;
            m.heuristics = p.heuristics;
            warnings.extend(p.warnings.iter().map(|w| w.to_string()));
        }

        m.bgg = bgg_snapshot;
        m.warnings = warnings;
        m.partial_reason = partial_reason;

        m.validate()?;
        Ok(m)
    }
}

/// Identity: the request title wins, then the BGG primary name, then the
/// PDF file stem. The slug is the normalized form of whatever won.
fn resolve_identity(req: &IngestRequest, bgg: Option<&BggSnapshot>) -> GameIdentity {
    let bgg_title = match bgg {
        Some(BggSnapshot::Full(t)) if !t.title.trim().is_empty() => Some(t.title.clone()),
        _ => None,
    };
    let name = req
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or(bgg_title)
        .or_else(|| {
            req.pdf_path
                .as_ref()
                .and_then(|p| p.file_stem())
                .map(|s| s.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "unknown game".to_string());

    let bgg_id = match bgg {
        Some(BggSnapshot::Full(t)) => Some(t.id),
        _ => req
            .bgg_id_or_url
            .as_deref()
            .and_then(|s| extract_bgg_id(s).ok()),
    };

    GameIdentity {
        slug: normalize_slug(&name),
        name,
        bgg_id,
    }
}
