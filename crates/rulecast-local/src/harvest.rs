//! Section anchoring and component-image harvesting over a rules page.
//!
//! The hard part of the whole pipeline: locate the "Components" section in
//! HTML whose language, heading level, and markup all vary, then collect
//! nearby images with proximity-weighted scores. Everything in this module
//! except the optional remote size probe is pure and deterministic: the
//! same bytes and base URL always produce the same ordered list.

use crate::fetch::HtmlFetcher;
use crate::governor::Governor;
use crate::slug::{ResolvedRulesPage, SlugResolver};
use html_scraper::{ElementRef, Html, Selector};
use rulecast_core::{
    ComponentItem, Error, ExtractedImage, FetchOutcome, HttpBackend, HttpRequest, ImageContext,
    OutlineHeading, Result, SizeSource,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Case-folded heading texts that mark a Components section, across the
/// languages the rules sites actually publish in.
const COMPONENT_ANCHORS: &[&str] = &[
    "components",
    "game components",
    "contents",
    "spielmaterial",
    "contenu",
    "componentes",
    "componenti",
    "matériel",
    "composants",
    "contenidos",
    "materiale",
    "material",
];

const CHROME_MARKERS: &[&str] = &["sidebar", "footer", "advert", "comments"];

const MIN_ACCEPTED_DIM: u32 = 120;
const PROXIMITY_K: f64 = 4.0;

/// Dimension defaults when every other source comes up empty.
const NEARBY_DEFAULT: (u32, u32) = (320, 240);
const PAGE_DEFAULT: (u32, u32) = (200, 150);

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Top-N cap on returned images.
    pub max_images: usize,
    /// When set, unknown image dimensions are resolved with a bounded
    /// remote probe (governed, range-limited GET + header sniff).
    pub probe_remote_size: bool,
    /// Additionally harvest the game's overview page for page-context images.
    pub also_overview: bool,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            max_images: 10,
            probe_remote_size: false,
            also_overview: false,
        }
    }
}

impl HarvestOptions {
    pub fn from_env() -> Self {
        Self {
            probe_remote_size: env("UBG_PROBE_SIZE").as_deref() == Some("1"),
            ..Self::default()
        }
    }
}

/// Pluggable focus/quality analyzer. The default scores everything 0.5.
pub trait FocusAnalyzer: Send + Sync {
    fn focus(&self, image: &ExtractedImage) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFocus;

impl FocusAnalyzer for DefaultFocus {
    fn focus(&self, _image: &ExtractedImage) -> f64 {
        0.5
    }
}

/// One image candidate before sizing/scoring.
#[derive(Debug, Clone)]
struct RawImage {
    url: url::Url,
    alt: String,
    attr_w: Option<u32>,
    attr_h: Option<u32>,
    srcset_w: Option<u32>,
    distance: u32,
    in_section: bool,
}

/// Result of one harvest over one page.
#[derive(Debug, Clone, Default)]
pub struct PageHarvest {
    pub images: Vec<ExtractedImage>,
    pub components: Vec<ComponentItem>,
    pub outline: Vec<OutlineHeading>,
    /// Whether a Components anchor was found (vs page-wide fallback only).
    pub anchored: bool,
    pub anchor_text: Option<String>,
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef) -> String {
    norm_ws(&el.text().collect::<Vec<_>>().join(" "))
}

/// Whether a heading text reads as a Components section title.
pub fn is_component_anchor_text(text: &str) -> bool {
    let t = norm_ws(text).to_lowercase();
    if t.is_empty() {
        return false;
    }
    COMPONENT_ANCHORS
        .iter()
        .any(|a| t == *a || t.starts_with(a))
}

fn heading_level(tag: &str) -> Option<u8> {
    match tag {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn class_or_id_lc(el: &ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_chrome(el: &ElementRef) -> bool {
    let s = class_or_id_lc(el);
    if s.is_empty() {
        return false;
    }
    CHROME_MARKERS.iter().any(|m| s.contains(m))
}

/// Chrome applies to a node and everything under it.
fn in_chrome(el: &ElementRef) -> bool {
    if is_chrome(el) {
        return true;
    }
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| is_chrome(&a))
}

/// First Components anchor in document order: h1..h4 preferred, then
/// strong/b/p. Returns the anchor and its effective heading level
/// (fallback anchors close at any heading).
fn find_anchor<'a>(doc: &'a Html) -> Option<(ElementRef<'a>, u8)> {
    let headings = Selector::parse("h1, h2, h3, h4").ok()?;
    for el in doc.select(&headings) {
        if in_chrome(&el) {
            continue;
        }
        if is_component_anchor_text(&element_text(&el)) {
            let level = heading_level(el.value().name()).unwrap_or(4);
            return Some((el, level));
        }
    }
    let fallback = Selector::parse("strong, b, p").ok()?;
    for el in doc.select(&fallback) {
        if in_chrome(&el) {
            continue;
        }
        if is_component_anchor_text(&element_text(&el)) {
            return Some((el, 7));
        }
    }
    None
}

/// The block whose siblings delimit the section. Inline anchors
/// (strong/b) walk from their containing block, never re-entered.
fn walk_root<'a>(anchor: ElementRef<'a>) -> ElementRef<'a> {
    let tag = anchor.value().name();
    if tag == "strong" || tag == "b" {
        if let Some(parent) = anchor.parent().and_then(ElementRef::wrap) {
            return parent;
        }
    }
    anchor
}

fn parse_dim_attr(el: &ElementRef, name: &str) -> Option<u32> {
    el.value()
        .attr(name)
        .and_then(|v| v.trim().trim_end_matches("px").parse::<u32>().ok())
        .filter(|n| *n > 0)
}

/// A `WxH` token in a URL path, e.g. `/img/800x600/board.jpg` or
/// `board-800x600.jpg`.
fn dims_from_path(path: &str) -> Option<(u32, u32)> {
    for token in path.split(|c: char| !c.is_ascii_alphanumeric()) {
        let Some((w, h)) = token.split_once('x') else {
            continue;
        };
        let (Ok(w), Ok(h)) = (w.parse::<u32>(), h.parse::<u32>()) else {
            continue;
        };
        if (16..=10_000).contains(&w) && (16..=10_000).contains(&h) {
            return Some((w, h));
        }
    }
    None
}

/// Parse a srcset and pick the largest candidate. Width descriptors win;
/// upsize hints in the candidate URL path break ties among the rest.
fn largest_srcset_candidate(srcset: &str) -> Option<(String, Option<u32>)> {
    let mut best: Option<(String, Option<u32>, u64)> = None;
    for part in srcset.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut it = part.split_whitespace();
        let url = it.next()?.to_string();
        let descriptor = it.next().unwrap_or("");

        let w = descriptor
            .strip_suffix('w')
            .and_then(|n| n.parse::<u32>().ok());
        let x = descriptor
            .strip_suffix('x')
            .and_then(|n| n.parse::<f64>().ok());
        // Rank: explicit width, then a WxH path hint, then density.
        let rank: u64 = if let Some(w) = w {
            1_000_000_000 + u64::from(w)
        } else if let Some((pw, _)) = dims_from_path(&url) {
            1_000_000 + u64::from(pw)
        } else if let Some(x) = x {
            (x * 1000.0) as u64
        } else {
            0
        };
        match &best {
            Some((_, _, best_rank)) if *best_rank >= rank => {}
            _ => best = Some((url, w, rank)),
        }
    }
    best.map(|(url, w, _)| (url, w))
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_")
        || matches!(key, "fbclid" | "gclid" | "mc_cid" | "mc_eid" | "ref" | "ref_src")
}

/// Absolute canonical image URL: resolved against the page, fragment
/// dropped, tracking parameters stripped, percent-encoding normalized by
/// the URL parser.
fn canonicalize_image_url(raw: &str, base: &url::Url) -> Option<url::Url> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    let mut u = match url::Url::parse(raw) {
        Ok(u) => u,
        Err(_) => base.join(raw).ok()?,
    };
    if !matches!(u.scheme(), "http" | "https") {
        return None;
    }
    u.set_fragment(None);
    let kept: Vec<(String, String)> = u
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        u.set_query(None);
    } else {
        let mut qp = String::new();
        {
            let mut ser = url::form_urlencoded::Serializer::new(&mut qp);
            for (k, v) in &kept {
                ser.append_pair(k, v);
            }
        }
        u.set_query(Some(&qp));
    }
    Some(u)
}

/// Resolve the best source URL for an `img`: explicit `src`, then
/// `data-src`, then the largest srcset/data-srcset candidate.
fn resolve_img_source(el: &ElementRef, base: &url::Url) -> Option<(url::Url, Option<u32>)> {
    let srcset = el
        .value()
        .attr("srcset")
        .or_else(|| el.value().attr("data-srcset"));
    let srcset_w = srcset.and_then(|ss| largest_srcset_candidate(ss).and_then(|(_, w)| w));

    for attr in ["src", "data-src"] {
        if let Some(raw) = el.value().attr(attr) {
            if let Some(u) = canonicalize_image_url(raw, base) {
                return Some((u, srcset_w));
            }
        }
    }
    let (raw, w) = largest_srcset_candidate(srcset?)?;
    let u = canonicalize_image_url(&raw, base)?;
    Some((u, w.or(srcset_w)))
}

fn push_raw_images(
    scope: &ElementRef,
    base: &url::Url,
    distance: u32,
    in_section: bool,
    out: &mut Vec<RawImage>,
) {
    let Ok(sel) = Selector::parse("img") else {
        return;
    };
    let mut targets: Vec<ElementRef> = Vec::new();
    if scope.value().name() == "img" {
        targets.push(*scope);
    }
    targets.extend(scope.select(&sel));

    for img in targets {
        if in_chrome(&img) {
            continue;
        }
        let Some((url, srcset_w)) = resolve_img_source(&img, base) else {
            continue;
        };
        out.push(RawImage {
            alt: norm_ws(img.value().attr("alt").unwrap_or("")),
            attr_w: parse_dim_attr(&img, "width"),
            attr_h: parse_dim_attr(&img, "height"),
            srcset_w,
            distance,
            in_section,
            url,
        });
    }
}

fn push_component_lines(scope: &ElementRef, out: &mut Vec<ComponentItem>) {
    let Ok(sel) = Selector::parse("li") else {
        return;
    };
    for li in scope.select(&sel) {
        if in_chrome(&li) {
            continue;
        }
        let raw = element_text(&li);
        if raw.is_empty() || out.len() >= 100 {
            continue;
        }
        out.push(component_from_line(&raw));
    }
}

/// "6 dice" -> quantity 6, name "dice". "6x Marker" works too.
fn component_from_line(raw: &str) -> ComponentItem {
    let raw = norm_ws(raw);
    if let Some((first, rest)) = raw.split_once(' ') {
        let numeric = first.trim_end_matches(['x', 'X']);
        if !numeric.is_empty() && numeric.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(q) = numeric.parse::<u32>() {
                return ComponentItem {
                    raw: raw.clone(),
                    name: rest.trim().to_string(),
                    quantity: Some(q),
                };
            }
        }
    }
    ComponentItem {
        name: raw.clone(),
        raw,
        quantity: None,
    }
}

/// Document outline: h1..h4 headings in order, chrome filtered, bounded.
fn collect_outline(doc: &Html) -> Vec<OutlineHeading> {
    let Ok(sel) = Selector::parse("h1, h2, h3, h4") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for el in doc.select(&sel) {
        if out.len() >= 64 {
            break;
        }
        if in_chrome(&el) {
            continue;
        }
        let text = element_text(&el);
        if text.is_empty() {
            continue;
        }
        out.push(OutlineHeading {
            text,
            level: heading_level(el.value().name()).unwrap_or(0),
            narration: None,
        });
    }
    out
}

struct Collected {
    raws: Vec<RawImage>,
    components: Vec<ComponentItem>,
    outline: Vec<OutlineHeading>,
    anchored: bool,
    anchor_text: Option<String>,
}

fn collect(html: &str, base: &url::Url) -> Collected {
    let doc = Html::parse_document(html);
    let outline = collect_outline(&doc);
    let mut raws: Vec<RawImage> = Vec::new();
    let mut components: Vec<ComponentItem> = Vec::new();

    let anchor = find_anchor(&doc);
    let (anchored, anchor_text) = match &anchor {
        Some((el, _)) => (true, Some(element_text(el))),
        None => (false, None),
    };

    if let Some((anchor_el, anchor_level)) = anchor {
        let root = walk_root(anchor_el);
        // Same block as the anchor: distance 0.
        push_raw_images(&root, base, 0, true, &mut raws);
        push_component_lines(&root, &mut components);

        let mut distance = 0u32;
        for sib in root.next_siblings() {
            let Some(el) = ElementRef::wrap(sib) else {
                continue;
            };
            if let Some(level) = heading_level(el.value().name()) {
                if level <= anchor_level {
                    break;
                }
            }
            distance += 1;
            if is_chrome(&el) {
                continue;
            }
            push_raw_images(&el, base, distance, true, &mut raws);
            push_component_lines(&el, &mut components);
        }
    }

    // Page-wide pass: base-10 candidates for everything outside the
    // section. When no anchor was found this is the whole harvest.
    if let Ok(sel) = Selector::parse("article img, .content img, .post img, img") {
        for img in doc.select(&sel) {
            push_raw_images(&img, base, 0, false, &mut raws);
        }
    }

    Collected {
        raws,
        components,
        outline,
        anchored,
        anchor_text,
    }
}

fn alt_matches_components(alt: &str) -> bool {
    let a = alt.to_lowercase();
    ["component", "setup", "card", "board", "token", "tile"]
        .iter()
        .any(|k| a.contains(k))
}

fn path_hints_image_dir(path: &str) -> bool {
    path.contains("/img/") || path.contains("/images/") || path.contains("/pics/")
}

fn is_rejected_format(path_lc: &str) -> bool {
    path_lc.ends_with(".svg") || path_lc.ends_with(".gif")
}

/// Dimension resolution ladder. `probed` carries any remote-probe results
/// keyed by canonical URL.
fn resolve_dims(
    raw: &RawImage,
    probed: &BTreeMap<String, (u32, u32)>,
) -> (u32, u32, SizeSource) {
    if let (Some(w), Some(h)) = (raw.attr_w, raw.attr_h) {
        return (w, h, SizeSource::AttrHint);
    }
    if let Some((w, h)) = dims_from_path(raw.url.path()) {
        return (w, h, SizeSource::UrlToken);
    }
    if let Some(w) = raw.srcset_w {
        // Width-only descriptor: assume the common 4:3 landscape.
        return (w, w * 3 / 4, SizeSource::SrcsetToken);
    }
    if let Some((w, h)) = probed.get(raw.url.as_str()) {
        return (*w, *h, SizeSource::RemoteProbe);
    }
    let (w, h) = if raw.in_section {
        NEARBY_DEFAULT
    } else {
        PAGE_DEFAULT
    };
    (w, h, SizeSource::Heuristic)
}

fn dedup_key(u: &url::Url) -> String {
    let mut k = u.clone();
    k.set_query(None);
    k.to_string()
}

fn finalize(
    raws: Vec<RawImage>,
    probed: &BTreeMap<String, (u32, u32)>,
    max_images: usize,
    focus: &dyn FocusAnalyzer,
) -> Vec<ExtractedImage> {
    let mut by_key: BTreeMap<String, ExtractedImage> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();

    for raw in raws {
        let path_lc = raw.url.path().to_ascii_lowercase();
        if is_rejected_format(&path_lc) {
            continue;
        }
        if let (Some(w), Some(h)) = (raw.attr_w, raw.attr_h) {
            if w < MIN_ACCEPTED_DIM && h < MIN_ACCEPTED_DIM {
                continue;
            }
        }
        let (width, height, size_source) = resolve_dims(&raw, probed);
        if width < MIN_ACCEPTED_DIM && height < MIN_ACCEPTED_DIM {
            continue;
        }

        let mut score = if raw.in_section { 50.0 } else { 10.0 };
        if alt_matches_components(&raw.alt) {
            score += 10.0;
        }
        if path_hints_image_dir(&path_lc) {
            score += 2.0;
        }
        let proximity = (-(f64::from(raw.distance)) / PROXIMITY_K).exp();

        let img = ExtractedImage {
            url: raw.url.to_string(),
            width,
            height,
            alt: raw.alt,
            score,
            context: if raw.in_section {
                ImageContext::ComponentsNearby
            } else {
                ImageContext::Page
            },
            distance: raw.distance,
            proximity,
            size_source,
            focus: 0.0,
        };

        let key = dedup_key(&raw.url);
        match by_key.get(&key) {
            Some(existing) if existing.score >= img.score => {}
            Some(_) => {
                by_key.insert(key, img);
            }
            None => {
                order.push(key.clone());
                by_key.insert(key, img);
            }
        }
    }

    // Collapse in first-seen order, then rank.
    let mut out: Vec<ExtractedImage> = order
        .into_iter()
        .filter_map(|k| by_key.remove(&k))
        .collect();
    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.area().cmp(&a.area()))
            .then_with(|| a.url.cmp(&b.url))
    });
    out.truncate(max_images);
    for img in &mut out {
        img.focus = focus.focus(img);
    }
    out
}

/// Deterministic single-page harvest (no network). Property: identical
/// HTML bytes + base URL in, identical ordered output out.
pub fn harvest_rules_page(html: &str, base_url: &str, opts: &HarvestOptions) -> PageHarvest {
    let Ok(base) = url::Url::parse(base_url) else {
        return PageHarvest::default();
    };
    let collected = collect(html, &base);
    let images = finalize(
        collected.raws,
        &BTreeMap::new(),
        opts.max_images,
        &DefaultFocus,
    );
    PageHarvest {
        images,
        components: collected.components,
        outline: collected.outline,
        anchored: collected.anchored,
        anchor_text: collected.anchor_text,
    }
}

/// Full harvest report for one game, as consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub slug: String,
    pub rules_url: String,
    pub components: Vec<ComponentItem>,
    pub images: Vec<ExtractedImage>,
    pub outline: Vec<OutlineHeading>,
    pub tried_urls: Vec<String>,
    pub cache_status: FetchOutcome,
    pub anchored: bool,
    pub warnings: Vec<&'static str>,
}

pub struct Harvester {
    resolver: SlugResolver,
    fetcher: Arc<HtmlFetcher>,
    http: Arc<dyn HttpBackend>,
    governor: Arc<Governor>,
    focus: Arc<dyn FocusAnalyzer>,
}

impl Harvester {
    pub fn new(
        resolver: SlugResolver,
        fetcher: Arc<HtmlFetcher>,
        http: Arc<dyn HttpBackend>,
        governor: Arc<Governor>,
        focus: Arc<dyn FocusAnalyzer>,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            http,
            governor,
            focus,
        }
    }

    pub async fn harvest(
        &self,
        title: &str,
        opts: &HarvestOptions,
        cancel: &CancellationToken,
    ) -> Result<HarvestReport> {
        let page = self.resolver.resolve(title, cancel).await?;
        let mut warnings: Vec<&'static str> = Vec::new();

        let Ok(base) = url::Url::parse(&page.final_url)
            .or_else(|_| url::Url::parse(&page.url))
        else {
            return Err(Error::BadInput(format!("unparsable rules url: {}", page.url)));
        };

        let mut collected = collect(&page.html, &base);
        if !collected.anchored {
            warnings.push("components_section_not_found");
        }

        if opts.also_overview {
            self.merge_overview(&page, &mut collected, cancel).await;
        }

        let probed = if opts.probe_remote_size {
            self.probe_sizes(&collected.raws, cancel).await?
        } else {
            BTreeMap::new()
        };

        let images = finalize(
            collected.raws,
            &probed,
            opts.max_images,
            self.focus.as_ref(),
        );
        if images.is_empty() {
            warnings.push("no_images_harvested");
        }

        Ok(HarvestReport {
            slug: page.slug,
            rules_url: page.url,
            components: collected.components,
            images,
            outline: collected.outline,
            tried_urls: page.tried,
            cache_status: page.outcome,
            anchored: collected.anchored,
            warnings,
        })
    }

    /// Page-context candidates from the overview page (never components).
    async fn merge_overview(
        &self,
        page: &ResolvedRulesPage,
        collected: &mut Collected,
        cancel: &CancellationToken,
    ) {
        let overview_url = format!(
            "{}/index.php",
            page.url.rsplit_once('/').map(|(head, _)| head).unwrap_or(&page.url)
        );
        if overview_url == page.url {
            return;
        }
        let Ok(f) = self.fetcher.fetch_html(&overview_url, cancel).await else {
            return;
        };
        let Ok(base) = url::Url::parse(&f.final_url) else {
            return;
        };
        let extra = collect(&f.body, &base);
        collected
            .raws
            .extend(extra.raws.into_iter().map(|mut r| {
                r.in_section = false;
                r.distance = 0;
                r
            }));
    }

    /// Bounded remote probe for candidates with no other size source:
    /// a governed, range-limited GET whose first bytes are sniffed.
    async fn probe_sizes(
        &self,
        raws: &[RawImage],
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, (u32, u32)>> {
        let mut probed = BTreeMap::new();
        for raw in raws {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let needs_probe = raw.attr_w.is_none()
                && raw.attr_h.is_none()
                && raw.srcset_w.is_none()
                && dims_from_path(raw.url.path()).is_none();
            if !needs_probe || probed.contains_key(raw.url.as_str()) {
                continue;
            }
            let host = raw.url.host_str().unwrap_or("no-host").to_string();
            if self.governor.acquire(&host, cancel).await.is_err() {
                return Err(Error::Canceled);
            }
            let mut req = HttpRequest::get(raw.url.as_str());
            req.headers
                .insert("Range".to_string(), "bytes=0-65535".to_string());
            req.timeout_ms = Some(5_000);
            match self.http.send(&req).await {
                Ok(resp) if resp.status == 200 || resp.status == 206 => {
                    if let Some(dims) = sniff_image_dimensions(&resp.body) {
                        probed.insert(raw.url.to_string(), dims);
                    }
                }
                Ok(_) | Err(_) => {
                    // Probe is best-effort; the heuristic default covers it.
                }
            }
        }
        Ok(probed)
    }
}

/// Pixel dimensions from the first bytes of a PNG/GIF/JPEG body.
pub fn sniff_image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") && bytes.len() >= 24 {
        let w = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let h = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        return (w > 0 && h > 0).then_some((w, h));
    }
    if (bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a")) && bytes.len() >= 10 {
        let w = u32::from(u16::from_le_bytes([bytes[6], bytes[7]]));
        let h = u32::from(u16::from_le_bytes([bytes[8], bytes[9]]));
        return (w > 0 && h > 0).then_some((w, h));
    }
    jpeg_dimensions(bytes)
}

fn jpeg_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    if !b.starts_with(&[0xFF, 0xD8]) {
        return None;
    }
    let mut i = 2usize;
    while i + 9 <= b.len() {
        if b[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = b[i + 1];
        // Standalone markers carry no length.
        if marker == 0xFF {
            i += 1;
            continue;
        }
        if matches!(marker, 0x01 | 0xD0..=0xD9) {
            i += 2;
            continue;
        }
        let len = usize::from(u16::from_be_bytes([b[i + 2], b[i + 3]]));
        let is_sof = matches!(
            marker,
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF
        );
        if is_sof {
            if i + 9 <= b.len() {
                let h = u32::from(u16::from_be_bytes([b[i + 5], b[i + 6]]));
                let w = u32::from(u16::from_be_bytes([b[i + 7], b[i + 8]]));
                return (w > 0 && h > 0).then_some((w, h));
            }
            return None;
        }
        i += 2 + len;
    }
    None
}
