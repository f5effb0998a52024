//! Slug candidates for a game title, and the probe loop that turns the
//! first responsive candidate into a rules page.
//!
//! Candidate generation is pure and deterministic: the same title always
//! yields the same ordered list.

use crate::fetch::HtmlFetcher;
use rulecast_core::{Error, FetchOutcome, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Lowercase, diacritic-stripped, hyphenated form of a title fragment.
pub fn normalize_slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true; // swallow leading hyphens
    for c in s.nfd().filter(|c| !is_combining_mark(*c)) {
        for lc in c.to_lowercase() {
            if lc.is_ascii_alphanumeric() {
                out.push(lc);
                last_dash = false;
            } else if !last_dash {
                out.push('-');
                last_dash = true;
            }
        }
    }
    out.trim_end_matches('-').to_string()
}

fn strip_leading_the(s: &str) -> Option<String> {
    let t = s.trim_start();
    match t.get(..4) {
        Some(head) if head.eq_ignore_ascii_case("the ") && t.len() > 4 => {
            Some(t[4..].trim_start().to_string())
        }
        _ => None,
    }
}

fn remove_parentheticals(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Ordered, deduplicated slug candidates for a title, most specific
/// first.
///
/// The "the "-strip, parenthetical-strip, and `&`→"and" passes are
/// layered over the full title first, and only then over the
/// subtitle-dropped head, so every variant of the full title precedes
/// any generic base-name candidate and the resolver never probes a
/// base-game slug before a more specific one. A `-board-game`/
/// `-card-game` suffix trim follows each slug it applies to.
pub fn slug_candidates(title: &str) -> Vec<String> {
    let t = title.trim();
    if t.is_empty() {
        return Vec::new();
    }

    let mut bases: Vec<String> = vec![t.to_string()];
    if let Some((head, _)) = t.split_once(':') {
        let head = head.trim();
        if !head.is_empty() {
            bases.push(head.to_string());
        }
    }

    let mut seeds: Vec<String> = Vec::new();
    for base in bases {
        let mut group: Vec<String> = vec![base];
        if let Some(stripped) = strip_leading_the(&group[0]) {
            group.push(stripped);
        }
        for s in group.clone() {
            let no_parens = remove_parentheticals(&s);
            if no_parens != s && !no_parens.is_empty() {
                group.push(no_parens);
            }
        }
        for s in group.clone() {
            if s.contains('&') {
                group.push(s.replace('&', " and "));
            }
        }
        seeds.extend(group);
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for seed in seeds {
        let slug = normalize_slug(&seed);
        if slug.is_empty() {
            continue;
        }
        if seen.insert(slug.clone()) {
            out.push(slug.clone());
        }
        for suffix in ["-board-game", "-card-game"] {
            if let Some(trimmed) = slug.strip_suffix(suffix) {
                if !trimmed.is_empty() && seen.insert(trimmed.to_string()) {
                    out.push(trimmed.to_string());
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Rules-site origin, no trailing slash.
    pub base_url: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.ultraboardgames.com".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRulesPage {
    pub slug: String,
    pub url: String,
    pub final_url: String,
    pub html: String,
    pub outcome: FetchOutcome,
    /// Every URL probed, in order, for diagnostics.
    pub tried: Vec<String>,
}

pub struct SlugResolver {
    fetcher: Arc<HtmlFetcher>,
    cfg: ResolverConfig,
}

impl SlugResolver {
    pub fn new(fetcher: Arc<HtmlFetcher>, cfg: ResolverConfig) -> Self {
        Self { fetcher, cfg }
    }

    /// Probe candidates in order; the first 2xx page wins. On an overview
    /// page a "Game Rules" link, when present, is followed.
    pub async fn resolve(
        &self,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedRulesPage> {
        let mut tried: Vec<String> = Vec::new();
        for slug in slug_candidates(title) {
            let rules_url = format!("{}/{}/game-rules.php", self.cfg.base_url, slug);
            tried.push(rules_url.clone());
            match self.fetcher.fetch_html(&rules_url, cancel).await {
                Ok(f) => {
                    return Ok(ResolvedRulesPage {
                        slug,
                        url: rules_url,
                        final_url: f.final_url,
                        html: f.body,
                        outcome: f.outcome,
                        tried,
                    })
                }
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(_) => {}
            }

            let overview_url = format!("{}/{}/index.php", self.cfg.base_url, slug);
            tried.push(overview_url.clone());
            let overview = match self.fetcher.fetch_html(&overview_url, cancel).await {
                Ok(f) => f,
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(_) => continue,
            };

            if let Some(link) = rules_link_in_overview(&overview.body, &overview_url) {
                tried.push(link.clone());
                match self.fetcher.fetch_html(&link, cancel).await {
                    Ok(f) => {
                        return Ok(ResolvedRulesPage {
                            slug,
                            url: link,
                            final_url: f.final_url,
                            html: f.body,
                            outcome: f.outcome,
                            tried,
                        })
                    }
                    Err(Error::Canceled) => return Err(Error::Canceled),
                    Err(_) => {}
                }
            }
            // No usable rules link: the overview page itself is the result.
            return Ok(ResolvedRulesPage {
                slug,
                url: overview_url,
                final_url: overview.final_url,
                html: overview.body,
                outcome: overview.outcome,
                tried,
            });
        }
        Err(Error::RulesPageNotFound { tried })
    }
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First link whose anchor text reads "Game Rules" / "Basic Game Rules",
/// resolved against the overview URL.
fn rules_link_in_overview(html: &str, base_url: &str) -> Option<String> {
    let base = url::Url::parse(base_url).ok()?;
    let doc = html_scraper::Html::parse_document(html);
    let sel = html_scraper::Selector::parse("a[href]").ok()?;
    for el in doc.select(&sel) {
        let text = norm_ws(&el.text().collect::<Vec<_>>().join(" ")).to_lowercase();
        if text != "game rules" && text != "basic game rules" {
            continue;
        }
        let href = el.value().attr("href")?.trim();
        if href.is_empty() {
            continue;
        }
        let mut u = match url::Url::parse(href) {
            Ok(u) => u,
            Err(_) => base.join(href).ok()?,
        };
        u.set_fragment(None);
        return Some(u.to_string());
    }
    None
}
