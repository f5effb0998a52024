//! BGG XML API v2 client: `thing?id=…&stats=1`, normalized.
//!
//! We use quick-xml because the thing schema nests names, links, and
//! statistics in ways regex parsing cannot track reliably. Any failure
//! (transport, status, parse) degrades to a `Partial` sentinel so the
//! pipeline can proceed with what it has.

use crate::governor::Governor;
use crate::FsCache;
use rulecast_core::{
    iso_from_ms, BggLink, BggLinkKind, BggName, BggPartial, BggSnapshot, BggThing, Clock, Error,
    HttpBackend, HttpRequest, Result,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct BggConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
    pub cache_ttl_ms: u64,
    /// Per-host QPS ceiling; the wiring translates it into the governor's
    /// min-gap for the endpoint host.
    pub qps: f64,
}

impl Default for BggConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://boardgamegeek.com/xmlapi2".to_string(),
            timeout_ms: 5_000,
            cache_ttl_ms: 24 * 60 * 60 * 1000,
            qps: 2.0,
        }
    }
}

impl BggConfig {
    /// Defaults with `BGG_CACHE_TTL_MS` / `BGG_RATE_LIMIT_QPS` applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ttl) = env("BGG_CACHE_TTL_MS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.cache_ttl_ms = ttl;
        }
        if let Some(qps) = env("BGG_RATE_LIMIT_QPS").and_then(|s| s.parse::<f64>().ok()) {
            if qps > 0.0 {
                cfg.qps = qps;
            }
        }
        cfg
    }

    pub fn host(&self) -> String {
        url::Url::parse(&self.endpoint)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "boardgamegeek.com".to_string())
    }
}

/// Numeric id from a raw id or a BGG URL (`/boardgame/<digits>/…`).
pub fn extract_bgg_id(input: &str) -> Result<u64> {
    let s = input.trim();
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
        return s
            .parse::<u64>()
            .map_err(|_| Error::InvalidBggId(input.to_string()));
    }
    if let Ok(u) = url::Url::parse(s) {
        if let Some(segments) = u.path_segments() {
            let segs: Vec<&str> = segments.collect();
            for w in segs.windows(2) {
                if w[0] == "boardgame"
                    && !w[1].is_empty()
                    && w[1].chars().all(|c| c.is_ascii_digit())
                {
                    if let Ok(id) = w[1].parse::<u64>() {
                        return Ok(id);
                    }
                }
            }
        }
    }
    Err(Error::InvalidBggId(input.to_string()))
}

pub struct BggClient {
    http: Arc<dyn HttpBackend>,
    cache: FsCache,
    governor: Arc<Governor>,
    clock: Arc<dyn Clock>,
    cfg: BggConfig,
}

impl BggClient {
    pub fn new(
        http: Arc<dyn HttpBackend>,
        cache: FsCache,
        governor: Arc<Governor>,
        clock: Arc<dyn Clock>,
        cfg: BggConfig,
    ) -> Self {
        Self {
            http,
            cache,
            governor,
            clock,
            cfg,
        }
    }

    /// Fetch + normalize one thing. Invalid input is an error; every
    /// downstream failure is a `Partial` sentinel, never an error.
    pub async fn fetch(
        &self,
        id_or_url: &str,
        cancel: &CancellationToken,
    ) -> Result<BggSnapshot> {
        let id = extract_bgg_id(id_or_url)?;
        let url = format!("{}/thing?id={id}&stats=1", self.cfg.endpoint);
        let now = self.clock.now_ms();

        if let Some(entry) = self.cache.get(&url) {
            if entry.is_fresh(self.cfg.cache_ttl_ms, now) {
                if let Some(thing) = parse_thing_xml(&entry.body, id, entry.fetched_at.clone()) {
                    return Ok(BggSnapshot::Full(Box::new(thing)));
                }
            }
        }

        let host = self.cfg.host();
        let mut req = HttpRequest::get(&url);
        req.timeout_ms = Some(self.cfg.timeout_ms);

        let max = self.governor.config().max_retries;
        let mut attempt = 0u32;
        let outcome = loop {
            self.governor.acquire(&host, cancel).await?;
            match self.http.send(&req).await {
                Ok(resp) if resp.status >= 500 && attempt < max => {
                    self.governor.backoff(attempt, cancel).await?;
                    attempt += 1;
                }
                other => break other,
            }
        };
        let fetched_at = iso_from_ms(self.clock.now_ms());

        let partial = |error: String| {
            BggSnapshot::Partial(BggPartial {
                id: id.to_string(),
                error,
                fetched_at: fetched_at.clone(),
            })
        };

        match outcome {
            Ok(resp) if resp.is_2xx() => {
                let body = resp.text_lossy();
                match parse_thing_xml(&body, id, fetched_at.clone()) {
                    Some(thing) => {
                        if !cancel.is_cancelled() {
                            let entry =
                                FsCache::entry(&url, body, resp.status, self.clock.now_ms());
                            self.cache.put_logged(&entry);
                        }
                        Ok(BggSnapshot::Full(Box::new(thing)))
                    }
                    None => Ok(partial("BGG API returned no parsable item".to_string())),
                }
            }
            Ok(resp) => Ok(partial(format!(
                "BGG API request failed with status {}",
                resp.status
            ))),
            Err(Error::Canceled) => Err(Error::Canceled),
            Err(e) => Ok(partial(e.to_string())),
        }
    }
}

fn link_kind(type_attr: &str) -> Option<BggLinkKind> {
    match type_attr {
        "boardgamecategory" => Some(BggLinkKind::Category),
        "boardgamemechanic" => Some(BggLinkKind::Mechanic),
        "boardgamedesigner" => Some(BggLinkKind::Designer),
        "boardgameartist" => Some(BggLinkKind::Artist),
        "boardgamepublisher" => Some(BggLinkKind::Publisher),
        "boardgameexpansion" => Some(BggLinkKind::Expansion),
        "boardgamefamily" => Some(BggLinkKind::Family),
        _ => None,
    }
}

fn attrs_map(e: &quick_xml::events::BytesStart) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for a in e.attributes().flatten() {
        let k = String::from_utf8_lossy(a.key.as_ref()).to_string();
        let v = a.unescape_value().map(|v| v.to_string()).unwrap_or_default();
        out.push((k, v));
    }
    out
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Parse the first `<item>` of a thing response into a normalized record.
/// Returns `None` when no item is present (unknown id, error body).
pub fn parse_thing_xml(body: &str, want_id: u64, fetched_at: String) -> Option<BggThing> {
    let mut reader = quick_xml::Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut thing = BggThing {
        fetched_at,
        ..BggThing::default()
    };
    let mut seen_item = false;
    let mut in_item = false;
    let mut in_ratings = false;
    let mut cur_tag = String::new();
    let mut cur_text = String::new();

    fn handle_tagged(
        thing: &mut BggThing,
        in_ratings: bool,
        name: &str,
        attrs: &[(String, String)],
    ) {
        let value = attr(attrs, "value").unwrap_or("");
        match name {
            "name" => {
                let n = if attr(attrs, "type") == Some("primary") {
                    BggName::Primary(value.to_string())
                } else {
                    BggName::Alternate(value.to_string())
                };
                thing.names.push(n);
            }
            "yearpublished" => thing.year = value.parse::<i32>().ok(),
            "minplayers" => thing.players.min = value.parse::<u32>().ok(),
            "maxplayers" => thing.players.max = value.parse::<u32>().ok(),
            "playingtime" => thing.time.playing = value.parse::<u32>().ok(),
            "minplaytime" => thing.time.min = value.parse::<u32>().ok(),
            "maxplaytime" => thing.time.max = value.parse::<u32>().ok(),
            "minage" => thing.min_age = value.parse::<u32>().ok(),
            "average" if in_ratings => thing.ratings.average = value.parse::<f64>().ok(),
            "usersrated" if in_ratings => {
                thing.ratings.users_rated = value.parse::<u64>().ok()
            }
            "link" => {
                let Some(kind) = attr(attrs, "type").and_then(link_kind) else {
                    return;
                };
                let Some(id) = attr(attrs, "id").and_then(|s| s.parse::<u64>().ok()) else {
                    return;
                };
                let link = BggLink {
                    kind,
                    id,
                    value: value.to_string(),
                };
                match kind {
                    BggLinkKind::Category => thing.categories.push(link),
                    BggLinkKind::Mechanic => thing.mechanics.push(link),
                    BggLinkKind::Designer => thing.designers.push(link),
                    BggLinkKind::Artist => thing.artists.push(link),
                    BggLinkKind::Publisher => thing.publishers.push(link),
                    BggLinkKind::Expansion => thing.expansions.push(link),
                    BggLinkKind::Family => thing.families.push(link),
                }
            }
            _ => {}
        }
    }

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Eof) => break,
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "item" if !seen_item => {
                        let attrs = attrs_map(&e);
                        thing.id = attr(&attrs, "id")
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(want_id);
                        seen_item = true;
                        in_item = true;
                    }
                    "ratings" if in_item => in_ratings = true,
                    _ if in_item => {
                        let attrs = attrs_map(&e);
                        handle_tagged(&mut thing, in_ratings, &name, &attrs);
                        cur_tag = name;
                        cur_text.clear();
                    }
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::Empty(e)) => {
                if in_item {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    let attrs = attrs_map(&e);
                    handle_tagged(&mut thing, in_ratings, &name, &attrs);
                }
            }
            Ok(quick_xml::events::Event::Text(t)) => {
                if in_item {
                    cur_text.push_str(&t.unescape().map(|t| t.to_string()).unwrap_or_default());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if in_item {
                    match name.as_str() {
                        "description" if cur_tag == "description" => {
                            thing.description = cur_text.trim().to_string();
                        }
                        "thumbnail" if cur_tag == "thumbnail" => {
                            let t = cur_text.trim();
                            thing.thumbnail = (!t.is_empty()).then(|| t.to_string());
                        }
                        "image" if cur_tag == "image" => {
                            let t = cur_text.trim();
                            thing.image = (!t.is_empty()).then(|| t.to_string());
                        }
                        "ratings" => in_ratings = false,
                        "item" => in_item = false,
                        _ => {}
                    }
                    cur_tag.clear();
                    cur_text.clear();
                }
            }
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    if !seen_item {
        return None;
    }

    // Primary name wins; first name is the fallback.
    thing.title = thing
        .names
        .iter()
        .find_map(|n| match n {
            BggName::Primary(s) => Some(s.clone()),
            BggName::Alternate(_) => None,
        })
        .or_else(|| thing.names.first().map(|n| n.value().to_string()))
        .unwrap_or_default();

    Some(thing)
}
