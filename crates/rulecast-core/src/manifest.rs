//! Ingestion manifest contract.
//!
//! The manifest is the immutable JSON artifact the pipeline emits and the
//! (out-of-scope) renderer consumes. Field order is struct order and all
//! collections are explicitly ordered, so identical inputs serialize to
//! identical bytes.

use crate::{Error, FetchOutcome, Result};
use serde::{Deserialize, Serialize};

pub const MANIFEST_CONTRACT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameIdentity {
    /// Lowercase, diacritic-stripped, hyphenated; stable for identical inputs.
    pub slug: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bgg_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageTextSource {
    Parser,
    Ocr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPage {
    /// 1-based. Pages are strictly ordered; missing pages are absent, not blank.
    pub page_number: u32,
    pub text: String,
    /// In [0, 1].
    pub confidence: f64,
    pub source: PageTextSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageContext {
    #[serde(rename = "components-nearby")]
    ComponentsNearby,
    #[serde(rename = "page")]
    Page,
}

/// Which heuristic produced an image's dimensions, in documented preference
/// order. Recorded so regressions in the resolver ladder are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeSource {
    AttrHint,
    UrlToken,
    SrcsetToken,
    RemoteProbe,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedImage {
    /// Absolute, canonicalized (tracking params stripped).
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub alt: String,
    pub score: f64,
    pub context: ImageContext,
    /// Sibling blocks between the Components anchor and this image; 0 = same block.
    pub distance: u32,
    /// `exp(-distance / 4)`, carried for downstream ranking experiments.
    pub proximity: f64,
    pub size_source: SizeSource,
    /// Pluggable focus/quality analyzer output; default 0.5.
    pub focus: f64,
}

impl ExtractedImage {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentItem {
    /// Whole list line as harvested.
    pub raw: String,
    /// Line with a leading count removed.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineHeading {
    pub text: String,
    /// Heading rank (1 for h1, …); 0 when unknown.
    pub level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum BggName {
    Primary(String),
    Alternate(String),
}

impl BggName {
    pub fn value(&self) -> &str {
        match self {
            BggName::Primary(s) | BggName::Alternate(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BggLinkKind {
    Category,
    Mechanic,
    Designer,
    Artist,
    Publisher,
    Expansion,
    Family,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BggLink {
    pub kind: BggLinkKind,
    pub id: u64,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playing: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BggRatings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_rated: Option<u64>,
}

/// A fully-populated BGG `thing`. Numerics are coerced from the API's
/// `value` attribute strings at parse time; totality after that.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BggThing {
    pub id: u64,
    pub title: String,
    pub names: Vec<BggName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub players: PlayerRange,
    pub time: PlayTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_age: Option<u32>,
    pub categories: Vec<BggLink>,
    pub mechanics: Vec<BggLink>,
    pub designers: Vec<BggLink>,
    pub artists: Vec<BggLink>,
    pub publishers: Vec<BggLink>,
    pub expansions: Vec<BggLink>,
    pub families: Vec<BggLink>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub ratings: BggRatings,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: String,
}

/// Sentinel carried when the BGG call failed; the pipeline proceeds with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BggPartial {
    pub id: String,
    pub error: String,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BggSnapshot {
    Full(Box<BggThing>),
    Partial(BggPartial),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrUsage {
    pub used: bool,
    /// 1-based page numbers whose text came from OCR.
    pub pages: Vec<u32>,
    /// OCR was needed but neither binary nor in-process engine was available.
    pub unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocInfo {
    pub page_number: u32,
    /// First 500 characters of the matching page.
    pub excerpt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestHeuristics {
    pub pages_with_low_text_ratio: Vec<u32>,
    pub components_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toc: Option<TocInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAssets {
    /// Ordered by page number.
    pub pages: Vec<ParsedPage>,
    /// Ordered by rank (score desc, area desc).
    pub images: Vec<ExtractedImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionManifest {
    pub contract_version: String,
    pub game: GameIdentity,
    pub outline: Vec<OutlineHeading>,
    pub components: Vec<ComponentItem>,
    pub assets: ManifestAssets,
    pub ocr: OcrUsage,
    pub heuristics: IngestHeuristics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bgg: Option<BggSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_url: Option<String>,
    pub tried_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<FetchOutcome>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_reason: Option<String>,
}

impl IngestionManifest {
    pub fn new(game: GameIdentity) -> Self {
        Self {
            contract_version: MANIFEST_CONTRACT_VERSION.to_string(),
            game,
            outline: Vec::new(),
            components: Vec::new(),
            assets: ManifestAssets::default(),
            ocr: OcrUsage::default(),
            heuristics: IngestHeuristics::default(),
            bgg: None,
            rules_url: None,
            tried_urls: Vec::new(),
            cache_status: None,
            warnings: Vec::new(),
            partial_reason: None,
        }
    }

    /// Contract validation. On failure the error enumerates every offending
    /// field path, not just the first.
    pub fn validate(&self) -> Result<()> {
        let mut missing: Vec<String> = Vec::new();

        if !is_semver(&self.contract_version) {
            missing.push("contractVersion".to_string());
        }
        if self.game.slug.trim().is_empty() {
            missing.push("game.slug".to_string());
        }
        if self.game.name.trim().is_empty() {
            missing.push("game.name".to_string());
        }

        let mut prev_page = 0u32;
        for (i, p) in self.assets.pages.iter().enumerate() {
            if p.page_number == 0 || p.page_number <= prev_page {
                missing.push(format!("assets.pages[{i}].pageNumber"));
            }
            prev_page = p.page_number;
            if !(0.0..=1.0).contains(&p.confidence) {
                missing.push(format!("assets.pages[{i}].confidence"));
            }
        }

        for (i, img) in self.assets.images.iter().enumerate() {
            if img.url.trim().is_empty() {
                missing.push(format!("assets.images[{i}].url"));
            }
            if !img.score.is_finite() {
                missing.push(format!("assets.images[{i}].score"));
            }
        }

        for (i, h) in self.outline.iter().enumerate() {
            if h.text.trim().is_empty() {
                missing.push(format!("outline[{i}].text"));
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::ContractViolation { missing })
        }
    }
}

fn is_semver(s: &str) -> bool {
    let mut parts = 0usize;
    for p in s.split('.') {
        if p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        parts += 1;
    }
    parts == 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> IngestionManifest {
        let mut m = IngestionManifest::new(GameIdentity {
            slug: "catan".into(),
            name: "Catan".into(),
            bgg_id: Some(13),
        });
        m.outline.push(OutlineHeading {
            text: "Setup".into(),
            level: 2,
            narration: Some("Place the board in the middle of the table.".into()),
        });
        m.components.push(ComponentItem {
            raw: "19 terrain hexes".into(),
            name: "terrain hexes".into(),
            quantity: Some(19),
        });
        m.assets.pages.push(ParsedPage {
            page_number: 1,
            text: "Components: 19 terrain hexes".into(),
            confidence: 1.0,
            source: PageTextSource::Parser,
        });
        m.assets.images.push(ExtractedImage {
            url: "https://example.com/img/board.jpg".into(),
            width: 640,
            height: 480,
            alt: "game board".into(),
            score: 60.0,
            context: ImageContext::ComponentsNearby,
            distance: 1,
            proximity: (-0.25f64).exp(),
            size_source: SizeSource::AttrHint,
            focus: 0.5,
        });
        m
    }

    #[test]
    fn manifest_round_trips() {
        let m = sample_manifest();
        let json = serde_json::to_string_pretty(&m).unwrap();
        let back: IngestionManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn manifest_serialization_is_deterministic() {
        let a = serde_json::to_string(&sample_manifest()).unwrap();
        let b = serde_json::to_string(&sample_manifest()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn image_context_uses_wire_names() {
        let j = serde_json::to_string(&ImageContext::ComponentsNearby).unwrap();
        assert_eq!(j, "\"components-nearby\"");
    }

    #[test]
    fn validate_accepts_well_formed() {
        assert!(sample_manifest().validate().is_ok());
    }

    #[test]
    fn validate_enumerates_all_offending_paths() {
        let mut m = sample_manifest();
        m.contract_version = "1.x".into();
        m.game.slug = String::new();
        m.assets.pages.push(ParsedPage {
            page_number: 1, // duplicate, not strictly increasing
            text: String::new(),
            confidence: 2.0,
            source: PageTextSource::Ocr,
        });
        let err = m.validate().unwrap_err();
        match err {
            Error::ContractViolation { missing } => {
                assert!(missing.contains(&"contractVersion".to_string()));
                assert!(missing.contains(&"game.slug".to_string()));
                assert!(missing.contains(&"assets.pages[1].pageNumber".to_string()));
                assert!(missing.contains(&"assets.pages[1].confidence".to_string()));
            }
            other => panic!("expected ContractViolation, got {other:?}"),
        }
    }

    #[test]
    fn bgg_snapshot_partial_round_trips_untagged() {
        let p = BggSnapshot::Partial(BggPartial {
            id: "13".into(),
            error: "BGG API request failed with status 500".into(),
            fetched_at: crate::iso_from_ms(0),
        });
        let json = serde_json::to_string(&p).unwrap();
        let back: BggSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn semver_check() {
        assert!(is_semver("1.0.0"));
        assert!(is_semver("10.2.33"));
        assert!(!is_semver("1.0"));
        assert!(!is_semver("1.0.x"));
        assert!(!is_semver(""));
    }
}
