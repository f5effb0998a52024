//! Deterministic storyboard generation from an ingestion manifest.
//!
//! Pure computation: no clock, no randomness, no IO. Identical manifests
//! and options serialize to byte-identical storyboard JSON, and every
//! emitted duration sits on the 1/6 s frame grid.

use crate::harvest::is_component_anchor_text;
use crate::sha256_hex;
use crate::slug::normalize_slug;
use rulecast_core::{
    clamp_snap, BggSnapshot, Error, ImageContext, IngestionManifest, Motion, Overlay, Rect,
    Resolution, Result, SceneKind, Storyboard, StoryboardGame, StoryboardScene, Transition,
    STORYBOARD_CONTRACT_VERSION,
};

#[derive(Debug, Clone)]
pub struct StoryboardOptions {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Base seconds per scene before narration length is added.
    pub base_step_sec: f64,
    pub per_word_sec: f64,
    pub complexity_weight: f64,
    pub min_scene_sec: f64,
    pub max_scene_sec: f64,
    pub transition_sec: f64,
    /// BCP-ish language hint for the default narration strings.
    pub language: String,
    pub include_overlay_hashes: bool,
}

impl Default for StoryboardOptions {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            base_step_sec: 4.0,
            per_word_sec: 0.15,
            complexity_weight: 1.0,
            min_scene_sec: 2.0,
            max_scene_sec: 15.0,
            transition_sec: 1.5,
            language: "en".to_string(),
            include_overlay_hashes: false,
        }
    }
}

fn intro_text(lang: &str, game: &str) -> String {
    match lang {
        "de" => format!("Willkommen! Heute lernen wir {game}."),
        "fr" => format!("Bienvenue ! Aujourd'hui nous apprenons {game}."),
        "es" => format!("¡Bienvenidos! Hoy aprendemos a jugar {game}."),
        _ => format!("Welcome! Let's learn how to play {game}."),
    }
}

fn heading_text(lang: &str, heading: &str) -> String {
    match lang {
        "de" => format!("Schauen wir uns {heading} an."),
        "fr" => format!("Voyons {heading}."),
        "es" => format!("Veamos {heading}."),
        _ => format!("Let's go over {heading}."),
    }
}

fn end_text(lang: &str, game: &str) -> String {
    match lang {
        "de" => format!("Viel Spaß beim Spielen von {game}!"),
        "fr" => format!("Bon jeu de {game} !"),
        "es" => format!("¡A disfrutar de {game}!"),
        _ => format!("Thanks for watching! Now gather your friends and play {game}."),
    }
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

fn scene_duration(narration: &str, opts: &StoryboardOptions) -> f64 {
    let raw = opts.base_step_sec
        + word_count(narration) as f64 * opts.per_word_sec * opts.complexity_weight;
    clamp_snap(raw, opts.min_scene_sec, opts.max_scene_sec)
}

/// Component cells: up to 3 columns, rows as needed, anchored above a 5%
/// bottom margin inside 10% horizontal margins. Cell width is 0.8 over
/// the per-row item count; cell height is 0.16.
pub fn layout_component_grid(n: usize) -> Vec<Rect> {
    if n == 0 {
        return Vec::new();
    }
    let cols = n.min(3);
    let rows = n.div_ceil(cols);
    let cell_w = 0.8 / cols as f64;
    let cell_h = 0.2 * 0.8;
    (0..n)
        .map(|i| {
            let row = i / cols;
            let col = i % cols;
            Rect {
                x: 0.1 + col as f64 * cell_w,
                y: 0.95 - (rows - row) as f64 * cell_h,
                w: cell_w,
                h: cell_h,
            }
        })
        .collect()
}

fn title_overlay(text: &str, duration_sec: f64, opts: &StoryboardOptions) -> Overlay {
    Overlay {
        text: text.to_string(),
        rect: Rect {
            x: 0.08,
            y: 0.08,
            w: 0.84,
            h: 0.25,
        },
        start_sec: 0.0,
        end_sec: duration_sec,
        easing: rulecast_core::Easing::Linear,
        text_hash: opts
            .include_overlay_hashes
            .then(|| sha256_hex(text.as_bytes())),
    }
}

fn hero_rect() -> Rect {
    Rect {
        x: 0.2,
        y: 0.15,
        w: 0.6,
        h: 0.6,
    }
}

fn hero_visual(url: Option<&str>, label: Option<&str>) -> rulecast_core::Visual {
    rulecast_core::Visual {
        image_url: url.map(|s| s.to_string()),
        label: label.map(|s| s.to_string()),
        rect: hero_rect(),
        motions: vec![Motion::default_fade(0.0)],
    }
}

/// Build a storyboard from a validated manifest. Never proceeds when the
/// manifest violates the contract.
pub fn build_storyboard(
    manifest: &IngestionManifest,
    opts: &StoryboardOptions,
) -> Result<Storyboard> {
    manifest.validate()?;

    let game_name = if manifest.game.name.trim().is_empty() {
        manifest.game.slug.clone()
    } else {
        manifest.game.name.clone()
    };

    let cover_url: Option<String> = match &manifest.bgg {
        Some(BggSnapshot::Full(thing)) => thing.image.clone(),
        _ => None,
    }
    .or_else(|| manifest.assets.images.first().map(|i| i.url.clone()));

    let component_images: Vec<&rulecast_core::ExtractedImage> = {
        let nearby: Vec<_> = manifest
            .assets
            .images
            .iter()
            .filter(|i| i.context == ImageContext::ComponentsNearby)
            .collect();
        if nearby.is_empty() {
            manifest.assets.images.iter().collect()
        } else {
            nearby
        }
    };

    let mut scenes: Vec<StoryboardScene> = Vec::new();

    // Intro.
    {
        let narration = intro_text(&opts.language, &game_name);
        let duration = scene_duration(&narration, opts);
        scenes.push(StoryboardScene {
            id: String::new(),
            index: 0,
            segment_id: "seg-intro".to_string(),
            kind: SceneKind::Intro,
            duration_sec: duration,
            overlays: vec![title_overlay(&game_name, duration, opts)],
            visuals: vec![hero_visual(cover_url.as_deref(), Some(&game_name))],
            narration,
            transition: None,
        });
    }

    // One setup scene per outline heading.
    for (i, heading) in manifest.outline.iter().enumerate() {
        let narration = heading
            .narration
            .clone()
            .unwrap_or_else(|| heading_text(&opts.language, &heading.text));
        let duration = scene_duration(&narration, opts);

        let visuals = if is_component_anchor_text(&heading.text) && !component_images.is_empty()
        {
            let rects = layout_component_grid(component_images.len());
            component_images
                .iter()
                .zip(rects)
                .map(|(img, rect)| rulecast_core::Visual {
                    image_url: Some(img.url.clone()),
                    label: (!img.alt.is_empty()).then(|| img.alt.clone()),
                    rect,
                    motions: vec![Motion::default_fade(0.0)],
                })
                .collect()
        } else {
            // Cycle through harvested imagery so consecutive scenes vary.
            let url = (!manifest.assets.images.is_empty())
                .then(|| manifest.assets.images[i % manifest.assets.images.len()].url.clone());
            vec![hero_visual(url.as_deref(), None)]
        };

        let heading_slug = normalize_slug(&heading.text);
        scenes.push(StoryboardScene {
            id: String::new(),
            index: 0,
            segment_id: format!("seg-{:02}-{}", i + 1, heading_slug),
            kind: SceneKind::Setup,
            duration_sec: duration,
            overlays: vec![title_overlay(&heading.text, duration, opts)],
            visuals,
            narration,
            transition: None,
        });
    }

    // End card.
    {
        let narration = end_text(&opts.language, &game_name);
        let duration = scene_duration(&narration, opts);
        scenes.push(StoryboardScene {
            id: String::new(),
            index: 0,
            segment_id: "seg-end-card".to_string(),
            kind: SceneKind::EndCard,
            duration_sec: duration,
            overlays: vec![title_overlay(&game_name, duration, opts)],
            visuals: vec![hero_visual(cover_url.as_deref(), Some(&game_name))],
            narration,
            transition: None,
        });
    }

    let last = scenes.len() - 1;
    for (i, scene) in scenes.iter_mut().enumerate() {
        scene.index = i as u32;
        scene.id = format!("scene-{i:03}");
        if i < last {
            scene.transition = Some(Transition::crossfade(opts.transition_sec));
        }
    }

    Ok(Storyboard {
        storyboard_contract_version: STORYBOARD_CONTRACT_VERSION.to_string(),
        game: StoryboardGame {
            slug: manifest.game.slug.clone(),
            name: game_name,
        },
        resolution: Resolution {
            width: opts.width,
            height: opts.height,
            fps: opts.fps,
        },
        scenes,
    })
}

/// Canonical JSON bytes for a storyboard; the determinism contract is on
/// this serialization.
pub fn storyboard_json(storyboard: &Storyboard) -> Result<String> {
    serde_json::to_string_pretty(storyboard)
        .map_err(|e| Error::BadInput(format!("storyboard serialization: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulecast_core::{
        ExtractedImage, GameIdentity, OutlineHeading, SizeSource, FRAME_QUANTUM_SEC,
    };

    fn on_grid(d: f64) -> bool {
        let q = d / FRAME_QUANTUM_SEC;
        (q - q.round()).abs() < 1e-9
    }

    fn image(url: &str, context: ImageContext) -> ExtractedImage {
        ExtractedImage {
            url: url.to_string(),
            width: 640,
            height: 480,
            alt: "components".to_string(),
            score: if context == ImageContext::ComponentsNearby {
                52.0
            } else {
                12.0
            },
            context,
            distance: 1,
            proximity: (-0.25f64).exp(),
            size_source: SizeSource::AttrHint,
            focus: 0.5,
        }
    }

    fn manifest_with_outline(headings: &[&str]) -> IngestionManifest {
        let mut m = IngestionManifest::new(GameIdentity {
            slug: "catan".into(),
            name: "Catan".into(),
            bgg_id: Some(13),
        });
        for h in headings {
            m.outline.push(OutlineHeading {
                text: h.to_string(),
                level: 2,
                narration: Some("one two three four five six seven eight nine ten".into()),
            });
        }
        m.assets.images.push(image(
            "https://example.com/img/components.jpg",
            ImageContext::ComponentsNearby,
        ));
        m.assets.images.push(image(
            "https://example.com/img/board.jpg",
            ImageContext::Page,
        ));
        m
    }

    #[test]
    fn outline_of_three_yields_five_quantized_scenes() {
        let m = manifest_with_outline(&["Setup", "Turn", "Scoring"]);
        let sb = build_storyboard(&m, &StoryboardOptions::default()).unwrap();

        assert_eq!(sb.scenes.len(), 5);
        assert_eq!(sb.scenes[0].kind, SceneKind::Intro);
        assert_eq!(sb.scenes[4].kind, SceneKind::EndCard);
        assert!(sb.scenes[1..4]
            .iter()
            .all(|s| s.kind == SceneKind::Setup));
        for s in &sb.scenes {
            assert!(s.duration_sec >= 2.0 && s.duration_sec <= 15.0);
            assert!(on_grid(s.duration_sec), "off grid: {}", s.duration_sec);
        }
        // 10-word narration: 4 + 10 * 0.15 = 5.5, already on the grid.
        assert!((sb.scenes[1].duration_sec - 5.5).abs() < 1e-9);
    }

    #[test]
    fn empty_outline_still_brackets_intro_and_end_card() {
        let m = manifest_with_outline(&[]);
        let sb = build_storyboard(&m, &StoryboardOptions::default()).unwrap();
        assert_eq!(sb.scenes.len(), 2);
        assert_eq!(sb.scenes[0].kind, SceneKind::Intro);
        assert!(!sb.scenes[0].narration.is_empty());
        assert_eq!(sb.scenes[1].kind, SceneKind::EndCard);
    }

    #[test]
    fn storyboard_is_byte_identical_for_identical_inputs() {
        let m = manifest_with_outline(&["Setup", "Components"]);
        let a = storyboard_json(&build_storyboard(&m, &StoryboardOptions::default()).unwrap())
            .unwrap();
        let b = storyboard_json(&build_storyboard(&m, &StoryboardOptions::default()).unwrap())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_manifest_never_builds() {
        let mut m = manifest_with_outline(&["Setup"]);
        m.game.slug = String::new();
        let err = build_storyboard(&m, &StoryboardOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "STORYBOARD_CONTRACT_VIOLATION");
    }

    #[test]
    fn long_narration_clamps_to_max() {
        let mut m = manifest_with_outline(&[]);
        m.outline.push(OutlineHeading {
            text: "Rules".into(),
            level: 2,
            narration: Some("word ".repeat(200)),
        });
        let sb = build_storyboard(&m, &StoryboardOptions::default()).unwrap();
        assert!((sb.scenes[1].duration_sec - 15.0).abs() < 1e-9);
    }

    #[test]
    fn component_heading_gets_the_grid() {
        let m = manifest_with_outline(&["Components", "Setup"]);
        let sb = build_storyboard(&m, &StoryboardOptions::default()).unwrap();

        let comp_scene = &sb.scenes[1];
        assert_eq!(comp_scene.visuals.len(), 1); // one components-nearby image
        assert!(comp_scene.visuals[0]
            .image_url
            .as_deref()
            .unwrap()
            .contains("components.jpg"));
        // Grid cells sit inside the margins.
        for v in &comp_scene.visuals {
            assert!(v.rect.x >= 0.1 - 1e-9);
            assert!(v.rect.x + v.rect.w <= 0.9 + 1e-9);
            assert!(v.rect.y + v.rect.h <= 0.95 + 1e-9);
        }
        // Every cell fades in over half a second.
        match &comp_scene.visuals[0].motions[0] {
            Motion::Fade { from, to, .. } => {
                assert_eq!(*from, 0.0);
                assert_eq!(*to, 1.0);
            }
            other => panic!("expected fade, got {other:?}"),
        }
    }

    #[test]
    fn grid_layout_caps_columns_at_three() {
        let rects = layout_component_grid(7);
        assert_eq!(rects.len(), 7);
        let xs: std::collections::BTreeSet<String> =
            rects.iter().map(|r| format!("{:.4}", r.x)).collect();
        assert!(xs.len() <= 3);
        for r in &rects {
            assert!(r.x >= 0.0 && r.x + r.w <= 1.0);
            assert!(r.y >= 0.0 && r.y + r.h <= 1.0);
            assert!((r.h - 0.16).abs() < 1e-9);
        }
        assert!(layout_component_grid(0).is_empty());
    }

    #[test]
    fn overlays_span_the_whole_scene() {
        let m = manifest_with_outline(&["Setup"]);
        let sb = build_storyboard(&m, &StoryboardOptions::default()).unwrap();
        for s in &sb.scenes {
            assert_eq!(s.overlays.len(), 1);
            let o = &s.overlays[0];
            assert_eq!(o.start_sec, 0.0);
            assert!((o.end_sec - s.duration_sec).abs() < 1e-9);
            assert!((o.rect.h - 0.25).abs() < 1e-9);
            assert!((o.rect.x - 0.08).abs() < 1e-9);
            assert!(o.text_hash.is_none());
        }
    }

    #[test]
    fn overlay_hashes_appear_when_requested() {
        let m = manifest_with_outline(&["Setup"]);
        let opts = StoryboardOptions {
            include_overlay_hashes: true,
            ..StoryboardOptions::default()
        };
        let sb = build_storyboard(&m, &opts).unwrap();
        let hash = sb.scenes[0].overlays[0].text_hash.as_deref().unwrap();
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn transitions_on_all_but_last_scene() {
        let m = manifest_with_outline(&["Setup", "Turn"]);
        let sb = build_storyboard(&m, &StoryboardOptions::default()).unwrap();
        let n = sb.scenes.len();
        for (i, s) in sb.scenes.iter().enumerate() {
            if i < n - 1 {
                let t = s.transition.unwrap();
                assert!((t.duration_sec - 1.5).abs() < 1e-9);
            } else {
                assert!(s.transition.is_none());
            }
        }
    }

    #[test]
    fn scene_ids_and_segments_are_deterministic() {
        let m = manifest_with_outline(&["Setup"]);
        let sb = build_storyboard(&m, &StoryboardOptions::default()).unwrap();
        assert_eq!(sb.scenes[0].id, "scene-000");
        assert_eq!(sb.scenes[1].segment_id, "seg-01-setup");
        assert_eq!(sb.scenes[2].segment_id, "seg-end-card");
        assert_eq!(sb.storyboard_contract_version, STORYBOARD_CONTRACT_VERSION);
    }
}
