//! Storyboard contract.
//!
//! Everything here is a deterministic value type: the generator in
//! `rulecast-local` fills these in, and identical manifests must serialize
//! to byte-identical storyboard JSON. All durations are snapped to the
//! frame quantum before they land in a scene.

use serde::{Deserialize, Serialize};

pub const STORYBOARD_CONTRACT_VERSION: &str = "1.2.0";

/// Frame quantum Q: the 1/6-second grid all durations snap to.
pub const FRAME_QUANTUM_SEC: f64 = 1.0 / 6.0;

/// Snap a duration to the nearest multiple of Q.
pub fn snap_to_frame(sec: f64) -> f64 {
    (sec / FRAME_QUANTUM_SEC).round() * FRAME_QUANTUM_SEC
}

/// Clamp then snap; used for every emitted duration.
pub fn clamp_snap(sec: f64, min: f64, max: f64) -> f64 {
    snap_to_frame(sec.clamp(min, max))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    Intro,
    Setup,
    Phase,
    Turn,
    EndCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Easing {
    #[serde(rename = "linear")]
    Linear,
    #[serde(rename = "easeInOutCubic")]
    EaseInOutCubic,
    #[serde(rename = "easeOutQuad")]
    EaseOutQuad,
    #[serde(rename = "easeInQuad")]
    EaseInQuad,
    #[serde(rename = "easeInOutSine")]
    EaseInOutSine,
}

impl Easing {
    /// Canonical 4-value cubic-bezier control points.
    pub fn cubic_bezier(&self) -> [f64; 4] {
        match self {
            Easing::Linear => [0.0, 0.0, 1.0, 1.0],
            Easing::EaseInOutCubic => [0.645, 0.045, 0.355, 1.0],
            Easing::EaseOutQuad => [0.25, 0.46, 0.45, 0.94],
            Easing::EaseInQuad => [0.55, 0.085, 0.68, 0.53],
            Easing::EaseInOutSine => [0.445, 0.05, 0.55, 0.95],
        }
    }
}

/// Normalized rectangle; all coordinates in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Motion {
    /// Opacity ramp; the default placement motion.
    Fade {
        from: f64,
        to: f64,
        #[serde(rename = "startSec")]
        start_sec: f64,
        #[serde(rename = "endSec")]
        end_sec: f64,
        easing: Easing,
    },
    /// Zoom toward a target rect. Duration bounded to [0.5, 4] s.
    FocusZoom {
        target: Rect,
        #[serde(rename = "startSec")]
        start_sec: f64,
        #[serde(rename = "endSec")]
        end_sec: f64,
        easing: Easing,
    },
    /// Slide toward a component's placement center.
    PanToComponent {
        to: Rect,
        #[serde(rename = "startSec")]
        start_sec: f64,
        #[serde(rename = "endSec")]
        end_sec: f64,
        easing: Easing,
    },
    /// Attention pulse. Duration bounded to [0.5, 4] s.
    HighlightPulse {
        #[serde(rename = "startSec")]
        start_sec: f64,
        #[serde(rename = "endSec")]
        end_sec: f64,
        easing: Easing,
    },
}

impl Motion {
    /// Default cell fade: opacity 0 -> 1 over 0.5 s.
    pub fn default_fade(start_sec: f64) -> Self {
        let start = snap_to_frame(start_sec.max(0.0));
        Motion::Fade {
            from: 0.0,
            to: 1.0,
            start_sec: start,
            end_sec: snap_to_frame(start + 0.5),
            easing: Easing::EaseInOutCubic,
        }
    }

    pub fn focus_zoom(target: Rect, start_sec: f64, end_sec: f64) -> Self {
        let (start, end) = bounded_span(start_sec, end_sec, 0.5, 4.0);
        Motion::FocusZoom {
            target,
            start_sec: start,
            end_sec: end,
            easing: Easing::EaseInOutCubic,
        }
    }

    pub fn pan_to_component(to: Rect, start_sec: f64, end_sec: f64) -> Self {
        let (start, end) = bounded_span(start_sec, end_sec, 0.5, 4.0);
        Motion::PanToComponent {
            to,
            start_sec: start,
            end_sec: end,
            easing: Easing::EaseInOutSine,
        }
    }

    pub fn highlight_pulse(start_sec: f64, end_sec: f64) -> Self {
        let (start, end) = bounded_span(start_sec, end_sec, 0.5, 4.0);
        Motion::HighlightPulse {
            start_sec: start,
            end_sec: end,
            easing: Easing::EaseOutQuad,
        }
    }
}

/// Snap both endpoints to Q and clamp the span length into [min, max].
fn bounded_span(start_sec: f64, end_sec: f64, min: f64, max: f64) -> (f64, f64) {
    let start = snap_to_frame(start_sec.max(0.0));
    let len = (end_sec - start_sec).clamp(min, max);
    (start, snap_to_frame(start + len))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visual {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub rect: Rect,
    pub motions: Vec<Motion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub text: String,
    pub rect: Rect,
    pub start_sec: f64,
    pub end_sec: f64,
    pub easing: Easing,
    /// Content hash of `text`, emitted when the generator is asked for
    /// overlay hashes (cheap change detection for downstream renderers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Crossfade,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub kind: TransitionKind,
    pub duration_sec: f64,
}

impl Transition {
    /// Default 1.5 s crossfade, clamped to [1, 3] and snapped to Q.
    pub fn crossfade(duration_sec: f64) -> Self {
        Transition {
            kind: TransitionKind::Crossfade,
            duration_sec: clamp_snap(duration_sec, 1.0, 3.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryboardScene {
    pub id: String,
    pub index: u32,
    pub segment_id: String,
    #[serde(rename = "type")]
    pub kind: SceneKind,
    pub duration_sec: f64,
    pub narration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
    pub visuals: Vec<Visual>,
    pub overlays: Vec<Overlay>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryboardGame {
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Storyboard {
    pub storyboard_contract_version: String,
    pub game: StoryboardGame,
    pub resolution: Resolution,
    pub scenes: Vec<StoryboardScene>,
}
