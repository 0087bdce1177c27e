//! Viseme Mapping
//!
//! Pure lookup from phonemes to viseme categories and from categories to
//! pose templates. The phoneme table is closed: anything it does not list
//! maps to [`VisemeCategory::Silence`], so mapping never fails.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::phoneme::PhonemeEvent;
use super::pose::PoseVector;

/// Default blend window in seconds
pub const DEFAULT_BLEND_WINDOW_SECS: f64 = 0.1;

/// A visually distinct mouth shape
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisemeCategory {
    /// Closed, relaxed mouth
    Silence,
    /// Open vowel (father)
    Aa,
    /// Spread high vowel (see)
    Ii,
    /// Rounded high vowel (blue)
    Uu,
    /// Mid front vowel (bed)
    Ee,
    /// Rounded mid vowel (go)
    Oo,
    /// Velar stop k
    K,
    /// Velar stop g, also ng
    G,
    /// Alveolar stop t
    T,
    /// Alveolar stop d
    D,
    /// Alveolar nasal n
    N,
    /// Bilabial nasal m
    M,
    /// Bilabial stop p
    P,
    /// Bilabial stop b
    B,
    /// Sibilants s, z, sh
    S,
    /// Glottal h
    H,
}

impl VisemeCategory {
    /// Every category, in table order
    pub const ALL: [Self; 16] = [
        Self::Silence,
        Self::Aa,
        Self::Ii,
        Self::Uu,
        Self::Ee,
        Self::Oo,
        Self::K,
        Self::G,
        Self::T,
        Self::D,
        Self::N,
        Self::M,
        Self::P,
        Self::B,
        Self::S,
        Self::H,
    ];

    /// Resolve a phoneme symbol (case-insensitive)
    #[must_use]
    pub fn from_phoneme(phoneme: &str) -> Self {
        match phoneme.to_ascii_lowercase().as_str() {
            "aa" | "ae" | "ah" => Self::Aa,
            "eh" | "er" | "ey" => Self::Ee,
            "ih" | "iy" => Self::Ii,
            "ow" | "oy" => Self::Oo,
            "uw" => Self::Uu,
            "p" => Self::P,
            "b" => Self::B,
            "m" => Self::M,
            "t" => Self::T,
            "d" => Self::D,
            "n" => Self::N,
            "k" => Self::K,
            "g" | "ng" => Self::G,
            "s" | "z" | "sh" => Self::S,
            "h" => Self::H,
            _ => Self::Silence,
        }
    }

    /// Pose template for this category
    #[must_use]
    pub fn pose(self) -> PoseVector {
        match self {
            Self::Silence => PoseVector::from_shape(0.2, 0.1, 0.0, 0.0, 0.0, 0.0),
            Self::Aa => PoseVector::from_shape(0.8, 0.7, 0.8, 0.2, 0.0, 0.0),
            Self::Ii => PoseVector::from_shape(0.5, 0.9, 0.3, 0.1, 5.0, -5.0),
            Self::Uu => PoseVector::from_shape(0.6, 0.4, 0.4, 0.9, 0.0, 5.0),
            Self::Ee => PoseVector::from_shape(0.7, 0.5, 0.5, 0.3, 0.0, -3.0),
            Self::Oo => PoseVector::from_shape(0.6, 0.5, 0.5, 0.7, 0.0, 2.0),
            Self::K => PoseVector::from_shape(0.5, 0.3, 0.3, 0.2, -2.0, 0.0),
            Self::G => PoseVector::from_shape(0.5, 0.3, 0.3, 0.2, 2.0, 0.0),
            Self::T => PoseVector::from_shape(0.4, 0.2, 0.2, 0.1, 3.0, 0.0),
            Self::D => PoseVector::from_shape(0.4, 0.2, 0.2, 0.1, -2.0, 0.0),
            Self::N | Self::M => PoseVector::from_shape(0.4, 0.2, 0.2, 0.1, 0.0, 0.0),
            Self::P => PoseVector::from_shape(0.3, 0.1, 0.1, 0.1, 0.0, 2.0),
            Self::B => PoseVector::from_shape(0.3, 0.1, 0.1, 0.1, 0.0, 1.0),
            Self::S => PoseVector::from_shape(0.4, 0.1, 0.1, 0.1, 0.0, 1.0),
            Self::H => PoseVector::from_shape(0.5, 0.3, 0.3, 0.2, 0.0, 0.0),
        }
    }

    /// Wire name, e.g. `viseme_aa`
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Silence => "viseme_silence",
            Self::Aa => "viseme_aa",
            Self::Ii => "viseme_ii",
            Self::Uu => "viseme_uu",
            Self::Ee => "viseme_ee",
            Self::Oo => "viseme_oo",
            Self::K => "viseme_k",
            Self::G => "viseme_g",
            Self::T => "viseme_t",
            Self::D => "viseme_d",
            Self::N => "viseme_n",
            Self::M => "viseme_m",
            Self::P => "viseme_p",
            Self::B => "viseme_b",
            Self::S => "viseme_s",
            Self::H => "viseme_h",
        }
    }
}

impl fmt::Display for VisemeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A viseme occupying `[start, start + duration)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisemeEvent {
    /// Mouth shape category
    pub category: VisemeCategory,
    /// Start time in seconds
    pub start: f64,
    /// Length in seconds
    pub duration: f64,
    /// Ramp length at each edge, in seconds
    pub blend_window: f64,
    /// Pose at full weight
    pub pose_target: PoseVector,
}

impl VisemeEvent {
    /// End time in seconds (exclusive)
    #[must_use]
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Whether `t` falls inside the half-open interval
    #[must_use]
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end()
    }

    /// Instantaneous weight at `t`
    ///
    /// Ramps 0→1 over the first blend window, holds 1, ramps 1→0 over the
    /// last blend window. Zero outside the interval.
    #[must_use]
    pub fn weight_at(&self, t: f64) -> f32 {
        if !self.contains(t) {
            return 0.0;
        }
        if self.blend_window <= 0.0 {
            return 1.0;
        }
        let ramp_in = (t - self.start) / self.blend_window;
        let ramp_out = (self.end() - t) / self.blend_window;
        narrow(ramp_in.min(ramp_out).clamp(0.0, 1.0))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn narrow(weight: f64) -> f32 {
    weight as f32
}

/// Maps phoneme events to viseme events
#[derive(Clone, Copy, Debug)]
pub struct VisemeMapper {
    blend_window: f64,
}

impl Default for VisemeMapper {
    fn default() -> Self {
        Self::new(DEFAULT_BLEND_WINDOW_SECS)
    }
}

impl VisemeMapper {
    /// Create a mapper that assigns `blend_window` seconds to every event
    ///
    /// Negative or non-finite windows are treated as zero.
    #[must_use]
    pub fn new(blend_window: f64) -> Self {
        let blend_window = if blend_window.is_finite() {
            blend_window.max(0.0)
        } else {
            0.0
        };
        Self { blend_window }
    }

    /// Blend window assigned to each event
    #[must_use]
    pub fn blend_window(&self) -> f64 {
        self.blend_window
    }

    /// Map a single phoneme event
    #[must_use]
    pub fn map(&self, event: &PhonemeEvent) -> VisemeEvent {
        let category = VisemeCategory::from_phoneme(&event.phoneme);
        VisemeEvent {
            category,
            start: event.start,
            duration: event.duration().max(0.0),
            blend_window: self.blend_window,
            pose_target: category.pose(),
        }
    }

    /// Map a whole timeline, preserving order
    #[must_use]
    pub fn map_all(&self, events: &[PhonemeEvent]) -> Vec<VisemeEvent> {
        events.iter().map(|e| self.map(e)).collect()
    }
}
