//! Pose Vectors
//!
//! A [`PoseVector`] is the only thing the renderer ever sees: six numbers
//! describing the mouth for one frame. Shape parameters are normalized to
//! `[0.0, 1.0]`; the two offsets are small signed displacements in
//! `[-1.0, 1.0]` (the template offsets are pixel nudges scaled by 1/100).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lower bound for the offset fields
pub const OFFSET_MIN: f32 = -1.0;
/// Upper bound for the offset fields
pub const OFFSET_MAX: f32 = 1.0;

/// Pixel offsets in the shape table are divided by this to normalize them
const OFFSET_SCALE: f32 = 100.0;

/// A pose vector failed validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoseError {
    /// A field was NaN or infinite
    #[error("pose field `{field}` is not finite")]
    NotFinite {
        /// Name of the offending field
        field: &'static str,
    },

    /// A field was outside its allowed range
    #[error("pose field `{field}` = {value} outside [{min}, {max}]")]
    OutOfRange {
        /// Name of the offending field
        field: &'static str,
        /// The rejected value
        value: f32,
        /// Inclusive lower bound
        min: f32,
        /// Inclusive upper bound
        max: f32,
    },
}

/// Normalized facial pose parameters for a single frame
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseVector {
    /// Horizontal mouth opening (0.0-1.0)
    pub mouth_width: f32,
    /// Vertical mouth opening (0.0-1.0)
    pub mouth_height: f32,
    /// Jaw drop (0.0-1.0)
    pub jaw_open: f32,
    /// Lip rounding (0.0-1.0)
    pub lip_round: f32,
    /// Horizontal mouth displacement (-1.0-1.0)
    pub x_offset: f32,
    /// Vertical mouth displacement (-1.0-1.0)
    pub y_offset: f32,
}

impl PoseVector {
    /// Build a pose from the shape table's units (offsets in pixels)
    #[must_use]
    pub fn from_shape(
        width: f32,
        height: f32,
        jaw: f32,
        round: f32,
        x_px: f32,
        y_px: f32,
    ) -> Self {
        Self {
            mouth_width: width,
            mouth_height: height,
            jaw_open: jaw,
            lip_round: round,
            x_offset: x_px / OFFSET_SCALE,
            y_offset: y_px / OFFSET_SCALE,
        }
    }

    /// Linear interpolation towards `target` by `t` (clamped to 0.0-1.0)
    #[must_use]
    pub fn lerp(&self, target: &Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        let mix = |a: f32, b: f32| a + (b - a) * t;
        Self {
            mouth_width: mix(self.mouth_width, target.mouth_width),
            mouth_height: mix(self.mouth_height, target.mouth_height),
            jaw_open: mix(self.jaw_open, target.jaw_open),
            lip_round: mix(self.lip_round, target.lip_round),
            x_offset: mix(self.x_offset, target.x_offset),
            y_offset: mix(self.y_offset, target.y_offset),
        }
    }

    /// Largest absolute per-field difference to another pose
    #[must_use]
    pub fn max_abs_diff(&self, other: &Self) -> f32 {
        self.fields()
            .iter()
            .zip(other.fields().iter())
            .map(|((_, a), (_, b))| (a - b).abs())
            .fold(0.0, f32::max)
    }

    /// Named fields in declaration order
    #[must_use]
    pub fn fields(&self) -> [(&'static str, f32); 6] {
        [
            ("mouth_width", self.mouth_width),
            ("mouth_height", self.mouth_height),
            ("jaw_open", self.jaw_open),
            ("lip_round", self.lip_round),
            ("x_offset", self.x_offset),
            ("y_offset", self.y_offset),
        ]
    }

    /// Check that every field is finite and inside its range
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), PoseError> {
        for (index, (field, value)) in self.fields().into_iter().enumerate() {
            if !value.is_finite() {
                return Err(PoseError::NotFinite { field });
            }
            let (min, max) = if index < 4 {
                (0.0, 1.0)
            } else {
                (OFFSET_MIN, OFFSET_MAX)
            };
            if value < min || value > max {
                return Err(PoseError::OutOfRange {
                    field,
                    value,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}
