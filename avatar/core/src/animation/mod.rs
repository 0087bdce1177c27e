//! Animation - Speech Timings to Pose Frames
//!
//! Everything between a synthesized utterance and the renderer: word
//! timings are expanded into phonemes, phonemes are mapped to visemes, and
//! visemes are blended and sampled into a fixed-rate pose track.
//!
//! # Architecture
//!
//! ```text
//! [WordTiming]
//!     │  PhonemeTimeline (pluggable grapheme→phoneme)
//!     ▼
//! [PhonemeEvent]      dense, contiguous, silence in the gaps
//!     │  VisemeMapper (closed lookup table)
//!     ▼
//! [VisemeEvent]       category + pose target + blend window
//!     │  FrameScheduler → VisemeBlender (dominant viseme, EMA smoothing)
//!     ▼
//! [PoseFrame]         one per 1/fps tick, strictly increasing
//! ```
//!
//! All of it is synchronous. The coordinator runs it on a blocking thread.

mod blend;
mod phoneme;
mod pose;
mod scheduler;
mod viseme;

pub use blend::{BlendError, BlendedPose, Smoother, VisemeBlender, DEFAULT_SMOOTHING_ALPHA};
pub use phoneme::{
    GraphemeToPhoneme, LexiconG2p, NaiveG2p, PhonemeEvent, PhonemeTimeline, TimelineError,
    WordTiming, OVERLAP_TOLERANCE_SECS, SILENCE_PHONEME,
};
pub use pose::{PoseError, PoseVector, OFFSET_MAX, OFFSET_MIN};
pub use scheduler::{FrameScheduler, PoseFrame, DEFAULT_FPS};
pub use viseme::{VisemeCategory, VisemeEvent, VisemeMapper, DEFAULT_BLEND_WINDOW_SECS};

use serde::{Deserialize, Serialize};

/// Parameters for turning an utterance into frames
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnimationConfig {
    /// Output frame rate
    pub fps: u32,
    /// Ramp length at each edge of a viseme, in seconds
    pub blend_window_secs: f64,
    /// Smoothing factor in `(0.0, 1.0]`; 1.0 disables smoothing
    pub smoothing_alpha: f32,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            blend_window_secs: DEFAULT_BLEND_WINDOW_SECS,
            smoothing_alpha: DEFAULT_SMOOTHING_ALPHA,
        }
    }
}

impl AnimationConfig {
    /// Frame scheduler for one utterance
    ///
    /// # Errors
    ///
    /// Returns a [`TimelineError`] if `words` is malformed.
    pub fn schedule(
        &self,
        timeline: &PhonemeTimeline,
        words: &[WordTiming],
        duration_secs: f64,
    ) -> Result<FrameScheduler, TimelineError> {
        let phonemes = timeline.build(words)?;
        let visemes = VisemeMapper::new(self.blend_window_secs).map_all(&phonemes);
        Ok(FrameScheduler::new(
            visemes,
            duration_secs,
            self.fps,
            self.smoothing_alpha,
        ))
    }
}

/// Run the whole chain and collect the frames
///
/// # Errors
///
/// Returns a [`TimelineError`] if `words` is malformed.
pub fn animate(
    timeline: &PhonemeTimeline,
    words: &[WordTiming],
    duration_secs: f64,
    config: &AnimationConfig,
) -> Result<Vec<PoseFrame>, TimelineError> {
    Ok(config.schedule(timeline, words, duration_secs)?.collect())
}
