//! Viseme Blending
//!
//! Resolves the viseme events active at a query time into a single pose.
//!
//! - Each active event's weight ramps linearly over its blend window at both
//!   edges (see [`VisemeEvent::weight_at`]).
//! - The dominant event wins: highest instantaneous weight, ties going to the
//!   earliest start. Poses are not summed.
//! - The dominant pose is drawn from silence towards the event's target by
//!   its weight, so the output is continuous where intervals begin and end.
//! - Nothing active means the silence pose at weight 1.0.
//! - Consecutive samples are smoothed with an exponential moving average.
//!   The smoothing state belongs to one stream, so samples must be requested
//!   in strictly increasing time order.

use thiserror::Error;

use super::pose::PoseVector;
use super::viseme::{VisemeCategory, VisemeEvent};

/// Default smoothing factor
pub const DEFAULT_SMOOTHING_ALPHA: f32 = 0.3;

/// One blended sample
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlendedPose {
    /// Category of the dominant event (silence when nothing is active)
    pub category: VisemeCategory,
    /// Instantaneous weight of the dominant event
    pub weight: f32,
    /// Smoothed output pose
    pub pose: PoseVector,
}

/// Sampling out of order
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BlendError {
    /// Sample time did not advance past the previous one
    #[error("blend time {requested} does not advance past {previous}")]
    TimeNotIncreasing {
        /// Time of the previous sample
        previous: f64,
        /// Requested time
        requested: f64,
    },
}

/// Exponential moving average over poses
#[derive(Clone, Debug)]
pub struct Smoother {
    alpha: f32,
    previous: Option<PoseVector>,
}

impl Smoother {
    /// Create a smoother; `alpha` is clamped into `(0.0, 1.0]`
    #[must_use]
    pub fn new(alpha: f32) -> Self {
        let alpha = if alpha.is_nan() {
            1.0
        } else {
            alpha.clamp(f32::MIN_POSITIVE, 1.0)
        };
        Self {
            alpha,
            previous: None,
        }
    }

    /// Effective smoothing factor
    #[must_use]
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Blend `raw` into the running state and return the output
    ///
    /// The first pose after creation or [`reset`](Self::reset) passes through.
    pub fn apply(&mut self, raw: PoseVector) -> PoseVector {
        let output = match self.previous {
            Some(previous) => previous.lerp(&raw, self.alpha),
            None => raw,
        };
        self.previous = Some(output);
        output
    }

    /// Forget the running state
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// Stateful sampler over one stream of viseme events
#[derive(Clone, Debug)]
pub struct VisemeBlender {
    events: Vec<VisemeEvent>,
    max_duration: f64,
    smoother: Smoother,
    last_time: Option<f64>,
}

impl VisemeBlender {
    /// Create a blender over `events`
    ///
    /// Events with non-finite times are dropped; the rest are ordered by
    /// start time.
    #[must_use]
    pub fn new(mut events: Vec<VisemeEvent>, alpha: f32) -> Self {
        events.retain(|e| e.start.is_finite() && e.duration.is_finite() && e.duration >= 0.0);
        events.sort_by(|a, b| a.start.total_cmp(&b.start));
        let max_duration = events.iter().map(|e| e.duration).fold(0.0, f64::max);
        Self {
            events,
            max_duration,
            smoother: Smoother::new(alpha),
            last_time: None,
        }
    }

    /// Events this blender samples from
    #[must_use]
    pub fn events(&self) -> &[VisemeEvent] {
        &self.events
    }

    /// Unsmoothed sample at `t`
    ///
    /// Pure: does not touch the smoothing state.
    #[must_use]
    pub fn raw_at(&self, t: f64) -> BlendedPose {
        let silence = VisemeCategory::Silence.pose();
        match self.dominant_at(t) {
            Some((event, weight)) => BlendedPose {
                category: event.category,
                weight,
                pose: silence.lerp(&event.pose_target, weight),
            },
            None => BlendedPose {
                category: VisemeCategory::Silence,
                weight: 1.0,
                pose: silence,
            },
        }
    }

    /// Smoothed sample at `t`
    ///
    /// # Errors
    ///
    /// Returns [`BlendError::TimeNotIncreasing`] if `t` is not later than
    /// the previous sample.
    pub fn blend_at(&mut self, t: f64) -> Result<BlendedPose, BlendError> {
        if let Some(previous) = self.last_time {
            if t.is_nan() || t <= previous {
                return Err(BlendError::TimeNotIncreasing {
                    previous,
                    requested: t,
                });
            }
        }
        self.last_time = Some(t);

        let mut sample = self.raw_at(t);
        sample.pose = self.smoother.apply(sample.pose);
        Ok(sample)
    }

    /// Start a new stream over the same events
    pub fn reset(&mut self) {
        self.smoother.reset();
        self.last_time = None;
    }

    fn dominant_at(&self, t: f64) -> Option<(&VisemeEvent, f32)> {
        let upper = self.events.partition_point(|e| e.start <= t);
        let mut best: Option<(&VisemeEvent, f32)> = None;

        for event in self.events[..upper].iter().rev() {
            if event.start + self.max_duration <= t {
                // sorted by start: nothing earlier can still be active
                break;
            }
            if !event.contains(t) {
                continue;
            }
            let weight = event.weight_at(t);
            best = match best {
                Some((current, current_weight))
                    if weight < current_weight
                        || (weight <= current_weight && event.start > current.start) =>
                {
                    Some((current, current_weight))
                }
                _ => Some((event, weight)),
            };
        }

        best
    }
}
