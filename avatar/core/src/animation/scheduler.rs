//! Frame Scheduling
//!
//! Turns a viseme stream and an audio duration into the per-frame pose
//! sequence handed to the renderer. Frames are produced lazily, one per
//! `1/fps` tick, so long utterances never materialize more than the caller
//! collects.

use serde::Serialize;
use tracing::warn;

use super::blend::VisemeBlender;
use super::pose::PoseVector;
use super::viseme::{VisemeCategory, VisemeEvent};

/// Default output frame rate
pub const DEFAULT_FPS: u32 = 30;

/// One rendered frame's pose
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PoseFrame {
    /// Zero-based frame number
    pub index: usize,
    /// Seconds from the start of the audio
    pub timestamp: f64,
    /// Dominant viseme at this frame
    pub category: VisemeCategory,
    /// Weight of the dominant viseme
    pub weight: f32,
    /// Smoothed pose
    pub pose: PoseVector,
}

/// Lazy, one-shot iterator over pose frames
///
/// Yields `floor(duration * fps)` frames at timestamps `i / fps`. A
/// non-positive or non-finite duration, or a zero frame rate, yields nothing.
#[derive(Debug)]
pub struct FrameScheduler {
    blender: VisemeBlender,
    fps: u32,
    next: usize,
    total: usize,
}

impl FrameScheduler {
    /// Schedule frames over `events` for `duration_secs` of audio
    #[must_use]
    pub fn new(events: Vec<VisemeEvent>, duration_secs: f64, fps: u32, alpha: f32) -> Self {
        Self {
            blender: VisemeBlender::new(events, alpha),
            fps,
            next: 0,
            total: frame_count(duration_secs, fps),
        }
    }

    /// Frame rate
    #[must_use]
    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Total frames this scheduler produces
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.total
    }

    #[allow(clippy::cast_precision_loss)]
    fn timestamp(&self, index: usize) -> f64 {
        index as f64 / f64::from(self.fps)
    }
}

impl Iterator for FrameScheduler {
    type Item = PoseFrame;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let index = self.next;
        let timestamp = self.timestamp(index);

        match self.blender.blend_at(timestamp) {
            Ok(sample) => {
                self.next += 1;
                Some(PoseFrame {
                    index,
                    timestamp,
                    category: sample.category,
                    weight: sample.weight,
                    pose: sample.pose,
                })
            }
            Err(e) => {
                warn!(error = %e, index, "Frame schedule stopped early");
                self.next = self.total;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FrameScheduler {}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn frame_count(duration_secs: f64, fps: u32) -> usize {
    if fps == 0 || !duration_secs.is_finite() || duration_secs <= 0.0 {
        return 0;
    }
    let frames = (duration_secs * f64::from(fps)).floor();
    if frames >= usize::MAX as f64 {
        usize::MAX
    } else {
        frames as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::phoneme::PhonemeEvent;
    use crate::animation::viseme::VisemeMapper;

    fn aa_then_silence() -> Vec<VisemeEvent> {
        VisemeMapper::default().map_all(&[
            PhonemeEvent {
                phoneme: "aa".to_string(),
                start: 0.0,
                end: 0.5,
            },
            PhonemeEvent::silence(0.5, 1.0),
        ])
    }

    #[test]
    fn test_frame_count_and_timestamps() {
        let frames: Vec<_> = FrameScheduler::new(aa_then_silence(), 1.0, 30, 0.3).collect();
        assert_eq!(frames.len(), 30);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.index, i);
            assert!((frame.timestamp - i as f64 / 30.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_frame_count_floors() {
        assert_eq!(FrameScheduler::new(Vec::new(), 0.99, 30, 0.3).count(), 29);
        assert_eq!(FrameScheduler::new(Vec::new(), 2.5, 24, 0.3).len(), 60);
    }

    #[test]
    fn test_degenerate_inputs_yield_nothing() {
        assert_eq!(FrameScheduler::new(aa_then_silence(), 0.0, 30, 0.3).count(), 0);
        assert_eq!(FrameScheduler::new(aa_then_silence(), -1.0, 30, 0.3).count(), 0);
        assert_eq!(FrameScheduler::new(aa_then_silence(), f64::NAN, 30, 0.3).count(), 0);
        assert_eq!(FrameScheduler::new(aa_then_silence(), 1.0, 0, 0.3).count(), 0);
    }

    #[test]
    fn test_every_frame_is_valid() {
        for frame in FrameScheduler::new(aa_then_silence(), 1.0, 30, 0.3) {
            assert!(frame.pose.validate().is_ok(), "frame {}", frame.index);
        }
    }

    #[test]
    fn test_size_hint_tracks_progress() {
        let mut scheduler = FrameScheduler::new(Vec::new(), 1.0, 10, 0.3);
        assert_eq!(scheduler.len(), 10);
        scheduler.next();
        scheduler.next();
        assert_eq!(scheduler.len(), 8);
        assert_eq!(scheduler.by_ref().count(), 8);
        assert!(scheduler.next().is_none());
    }

    #[test]
    fn test_frames_past_events_are_silence() {
        let events = VisemeMapper::default().map_all(&[PhonemeEvent {
            phoneme: "m".to_string(),
            start: 0.0,
            end: 0.2,
        }]);
        let last = FrameScheduler::new(events, 2.0, 30, 1.0).last().unwrap();
        assert_eq!(last.category, VisemeCategory::Silence);
        assert_eq!(last.pose, VisemeCategory::Silence.pose());
    }
}
