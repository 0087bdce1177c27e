//! Phoneme Timeline
//!
//! Turns word timings from the speech stage into a dense, contiguous list of
//! phoneme events. Each word's span is split evenly across its phonemes and
//! the gaps between words are filled with explicit silence, so the result
//! covers `[first.start, last.end)` with no holes and no overlaps.
//!
//! Grapheme-to-phoneme conversion is pluggable through
//! [`GraphemeToPhoneme`]; [`NaiveG2p`] is the letter-based default and
//! [`LexiconG2p`] layers a pronunciation dictionary on top of any fallback.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Phoneme symbol used for silence
pub const SILENCE_PHONEME: &str = "sil";

/// Overlaps between consecutive words up to this many seconds are clamped
/// instead of rejected
pub const OVERLAP_TOLERANCE_SECS: f64 = 1e-6;

/// Timing of one spoken word, as reported by synthesis or recognition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    /// The word text
    pub word: String,
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
}

impl WordTiming {
    /// Create a word timing
    pub fn new(word: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            word: word.into(),
            start,
            end,
        }
    }
}

/// One phoneme occupying `[start, end)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhonemeEvent {
    /// Phoneme symbol (lowercase, ARPAbet-like)
    pub phoneme: String,
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
}

impl PhonemeEvent {
    /// Create a silence event
    #[must_use]
    pub fn silence(start: f64, end: f64) -> Self {
        Self {
            phoneme: SILENCE_PHONEME.to_string(),
            start,
            end,
        }
    }

    /// Length of the event in seconds
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Whether this is a silence event
    #[must_use]
    pub fn is_silence(&self) -> bool {
        self.phoneme == SILENCE_PHONEME
    }
}

/// Invalid word timing input
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimelineError {
    /// A start or end time was NaN or infinite
    #[error("word {index} (`{word}`) has a non-finite time")]
    NonFinite {
        /// Position in the input list
        index: usize,
        /// The word text
        word: String,
    },

    /// A word ends before it starts
    #[error("word {index} (`{word}`) ends at {end} before it starts at {start}")]
    InvertedSpan {
        /// Position in the input list
        index: usize,
        /// The word text
        word: String,
        /// Reported start
        start: f64,
        /// Reported end
        end: f64,
    },

    /// A word starts before the previous one ended
    #[error("word {index} (`{word}`) starts at {start}, before the previous word ends at {previous_end}")]
    Overlap {
        /// Position in the input list
        index: usize,
        /// The word text
        word: String,
        /// Reported start
        start: f64,
        /// End of the previous word
        previous_end: f64,
    },
}

/// Grapheme-to-phoneme conversion
pub trait GraphemeToPhoneme: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Phoneme sequence for a single word (may be empty)
    fn phonemes(&self, word: &str) -> Vec<String>;
}

/// Letter-by-letter conversion
///
/// Vowel letters become `aa`, every other alphabetic character stands for
/// itself, everything else is dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaiveG2p;

impl GraphemeToPhoneme for NaiveG2p {
    fn name(&self) -> &str {
        "naive"
    }

    fn phonemes(&self, word: &str) -> Vec<String> {
        word.chars()
            .flat_map(char::to_lowercase)
            .filter_map(|c| match c {
                'a' | 'e' | 'i' | 'o' | 'u' => Some("aa".to_string()),
                c if c.is_alphabetic() => Some(c.to_string()),
                _ => None,
            })
            .collect()
    }
}

/// Dictionary lookup with a fallback converter for unknown words
#[derive(Clone)]
pub struct LexiconG2p {
    entries: HashMap<String, Vec<String>>,
    fallback: Arc<dyn GraphemeToPhoneme>,
}

impl LexiconG2p {
    /// Create an empty lexicon over `fallback`
    pub fn new(fallback: Arc<dyn GraphemeToPhoneme>) -> Self {
        Self {
            entries: HashMap::new(),
            fallback,
        }
    }

    /// Add a pronunciation
    #[must_use]
    pub fn with_entry<I, S>(mut self, word: &str, phonemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries.insert(
            Self::normalize(word),
            phonemes.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Number of dictionary entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dictionary is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn normalize(word: &str) -> String {
        word.trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
    }
}

impl GraphemeToPhoneme for LexiconG2p {
    fn name(&self) -> &str {
        "lexicon"
    }

    fn phonemes(&self, word: &str) -> Vec<String> {
        match self.entries.get(&Self::normalize(word)) {
            Some(phonemes) => phonemes.clone(),
            None => self.fallback.phonemes(word),
        }
    }
}

/// Builds dense phoneme timelines from word timings
#[derive(Clone)]
pub struct PhonemeTimeline {
    g2p: Arc<dyn GraphemeToPhoneme>,
}

impl Default for PhonemeTimeline {
    fn default() -> Self {
        Self::new(Arc::new(NaiveG2p))
    }
}

impl PhonemeTimeline {
    /// Create a timeline builder using the given converter
    pub fn new(g2p: Arc<dyn GraphemeToPhoneme>) -> Self {
        Self { g2p }
    }

    /// Build the phoneme timeline for an ordered list of words
    ///
    /// # Errors
    ///
    /// Rejects non-finite times, inverted spans and overlaps larger than
    /// [`OVERLAP_TOLERANCE_SECS`].
    pub fn build(&self, words: &[WordTiming]) -> Result<Vec<PhonemeEvent>, TimelineError> {
        let mut events = Vec::with_capacity(words.len() * 4);
        let mut cursor: Option<f64> = None;

        for (index, timing) in words.iter().enumerate() {
            if !timing.start.is_finite() || !timing.end.is_finite() {
                return Err(TimelineError::NonFinite {
                    index,
                    word: timing.word.clone(),
                });
            }
            if timing.end < timing.start {
                return Err(TimelineError::InvertedSpan {
                    index,
                    word: timing.word.clone(),
                    start: timing.start,
                    end: timing.end,
                });
            }

            let mut start = timing.start;
            if let Some(previous_end) = cursor {
                if start < previous_end - OVERLAP_TOLERANCE_SECS {
                    return Err(TimelineError::Overlap {
                        index,
                        word: timing.word.clone(),
                        start,
                        previous_end,
                    });
                }
                if start - previous_end > OVERLAP_TOLERANCE_SECS {
                    events.push(PhonemeEvent::silence(previous_end, start));
                } else {
                    start = previous_end;
                }
            }
            let end = timing.end.max(start);

            if end > start {
                self.split_word(&timing.word, start, end, &mut events);
            }
            cursor = Some(end);
        }

        tracing::trace!(
            g2p = self.g2p.name(),
            words = words.len(),
            phonemes = events.len(),
            "Built phoneme timeline"
        );
        Ok(events)
    }

    fn split_word(&self, word: &str, start: f64, end: f64, events: &mut Vec<PhonemeEvent>) {
        let phonemes = self.g2p.phonemes(word);
        if phonemes.is_empty() {
            events.push(PhonemeEvent::silence(start, end));
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let step = (end - start) / phonemes.len() as f64;
        let last = phonemes.len() - 1;
        for (i, phoneme) in phonemes.into_iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let event_start = start + step * i as f64;
            #[allow(clippy::cast_precision_loss)]
            let event_end = if i == last {
                end
            } else {
                start + step * (i + 1) as f64
            };
            events.push(PhonemeEvent {
                phoneme,
                start: event_start,
                end: event_end,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const EPSILON: f64 = 1e-9;

    fn assert_dense(events: &[PhonemeEvent], start: f64, end: f64) {
        assert!(!events.is_empty());
        assert!((events[0].start - start).abs() < EPSILON);
        assert!((events[events.len() - 1].end - end).abs() < EPSILON);
        for pair in events.windows(2) {
            assert!(
                (pair[0].end - pair[1].start).abs() < EPSILON,
                "gap or overlap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
        for event in events {
            assert!(event.duration() > 0.0);
        }
    }

    #[test]
    fn test_naive_g2p() {
        let g2p = NaiveG2p;
        assert_eq!(g2p.phonemes("Hi!"), vec!["h", "aa"]);
        assert_eq!(g2p.phonemes("map"), vec!["m", "aa", "p"]);
        assert!(g2p.phonemes("42?").is_empty());
    }

    #[test]
    fn test_lexicon_with_fallback() {
        let g2p = LexiconG2p::new(Arc::new(NaiveG2p)).with_entry("Hello", ["h", "eh", "l", "ow"]);
        assert_eq!(g2p.len(), 1);
        assert_eq!(g2p.phonemes("hello,"), vec!["h", "eh", "l", "ow"]);
        assert_eq!(g2p.phonemes("bat"), vec!["b", "aa", "t"]);
    }

    #[test]
    fn test_single_word_split_evenly() {
        let g2p = LexiconG2p::new(Arc::new(NaiveG2p)).with_entry("hi", ["h", "iy"]);
        let timeline = PhonemeTimeline::new(Arc::new(g2p));

        let events = timeline
            .build(&[WordTiming::new("hi", 0.0, 0.5)])
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phoneme, "h");
        assert_eq!(events[1].phoneme, "iy");
        assert!((events[0].duration() - 0.25).abs() < EPSILON);
        assert!((events[1].duration() - 0.25).abs() < EPSILON);
        assert_dense(&events, 0.0, 0.5);
    }

    #[test]
    fn test_gaps_filled_with_silence() {
        let timeline = PhonemeTimeline::default();
        let words = vec![
            WordTiming::new("ma", 0.2, 0.6),
            WordTiming::new("pa", 1.0, 1.3),
            WordTiming::new("ta", 1.3, 1.9),
        ];

        let events = timeline.build(&words).unwrap();

        assert_dense(&events, 0.2, 1.9);
        let gap = events
            .iter()
            .find(|e| (e.start - 0.6).abs() < EPSILON)
            .unwrap();
        assert!(gap.is_silence());
        assert!((gap.end - 1.0).abs() < EPSILON);
        // no silence between adjacent words
        assert_eq!(events.iter().filter(|e| e.is_silence()).count(), 1);
    }

    #[test]
    fn test_word_without_phonemes_is_silence() {
        let timeline = PhonemeTimeline::default();
        let events = timeline
            .build(&[WordTiming::new("...", 0.0, 0.3), WordTiming::new("a", 0.3, 0.4)])
            .unwrap();

        assert_eq!(events[0], PhonemeEvent::silence(0.0, 0.3));
        assert_eq!(events[1].phoneme, "aa");
        assert_dense(&events, 0.0, 0.4);
    }

    #[test]
    fn test_zero_length_word_is_skipped() {
        let timeline = PhonemeTimeline::default();
        let events = timeline
            .build(&[
                WordTiming::new("a", 0.0, 0.2),
                WordTiming::new("b", 0.2, 0.2),
                WordTiming::new("c", 0.2, 0.4),
            ])
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_dense(&events, 0.0, 0.4);
    }

    #[test]
    fn test_empty_input() {
        assert!(PhonemeTimeline::default().build(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_tiny_overlap_is_clamped() {
        let timeline = PhonemeTimeline::default();
        let events = timeline
            .build(&[
                WordTiming::new("a", 0.0, 0.3),
                WordTiming::new("b", 0.3 - 1e-9, 0.6),
            ])
            .unwrap();
        assert_dense(&events, 0.0, 0.6);
    }

    #[test]
    fn test_rejects_invalid_input() {
        let timeline = PhonemeTimeline::default();

        let overlap = timeline.build(&[WordTiming::new("a", 0.0, 0.5), WordTiming::new("b", 0.4, 0.8)]);
        assert!(matches!(overlap, Err(TimelineError::Overlap { index: 1, .. })));

        let inverted = timeline.build(&[WordTiming::new("a", 0.5, 0.1)]);
        assert!(matches!(inverted, Err(TimelineError::InvertedSpan { index: 0, .. })));

        let nan = timeline.build(&[WordTiming::new("a", f64::NAN, 0.1)]);
        assert!(matches!(nan, Err(TimelineError::NonFinite { index: 0, .. })));
    }

    #[test]
    fn test_dense_coverage_over_many_words() {
        let timeline = PhonemeTimeline::default();
        let mut words = Vec::new();
        let mut t = 0.0;
        for (i, word) in ["namaste", "aap", "kaise", "hain", "zzz", "ok"].iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let gap = if i % 2 == 0 { 0.0 } else { 0.07 * i as f64 };
            let start = t + gap;
            let end = start + 0.13 + 0.05 * word.len() as f64;
            words.push(WordTiming::new(*word, start, end));
            t = end;
        }

        let events = timeline.build(&words).unwrap();
        assert_dense(&events, words[0].start, t);
    }
}
