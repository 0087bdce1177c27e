//! Minimal WAV handling for 16-bit PCM
//!
//! Speech engines hand back either a RIFF/WAVE file or headerless PCM. Only
//! the pieces the pipeline needs live here: wrapping raw PCM in a header and
//! reading the length of a clip.

/// Size of a canonical PCM WAV header
pub const WAV_HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = 16;
const CHANNELS: u16 = 1;

/// Parsed `fmt ` chunk fields needed for timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WavInfo {
    /// Samples per second
    pub sample_rate: u32,
    /// Bytes per second of audio
    pub byte_rate: u32,
    /// Length of the `data` chunk in bytes
    pub data_len: u32,
}

impl WavInfo {
    /// Clip length in seconds
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        if self.byte_rate == 0 {
            return 0.0;
        }
        f64::from(self.data_len) / f64::from(self.byte_rate)
    }
}

/// Whether `bytes` starts with a RIFF/WAVE header
#[must_use]
pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Walk the RIFF chunks and pull out format and data sizes
#[must_use]
pub fn parse(bytes: &[u8]) -> Option<WavInfo> {
    if !is_wav(bytes) {
        return None;
    }

    let mut offset = 12;
    let mut format: Option<(u32, u32)> = None;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let len = read_u32(bytes, offset + 4)?;
        let body = offset + 8;

        if id == b"fmt " {
            let sample_rate = read_u32(bytes, body + 4)?;
            let byte_rate = read_u32(bytes, body + 8)?;
            format = Some((sample_rate, byte_rate));
        } else if id == b"data" {
            let (sample_rate, byte_rate) = format?;
            // streamed WAVs often carry a placeholder length
            let available = u32::try_from(bytes.len() - body).unwrap_or(u32::MAX);
            return Some(WavInfo {
                sample_rate,
                byte_rate,
                data_len: len.min(available),
            });
        }

        // chunks are word aligned
        let padded = usize::try_from(len).ok()?.checked_add(usize::try_from(len % 2).ok()?)?;
        offset = body.checked_add(padded)?;
    }
    None
}

/// Length of a clip in seconds
///
/// WAV input is timed from its header; anything else is treated as raw
/// 16-bit mono PCM at `sample_rate`.
#[must_use]
pub fn duration_secs(bytes: &[u8], sample_rate: u32) -> f64 {
    if let Some(info) = parse(bytes) {
        return info.duration_secs();
    }
    if sample_rate == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let len = bytes.len() as f64;
    len / (f64::from(sample_rate) * f64::from(BITS_PER_SAMPLE / 8))
}

/// Wrap raw 16-bit mono PCM in a canonical WAV header
#[must_use]
pub fn wrap_pcm(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let block_align = CHANNELS * (BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate * u32::from(block_align);
    let data_len = u32::try_from(pcm.len()).unwrap_or(u32::MAX);

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&data_len.saturating_add(36).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&CHANNELS.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

/// Return `audio` unchanged if it is already WAV, otherwise wrap it
#[must_use]
pub fn ensure_wav(audio: &[u8], sample_rate: u32) -> Vec<u8> {
    if is_wav(audio) {
        audio.to_vec()
    } else {
        wrap_pcm(audio, sample_rate)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let slice = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_and_parse() {
        let pcm = vec![0u8; 32_000];
        let wav = wrap_pcm(&pcm, 16_000);

        assert_eq!(wav.len(), WAV_HEADER_LEN + pcm.len());
        assert!(is_wav(&wav));

        let info = parse(&wav).unwrap();
        assert_eq!(info.sample_rate, 16_000);
        assert_eq!(info.byte_rate, 32_000);
        assert_eq!(info.data_len, 32_000);
        assert!((info.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_raw_pcm_duration() {
        let pcm = vec![0u8; 16_000];
        assert!((duration_secs(&pcm, 16_000) - 0.5).abs() < 1e-9);
        assert!(duration_secs(&pcm, 0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_placeholder_data_length_is_clamped() {
        let mut wav = wrap_pcm(&[0u8; 3_200], 16_000);
        wav[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
        let info = parse(&wav).unwrap();
        assert_eq!(info.data_len, 3_200);
        assert!((duration_secs(&wav, 16_000) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_ensure_wav_is_idempotent() {
        let wav = wrap_pcm(&[1, 2, 3, 4], 22_050);
        assert_eq!(ensure_wav(&wav, 16_000), wav);
        assert!(is_wav(&ensure_wav(&[1, 2, 3, 4], 16_000)));
    }

    #[test]
    fn test_truncated_header() {
        assert!(parse(b"RIFF").is_none());
        assert!(parse(b"RIFF\0\0\0\0WAVEfmt ").is_none());
    }
}
