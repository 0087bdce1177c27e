//! Command-line speech engines
//!
//! [`CommandStt`] and [`CommandTts`] drive local speech programs
//! (whisper.cpp and piper style) over stdin/stdout. Children are killed when
//! the future driving them is dropped, so a cancelled or timed-out pipeline
//! never leaves an engine running.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::traits::{BackendError, Synthesis, SttEngine, TtsEngine};
use super::wav;
use crate::animation::WordTiming;

/// Maximum audio input size for recognition (10 MiB)
pub const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Maximum text input size for synthesis (64 KiB)
pub const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

const MAX_STDERR_CHARS: usize = 512;

/// A program and its fixed arguments
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable path or name on `PATH`
    pub program: PathBuf,
    /// Arguments passed before any per-call arguments
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Create a spec with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append fixed arguments
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn display(&self) -> String {
        self.program.display().to_string()
    }
}

/// Run a program to completion, feeding `input` on stdin
///
/// Returns stdout on a zero exit status.
pub(crate) async fn run_program(
    spec: &CommandSpec,
    extra_args: &[String],
    input: Vec<u8>,
    timeout: Duration,
    operation: &'static str,
) -> Result<Vec<u8>, BackendError> {
    let program = spec.display();
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .args(extra_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| BackendError::Spawn {
        program: program.clone(),
        message: e.to_string(),
    })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BackendError::Io(format!("failed to open stdin of `{program}`")))?;

    // Write from a separate task so a full stdout pipe cannot deadlock us
    let write_task = tokio::spawn(async move {
        stdin.write_all(&input).await?;
        stdin.shutdown().await
    });

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| BackendError::Timeout { operation, timeout })??;

    match write_task.await {
        Ok(Ok(())) => {}
        // the program may legitimately stop reading early
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
        Ok(Err(e)) => return Err(BackendError::Io(format!("writing to `{program}`: {e}"))),
        Err(e) => return Err(BackendError::Io(format!("stdin task failed: {e}"))),
    }

    if !output.status.success() {
        let stderr: String = String::from_utf8_lossy(&output.stderr)
            .trim()
            .chars()
            .take(MAX_STDERR_CHARS)
            .collect();
        return Err(BackendError::ProcessFailed {
            program,
            status: output.status.to_string(),
            stderr,
        });
    }

    Ok(output.stdout)
}

/// Speech recognition through an external program
///
/// The audio is passed as WAV on stdin (raw PCM is wrapped first) and the
/// transcript is read from stdout. Bracketed segment timestamps such as
/// `[00:00.000 --> 00:01.000]` are stripped.
#[derive(Clone, Debug)]
pub struct CommandStt {
    spec: CommandSpec,
    sample_rate: u32,
    timeout: Duration,
}

impl CommandStt {
    /// Create a recognizer
    #[must_use]
    pub fn new(spec: CommandSpec, sample_rate: u32, timeout: Duration) -> Self {
        Self {
            spec,
            sample_rate,
            timeout,
        }
    }
}

#[async_trait]
impl SttEngine for CommandStt {
    fn name(&self) -> &str {
        "command-stt"
    }

    async fn recognize(&self, audio: &[u8]) -> Result<Option<String>, BackendError> {
        if audio.len() > MAX_STT_INPUT_BYTES {
            return Err(BackendError::InputTooLarge {
                size: audio.len(),
                limit: MAX_STT_INPUT_BYTES,
            });
        }
        if audio.is_empty() {
            return Ok(None);
        }

        let input = wav::ensure_wav(audio, self.sample_rate);
        let stdout = run_program(&self.spec, &[], input, self.timeout, "recognition").await?;
        let transcript = clean_transcript(&String::from_utf8_lossy(&stdout));

        tracing::debug!(
            engine = self.name(),
            bytes = audio.len(),
            chars = transcript.len(),
            "Recognition finished"
        );
        Ok((!transcript.is_empty()).then_some(transcript))
    }
}

fn clean_transcript(raw: &str) -> String {
    raw.lines()
        .map(|line| {
            let line = line.trim();
            match (line.starts_with('['), line.find(']')) {
                (true, Some(end)) => line[end + 1..].trim(),
                _ => line,
            }
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Speech synthesis through an external program
///
/// The text goes in on stdin with `--voice <voice>` appended to the
/// arguments; WAV or raw 16-bit PCM is read from stdout. Word timings are
/// approximated by spreading the clip evenly over the words.
#[derive(Clone, Debug)]
pub struct CommandTts {
    spec: CommandSpec,
    voice: String,
    sample_rate: u32,
    timeout: Duration,
}

impl CommandTts {
    /// Create a synthesizer
    pub fn new(
        spec: CommandSpec,
        voice: impl Into<String>,
        sample_rate: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            spec,
            voice: voice.into(),
            sample_rate,
            timeout,
        }
    }
}

#[async_trait]
impl TtsEngine for CommandTts {
    fn name(&self) -> &str {
        "command-tts"
    }

    fn voice(&self) -> &str {
        &self.voice
    }

    async fn synthesize(&self, text: &str) -> Result<Synthesis, BackendError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(BackendError::InputTooLarge {
                size: text.len(),
                limit: MAX_TTS_INPUT_BYTES,
            });
        }
        if text.trim().is_empty() {
            return Err(BackendError::InvalidInput("nothing to synthesize".into()));
        }

        let args = ["--voice".to_string(), self.voice.clone()];
        let stdout = run_program(
            &self.spec,
            &args,
            text.as_bytes().to_vec(),
            self.timeout,
            "synthesis",
        )
        .await?;
        if stdout.is_empty() {
            return Err(BackendError::InvalidOutput(format!(
                "`{}` produced no audio",
                self.spec.display()
            )));
        }

        let sample_rate = wav::parse(&stdout).map_or(self.sample_rate, |info| info.sample_rate);
        let audio = wav::ensure_wav(&stdout, sample_rate);
        let duration_secs = wav::duration_secs(&audio, sample_rate);

        Ok(Synthesis {
            audio: Arc::from(audio),
            word_timings: even_word_timings(text, duration_secs),
            duration_secs,
            sample_rate,
        })
    }
}

/// Spread `duration_secs` evenly over the whitespace-separated words
#[must_use]
pub fn even_word_timings(text: &str, duration_secs: f64) -> Vec<WordTiming> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Vec::new();
    }

    #[allow(clippy::cast_precision_loss)]
    let step = duration_secs / words.len() as f64;
    #[allow(clippy::cast_precision_loss)]
    let at = |k: usize| step * k as f64;
    let last = words.len() - 1;
    words
        .into_iter()
        .enumerate()
        .map(|(i, word)| {
            let end = if i == last { duration_secs } else { at(i + 1) };
            WordTiming::new(word, at(i), end)
        })
        .collect()
}
