//! Synthesis Cache
//!
//! [`CachedTts`] wraps any [`TtsEngine`] with an on-disk cache keyed by the
//! SHA-256 of `"{text}_{voice}"`. Each entry is two files:
//!
//! ```text
//! {dir}/{key}.wav    the audio
//! {dir}/{key}.json   timings, duration, sample rate, CRC32 of the audio, creation time
//! ```
//!
//! Entries past their TTL, or whose audio no longer matches the stored
//! CRC32, count as misses and are rewritten by the next synthesis.
//!
//! Concurrent requests for the same key share one synthesis task. Every
//! waiter gets the same result, including failures; failures are never
//! written to disk. The shared task runs to completion even if every waiter
//! goes away, so its result still lands in the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::animation::WordTiming;
use crate::backend::{BackendError, Synthesis, TtsEngine};

/// Synthesis cache settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether caching (and coalescing) is on
    pub enabled: bool,
    /// Cache directory
    pub dir: PathBuf,
    /// Entry lifetime
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("cache/tts"),
            ttl: Duration::from_secs(3600),
        }
    }
}

/// A cache entry could not be read or written
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Entry metadata is unreadable or does not match the audio
    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt {
        /// Cache key
        key: String,
        /// What was wrong
        reason: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    word_timings: Vec<WordTiming>,
    duration_secs: f64,
    sample_rate: u32,
    crc32: u32,
    created_at: DateTime<Utc>,
}

type SharedSynthesis = Shared<BoxFuture<'static, Result<Synthesis, BackendError>>>;

/// Cache key for `text` spoken with `voice`
#[must_use]
pub fn cache_key(text: &str, voice: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b"_");
    hasher.update(voice.as_bytes());
    hex::encode(hasher.finalize())
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn entry_paths(dir: &Path, key: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{key}.wav")),
        dir.join(format!("{key}.json")),
    )
}

/// Read a valid entry; `Ok(None)` for a missing or expired one
async fn read_entry(dir: &Path, key: &str, ttl: Duration) -> Result<Option<Synthesis>, CacheError> {
    let (wav_path, meta_path) = entry_paths(dir, key);

    let meta_bytes = match tokio::fs::read(&meta_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(&meta_path)(e)),
    };
    let meta: EntryMeta = serde_json::from_slice(&meta_bytes).map_err(|e| CacheError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;

    let age = (Utc::now() - meta.created_at).to_std().unwrap_or_default();
    if age > ttl {
        tracing::debug!(key, age_secs = age.as_secs(), "Cache entry expired");
        return Ok(None);
    }

    let audio = match tokio::fs::read(&wav_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CacheError::Corrupt {
                key: key.to_string(),
                reason: "audio file missing".into(),
            })
        }
        Err(e) => return Err(io_error(&wav_path)(e)),
    };

    let crc = crc32fast::hash(&audio);
    if crc != meta.crc32 {
        return Err(CacheError::Corrupt {
            key: key.to_string(),
            reason: format!("checksum {crc:08x} != {:08x}", meta.crc32),
        });
    }

    Ok(Some(Synthesis {
        audio: Arc::from(audio),
        word_timings: meta.word_timings,
        duration_secs: meta.duration_secs,
        sample_rate: meta.sample_rate,
    }))
}

/// Write an entry; audio first so metadata never points at missing audio
async fn write_entry(dir: &Path, key: &str, synthesis: &Synthesis) -> Result<(), CacheError> {
    tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;
    let (wav_path, meta_path) = entry_paths(dir, key);

    let meta = EntryMeta {
        word_timings: synthesis.word_timings.clone(),
        duration_secs: synthesis.duration_secs,
        sample_rate: synthesis.sample_rate,
        crc32: crc32fast::hash(&synthesis.audio),
        created_at: Utc::now(),
    };
    let meta_json = serde_json::to_vec(&meta).map_err(|e| CacheError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;

    write_atomic(&wav_path, &synthesis.audio).await?;
    write_atomic(&meta_path, &meta_json).await
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await.map_err(io_error(&tmp))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error(path)(e));
    }
    Ok(())
}

/// Removes an in-flight entry when its task ends, however it ends
struct InFlightGuard {
    registry: Arc<Mutex<HashMap<String, SharedSynthesis>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// A [`TtsEngine`] with an on-disk cache and in-flight coalescing
pub struct CachedTts<T> {
    inner: Arc<T>,
    config: CacheConfig,
    in_flight: Arc<Mutex<HashMap<String, SharedSynthesis>>>,
}

impl<T> CachedTts<T>
where
    T: TtsEngine + 'static,
{
    /// Wrap `inner`
    pub fn new(inner: T, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cache settings
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of syntheses currently running
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn start_or_join(&self, key: &str, text: &str) -> SharedSynthesis {
        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(key) {
            tracing::debug!(key, "Joining in-flight synthesis");
            return existing.clone();
        }

        let inner = Arc::clone(&self.inner);
        let guard = InFlightGuard {
            registry: Arc::clone(&self.in_flight),
            key: key.to_string(),
        };
        let dir = self.config.dir.clone();
        let ttl = self.config.ttl;
        let owned_text = text.to_string();

        // The guard cannot remove the entry before the insert below because
        // we still hold the lock.
        let task = tokio::spawn(async move {
            let key = guard.key.as_str();

            // a task that finished just before this one started has written
            // the entry already
            if let Ok(Some(hit)) = read_entry(&dir, key, ttl).await {
                tracing::debug!(key, "Synthesis cached while waiting");
                return Ok(hit);
            }

            let result = inner.synthesize(&owned_text).await;
            if let Ok(ref synthesis) = result {
                match write_entry(&dir, key, synthesis).await {
                    Ok(()) => tracing::debug!(key, "Cached synthesis"),
                    Err(e) => tracing::warn!(key, error = %e, "Failed to cache synthesis"),
                }
            }
            result
        });

        let shared = async move {
            task.await.unwrap_or_else(|e| {
                Err(BackendError::InvalidOutput(format!("synthesis task failed: {e}")))
            })
        }
        .boxed()
        .shared();

        in_flight.insert(key.to_string(), shared.clone());
        shared
    }
}

#[async_trait]
impl<T> TtsEngine for CachedTts<T>
where
    T: TtsEngine + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn voice(&self) -> &str {
        self.inner.voice()
    }

    async fn synthesize(&self, text: &str) -> Result<Synthesis, BackendError> {
        if !self.config.enabled {
            return self.inner.synthesize(text).await;
        }

        let key = cache_key(text, self.inner.voice());
        match read_entry(&self.config.dir, &key, self.config.ttl).await {
            Ok(Some(hit)) => {
                tracing::debug!(key = %key, "Synthesis cache hit");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Ignoring unusable cache entry"),
        }

        self.start_or_join(&key, text).await
    }
}
