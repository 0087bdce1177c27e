//! Video rendering through an external encoder
//!
//! The pose track and audio are staged in temporary files and handed to an
//! encoder program:
//!
//! ```text
//! <program> <args...> --avatar <id> --poses <poses.json> --audio <audio.wav>
//!                     --fps <n> --output <output_dir>/<uuid>.mp4
//! ```
//!
//! Staged inputs are removed when the call returns, fails, times out or is
//! dropped. A partially written output is removed unless encoding succeeded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tempfile::NamedTempFile;

use super::subprocess::{run_program, CommandSpec};
use super::traits::{BackendError, RenderRequest, RenderedVideo, Renderer};
use crate::animation::PoseFrame;

#[derive(Serialize)]
struct PoseTrack<'a> {
    avatar_id: &'a str,
    fps: u32,
    frames: &'a [PoseFrame],
}

/// Removes the output file on drop unless the encode succeeded
struct PartialOutput {
    path: PathBuf,
    keep: bool,
}

impl PartialOutput {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }

    async fn discard(mut self) {
        self.keep = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed partial render output"),
            Err(e) => log_remove_error(&self.path, &e),
        }
    }
}

fn log_remove_error(path: &Path, e: &std::io::Error) {
    if e.kind() != std::io::ErrorKind::NotFound {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial render output");
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed abandoned render output"),
        Err(e) => log_remove_error(path, &e),
    }
}

// Only reached when the render future is dropped mid-encode
impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || remove_partial(&path));
            }
            Err(_) => remove_partial(&path),
        }
    }
}

async fn encode(
    spec: &CommandSpec,
    args: &[String],
    timeout: Duration,
    output: &Path,
) -> Result<(), BackendError> {
    run_program(spec, args, Vec::new(), timeout, "render").await?;

    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(BackendError::InvalidOutput(format!(
            "encoder produced no output at {}",
            output.display()
        ))),
    }
}

/// Renders pose tracks with an external encoder program
#[derive(Clone, Debug)]
pub struct CommandRenderer {
    spec: CommandSpec,
    output_dir: PathBuf,
    timeout: Duration,
}

impl CommandRenderer {
    /// Create a renderer writing videos into `output_dir`
    pub fn new(spec: CommandSpec, output_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            spec,
            output_dir: output_dir.into(),
            timeout,
        }
    }

    /// Directory videos are written to
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn stage(suffix: &str, bytes: Vec<u8>) -> Result<NamedTempFile, BackendError> {
        let file = tempfile::Builder::new()
            .prefix("avatar-render-")
            .suffix(suffix)
            .tempfile()?;
        tokio::fs::write(file.path(), bytes).await?;
        Ok(file)
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    fn name(&self) -> &str {
        "command-renderer"
    }

    async fn render(&self, request: RenderRequest) -> Result<RenderedVideo, BackendError> {
        request.validate()?;

        let track = PoseTrack {
            avatar_id: &request.avatar_id,
            fps: request.fps,
            frames: &request.frames,
        };
        let poses_json =
            serde_json::to_vec(&track).map_err(|e| BackendError::InvalidInput(e.to_string()))?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let poses = Self::stage(".json", poses_json).await?;
        let audio = Self::stage(".wav", request.audio.to_vec()).await?;

        let output = PartialOutput::new(
            self.output_dir
                .join(format!("{}.mp4", uuid::Uuid::new_v4())),
        );

        let args = vec![
            "--avatar".to_string(),
            request.avatar_id.clone(),
            "--poses".to_string(),
            poses.path().display().to_string(),
            "--audio".to_string(),
            audio.path().display().to_string(),
            "--fps".to_string(),
            request.fps.to_string(),
            "--output".to_string(),
            output.path.display().to_string(),
        ];

        if let Err(e) = encode(&self.spec, &args, self.timeout, &output.path).await {
            output.discard().await;
            return Err(e);
        }

        let frame_count = request.frames.len();
        let path = output.keep();
        tracing::info!(
            path = %path.display(),
            avatar_id = %request.avatar_id,
            frames = frame_count,
            "Rendered video"
        );

        // staged inputs are deleted here as `poses` and `audio` drop
        Ok(RenderedVideo { path, frame_count })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::animation::{PoseVector, VisemeCategory};
    use std::sync::Arc;

    const ARG_LOOP: &str = r#"while [ $# -gt 0 ]; do case "$1" in --poses) poses="$2";; --output) out="$2";; esac; shift; done;"#;

    fn renderer(script: &str, dir: &Path) -> CommandRenderer {
        let spec = CommandSpec::new("sh").with_args(["-c", &format!("{ARG_LOOP} {script}"), "render"]);
        CommandRenderer::new(spec, dir, Duration::from_secs(5))
    }

    fn request(pose: PoseVector) -> RenderRequest {
        RenderRequest {
            avatar_id: "professional/model_v1".into(),
            frames: vec![PoseFrame {
                index: 0,
                timestamp: 0.0,
                category: VisemeCategory::Aa,
                weight: 1.0,
                pose,
            }],
            fps: 30,
            audio: Arc::from(vec![0u8; 64]),
        }
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(Iterator::count).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_render_success_cleans_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(r#"printf '%s' "$poses" > "$out""#, dir.path());

        let video = renderer
            .render(request(VisemeCategory::Aa.pose()))
            .await
            .unwrap();

        assert_eq!(video.frame_count, 1);
        assert_eq!(video.path.extension().unwrap(), "mp4");
        assert!(video.path.starts_with(dir.path()));

        let staged_poses = std::fs::read_to_string(&video.path).unwrap();
        assert!(!staged_poses.is_empty());
        assert!(!Path::new(&staged_poses).exists());
    }

    #[tokio::test]
    async fn test_failed_encode_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(r#"printf partial > "$out"; exit 1"#, dir.path());

        let err = renderer
            .render(request(VisemeCategory::Aa.pose()))
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::ProcessFailed { .. }));
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_empty_output_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer("true", dir.path());

        let err = renderer
            .render(request(VisemeCategory::Aa.pose()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidOutput(_)));
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_pose_never_reaches_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(r#"printf video > "$out""#, dir.path());

        let mut pose = VisemeCategory::Aa.pose();
        pose.jaw_open = f32::NAN;

        let err = renderer.render(request(pose)).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_abandoned_render_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(r#"printf partial > "$out"; sleep 10"#, dir.path());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            renderer.render(request(VisemeCategory::Aa.pose())),
        )
        .await;
        assert!(abandoned.is_err());

        // removal runs on the blocking pool
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while entries(dir.path()) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(entries(dir.path()), 0);
    }
}
