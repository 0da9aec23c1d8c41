use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FfmpegConfig;
use crate::pipeline::{MediaProcessor, ProcessedMedia};

/// Get video duration using ffprobe
pub async fn get_video_duration<P: AsRef<Path>>(file_path: P) -> Result<f64> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(file_path.as_ref())
        .output()
        .await
        .context("Failed to execute ffprobe")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffprobe failed: {}", stderr);
    }

    let duration_str = String::from_utf8_lossy(&output.stdout);
    let duration = duration_str
        .trim()
        .parse::<f64>()
        .context("Failed to parse duration")?;

    Ok(duration)
}

/// Transcode to a web-friendly H.264 mp4
pub async fn transcode(
    input_path: &Path,
    output_path: &Path,
    config: &FfmpegConfig,
) -> Result<()> {
    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(input_path)
        .arg("-c:v")
        .arg("libx264")
        .arg("-preset")
        .arg(&config.preset)
        .arg("-crf")
        .arg(config.crf.to_string())
        .arg("-pix_fmt")
        .arg(&config.pixel_format)
        .arg("-c:a")
        .arg(&config.audio_codec)
        .arg("-movflags")
        .arg("+faststart")
        .arg("-threads")
        .arg(config.effective_threads().to_string())
        .arg("-y") // Overwrite output file
        .arg(output_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to execute ffmpeg")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffmpeg transcode failed: {}", stderr);
    }

    Ok(())
}

/// Grab a single frame at `at_secs` as a jpeg, scaled to `width`
pub async fn extract_thumbnail(
    input_path: &Path,
    output_path: &Path,
    at_secs: f64,
    width: u32,
) -> Result<()> {
    let output = Command::new("ffmpeg")
        .arg("-ss")
        .arg(format!("{:.3}", at_secs))
        .arg("-i")
        .arg(input_path)
        .arg("-frames:v")
        .arg("1")
        .arg("-vf")
        .arg(format!("scale={}:-2", width))
        .arg("-q:v")
        .arg("3")
        .arg("-y")
        .arg(output_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to execute ffmpeg")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffmpeg thumbnail failed: {}", stderr);
    }

    Ok(())
}

/// Check if ffmpeg is available
pub async fn check_ffmpeg_available() -> Result<String> {
    let output = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await
        .context("Failed to execute ffmpeg")?;

    if !output.status.success() {
        anyhow::bail!("ffmpeg not available");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    Ok(version.lines().next().unwrap_or("unknown").to_string())
}

/// How often a queued source file is touched while it waits for a slot.
/// The upload sweeper never uses a max age below twice this.
pub const QUEUE_KEEPALIVE: Duration = Duration::from_secs(60);

/// Bump the modification time so the upload sweeper sees the file as fresh.
async fn touch(path: &Path) {
    let path = path.to_path_buf();
    let touched = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::now())
    })
    .await;
    match touched {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failed to touch queued source: {}", e),
        Err(e) => warn!("touch task failed: {}", e),
    }
}

/// Caps how many ffmpeg jobs run at once. Waiting jobs keep their source
/// file fresh so the sweeper leaves it alone.
pub struct TranscodeQueue {
    permits: Semaphore,
    keepalive: Duration,
}

impl TranscodeQueue {
    pub fn new(slots: usize) -> Self {
        Self::with_keepalive(slots, QUEUE_KEEPALIVE)
    }

    pub fn with_keepalive(slots: usize, keepalive: Duration) -> Self {
        Self {
            permits: Semaphore::new(slots.max(1)),
            keepalive,
        }
    }

    /// Wait for a free slot, in arrival order.
    pub async fn admit(&self, source: &Path) -> Result<SemaphorePermit<'_>> {
        let acquire = self.permits.acquire();
        tokio::pin!(acquire);

        let mut keepalive = tokio::time::interval(self.keepalive);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;

        let permit = loop {
            tokio::select! {
                permit = &mut acquire => break permit.context("transcode queue closed")?,
                _ = keepalive.tick() => {
                    debug!(source = %source.display(), "waiting for a transcode slot");
                    touch(source).await;
                }
            }
        };
        touch(source).await;
        Ok(permit)
    }
}

/// Transcodes into `<output_dir>/videos` and writes thumbnails into
/// `<output_dir>/thumbnails`, both served under `/media`.
pub struct FfmpegProcessor {
    output_dir: PathBuf,
    config: FfmpegConfig,
    queue: TranscodeQueue,
}

impl FfmpegProcessor {
    pub fn new(output_dir: impl Into<PathBuf>, config: FfmpegConfig) -> Self {
        let queue = TranscodeQueue::new(config.effective_transcodes());
        Self {
            output_dir: output_dir.into(),
            config,
            queue,
        }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.output_dir.join("videos")).await?;
        tokio::fs::create_dir_all(self.output_dir.join("thumbnails")).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn process_video(&self, source: &Path, thumbnail_at: f64) -> Result<ProcessedMedia> {
        let _permit = self.queue.admit(source).await?;

        let name = Uuid::new_v4().simple().to_string();
        let video_file = self.output_dir.join("videos").join(format!("{}.mp4", name));
        let thumb_file = self
            .output_dir
            .join("thumbnails")
            .join(format!("{}.jpg", name));

        debug!(source = %source.display(), thumbnail_at, "transcoding");
        transcode(source, &video_file, &self.config).await?;

        // A long transcode can outlast the sweeper's max age.
        touch(source).await;
        if let Err(e) =
            extract_thumbnail(source, &thumb_file, thumbnail_at, self.config.thumbnail_width).await
        {
            let _ = tokio::fs::remove_file(&video_file).await;
            return Err(e);
        }

        info!(video = %video_file.display(), "transcode finished");
        Ok(ProcessedMedia {
            video_path: format!("/media/videos/{}.mp4", name),
            thumbnail_path: format!("/media/thumbnails/{}.jpg", name),
        })
    }
}
