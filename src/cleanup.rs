use crate::config::Config;
use crate::ffmpeg::QUEUE_KEEPALIVE;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub bytes_freed: u64,
}

/// Remove temp uploads in `dir` last modified more than `max_age` before
/// `now`. Only regular files are touched; a missing directory is empty.
pub async fn sweep_stale_uploads(
    dir: &Path,
    max_age: Duration,
    now: SystemTime,
) -> anyhow::Result<SweepReport> {
    let mut report = SweepReport::default();
    if !dir.exists() {
        return Ok(report);
    }

    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();

        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), "failed to stat upload: {}", e);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let modified = match metadata.modified() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), "no modification time: {}", e);
                continue;
            }
        };
        // mtime in the future: leave it for a later sweep
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age <= max_age {
            continue;
        }

        match fs::remove_file(&path).await {
            Ok(()) => {
                report.removed += 1;
                report.bytes_freed += metadata.len();
                debug!(
                    path = %path.display(),
                    age_min = age.as_secs_f64() / 60.0,
                    "removed stale upload"
                );
            }
            Err(e) => error!(path = %path.display(), "failed to remove stale upload: {}", e),
        }
    }

    Ok(report)
}

/// Queued transcodes refresh their source every [`QUEUE_KEEPALIVE`]; a
/// shorter max age could delete a file that is still waiting for a slot.
pub fn effective_max_age(configured_secs: u64) -> Duration {
    Duration::from_secs(configured_secs).max(QUEUE_KEEPALIVE * 2)
}

/// Periodically sweep the upload directory for files orphaned by a crash
/// between receipt and release.
pub fn start_cleanup_task(config: Arc<Config>) -> tokio::task::JoinHandle<()> {
    let max_age = effective_max_age(config.limits.cleanup_max_age_seconds);
    let every = Duration::from_secs(config.limits.cleanup_interval_seconds.max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_min = every.as_secs_f64() / 60.0,
            max_age_min = max_age.as_secs_f64() / 60.0,
            "starting upload sweeper"
        );

        loop {
            interval.tick().await;

            match sweep_stale_uploads(&config.upload_dir, max_age, SystemTime::now()).await {
                Ok(report) if report.removed > 0 => info!(
                    removed = report.removed,
                    freed_mb = report.bytes_freed as f64 / 1024.0 / 1024.0,
                    "upload sweep complete"
                ),
                Ok(_) => {}
                Err(e) => error!("upload sweep failed: {}", e),
            }
        }
    })
}
