//! Content sniffing, duration extraction and upload validation.
//!
//! Nothing here touches persistence or HTTP; the only side effect is
//! deleting temporary uploads through [`TempUpload`].

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::ffmpeg;
use crate::models::ContainerFormat;

/// Containers accepted for direct video uploads.
pub const UPLOAD_FORMATS: &[ContainerFormat] = &[
    ContainerFormat::Mp4,
    ContainerFormat::Mkv,
    ContainerFormat::Flv,
];

/// Containers accepted for recorded stream segments.
pub const STREAM_FORMATS: &[ContainerFormat] = &[
    ContainerFormat::Mp4,
    ContainerFormat::Webm,
    ContainerFormat::Mkv,
];

const SNIFF_LEN: usize = 4100;
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

// ISO BMFF brands that are still images, not video.
const IMAGE_BRANDS: &[&[u8; 4]] = &[b"avif", b"avis", b"heic", b"heix", b"mif1", b"msf1"];

/// Detect the container from the leading bytes of a file.
pub fn sniff_container(data: &[u8]) -> Option<ContainerFormat> {
    // FLV: "FLV" + version 1
    if data.len() >= 4 && &data[0..3] == b"FLV" && data[3] == 0x01 {
        return Some(ContainerFormat::Flv);
    }

    // MP4 family: size(4) + "ftyp" + major brand
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        let brand = &data[8..12];
        if IMAGE_BRANDS.iter().any(|b| &b[..] == brand) {
            return None;
        }
        return Some(ContainerFormat::Mp4);
    }

    // Matroska / WebM share the EBML header; the DocType tells them apart
    if data.len() >= 4 && data[0..4] == EBML_MAGIC {
        let header = &data[..data.len().min(SNIFF_LEN)];
        if contains(header, b"webm") {
            return Some(ContainerFormat::Webm);
        }
        if contains(header, b"matroska") {
            return Some(ContainerFormat::Mkv);
        }
    }

    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Reads container type and duration of a media file.
#[async_trait]
pub trait MediaInspector: Send + Sync {
    async fn detect_type(&self, path: &Path) -> anyhow::Result<Option<ContainerFormat>>;

    /// Play duration in (fractional) seconds.
    async fn extract_duration(&self, path: &Path) -> anyhow::Result<f64>;
}

/// Sniffs the file head itself and asks ffprobe for the duration.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfprobeInspector;

#[async_trait]
impl MediaInspector for FfprobeInspector {
    async fn detect_type(&self, path: &Path) -> anyhow::Result<Option<ContainerFormat>> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut head = vec![0u8; SNIFF_LEN];
        let mut filled = 0;
        while filled < head.len() {
            let n = file.read(&mut head[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        head.truncate(filled);
        Ok(sniff_container(&head))
    }

    async fn extract_duration(&self, path: &Path) -> anyhow::Result<f64> {
        ffmpeg::get_video_duration(path).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaInfo {
    pub container: ContainerFormat,
    pub duration_secs: u64,
}

/// Validate an uploaded file against `allowed` and an optional requested
/// thumbnail timestamp (seconds), which must fall strictly inside the video.
pub async fn validate_media(
    inspector: &dyn MediaInspector,
    path: &Path,
    allowed: &[ContainerFormat],
    thumbnail_timestamp: Option<u64>,
) -> Result<MediaInfo> {
    let container = inspector
        .detect_type(path)
        .await
        .map_err(AppError::Internal)?
        .filter(|c| allowed.contains(c))
        .ok_or_else(|| AppError::validation("invalid video"))?;

    let duration = inspector.extract_duration(path).await.map_err(|e| {
        warn!(path = %path.display(), "failed to read duration: {:#}", e);
        AppError::validation("invalid video")
    })?;
    if !duration.is_finite() || duration < 0.0 {
        return Err(AppError::validation("invalid video"));
    }
    let duration_secs = duration.trunc() as u64;

    if let Some(ts) = thumbnail_timestamp {
        if ts >= duration_secs {
            return Err(AppError::validation(
                "thumbnail_timestamp out of video duration",
            ));
        }
    }

    debug!(%container, duration_secs, "media validated");
    Ok(MediaInfo {
        container,
        duration_secs,
    })
}

/// Exclusive owner of a temporary upload. The file is removed by
/// [`TempUpload::release`] or, failing that, on drop.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
    released: bool,
}

impl TempUpload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(mut self) {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "released temp upload"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove temp upload: {}", e),
        }
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn mp4_header() -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x00, 0x20];
        v.extend_from_slice(b"ftypisom");
        v.extend_from_slice(&[0u8; 20]);
        v
    }

    fn ebml_header(doc_type: &[u8]) -> Vec<u8> {
        let mut v = EBML_MAGIC.to_vec();
        v.extend_from_slice(&[0x9F, 0x42, 0x86, 0x81, 0x01, 0x42, 0x82, 0x88]);
        v.extend_from_slice(doc_type);
        v
    }

    /// Inspector with canned answers.
    pub(crate) struct FixedInspector {
        pub container: Option<ContainerFormat>,
        pub duration: f64,
    }

    #[async_trait]
    impl MediaInspector for FixedInspector {
        async fn detect_type(&self, _path: &Path) -> anyhow::Result<Option<ContainerFormat>> {
            Ok(self.container)
        }

        async fn extract_duration(&self, _path: &Path) -> anyhow::Result<f64> {
            Ok(self.duration)
        }
    }

    #[test]
    fn test_sniff_known_containers() {
        assert_eq!(sniff_container(&mp4_header()), Some(ContainerFormat::Mp4));
        assert_eq!(
            sniff_container(&ebml_header(b"webm")),
            Some(ContainerFormat::Webm)
        );
        assert_eq!(
            sniff_container(&ebml_header(b"matroska")),
            Some(ContainerFormat::Mkv)
        );
        assert_eq!(
            sniff_container(b"FLV\x01\x05\x00\x00\x00\x09"),
            Some(ContainerFormat::Flv)
        );
    }

    #[test]
    fn test_sniff_rejects_non_video() {
        assert_eq!(sniff_container(&[0xFF, 0xD8, 0xFF, 0xE0]), None);
        assert_eq!(sniff_container(b"hello world, not a video"), None);
        assert_eq!(sniff_container(&[]), None);

        let mut avif = vec![0, 0, 0, 0x1C];
        avif.extend_from_slice(b"ftypavif");
        assert_eq!(sniff_container(&avif), None);
    }

    #[tokio::test]
    async fn test_ffprobe_inspector_sniffs_file_bytes_not_extension() {
        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(&ebml_header(b"webm")).unwrap();

        let detected = FfprobeInspector.detect_type(file.path()).await.unwrap();
        assert_eq!(detected, Some(ContainerFormat::Webm));
    }

    #[tokio::test]
    async fn test_validate_truncates_duration() {
        let inspector = FixedInspector {
            container: Some(ContainerFormat::Mp4),
            duration: 12.9,
        };
        let info = validate_media(&inspector, Path::new("x"), UPLOAD_FORMATS, None)
            .await
            .unwrap();
        assert_eq!(info.duration_secs, 12);
        assert_eq!(info.container, ContainerFormat::Mp4);
    }

    #[tokio::test]
    async fn test_validate_rejects_disallowed_container() {
        let inspector = FixedInspector {
            container: Some(ContainerFormat::Webm),
            duration: 10.0,
        };
        let err = validate_media(&inspector, Path::new("x"), UPLOAD_FORMATS, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m == "invalid video"));

        let ok = validate_media(&inspector, Path::new("x"), STREAM_FORMATS, None).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_validate_thumbnail_timestamp_bounds() {
        let inspector = FixedInspector {
            container: Some(ContainerFormat::Mkv),
            duration: 30.4,
        };
        assert!(validate_media(&inspector, Path::new("x"), UPLOAD_FORMATS, Some(29))
            .await
            .is_ok());

        let err = validate_media(&inspector, Path::new("x"), UPLOAD_FORMATS, Some(30))
            .await
            .unwrap_err();
        assert!(
            matches!(err, AppError::Validation(ref m) if m.contains("thumbnail_timestamp"))
        );
    }

    #[tokio::test]
    async fn test_temp_upload_release_and_drop() {
        let dir = tempfile::tempdir().unwrap();

        let released = dir.path().join("a.bin");
        std::fs::write(&released, b"x").unwrap();
        TempUpload::new(&released).release().await;
        assert!(!released.exists());

        let dropped = dir.path().join("b.bin");
        std::fs::write(&dropped, b"x").unwrap();
        drop(TempUpload::new(&dropped));
        assert!(!dropped.exists());

        // already gone is fine
        TempUpload::new(dir.path().join("missing")).release().await;
    }
}
