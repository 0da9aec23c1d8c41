//! Live stream sessions: key-authenticated `Off`/`Live` toggling and
//! recorded-segment upload into the [`UploadPipeline`].

use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, Result};
use crate::media::{TempUpload, STREAM_FORMATS};
use crate::models::{Privacy, StreamSession, StreamView};
use crate::pipeline::{Acknowledgement, UploadPipeline, UploadRequest};
use crate::store::StreamStore;

const NOT_FOUND: &str = "stream not found";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Live,
    Off,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

fn key_matches(presented: &str, stored: &str) -> bool {
    constant_time_eq(presented.as_bytes(), stored.as_bytes())
}

impl StreamSession {
    pub fn status(&self) -> StreamStatus {
        if self.is_streaming {
            StreamStatus::Live
        } else {
            StreamStatus::Off
        }
    }

    /// Move to `target`. The session is left untouched on any error.
    pub fn transition(
        &mut self,
        presented_key: &str,
        target: StreamStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !key_matches(presented_key, &self.stream_key) {
            return Err(AppError::unauthorized("stream_key not match"));
        }

        match (self.status(), target) {
            (StreamStatus::Off, StreamStatus::Live) => {
                self.is_streaming = true;
            }
            (StreamStatus::Live, StreamStatus::Off) => {
                self.is_streaming = false;
                self.last_ended_at = Some(now);
            }
            (StreamStatus::Live, StreamStatus::Live) => {
                return Err(AppError::conflict("stream has been started"));
            }
            (StreamStatus::Off, StreamStatus::Off) => {
                return Err(AppError::conflict("stream has been ended"));
            }
        }
        Ok(())
    }
}

pub struct StreamService {
    store: Arc<dyn StreamStore>,
    pipeline: Arc<UploadPipeline>,
    clock: Arc<dyn Clock>,
}

impl StreamService {
    pub fn new(store: Arc<dyn StreamStore>, pipeline: Arc<UploadPipeline>) -> Self {
        Self {
            store,
            pipeline,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn list_live(&self, offset: usize, limit: usize) -> Result<Vec<StreamView>> {
        let sessions = self.store.list_live(offset, limit).await?;
        Ok(sessions.iter().map(StreamView::from).collect())
    }

    pub async fn get(&self, id: &str) -> Result<StreamView> {
        self.store
            .find(id)
            .await?
            .map(|s| StreamView::from(&s))
            .ok_or_else(|| AppError::not_found(NOT_FOUND))
    }

    pub async fn update_status(
        &self,
        id: &str,
        stream_key: &str,
        status: StreamStatus,
    ) -> Result<StreamView> {
        let mut session = self
            .store
            .find(id)
            .await?
            .ok_or_else(|| AppError::not_found(NOT_FOUND))?;

        session.transition(stream_key, status, self.clock.now())?;
        self.store.save(&session).await?;

        info!(stream_id = id, ?status, "stream status changed");
        Ok(StreamView::from(&session))
    }

    /// Hand a recorded segment to the upload pipeline on behalf of the
    /// session owner. A wrong key reads exactly like an unknown stream.
    pub async fn upload_recording(
        &self,
        id: &str,
        stream_key: &str,
        file: TempUpload,
    ) -> Result<Acknowledgement> {
        let session = match self.store.find(id).await? {
            Some(s) => s,
            None => {
                file.release().await;
                return Err(AppError::not_found(NOT_FOUND));
            }
        };
        if !key_matches(stream_key, &session.stream_key) {
            file.release().await;
            return Err(AppError::unauthorized(NOT_FOUND));
        }

        let request = UploadRequest {
            file,
            title: self.clock.now().format("%Y-%m-%d %H:%M:%S").to_string(),
            description: None,
            categories: Vec::new(),
            owner_id: session.owner_id,
            privacy: Privacy::Private,
            thumbnail_timestamp: None,
            allowed: STREAM_FORMATS,
        };
        self.pipeline.accept(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TokioSpawner;
    use crate::media::tests::FixedInspector;
    use crate::models::ContainerFormat;
    use crate::pipeline::tests::{
        temp_upload, wait_for, EventLog, FakeProcessor, RecordingObserver,
    };
    use crate::store::{AssetStore, MemoryStore};
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn session(is_streaming: bool) -> StreamSession {
        StreamSession {
            id: "st12345678".to_string(),
            stream_key: "k".repeat(32),
            name: "evening show".to_string(),
            is_streaming,
            last_ended_at: None,
            owner_id: 9,
        }
    }

    #[test]
    fn test_start_then_conflict() {
        let mut s = session(false);
        let key = s.stream_key.clone();

        s.transition(&key, StreamStatus::Live, fixed_now()).unwrap();
        assert_eq!(s.status(), StreamStatus::Live);

        let err = s
            .transition(&key, StreamStatus::Live, fixed_now())
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "stream has been started"));
        assert!(s.is_streaming);
    }

    #[test]
    fn test_stop_stamps_end_time() {
        let mut s = session(true);
        let key = s.stream_key.clone();

        s.transition(&key, StreamStatus::Off, fixed_now()).unwrap();
        assert!(!s.is_streaming);
        assert_eq!(s.last_ended_at, Some(fixed_now()));

        let err = s.transition(&key, StreamStatus::Off, fixed_now()).unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "stream has been ended"));
    }

    #[test]
    fn test_wrong_key_leaves_state_unchanged() {
        let mut s = session(true);
        let err = s
            .transition("wrong", StreamStatus::Off, fixed_now())
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert!(s.is_streaming);
        assert_eq!(s.last_ended_at, None);
    }

    struct Fixture {
        service: StreamService,
        store: Arc<MemoryStore>,
        assets: Arc<MemoryStore>,
        log: EventLog,
    }

    async fn fixture(container: ContainerFormat) -> Fixture {
        let log: EventLog = Arc::default();
        let store = Arc::new(MemoryStore::new());
        store.insert_stream(session(false)).await;
        let assets = Arc::new(MemoryStore::new());

        let pipeline = UploadPipeline::new(
            Arc::new(FixedInspector {
                container: Some(container),
                duration: 90.0,
            }),
            Arc::new(FakeProcessor::new(false, log.clone())),
            assets.clone(),
            Arc::new(TokioSpawner),
        )
        .with_observer(Arc::new(RecordingObserver(log.clone())));

        let service = StreamService::new(store.clone(), Arc::new(pipeline))
            .with_clock(Arc::new(FixedClock(fixed_now())));
        Fixture {
            service,
            store,
            assets,
            log,
        }
    }

    #[tokio::test]
    async fn test_update_status_round_trip() {
        let f = fixture(ContainerFormat::Mp4).await;
        let key = "k".repeat(32);

        let view = f
            .service
            .update_status("st12345678", &key, StreamStatus::Live)
            .await
            .unwrap();
        assert!(view.is_streaming);
        assert_eq!(f.service.list_live(0, 30).await.unwrap().len(), 1);

        let view = f
            .service
            .update_status("st12345678", &key, StreamStatus::Off)
            .await
            .unwrap();
        assert!(!view.is_streaming);
        assert_eq!(view.last_ended_at, Some(fixed_now()));
        assert!(f.service.list_live(0, 30).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_status_errors() {
        let f = fixture(ContainerFormat::Mp4).await;

        let err = f
            .service
            .update_status("missing", "k", StreamStatus::Live)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = f
            .service
            .update_status("st12345678", "nope", StreamStatus::Live)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let stored = f.store.find("st12345678").await.unwrap().unwrap();
        assert!(!stored.is_streaming);
    }

    #[tokio::test]
    async fn test_view_never_serialises_key() {
        let f = fixture(ContainerFormat::Mp4).await;
        let view = f.service.get("st12345678").await.unwrap();
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("stream_key"));
        assert!(!json.contains(&"k".repeat(32)));

        let json = serde_json::to_string(&session(false)).unwrap();
        assert!(!json.contains("stream_key"));
    }

    #[tokio::test]
    async fn test_upload_recording_wrong_key_looks_like_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(ContainerFormat::Webm).await;

        let file = temp_upload(&dir, "a.webm");
        let path = file.path().to_path_buf();
        let unauthorized = f
            .service
            .upload_recording("st12345678", "nope", file)
            .await
            .err()
            .unwrap();
        assert!(!path.exists());

        let missing = f
            .service
            .upload_recording("other", "k", temp_upload(&dir, "b.webm"))
            .await
            .err()
            .unwrap();

        assert_eq!(unauthorized.to_string(), missing.to_string());
        assert_eq!(unauthorized.status_code(), axum::http::StatusCode::UNAUTHORIZED);
        assert_eq!(missing.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_recording_is_private_and_owned_by_session_owner() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(ContainerFormat::Webm).await;

        let ack = f
            .service
            .upload_recording("st12345678", &"k".repeat(32), temp_upload(&dir, "a.webm"))
            .await
            .unwrap();
        let id = ack.asset_id().to_string();
        ack.send();
        wait_for(&f.log, "Finalized").await;

        let asset = f.assets.get_asset(&id).await.unwrap().unwrap();
        assert_eq!(asset.privacy, Privacy::Private);
        assert_eq!(asset.owner_id, 9);
        assert_eq!(asset.title, "2024-05-01 12:00:00");
        assert_eq!(asset.duration_secs, 90);
    }

    #[tokio::test]
    async fn test_upload_recording_rejects_flv() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(ContainerFormat::Flv).await;
        let err = f
            .service
            .upload_recording("st12345678", &"k".repeat(32), temp_upload(&dir, "a.flv"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
