//! Respond now, finish later.
//!
//! An upload moves through
//! `Received → Validated → Acknowledged → Processing → Finalized`.
//! Validation failures end in `Rejected` before anything is committed;
//! failures after the caller was acknowledged end in `Failed` and are only
//! reported through the [`ProcessingObserver`].
//!
//! The background job is handed to a [`TaskSpawner`] as soon as validation
//! passes, but it waits on a gate that only [`Acknowledgement::send`] opens,
//! so the success response always precedes any storage write.

use async_trait::async_trait;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::{ProcessingError, Result};
use crate::executor::TaskSpawner;
use crate::media::{validate_media, MediaInspector, TempUpload};
use crate::models::{AccountId, ContainerFormat, DataResponse, MediaAsset, Privacy, UploadAccepted};
use crate::store::AssetStore;

pub const ACCEPTED_MESSAGE: &str = "upload video success, waiting to process";

const ASSET_ID_LEN: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedMedia {
    pub video_path: String,
    pub thumbnail_path: String,
}

/// Transcodes a source file and extracts its thumbnail.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn process_video(&self, source: &Path, thumbnail_at: f64)
        -> anyhow::Result<ProcessedMedia>;
}

pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Ten random alphanumeric characters.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ASSET_ID_LEN)
            .map(char::from)
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Validated,
    Acknowledged,
    Processing,
    Finalized,
    Rejected,
    Failed,
}

/// Out-of-band channel for pipeline progress. `asset_id` is `None` until
/// an id has been allocated.
pub trait ProcessingObserver: Send + Sync {
    fn stage_changed(&self, asset_id: Option<&str>, stage: PipelineStage);

    fn failed(&self, asset_id: &str, _error: &ProcessingError) {
        self.stage_changed(Some(asset_id), PipelineStage::Failed);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl ProcessingObserver for TracingObserver {
    fn stage_changed(&self, asset_id: Option<&str>, stage: PipelineStage) {
        debug!(asset_id = asset_id.unwrap_or("-"), ?stage, "pipeline stage");
    }

    fn failed(&self, asset_id: &str, error: &ProcessingError) {
        error!(asset_id, "background processing failed: {}", error);
    }
}

pub struct UploadRequest {
    pub file: TempUpload,
    pub title: String,
    pub description: Option<String>,
    pub categories: Vec<String>,
    pub owner_id: AccountId,
    pub privacy: Privacy,
    pub thumbnail_timestamp: Option<u64>,
    pub allowed: &'static [ContainerFormat],
}

pub struct UploadPipeline {
    inspector: Arc<dyn MediaInspector>,
    processor: Arc<dyn MediaProcessor>,
    assets: Arc<dyn AssetStore>,
    spawner: Arc<dyn TaskSpawner>,
    ids: Arc<dyn IdGenerator>,
    observer: Arc<dyn ProcessingObserver>,
}

impl UploadPipeline {
    pub fn new(
        inspector: Arc<dyn MediaInspector>,
        processor: Arc<dyn MediaProcessor>,
        assets: Arc<dyn AssetStore>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Self {
        Self {
            inspector,
            processor,
            assets,
            spawner,
            ids: Arc::new(RandomIdGenerator),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProcessingObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate the upload and schedule its processing. Returns once the
    /// caller can be answered; the job itself waits for the returned
    /// acknowledgement to be sent.
    pub async fn accept(&self, request: UploadRequest) -> Result<Acknowledgement> {
        self.observer.stage_changed(None, PipelineStage::Received);

        let validated = validate_media(
            self.inspector.as_ref(),
            request.file.path(),
            request.allowed,
            request.thumbnail_timestamp,
        )
        .await;
        let info = match validated {
            Ok(info) => info,
            Err(e) => {
                self.observer.stage_changed(None, PipelineStage::Rejected);
                request.file.release().await;
                return Err(e);
            }
        };

        let id = self.ids.generate();
        let asset = MediaAsset {
            id: id.clone(),
            title: request.title,
            description: request.description,
            container: info.container,
            duration_secs: info.duration_secs,
            privacy: request.privacy,
            views: 0,
            uploaded_at: Utc::now(),
            owner_id: request.owner_id,
            video_path: None,
            thumbnail_path: None,
            categories: request.categories,
        };
        self.observer
            .stage_changed(Some(&id), PipelineStage::Validated);

        let thumbnail_at = request
            .thumbnail_timestamp
            .map(|ts| ts as f64)
            .unwrap_or(info.duration_secs as f64 / 2.0);

        let (gate_tx, gate_rx) = oneshot::channel();
        let job = BackgroundJob {
            asset,
            file: request.file,
            thumbnail_at,
            processor: self.processor.clone(),
            assets: self.assets.clone(),
            observer: self.observer.clone(),
        };
        self.spawner.spawn(Box::pin(job.run(gate_rx)));

        Ok(Acknowledgement {
            asset_id: id,
            gate: Some(gate_tx),
            observer: self.observer.clone(),
        })
    }
}

/// Proof that an upload was accepted. Sending it (directly, or by turning
/// it into a response) releases the background job.
pub struct Acknowledgement {
    asset_id: String,
    gate: Option<oneshot::Sender<()>>,
    observer: Arc<dyn ProcessingObserver>,
}

impl Acknowledgement {
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn send(mut self) -> UploadAccepted {
        if let Some(gate) = self.gate.take() {
            self.observer
                .stage_changed(Some(&self.asset_id), PipelineStage::Acknowledged);
            let _ = gate.send(());
        }
        UploadAccepted {
            message: ACCEPTED_MESSAGE.to_string(),
            id: std::mem::take(&mut self.asset_id),
        }
    }
}

impl IntoResponse for Acknowledgement {
    fn into_response(self) -> Response {
        Json(DataResponse { data: self.send() }).into_response()
    }
}

struct BackgroundJob {
    asset: MediaAsset,
    file: TempUpload,
    thumbnail_at: f64,
    processor: Arc<dyn MediaProcessor>,
    assets: Arc<dyn AssetStore>,
    observer: Arc<dyn ProcessingObserver>,
}

impl BackgroundJob {
    async fn run(self, gate: oneshot::Receiver<()>) {
        let BackgroundJob {
            mut asset,
            file,
            thumbnail_at,
            processor,
            assets,
            observer,
        } = self;

        if gate.await.is_err() {
            file.release().await;
            observer.failed(&asset.id, &ProcessingError::NotAcknowledged);
            return;
        }

        observer.stage_changed(Some(&asset.id), PipelineStage::Processing);
        let processed = processor.process_video(file.path(), thumbnail_at).await;
        file.release().await;

        let outcome = match processed {
            Ok(media) => {
                asset.video_path = Some(media.video_path);
                asset.thumbnail_path = Some(media.thumbnail_path);
                assets
                    .persist_asset(&asset)
                    .await
                    .map_err(ProcessingError::Persist)
            }
            Err(e) => Err(ProcessingError::Processor(e)),
        };

        match outcome {
            Ok(()) => {
                info!(asset_id = %asset.id, duration = asset.duration_secs, "asset finalized");
                observer.stage_changed(Some(&asset.id), PipelineStage::Finalized);
            }
            Err(e) => observer.failed(&asset.id, &e),
        }
    }
}
