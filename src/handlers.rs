use crate::{
    config::Config,
    engagement::ReactorPool,
    error::{AppError, Result},
    executor::TaskSpawner,
    harvester::CommentSource,
    media::{TempUpload, UPLOAD_FORMATS},
    models::{AccountId, DataResponse, MessageBody, Privacy, StreamView},
    pipeline::{Acknowledgement, UploadPipeline, UploadRequest},
    seed::{Seeder, VideoStatsSource},
    stream::{StreamService, StreamStatus},
};
use anyhow::Context;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use multer::{Constraints, Multipart, SizeLimit};
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tokio::io::AsyncWriteExt;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

const USER_HEADER: &str = "x-user-id";
const VIDEO_FIELD: &str = "video";
const DEFAULT_PAGE_SIZE: usize = 30;
const MAX_PAGE_SIZE: usize = 100;
// Room for the text fields and part headers next to the file itself.
const FORM_OVERHEAD: u64 = 64 * 1024;

pub struct AppState {
    pub config: Config,
    pub uploads: Arc<UploadPipeline>,
    pub streams: Arc<StreamService>,
    pub seeder: Arc<Seeder>,
    pub stats_source: Arc<dyn VideoStatsSource>,
    pub comment_source: Arc<dyn CommentSource>,
    pub reactors: Arc<ReactorPool>,
    pub spawner: Arc<dyn TaskSpawner>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let media_dir = state.config.output_dir.clone();
    Router::new()
        .route("/videos", post(upload_video))
        .route("/streams", get(list_streams))
        .route("/streams/upload", post(upload_stream_recording))
        .route("/streams/:id", get(get_stream).patch(update_stream_status))
        .route("/admin/seed", post(seed_video))
        .nest_service("/media", ServeDir::new(media_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Stand-in for session auth: the caller's account id.
fn user_id(headers: &HeaderMap) -> Result<AccountId> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| AppError::unauthorized("missing or invalid x-user-id"))
}

/// A parsed multipart form. The video part, if any, has been streamed to a
/// uniquely named temp file in the upload directory.
#[derive(Default)]
struct UploadForm {
    video: Option<TempUpload>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.text(name)
            .map(str::to_string)
            .ok_or_else(|| AppError::validation(format!("{} is required", name)))
    }

    fn take_video(&mut self) -> Result<TempUpload> {
        self.video
            .take()
            .ok_or_else(|| AppError::validation(format!("{} is required", VIDEO_FIELD)))
    }
}

fn multipart_error(config: &Config, e: multer::Error) -> AppError {
    match e {
        multer::Error::FieldSizeExceeded { .. } | multer::Error::StreamSizeExceeded { .. } => {
            AppError::PayloadTooLarge(format!(
                "file too large, maximum file size is {}MB",
                config.max_file_size / 1024 / 1024
            ))
        }
        other => AppError::validation(format!("error parsing multipart request: {}", other)),
    }
}

async fn read_upload_form(config: &Config, request: Request) -> Result<UploadForm> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::validation("missing Content-Type header"))?;

    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| AppError::validation(format!("invalid multipart request: {}", e)))?;

    let constraints = Constraints::new().size_limit(
        SizeLimit::new()
            .per_field(config.max_file_size)
            .whole_stream(config.max_file_size + FORM_OVERHEAD),
    );
    let mut multipart = Multipart::with_constraints(
        request.into_body().into_data_stream(),
        boundary,
        constraints,
    );

    let mut form = UploadForm::default();
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(config, e))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name != VIDEO_FIELD {
            let value = field.text().await.map_err(|e| multipart_error(config, e))?;
            form.fields.insert(name, value);
            continue;
        }

        // Never trust the client's file name; the container is sniffed later.
        let path = config.upload_dir.join(format!("{}.upload", Uuid::new_v4()));
        let upload = TempUpload::new(&path);
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;

        while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(config, e))? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }
        file.flush().await.context("flushing upload")?;

        form.video = Some(upload);
    }

    Ok(form)
}

/// Accept a new video upload. Answers as soon as the file is validated;
/// transcoding happens after the response is sent.
pub async fn upload_video(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Acknowledgement> {
    let owner_id = user_id(request.headers())?;
    let mut form = read_upload_form(&state.config, request).await?;
    let file = form.take_video()?;

    let title = form.required("title")?;
    let thumbnail_timestamp = form
        .text("thumbnail_timestamp")
        .map(|v| v.parse::<u64>())
        .transpose()
        .map_err(|_| AppError::validation("thumbnail_timestamp must be a non-negative integer"))?;
    let categories = form
        .text("categories")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let ack = state
        .uploads
        .accept(UploadRequest {
            file,
            title,
            description: form.text("description").map(str::to_string),
            categories,
            owner_id,
            privacy: Privacy::Public,
            thumbnail_timestamp,
            allowed: UPLOAD_FORMATS,
        })
        .await?;

    info!(asset_id = ack.asset_id(), owner_id, "[POST /videos] upload accepted");
    Ok(ack)
}

#[derive(Debug, Deserialize)]
pub struct Paging {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn list_streams(
    State(state): State<Arc<AppState>>,
    Query(paging): Query<Paging>,
) -> Result<Json<DataResponse<Vec<StreamView>>>> {
    let limit = paging.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if limit > MAX_PAGE_SIZE {
        return Err(AppError::validation(format!(
            "limit must not exceed {}",
            MAX_PAGE_SIZE
        )));
    }
    let data = state
        .streams
        .list_live(paging.offset.unwrap_or(0), limit)
        .await?;
    Ok(Json(DataResponse { data }))
}

pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DataResponse<StreamView>>> {
    let data = state.streams.get(&id).await?;
    Ok(Json(DataResponse { data }))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub stream_key: String,
    pub status: String,
}

fn parse_status(value: &str) -> Result<StreamStatus> {
    match value {
        "live" => Ok(StreamStatus::Live),
        "off" => Ok(StreamStatus::Off),
        _ => Err(AppError::validation("status must be one of: live, off")),
    }
}

pub async fn update_stream_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdate>,
) -> Result<Json<DataResponse<StreamView>>> {
    let status = parse_status(&body.status)?;
    let data = state
        .streams
        .update_status(&id, &body.stream_key, status)
        .await?;
    Ok(Json(DataResponse { data }))
}

/// Upload a recorded segment of a stream, authenticated by its stream key.
pub async fn upload_stream_recording(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Acknowledgement> {
    let mut form = read_upload_form(&state.config, request).await?;
    let file = form.take_video()?;
    let stream_id = form.required("stream_id")?;
    let stream_key = form.required("stream_key")?;

    let ack = state
        .streams
        .upload_recording(&stream_id, &stream_key, file)
        .await?;

    info!(asset_id = ack.asset_id(), stream_id, "[POST /streams/upload] recording accepted");
    Ok(ack)
}

#[derive(Debug, Deserialize)]
pub struct SeedRequest {
    pub video_id: String,
    pub external_id: String,
}

/// Copy engagement from an external video onto a stored one. Runs in the
/// background; the outcome is only logged.
pub async fn seed_video(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SeedRequest>,
) -> Result<(StatusCode, Json<DataResponse<MessageBody>>)> {
    if state.reactors.is_empty() {
        return Err(AppError::conflict("no reactor accounts configured"));
    }

    let seeder = state.seeder.clone();
    let stats_source = state.stats_source.clone();
    let comment_source = state.comment_source.clone();
    let reactors = state.reactors.clone();
    let SeedRequest {
        video_id,
        external_id,
    } = request;

    info!(%video_id, %external_id, "[POST /admin/seed] seeding scheduled");
    state.spawner.spawn(Box::pin(async move {
        let seeded = seeder
            .seed_video(
                stats_source.as_ref(),
                comment_source.as_ref(),
                &video_id,
                &external_id,
                &reactors,
            )
            .await;
        if let Err(e) = seeded {
            error!(%video_id, %external_id, "seeding failed: {}", e);
        }
    }));

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: MessageBody {
                message: "seeding started".to_string(),
            },
        }),
    ))
}
