use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use video_platform_backend::{
    cleanup,
    config::Config,
    engagement::{EngagementEngine, ReactorPool},
    executor::{TaskSpawner, TokioSpawner},
    ffmpeg::{self, FfmpegProcessor},
    handlers::{self, AppState},
    harvester::Harvester,
    media::FfprobeInspector,
    pipeline::UploadPipeline,
    seed::Seeder,
    store::MemoryStore,
    stream::StreamService,
    youtube::YouTubeClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("video_platform_backend=debug,tower_http=debug")
            }),
        )
        .init();

    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.upload_dir).await?;
    tokio::fs::create_dir_all(&config.output_dir).await?;

    match ffmpeg::check_ffmpeg_available().await {
        Ok(version) => info!("ffmpeg: {}", version),
        Err(e) => warn!("ffmpeg not available, uploads will fail to process: {}", e),
    }

    let store = Arc::new(MemoryStore::new());
    let spawner: Arc<dyn TaskSpawner> = Arc::new(TokioSpawner);

    let processor = FfmpegProcessor::new(&config.output_dir, config.ffmpeg.clone());
    processor.ensure_dirs().await?;

    let uploads = Arc::new(UploadPipeline::new(
        Arc::new(FfprobeInspector),
        Arc::new(processor),
        store.clone(),
        spawner.clone(),
    ));
    let streams = Arc::new(StreamService::new(store.clone(), uploads.clone()));

    let engine = Arc::new(EngagementEngine::new(
        store.clone(),
        config.engagement.fan_out_concurrency,
    ));
    let harvester = Arc::new(Harvester::new(
        store.clone(),
        engine.clone(),
        config.engagement.clone(),
    ));
    let seeder = Arc::new(Seeder::new(store.clone(), engine, harvester));
    let youtube = Arc::new(YouTubeClient::new(&config.external)?);

    let reactors = match &config.seed.reactor_tokens_path {
        Some(path) => ReactorPool::load(std::path::Path::new(path)).await?,
        None => ReactorPool::default(),
    };
    if reactors.is_empty() {
        warn!("no reactor accounts loaded, seeding is disabled");
    } else {
        info!(reactors = reactors.len(), "reactor pool loaded");
    }

    if let Some(path) = &config.seed.streams_path {
        store.load_streams(std::path::Path::new(path)).await?;
    } else {
        warn!("no stream sessions configured, stream routes will answer 404");
    }

    cleanup::start_cleanup_task(Arc::new(config.clone()));

    let addr = format!("0.0.0.0:{}", config.port);
    info!(
        upload_dir = %config.upload_dir.display(),
        output_dir = %config.output_dir.display(),
        ffmpeg_threads = config.ffmpeg.effective_threads(),
        "configuration loaded"
    );

    let state = Arc::new(AppState {
        config,
        uploads,
        streams,
        seeder,
        stats_source: youtube.clone(),
        comment_source: youtube,
        reactors: Arc::new(reactors),
        spawner,
    });
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
