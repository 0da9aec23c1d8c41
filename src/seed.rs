//! Seeds a stored video with realistic engagement copied from an external
//! video: views, publish date, likes/dislikes and comment threads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::engagement::{DistributionReport, EngagementCounts, EngagementEngine, ReactorPool};
use crate::error::{AppError, HarvestError, Result};
use crate::harvester::{CommentSource, HarvestReport, Harvester};
use crate::models::Subject;
use crate::store::AssetStore;

/// Stored views are the external count scaled down by this factor.
const VIEW_SCALE: u64 = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct ExternalVideoStats {
    pub title: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub views: u64,
    pub likes: u64,
    pub dislikes: u64,
    pub comment_count: u64,
}

#[async_trait]
pub trait VideoStatsSource: Send + Sync {
    async fn fetch_stats(
        &self,
        external_id: &str,
    ) -> std::result::Result<ExternalVideoStats, HarvestError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub video_reactions: DistributionReport,
    pub comments: HarvestReport,
}

pub struct Seeder {
    assets: Arc<dyn AssetStore>,
    engine: Arc<EngagementEngine>,
    harvester: Arc<Harvester>,
}

impl Seeder {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        engine: Arc<EngagementEngine>,
        harvester: Arc<Harvester>,
    ) -> Self {
        Self {
            assets,
            engine,
            harvester,
        }
    }

    pub async fn seed_video(
        &self,
        stats_source: &dyn VideoStatsSource,
        comment_source: &dyn CommentSource,
        video_id: &str,
        external_id: &str,
        pool: &ReactorPool,
    ) -> Result<SeedReport> {
        let stats = stats_source
            .fetch_stats(external_id)
            .await
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!("fetching stats for {}: {}", external_id, e))
            })?;

        let updated = self
            .assets
            .update_asset_stats(video_id, stats.views / VIEW_SCALE, stats.published_at)
            .await?;
        if !updated {
            return Err(AppError::not_found("video not found"));
        }

        let video_reactions = self
            .engine
            .distribute(
                &Subject::video(video_id),
                EngagementCounts::new(stats.likes, stats.dislikes),
                pool,
            )
            .await;

        let n = if pool.is_empty() {
            0
        } else {
            (stats.comment_count % pool.len() as u64) as usize
        };
        let comments = self
            .harvester
            .harvest(comment_source, video_id, external_id, n, pool)
            .await;

        info!(
            video_id,
            external_id,
            title = %stats.title,
            description_chars = stats.description.chars().count(),
            likes = video_reactions.likes,
            dislikes = video_reactions.dislikes,
            comments = comments.comments,
            "video seeded"
        );
        Ok(SeedReport {
            video_reactions,
            comments,
        })
    }
}
