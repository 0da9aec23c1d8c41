//! YouTube Data API v3 client for video statistics and comment threads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::ExternalConfig;
use crate::error::HarvestError;
use crate::harvester::{CommentPage, CommentSource, ExternalComment, ExternalReply};
use crate::seed::{ExternalVideoStats, VideoStatsSource};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Deserialize)]
struct VideoItem {
    snippet: VideoSnippet,
    #[serde(default)]
    statistics: VideoStatistics,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    #[serde(default)]
    description: String,
    published_at: DateTime<Utc>,
}

// Counts arrive as decimal strings and may be hidden by the uploader.
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    dislike_count: Option<String>,
    comment_count: Option<String>,
}

fn count(value: &Option<String>) -> u64 {
    value
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadListResponse {
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<CommentThread>,
}

#[derive(Deserialize)]
struct CommentThread {
    snippet: CommentThreadSnippet,
    replies: Option<CommentThreadReplies>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadSnippet {
    top_level_comment: CommentResource,
}

#[derive(Deserialize)]
struct CommentThreadReplies {
    #[serde(default)]
    comments: Vec<CommentResource>,
}

#[derive(Deserialize)]
struct CommentResource {
    snippet: CommentSnippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentSnippet {
    #[serde(default)]
    text_original: String,
    published_at: DateTime<Utc>,
    #[serde(default)]
    like_count: u64,
}

pub fn parse_video_stats(body: &str) -> Result<ExternalVideoStats, HarvestError> {
    let response: VideoListResponse =
        serde_json::from_str(body).map_err(|e| HarvestError::Decode(e.to_string()))?;
    let item = response
        .items
        .into_iter()
        .next()
        .ok_or_else(|| HarvestError::Decode("video not found".to_string()))?;

    let s = &item.statistics;
    Ok(ExternalVideoStats {
        title: item.snippet.title,
        description: item.snippet.description,
        published_at: item.snippet.published_at,
        views: count(&s.view_count),
        likes: count(&s.like_count),
        dislikes: count(&s.dislike_count),
        comment_count: count(&s.comment_count),
    })
}

pub fn parse_comment_page(body: &str) -> Result<CommentPage, HarvestError> {
    let response: CommentThreadListResponse =
        serde_json::from_str(body).map_err(|e| HarvestError::Decode(e.to_string()))?;

    let items = response
        .items
        .into_iter()
        .map(|thread| {
            let top = thread.snippet.top_level_comment.snippet;
            ExternalComment {
                text: top.text_original,
                published_at: top.published_at,
                like_count: top.like_count,
                replies: thread
                    .replies
                    .map(|r| r.comments)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|c| ExternalReply {
                        text: c.snippet.text_original,
                        published_at: c.snippet.published_at,
                    })
                    .collect(),
            }
        })
        .collect();

    Ok(CommentPage {
        items,
        next_cursor: response.next_page_token,
    })
}

#[derive(Clone)]
pub struct YouTubeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    page_size: u32,
}

impl YouTubeClient {
    pub fn new(config: &ExternalConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            page_size: config.page_size,
        })
    }

    async fn get<T>(
        &self,
        resource: &str,
        query: &[(&str, &str)],
        parse: impl FnOnce(&str) -> Result<T, HarvestError>,
    ) -> Result<T, HarvestError> {
        let url = format!("{}/{}", self.base_url, resource);
        debug!(%url, "youtube request");
        let response = self
            .http
            .get(&url)
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(HarvestError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse(&body)
    }
}

#[async_trait]
impl VideoStatsSource for YouTubeClient {
    async fn fetch_stats(&self, external_id: &str) -> Result<ExternalVideoStats, HarvestError> {
        self.get(
            "videos",
            &[("part", "statistics,snippet"), ("id", external_id)],
            parse_video_stats,
        )
        .await
    }
}

#[async_trait]
impl CommentSource for YouTubeClient {
    async fn fetch_page(
        &self,
        subject_id: &str,
        cursor: Option<&str>,
    ) -> Result<CommentPage, HarvestError> {
        let max_results = self.page_size.to_string();
        self.get(
            "commentThreads",
            &[
                ("part", "snippet,replies"),
                ("maxResults", max_results.as_str()),
                ("videoId", subject_id),
                ("pageToken", cursor.unwrap_or("")),
            ],
            parse_comment_page,
        )
        .await
    }
}
