//! Cursor-driven retrieval of external comment threads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngagementConfig;
use crate::engagement::{EngagementCounts, EngagementEngine, ReactorPool};
use crate::error::HarvestError;
use crate::executor::for_each_bounded;
use crate::models::{AccountId, CommentId, NewComment, Subject};
use crate::store::CommentStore;

#[derive(Clone, Debug, PartialEq)]
pub struct ExternalReply {
    pub text: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExternalComment {
    pub text: String,
    pub published_at: DateTime<Utc>,
    pub like_count: u64,
    pub replies: Vec<ExternalReply>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommentPage {
    pub items: Vec<ExternalComment>,
    pub next_cursor: Option<String>,
}

/// A paginated third-party comment feed.
#[async_trait]
pub trait CommentSource: Send + Sync {
    async fn fetch_page(
        &self,
        subject_id: &str,
        cursor: Option<&str>,
    ) -> Result<CommentPage, HarvestError>;
}

struct PageState {
    cursor: Option<String>,
    remaining: usize,
    exhausted: bool,
}

/// Pages of `subject_id`, starting at `cursor`, trimmed so that no more
/// than `budget` items are yielded in total.
///
/// Ends at the budget, at the last page, at an empty page, or at the first
/// failed fetch. Each yielded page carries the cursor to resume from.
pub fn comment_pages<'a>(
    source: &'a dyn CommentSource,
    subject_id: &'a str,
    budget: usize,
    cursor: Option<String>,
) -> impl Stream<Item = CommentPage> + Send + 'a {
    let state = PageState {
        cursor,
        remaining: budget,
        exhausted: false,
    };

    stream::unfold(state, move |mut state| async move {
        if state.exhausted || state.remaining == 0 {
            return None;
        }

        let page = match source.fetch_page(subject_id, state.cursor.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                warn!(subject_id, "comment page fetch failed, ending harvest: {}", e);
                return None;
            }
        };
        if page.items.is_empty() {
            return None;
        }

        let mut items = page.items;
        items.truncate(state.remaining);
        state.remaining -= items.len();

        match page.next_cursor.filter(|c| !c.is_empty()) {
            Some(next) => state.cursor = Some(next),
            None => state.exhausted = true,
        }

        let next_cursor = if state.exhausted {
            None
        } else {
            state.cursor.clone()
        };
        Some((CommentPage { items, next_cursor }, state))
    })
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HarvestReport {
    pub pages: usize,
    /// Items taken from pages, persisted or not.
    pub taken: usize,
    pub comments: usize,
    pub replies: usize,
    pub skipped: usize,
    pub reactions: usize,
}

pub struct Harvester {
    comments: Arc<dyn CommentStore>,
    engine: Arc<EngagementEngine>,
    config: EngagementConfig,
}

impl Harvester {
    pub fn new(
        comments: Arc<dyn CommentStore>,
        engine: Arc<EngagementEngine>,
        config: EngagementConfig,
    ) -> Self {
        Self {
            comments,
            engine,
            config,
        }
    }

    /// Copy up to `n` top-level comments of `subject_id` onto `video_id`,
    /// with authors and reactors drawn from `pool`.
    pub async fn harvest(
        &self,
        source: &dyn CommentSource,
        video_id: &str,
        subject_id: &str,
        n: usize,
        pool: &ReactorPool,
    ) -> HarvestReport {
        let mut report = HarvestReport::default();
        if pool.is_empty() {
            debug!(video_id, "empty reactor pool, nothing to harvest");
            return report;
        }

        let mut pages = Box::pin(comment_pages(source, subject_id, n, None));
        while let Some(page) = pages.next().await {
            report.pages += 1;
            for item in page.items {
                report.taken += 1;
                self.process_item(video_id, item, pool, &mut report).await;
            }
        }

        info!(
            video_id,
            pages = report.pages,
            comments = report.comments,
            replies = report.replies,
            skipped = report.skipped,
            "comments harvested"
        );
        report
    }

    fn pick_author(&self, pool: &ReactorPool) -> Option<AccountId> {
        self.engine
            .with_rng(|rng| pool.choose(rng).map(|r| r.account_id))
    }

    async fn process_item(
        &self,
        video_id: &str,
        item: ExternalComment,
        pool: &ReactorPool,
        report: &mut HarvestReport,
    ) {
        if item.text.is_empty() {
            report.skipped += 1;
            return;
        }
        let Some(author_id) = self.pick_author(pool) else {
            report.skipped += 1;
            return;
        };

        let comment = NewComment {
            content: truncate_chars(&item.text, self.config.comment_max_chars),
            created_at: item.published_at,
            video_id: video_id.to_string(),
            author_id,
            parent_id: None,
        };
        let record = match self.comments.persist_comment(comment).await {
            Ok(record) => record,
            Err(e) => {
                warn!(video_id, "failed to persist comment: {:#}", e);
                report.skipped += 1;
                return;
            }
        };
        report.comments += 1;

        let counts = self.engine.with_rng(|rng| {
            EngagementCounts::with_estimated_dislikes(
                item.like_count,
                self.config.dislike_estimate_ratio,
                rng,
            )
        });
        let reactions = self
            .engine
            .distribute(&Subject::comment(record.id), counts, pool)
            .await;
        report.reactions += reactions.likes + reactions.dislikes;

        if !item.replies.is_empty() {
            report.replies += self
                .persist_replies(video_id, record.id, item.replies, pool)
                .await;
        }
    }

    async fn persist_replies(
        &self,
        video_id: &str,
        parent_id: CommentId,
        replies: Vec<ExternalReply>,
        pool: &ReactorPool,
    ) -> usize {
        let replies: Vec<NewComment> = replies
            .into_iter()
            .take(self.config.max_replies)
            .filter(|r| !r.text.is_empty())
            .filter_map(|r| {
                let author_id = self.pick_author(pool)?;
                Some(NewComment {
                    content: truncate_chars(&r.text, self.config.comment_max_chars),
                    created_at: r.published_at,
                    video_id: video_id.to_string(),
                    author_id,
                    parent_id: Some(parent_id),
                })
            })
            .collect();

        let fan_out = for_each_bounded(replies, self.config.fan_out_concurrency, |reply| {
            let comments = self.comments.clone();
            async move { comments.persist_comment(reply).await.map(|_| ()) }
        })
        .await;
        for e in &fan_out.failures {
            warn!(video_id, parent_id, "failed to persist reply: {:#}", e);
        }
        fan_out.succeeded()
    }
}
