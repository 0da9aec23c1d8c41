//! Persistence collaborators and an in-memory implementation of all of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::{
    AccountId, CommentId, CommentRecord, MediaAsset, NewComment, Reaction, StreamSession,
    SubjectKind,
};

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Create or replace by asset id.
    async fn persist_asset(&self, asset: &MediaAsset) -> anyhow::Result<()>;

    async fn get_asset(&self, id: &str) -> anyhow::Result<Option<MediaAsset>>;

    /// Returns false when no asset has this id.
    async fn update_asset_stats(
        &self,
        id: &str,
        views: u64,
        uploaded_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait CommentStore: Send + Sync {
    /// Inserts the comment and returns it with its assigned id.
    async fn persist_comment(&self, comment: NewComment) -> anyhow::Result<CommentRecord>;
}

#[async_trait]
pub trait ReactionStore: Send + Sync {
    /// Create or update keyed by (subject, reactor).
    async fn persist_reaction(&self, reaction: &Reaction) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn find(&self, id: &str) -> anyhow::Result<Option<StreamSession>>;

    async fn save(&self, session: &StreamSession) -> anyhow::Result<()>;

    async fn list_live(&self, offset: usize, limit: usize) -> anyhow::Result<Vec<StreamSession>>;
}

type ReactionKey = (SubjectKind, String, AccountId);

#[derive(Default)]
pub struct MemoryStore {
    assets: RwLock<HashMap<String, MediaAsset>>,
    comments: RwLock<BTreeMap<CommentId, CommentRecord>>,
    next_comment_id: AtomicU64,
    reactions: RwLock<HashMap<ReactionKey, bool>>,
    streams: RwLock<BTreeMap<String, StreamSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_stream(&self, session: StreamSession) {
        self.streams
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    /// Register sessions from a JSON array. Sessions without a key are
    /// skipped; a repeated id replaces the earlier entry.
    pub async fn load_streams(&self, path: &Path) -> anyhow::Result<usize> {
        let content = tokio::fs::read_to_string(path).await?;
        let sessions: Vec<StreamSession> = serde_json::from_str(&content)?;

        let mut loaded = 0;
        for session in sessions {
            if session.stream_key.is_empty() {
                warn!(stream_id = %session.id, "skipping stream without a key");
                continue;
            }
            self.insert_stream(session).await;
            loaded += 1;
        }
        info!(path = %path.display(), streams = loaded, "loaded stream sessions");
        Ok(loaded)
    }

    pub async fn comments(&self) -> Vec<CommentRecord> {
        self.comments.read().await.values().cloned().collect()
    }

    pub async fn reactions(&self) -> Vec<Reaction> {
        self.reactions
            .read()
            .await
            .iter()
            .map(|((kind, subject_id, reactor_id), like)| Reaction {
                subject_kind: *kind,
                subject_id: subject_id.clone(),
                reactor_id: *reactor_id,
                like: *like,
            })
            .collect()
    }

    pub async fn asset_count(&self) -> usize {
        self.assets.read().await.len()
    }
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn persist_asset(&self, asset: &MediaAsset) -> anyhow::Result<()> {
        self.assets
            .write()
            .await
            .insert(asset.id.clone(), asset.clone());
        Ok(())
    }

    async fn get_asset(&self, id: &str) -> anyhow::Result<Option<MediaAsset>> {
        Ok(self.assets.read().await.get(id).cloned())
    }

    async fn update_asset_stats(
        &self,
        id: &str,
        views: u64,
        uploaded_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut assets = self.assets.write().await;
        Ok(match assets.get_mut(id) {
            Some(asset) => {
                asset.views = views;
                asset.uploaded_at = uploaded_at;
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl CommentStore for MemoryStore {
    async fn persist_comment(&self, comment: NewComment) -> anyhow::Result<CommentRecord> {
        if let Some(parent) = comment.parent_id {
            if !self.comments.read().await.contains_key(&parent) {
                anyhow::bail!("parent comment {} does not exist", parent);
            }
        }

        let id = self.next_comment_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = CommentRecord {
            id,
            content: comment.content,
            created_at: comment.created_at,
            video_id: comment.video_id,
            author_id: comment.author_id,
            parent_id: comment.parent_id,
        };
        self.comments.write().await.insert(id, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl ReactionStore for MemoryStore {
    async fn persist_reaction(&self, reaction: &Reaction) -> anyhow::Result<()> {
        self.reactions.write().await.insert(
            (
                reaction.subject_kind,
                reaction.subject_id.clone(),
                reaction.reactor_id,
            ),
            reaction.like,
        );
        Ok(())
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn find(&self, id: &str) -> anyhow::Result<Option<StreamSession>> {
        Ok(self.streams.read().await.get(id).cloned())
    }

    async fn save(&self, session: &StreamSession) -> anyhow::Result<()> {
        self.insert_stream(session.clone()).await;
        Ok(())
    }

    async fn list_live(&self, offset: usize, limit: usize) -> anyhow::Result<Vec<StreamSession>> {
        Ok(self
            .streams
            .read()
            .await
            .values()
            .filter(|s| s.is_streaming)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
