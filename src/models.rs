use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type AccountId = i64;
pub type CommentId = u64;

/// Container formats recognised by content sniffing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
    Mkv,
    Webm,
    Flv,
}

impl ContainerFormat {
    pub fn ext(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::Webm => "webm",
            ContainerFormat::Flv => "flv",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ext())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Private,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub container: ContainerFormat,
    pub duration_secs: u64,
    pub privacy: Privacy,
    pub views: u64,
    pub uploaded_at: DateTime<Utc>,
    pub owner_id: AccountId,
    pub video_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub categories: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamSession {
    pub id: String,
    #[serde(skip_serializing)]
    pub stream_key: String,
    pub name: String,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub last_ended_at: Option<DateTime<Utc>>,
    pub owner_id: AccountId,
}

/// Listing projection of a session. Never carries the key.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StreamView {
    pub id: String,
    pub name: String,
    pub is_streaming: bool,
    pub last_ended_at: Option<DateTime<Utc>>,
    pub owner_id: AccountId,
}

impl From<&StreamSession> for StreamView {
    fn from(s: &StreamSession) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            is_streaming: s.is_streaming,
            last_ended_at: s.last_ended_at,
            owner_id: s.owner_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Video,
    Comment,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: String,
}

impl Subject {
    pub fn video(id: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::Video,
            id: id.into(),
        }
    }

    pub fn comment(id: CommentId) -> Self {
        Self {
            kind: SubjectKind::Comment,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SubjectKind::Video => write!(f, "video:{}", self.id),
            SubjectKind::Comment => write!(f, "comment:{}", self.id),
        }
    }
}

/// One like (`like == true`) or dislike by one reactor on one subject.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reaction {
    pub subject_kind: SubjectKind,
    pub subject_id: String,
    pub reactor_id: AccountId,
    pub like: bool,
}

/// A comment before the store has assigned it an id.
#[derive(Clone, Debug)]
pub struct NewComment {
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub video_id: String,
    pub author_id: AccountId,
    pub parent_id: Option<CommentId>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CommentRecord {
    pub id: CommentId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub video_id: String,
    pub author_id: AccountId,
    pub parent_id: Option<CommentId>,
}

#[derive(Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Serialize)]
pub struct MessageBody {
    pub message: String,
}

#[derive(Serialize)]
pub struct UploadAccepted {
    pub message: String,
    pub id: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
