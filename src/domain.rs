use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BatchError;
use crate::identity::Identifier;

/// Job state as seen by the orchestrator. Every status string the service
/// reports other than `processed` and `failed` is treated as still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn from_service(value: Option<&str>) -> Self {
        match value.map(|status| status.trim().to_ascii_lowercase()) {
            Some(status) if status == "processed" => JobStatus::Succeeded,
            Some(status) if status == "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Media URL fields a job record may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultField {
    OriginalVideo,
    Video,
    Thumbnail,
}

impl ResultField {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultField::OriginalVideo => "original_video",
            ResultField::Video => "video",
            ResultField::Thumbnail => "thumbnail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteJob {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<JobStatus>,
    pub error: Option<String>,
    pub original_video: Option<String>,
    pub video: Option<String>,
    pub thumbnail: Option<String>,
}

impl RemoteJob {
    pub fn status(&self) -> JobStatus {
        self.status.unwrap_or(JobStatus::Pending)
    }

    pub fn field(&self, field: ResultField) -> Option<&str> {
        let value = match field {
            ResultField::OriginalVideo => self.original_video.as_deref(),
            ResultField::Video => self.video.as_deref(),
            ResultField::Thumbnail => self.thumbnail.as_deref(),
        };
        value.map(str::trim).filter(|value| !value.is_empty())
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or("Untitled")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Dream,
    Playlist,
    #[serde(other)]
    Other,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Dream => "dream",
            ItemKind::Playlist => "playlist",
            ItemKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionItem {
    pub id: String,
    pub kind: ItemKind,
    pub job: Option<RemoteJob>,
}

impl CollectionItem {
    /// The job record behind this item, when the item is a job reference.
    pub fn job(&self) -> Option<&RemoteJob> {
        match self.kind {
            ItemKind::Dream => self.job.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectionPage {
    pub items: Vec<CollectionItem>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub id: String,
    pub name: Option<String>,
    pub items: Vec<CollectionItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    WanI2v,
    QwenImage,
    Uprez,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::WanI2v => "wan-i2v",
            Algorithm::QwenImage => "qwen-image",
            Algorithm::Uprez => "uprez",
        }
    }

    /// Payload key that carries the unit's input reference.
    pub fn input_field(self) -> Option<&'static str> {
        match self {
            Algorithm::WanI2v => Some("image"),
            Algorithm::Uprez => Some("video_uuid"),
            Algorithm::QwenImage => None,
        }
    }

    /// Whether an uploaded input must be passed as a fetchable URL rather
    /// than as an item id.
    pub fn requires_url(self) -> bool {
        matches!(self, Algorithm::WanI2v)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = BatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "wan-i2v" => Ok(Algorithm::WanI2v),
            "qwen-image" => Ok(Algorithm::QwenImage),
            "uprez" => Ok(Algorithm::Uprez),
            other => Err(BatchError::InvalidConfig(format!(
                "unknown algorithm: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRef {
    LocalFile(PathBuf),
    RemoteItem(String),
    None,
}

#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub identifier: Identifier,
    pub input: InputRef,
    pub params: Map<String, Value>,
    pub name: String,
    pub description: Option<String>,
    pub index: usize,
}
