pub mod cache;
pub mod format_selector;
pub mod http_pool;
pub mod identity;
pub mod manager;
pub mod playlist;
pub mod progress;
pub mod retry;
pub mod transfer;
pub mod ytdlp;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::{Container, Quality};
use crate::errors::ErrorKind;

pub use format_selector::FormatCandidate;
pub use identity::{ResourceIdentity, ResourceKind};

pub type TaskId = String;
pub type JobId = String;

/// Where a `MediaInfo` came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InfoSource {
    Probe,
    Extractor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistMembership {
    pub id: String,
    pub title: Option<String>,
    pub item_count: Option<usize>,
}

/// Resolved metadata. Replaced wholesale in the cache, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub identity: ResourceIdentity,
    pub title: String,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub webpage_url: String,
    pub uploader: Option<String>,
    pub formats: Vec<FormatCandidate>,
    pub playlist: Option<PlaylistMembership>,
    pub source: InfoSource,
    /// Set when the source listed formats it could not hand out directly.
    #[serde(default)]
    pub partial: bool,
}

impl MediaInfo {
    /// A probe result may lack a full format ladder; downloads need one.
    pub fn is_complete(&self) -> bool {
        self.identity.is_playlist() || (!self.formats.is_empty() && !self.partial)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistEntry {
    pub index: usize,
    pub id: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
}

/// Format constraints a task was submitted with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatConstraints {
    pub container: Container,
    pub quality: Quality,
    pub audio_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub constraints: FormatConstraints,
    pub destination: PathBuf,
    pub subtitles: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistRequest {
    pub url: String,
    pub constraints: FormatConstraints,
    pub destination: PathBuf,
    pub subtitles: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Resolving,
    Selecting,
    Transferring,
    Finalizing,
    Completed { path: PathBuf, size: u64 },
    Failed { kind: ErrorKind },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed { .. } | TaskState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Resolving => "resolving",
            TaskState::Selecting => "selecting",
            TaskState::Transferring => "transferring",
            TaskState::Finalizing => "finalizing",
            TaskState::Completed { .. } => "completed",
            TaskState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub identity: ResourceIdentity,
    pub constraints: FormatConstraints,
    pub destination: PathBuf,
    pub subtitles: bool,
    pub job_id: Option<JobId>,
    pub title: Option<String>,
    pub state: TaskState,
    pub error: Option<String>,
    pub subtitle_files: Vec<PathBuf>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub order: u32, // position within its playlist job
}

impl DownloadTask {
    pub fn new(identity: ResourceIdentity, request: &DownloadRequest) -> Self {
        Self {
            id: crate::utils::generate_download_id(),
            identity,
            constraints: request.constraints.clone(),
            destination: request.destination.clone(),
            subtitles: request.subtitles,
            job_id: None,
            title: None,
            state: TaskState::Pending,
            error: None,
            subtitle_files: Vec::new(),
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            order: 0,
        }
    }
}
