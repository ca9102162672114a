//! Post-transfer collaborators: muxing/transcoding and subtitle generation.
//!
//! The orchestrator only talks to the traits here, so tests can swap in
//! in-process fakes for the ffmpeg and yt-dlp backed implementations.

pub mod ffmpeg;
pub mod subtitles;

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::downloader::MediaInfo;
use crate::errors::Result;

pub use ffmpeg::FfmpegMuxer;
pub use subtitles::YtDlpSubtitles;

/// Bitrate used when converting audio-only downloads to mp3.
pub const MP3_BITRATE_KBPS: u32 = 192;

/// Basic tags written into the container on merge/convert.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub comment: Option<String>,
}

impl MediaTags {
    pub fn from_media(info: &MediaInfo) -> Self {
        Self {
            title: Some(info.title.clone()),
            artist: info.uploader.clone(),
            comment: Some(info.webpage_url.clone()),
        }
    }

    pub(crate) fn pairs(&self) -> Vec<(&'static str, &str)> {
        [
            ("title", self.title.as_deref()),
            ("artist", self.artist.as_deref()),
            ("comment", self.comment.as_deref()),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.filter(|v| !v.is_empty()).map(|v| (key, v)))
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleRequest {
    pub source_url: String,
    pub languages: Vec<String>,
    pub auto_generated: bool,
}

#[async_trait]
pub trait Muxer: Send + Sync {
    /// Combines a video-only and an audio-only stream into `output`.
    async fn merge(&self, video: &Path, audio: &Path, output: &Path, tags: &MediaTags) -> Result<()>;

    /// Rewraps a single stream into the container implied by `output`.
    async fn remux(&self, input: &Path, output: &Path, tags: &MediaTags) -> Result<()>;

    async fn extract_audio(&self, input: &Path, output: &Path, bitrate_kbps: u32, tags: &MediaTags) -> Result<()>;

    async fn embed_subtitles(&self, media: &Path, subtitles: &[PathBuf], output: &Path) -> Result<()>;
}

#[async_trait]
pub trait SubtitlePipeline: Send + Sync {
    /// Writes timed-text files next to `media` and returns their paths.
    async fn generate(&self, media: &Path, request: &SubtitleRequest) -> Result<Vec<PathBuf>>;
}
