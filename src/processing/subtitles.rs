use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::{AppError, Result};
use crate::processing::{SubtitlePipeline, SubtitleRequest};

/// Fetches uploaded (and optionally auto-generated) subtitle tracks with
/// yt-dlp and converts them to `.srt` beside the media file.
pub struct YtDlpSubtitles {
    ytdlp_path: String,
    ffmpeg_location: Option<PathBuf>,
}

impl YtDlpSubtitles {
    pub fn new(ytdlp_path: impl Into<String>) -> Self {
        Self {
            ytdlp_path: ytdlp_path.into(),
            ffmpeg_location: None,
        }
    }

    pub fn with_ffmpeg(mut self, ffmpeg: Option<PathBuf>) -> Self {
        self.ffmpeg_location = ffmpeg;
        self
    }
}

/// yt-dlp treats `%` as a template marker.
fn output_template(media: &Path) -> Option<String> {
    let dir = media.parent()?;
    let stem = media.file_stem()?.to_str()?.replace('%', "%%");
    Some(dir.join(format!("{}.%(ext)s", stem)).to_string_lossy().into_owned())
}

/// `.srt` files named `<stem>.<lang>.srt` in the media's directory.
async fn collect_tracks(media: &Path) -> Result<Vec<PathBuf>> {
    let (Some(dir), Some(stem)) = (media.parent(), media.file_stem().and_then(|s| s.to_str())) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.", stem);

    let mut tracks = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) && name.ends_with(".srt") {
            tracks.push(entry.path());
        }
    }
    tracks.sort();
    Ok(tracks)
}

#[async_trait]
impl SubtitlePipeline for YtDlpSubtitles {
    async fn generate(&self, media: &Path, request: &SubtitleRequest) -> Result<Vec<PathBuf>> {
        let template = output_template(media)
            .ok_or_else(|| AppError::Processing(format!("Cannot derive subtitle path from {:?}", media)))?;
        let languages = request.languages.join(",");
        log::info!("📝 [SUBS] Requesting '{}' subtitles for {}", languages, request.source_url);

        let mut cmd = Command::new(&self.ytdlp_path);
        cmd.args(["--no-warnings", "--skip-download", "--write-subs"]);
        if request.auto_generated {
            cmd.arg("--write-auto-subs");
        }
        cmd.args(["--sub-langs", &languages, "--convert-subs", "srt", "-o", &template]);
        if let Some(ffmpeg) = &self.ffmpeg_location {
            cmd.arg("--ffmpeg-location").arg(ffmpeg);
        }
        cmd.arg(&request.source_url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::Processing(format!("'{}' was not found on PATH", self.ytdlp_path)),
            _ => AppError::Io(e),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Processing(format!("subtitle fetch failed: {}", stderr.trim())));
        }

        let tracks = collect_tracks(media).await?;
        if tracks.is_empty() {
            log::warn!("⚠️ [SUBS] No subtitle tracks available in {}", languages);
        } else {
            log::info!("✅ [SUBS] Wrote {} subtitle file(s)", tracks.len());
        }
        Ok(tracks)
    }
}
