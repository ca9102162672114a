use std::process::Stdio;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::downloader::{
    FormatCandidate, InfoSource, MediaInfo, PlaylistEntry, PlaylistMembership, ResourceIdentity,
};
use crate::errors::{AppError, Result};

/// Heavyweight extraction boundary.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, identity: &ResourceIdentity) -> Result<MediaInfo>;

    /// Flat listing of a playlist, at most `limit` entries, in playlist order.
    async fn enumerate_playlist(&self, identity: &ResourceIdentity, limit: usize) -> Result<Vec<PlaylistEntry>>;

    fn name(&self) -> &str;
}

/// yt-dlp information extractor
pub struct YtDlpExtractor {
    ytdlp_path: String,
    user_agent: String,
    proxy: Option<String>,
    insecure_tls: bool,
}

impl YtDlpExtractor {
    pub fn new(ytdlp_path: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ytdlp_path: ytdlp_path.into(),
            user_agent: user_agent.into(),
            proxy: None,
            insecure_tls: false,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_insecure_tls(mut self, insecure_tls: bool) -> Self {
        self.insecure_tls = insecure_tls;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ytdlp_path);
        cmd.args(["--no-warnings", "--user-agent", &self.user_agent]);
        if self.insecure_tls {
            cmd.arg("--no-check-certificate");
        }
        if let Some(proxy) = &self.proxy {
            cmd.args(["--proxy", proxy]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_json(&self, mut cmd: Command, tag: &str) -> Result<String> {
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::ResolutionFailed(format!("'{}' was not found on PATH", self.ytdlp_path))
            } else {
                AppError::Io(e)
            }
        })?;
        log::debug!("📊 [{}] yt-dlp exit status: {}", tag, output.status);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|line| line.contains("ERROR"))
                .unwrap_or_else(|| stderr.trim());
            log::error!("❌ [{}] yt-dlp failed: {}", tag, message);
            return Err(AppError::from_extractor_message(message));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| AppError::ResolutionFailed(format!("Invalid UTF-8 in yt-dlp output: {}", e)))
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract(&self, identity: &ResourceIdentity) -> Result<MediaInfo> {
        let url = identity.canonical_url();
        log::info!("🔍 [EXTRACT] Running yt-dlp --dump-json for {}", url);

        let mut cmd = self.command();
        cmd.args(["--dump-json", "--no-playlist", &url]);
        let json = self.run_json(cmd, "EXTRACT").await?;

        let info: VideoInfo = serde_json::from_str(json.trim())?;
        log::info!("✅ [EXTRACT] Parsed video info: {} ({} formats)", info.title, info.formats.as_ref().map_or(0, Vec::len));
        Ok(info.into_media_info(identity))
    }

    async fn enumerate_playlist(&self, identity: &ResourceIdentity, limit: usize) -> Result<Vec<PlaylistEntry>> {
        let url = identity.canonical_url();
        log::info!("📜 [EXTRACT] Listing up to {} entries of {}", limit, url);

        let mut cmd = self.command();
        cmd.args([
            "--flat-playlist",
            "--dump-single-json",
            "--ignore-errors",
            "--playlist-end",
            &limit.to_string(),
            &url,
        ]);
        let json = self.run_json(cmd, "EXTRACT").await?;

        let listing: FlatPlaylist = serde_json::from_str(json.trim())?;
        let entries = listing.into_entries(limit);
        log::info!("📊 [EXTRACT] Playlist lists {} entries", entries.len());
        Ok(entries)
    }

    fn name(&self) -> &str {
        "yt-dlp"
    }
}

/// Video information from yt-dlp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub formats: Option<Vec<FormatInfo>>,
    pub playlist_id: Option<String>,
    pub playlist_title: Option<String>,
    pub playlist_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: String,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub abr: Option<f64>, // Audio bitrate
    pub tbr: Option<f64>, // Total bitrate
    pub filesize: Option<u64>,
    pub filesize_approx: Option<f64>,
    pub url: Option<String>,
    pub protocol: Option<String>,
}

impl FormatInfo {
    /// Only direct http(s) streams; storyboards and manifests are dropped.
    pub fn to_candidate(&self) -> Option<FormatCandidate> {
        let url = self.url.clone()?;
        if !matches!(self.protocol.as_deref(), None | Some("http") | Some("https")) {
            return None;
        }

        let vcodec = self.vcodec.as_deref().unwrap_or("none");
        let acodec = self.acodec.as_deref().unwrap_or("none");
        let has_video = vcodec != "none";
        let has_audio = acodec != "none";
        if !has_video && !has_audio {
            return None;
        }

        Some(FormatCandidate {
            format_id: self.format_id.clone(),
            url: Some(url),
            height: if has_video { self.height.unwrap_or(0) } else { 0 },
            width: self.width,
            codec: if has_video { vcodec } else { acodec }.to_string(),
            container: self.ext.clone(),
            filesize: self.filesize.or(self.filesize_approx.map(|size| size as u64)),
            bitrate_kbps: if has_video { self.tbr } else { self.abr.or(self.tbr) },
            audio_only: !has_video,
            has_audio,
        })
    }
}

impl VideoInfo {
    pub fn into_media_info(self, identity: &ResourceIdentity) -> MediaInfo {
        let formats = self
            .formats
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(FormatInfo::to_candidate)
            .collect();

        let playlist = self
            .playlist_id
            .clone()
            .or_else(|| identity.playlist_id().map(str::to_string))
            .map(|id| PlaylistMembership {
                id,
                title: self.playlist_title.clone(),
                item_count: self.playlist_count,
            });

        MediaInfo {
            identity: identity.canonical(),
            title: self.title,
            duration: self.duration,
            thumbnail: self.thumbnail,
            webpage_url: self.webpage_url.unwrap_or_else(|| identity.canonical_url()),
            uploader: self.uploader,
            formats,
            playlist,
            source: InfoSource::Extractor,
            partial: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    #[serde(default)]
    entries: Vec<Option<FlatEntry>>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
}

impl FlatPlaylist {
    fn into_entries(self, limit: usize) -> Vec<PlaylistEntry> {
        self.entries
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, entry)| {
                let entry = entry.unwrap_or(FlatEntry { id: None, title: None, duration: None });
                PlaylistEntry {
                    index: i + 1,
                    id: entry.id.unwrap_or_default(),
                    title: entry.title,
                    duration: entry.duration,
                }
            })
            .collect()
    }
}
