//! In-process fakes for the extractor, muxer and subtitle collaborators, plus
//! a range-aware media responder for the mock CDN.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use stream_scribe::config::{AppConfig, Container, Quality};
use stream_scribe::downloader::progress::DownloadEvent;
use stream_scribe::downloader::ytdlp::Extractor;
use stream_scribe::downloader::{
    FormatCandidate, FormatConstraints, InfoSource, MediaInfo, PlaylistEntry, ResourceIdentity,
};
use stream_scribe::processing::{MediaTags, Muxer, SubtitlePipeline, SubtitleRequest};
use stream_scribe::{AppError, Collaborators, DownloadManager, Result};

pub const VIDEO_ID: &str = "dQw4w9WgXcQ";
pub const PLAYLIST_URL: &str = "https://www.youtube.com/playlist?list=PLtestlist01";
pub const TITLE: &str = "Test Clip";
pub const VIDEO_LEN: usize = 48 * 1024;
pub const AUDIO_LEN: usize = 16 * 1024;

pub fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", id)
}

/// Eleven-character id derived from a short seed.
pub fn video_id(seed: usize) -> String {
    format!("vid{:0>8}", seed)
}

/// Serves `bytes a-b` ranges of a fixed body the way a CDN does.
pub struct RangeResponder {
    body: Vec<u8>,
    delay: Option<Duration>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body, delay: None }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len();
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let template = match range {
            Some((start, end)) if start < total => {
                let end = end.min(total - 1);
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, total))
                    .set_body_bytes(self.body[start..=end].to_vec())
            }
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        };
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

pub fn video_body() -> Vec<u8> {
    vec![b'v'; VIDEO_LEN]
}

pub fn audio_body() -> Vec<u8> {
    vec![b'a'; AUDIO_LEN]
}

/// Mounts `/media/<id>/video` and `/media/<id>/audio` for every id.
pub async fn mount_media(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/[^/]+/video$"))
        .respond_with(RangeResponder::new(video_body()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/[^/]+/audio$"))
        .respond_with(RangeResponder::new(audio_body()))
        .mount(server)
        .await;
}

pub struct FakeExtractor {
    media_base: String,
    failing: HashSet<String>,
    playlist: Vec<PlaylistEntry>,
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn new(media_base: &str) -> Self {
        Self {
            media_base: media_base.trim_end_matches('/').to_string(),
            failing: HashSet::new(),
            playlist: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    pub fn with_playlist(mut self, entries: Vec<PlaylistEntry>) -> Self {
        self.playlist = entries;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn format(&self, id: &str, format_id: &str, kind: &str, height: u32, container: &str, len: usize) -> FormatCandidate {
        let audio_only = kind == "audio";
        FormatCandidate {
            format_id: format_id.to_string(),
            url: Some(format!("{}/media/{}/{}", self.media_base, id, kind)),
            height,
            width: None,
            codec: if audio_only { "mp4a.40.2" } else { "avc1.640028" }.to_string(),
            container: container.to_string(),
            filesize: Some(len as u64),
            bitrate_kbps: Some(if audio_only { 128.0 } else { 4000.0 }),
            audio_only,
            has_audio: audio_only,
        }
    }
}

pub fn entry(index: usize, id: &str, title: &str) -> PlaylistEntry {
    PlaylistEntry {
        index,
        id: id.to_string(),
        title: Some(title.to_string()),
        duration: Some(60.0),
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, identity: &ResourceIdentity) -> Result<MediaInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = identity.id();
        if self.failing.contains(id) {
            return Err(AppError::from_extractor_message("ERROR: Video unavailable"));
        }

        Ok(MediaInfo {
            identity: identity.canonical(),
            title: TITLE.to_string(),
            duration: Some(60.0),
            thumbnail: None,
            webpage_url: identity.canonical_url(),
            uploader: Some("Uploader".to_string()),
            formats: vec![
                self.format(id, "137", "video", 1080, "mp4", VIDEO_LEN),
                self.format(id, "140", "audio", 0, "m4a", AUDIO_LEN),
            ],
            playlist: None,
            source: InfoSource::Extractor,
            partial: false,
        })
    }

    async fn enumerate_playlist(&self, identity: &ResourceIdentity, limit: usize) -> Result<Vec<PlaylistEntry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(identity.id()) {
            return Err(AppError::from_extractor_message("ERROR: This playlist does not exist"));
        }
        Ok(self.playlist.iter().take(limit).cloned().collect())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Concatenates or copies inputs instead of invoking ffmpeg.
#[derive(Default)]
pub struct FakeMuxer {
    calls: Mutex<Vec<String>>,
}

impl FakeMuxer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl Muxer for FakeMuxer {
    async fn merge(&self, video: &Path, audio: &Path, output: &Path, _tags: &MediaTags) -> Result<()> {
        self.record("merge");
        let mut bytes = tokio::fs::read(video).await?;
        bytes.extend(tokio::fs::read(audio).await?);
        tokio::fs::write(output, bytes).await?;
        Ok(())
    }

    async fn remux(&self, input: &Path, output: &Path, _tags: &MediaTags) -> Result<()> {
        self.record("remux");
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn extract_audio(&self, input: &Path, output: &Path, _bitrate_kbps: u32, _tags: &MediaTags) -> Result<()> {
        self.record("extract_audio");
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn embed_subtitles(&self, media: &Path, _subtitles: &[PathBuf], output: &Path) -> Result<()> {
        self.record("embed_subtitles");
        tokio::fs::copy(media, output).await?;
        Ok(())
    }
}

/// Writes one `.en.srt` track next to the media file.
pub struct FakeSubtitles;

#[async_trait]
impl SubtitlePipeline for FakeSubtitles {
    async fn generate(&self, media: &Path, _request: &SubtitleRequest) -> Result<Vec<PathBuf>> {
        let track = media.with_extension("en.srt");
        tokio::fs::write(&track, "1\n00:00:00,000 --> 00:00:01,000\nhello\n").await?;
        Ok(vec![track])
    }
}

/// Fast retries and a probe base that points at the mock server.
pub fn test_config(server: &MockServer, download_dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.download_path = download_dir.to_path_buf();
    config.network.probe_base_url = server.uri();
    config.network.thumbnail_base_url = server.uri();
    config.network.fast_probe_timeout_ms = 1_000;
    config.network.thumbnail_check_timeout_ms = 500;
    config.network.full_resolve_timeout_ms = 5_000;
    config.network.idle_timeout_ms = 5_000;
    config.network.chunk_size = 8 * 1024;
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config.retry.jitter_ms = 0;
    config.subtitles.languages = vec!["en".to_string()];
    config
}

pub struct Harness {
    pub manager: DownloadManager,
    pub events: UnboundedReceiver<DownloadEvent>,
    pub extractor: Arc<FakeExtractor>,
    pub muxer: Arc<FakeMuxer>,
}

pub fn harness(config: AppConfig, extractor: FakeExtractor) -> Harness {
    let extractor = Arc::new(extractor);
    let muxer = Arc::new(FakeMuxer::default());
    let collaborators = Collaborators {
        extractor: extractor.clone(),
        muxer: muxer.clone(),
        subtitles: Arc::new(FakeSubtitles),
    };
    let (manager, events) = DownloadManager::new(Arc::new(config), collaborators).unwrap();
    Harness { manager, events, extractor, muxer }
}

pub fn constraints(audio_only: bool) -> FormatConstraints {
    FormatConstraints {
        container: Container::Mp4,
        quality: Quality::Q1080,
        audio_only,
    }
}

/// Everything currently queued on the event channel.
pub fn drain(events: &mut UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
