use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Client, ClientBuilder, Proxy};
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::NetworkConfig;
use crate::downloader::ytdlp::Extractor;
use crate::downloader::{
    FormatCandidate, InfoSource, MediaInfo, PlaylistEntry, PlaylistMembership, ResourceIdentity,
};
use crate::errors::{AppError, Result};
use crate::utils::decode_html_entities;

/// Shared outbound sessions: one keep-alive HTTP client for lightweight
/// probing and transfers, plus a bounded gate in front of the heavyweight
/// extractor.
pub struct SessionPool {
    client: Client,
    permits: Semaphore,
    max_connections: usize,
    extractor: Arc<dyn Extractor>,
    config: NetworkConfig,
}

impl SessionPool {
    pub fn new(config: &NetworkConfig, extractor: Arc<dyn Extractor>) -> Result<Self> {
        Ok(Self {
            client: Self::build_client(config)?,
            permits: Semaphore::new(config.max_connections),
            max_connections: config.max_connections,
            extractor,
            config: config.clone(),
        })
    }

    fn build_client(config: &NetworkConfig) -> Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let mut builder = ClientBuilder::new()
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .connect_timeout(config.full_resolve_timeout())
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true);

        if config.insecure_tls {
            log::warn!("🔓 [HTTP] TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(proxy_url) = &config.proxy {
            log::info!("🌐 [HTTP] Routing sessions through proxy {}", proxy_url);
            builder = builder.proxy(Proxy::all(proxy_url)?);
        }

        Ok(builder.build()?)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Waits for a free session, bounded by the acquire timeout.
    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        match tokio::time::timeout(self.config.acquire_timeout(), self.permits.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(AppError::ResolutionFailed("session pool is closed".to_string())),
            Err(_) => Err(AppError::NetworkTransient(format!(
                "no free session within {:?} ({} in use)",
                self.config.acquire_timeout(),
                self.max_connections
            ))),
        }
    }

    async fn within<T>(budget: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(budget, fut)
            .await
            .map_err(|_| AppError::NetworkTransient(format!("{} timed out after {:?}", what, budget)))?
    }

    /// Lightweight metadata scrape of the resource page.
    pub async fn probe(&self, identity: &ResourceIdentity) -> Result<MediaInfo> {
        let _permit = self.acquire().await?;
        let page_url = format!(
            "{}{}",
            self.config.probe_base_url.trim_end_matches('/'),
            identity.page_path()
        );
        log::debug!("⚡ [PROBE] GET {}", page_url);

        let budget = self.config.fast_probe_timeout();
        let html = Self::within(budget, "fast probe", async {
            let response = self.client.get(&page_url).timeout(budget).send().await?;
            if !response.status().is_success() {
                return Err(AppError::from_status(response.status(), "probe"));
            }
            Ok(response.text().await?)
        })
        .await?;

        let mut info = if identity.is_playlist() {
            parse_playlist_page(&html, identity)?
        } else {
            parse_watch_page(&html, identity)?
        };

        if let Some(thumbnail_id) = info.thumbnail.take() {
            info.thumbnail = Some(self.best_thumbnail(&thumbnail_id).await);
        }

        log::info!(
            "⚡ [PROBE] {} -> '{}' ({} direct formats)",
            identity, info.title, info.formats.len()
        );
        Ok(info)
    }

    /// Thumbnail URL for a video id: maxres when it exists, else mqdefault.
    async fn best_thumbnail(&self, video_id: &str) -> String {
        let base = self.config.thumbnail_base_url.trim_end_matches('/');
        let fallback = format!("{}/vi/{}/mqdefault.jpg", base, video_id);
        let maxres = format!("{}/vi/{}/maxresdefault.jpg", base, video_id);

        let check = self
            .client
            .head(&maxres)
            .timeout(self.config.thumbnail_check_timeout())
            .send()
            .await;

        match check {
            Ok(response) if response.status().is_success() => maxres,
            _ => fallback,
        }
    }

    /// Full resolution through the extractor, bounded by the long budget.
    pub async fn resolve_full(&self, identity: &ResourceIdentity) -> Result<MediaInfo> {
        let _permit = self.acquire().await?;
        log::debug!("🐢 [RESOLVE] {} via {}", identity, self.extractor.name());
        Self::within(
            self.config.full_resolve_timeout(),
            "full resolution",
            self.extractor.extract(identity),
        )
        .await
    }

    pub async fn enumerate_playlist(&self, identity: &ResourceIdentity, limit: usize) -> Result<Vec<PlaylistEntry>> {
        let _permit = self.acquire().await?;
        let mut entries = Self::within(
            self.config.full_resolve_timeout(),
            "playlist enumeration",
            self.extractor.enumerate_playlist(identity, limit),
        )
        .await?;
        entries.truncate(limit);
        Ok(entries)
    }

    pub async fn fetch_thumbnail(&self, url: &str) -> Result<Vec<u8>> {
        let _permit = self.acquire().await?;
        let budget = self.config.fast_probe_timeout();
        Self::within(budget, "thumbnail fetch", async {
            let response = self.client.get(url).timeout(budget).send().await?;
            if !response.status().is_success() {
                return Err(AppError::from_status(response.status(), "thumbnail"));
            }
            Ok(response.bytes().await?.to_vec())
        })
        .await
    }
}

fn title_tag() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<title[^>]*>([^<]+)</title>").ok()).as_ref()
}

fn og_title() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"<meta\s+property="og:title"\s+content="([^"]*)""#).ok())
        .as_ref()
}

fn video_id_ref() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#""videoId":"([A-Za-z0-9_-]{11})""#).ok())
        .as_ref()
}

/// First JSON value assigned to `marker` inside an inline script.
fn embedded_json(html: &str, marker: &str) -> Option<Value> {
    let start = html.find(marker)? + marker.len();
    let rest = html[start..].trim_start_matches(|c: char| c == ' ' || c == '=');
    serde_json::Deserializer::from_str(rest)
        .into_iter::<Value>()
        .next()?
        .ok()
}

fn clean_title(raw: &str) -> Option<String> {
    let decoded = decode_html_entities(raw);
    let title = decoded.trim().trim_end_matches("- YouTube").trim();
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() || title == "YouTube" {
        None
    } else {
        Some(title)
    }
}

fn page_title(html: &str) -> Option<String> {
    title_tag()
        .and_then(|re| re.captures(html))
        .and_then(|caps| caps.get(1))
        .and_then(|m| clean_title(m.as_str()))
}

/// Scrapes title, duration and any direct-URL formats from a watch page.
/// The thumbnail field carries the video id; the caller turns it into a URL.
pub fn parse_watch_page(html: &str, identity: &ResourceIdentity) -> Result<MediaInfo> {
    let player = embedded_json(html, "ytInitialPlayerResponse");
    let details = player.as_ref().map(|p| &p["videoDetails"]);

    let title = details
        .and_then(|d| d["title"].as_str())
        .and_then(clean_title)
        .or_else(|| page_title(html))
        .ok_or_else(|| AppError::ResolutionFailed(format!("probe found no metadata for {}", identity)))?;

    let duration = details
        .and_then(|d| d["lengthSeconds"].as_str())
        .and_then(|s| s.parse::<f64>().ok());
    let uploader = details.and_then(|d| d["author"].as_str()).map(str::to_string);

    let (formats, withheld) = player
        .as_ref()
        .map(|p| streaming_formats(&p["streamingData"]))
        .unwrap_or_default();
    if withheld > 0 {
        log::debug!(
            "⚡ [PROBE] {} lists {} formats without a direct URL",
            identity, withheld
        );
    }

    Ok(MediaInfo {
        identity: identity.canonical(),
        title,
        duration,
        thumbnail: Some(identity.id().to_string()),
        webpage_url: identity.canonical_url(),
        uploader,
        formats,
        playlist: identity.playlist_id().map(|id| PlaylistMembership {
            id: id.to_string(),
            title: None,
            item_count: None,
        }),
        source: InfoSource::Probe,
        partial: withheld > 0,
    })
}

pub fn parse_playlist_page(html: &str, identity: &ResourceIdentity) -> Result<MediaInfo> {
    let title = og_title()
        .and_then(|re| re.captures(html))
        .and_then(|caps| caps.get(1))
        .and_then(|m| clean_title(m.as_str()))
        .or_else(|| page_title(html))
        .ok_or_else(|| AppError::ResolutionFailed(format!("probe found no metadata for {}", identity)))?;

    let mut video_ids: Vec<&str> = Vec::new();
    if let Some(re) = video_id_ref() {
        for caps in re.captures_iter(html) {
            if let Some(id) = caps.get(1).map(|m| m.as_str()) {
                if !video_ids.contains(&id) {
                    video_ids.push(id);
                }
            }
        }
    }

    Ok(MediaInfo {
        identity: identity.clone(),
        title: title.clone(),
        duration: None,
        thumbnail: video_ids.first().map(|id| id.to_string()),
        webpage_url: identity.canonical_url(),
        uploader: None,
        formats: Vec::new(),
        playlist: Some(PlaylistMembership {
            id: identity.id().to_string(),
            title: Some(title),
            item_count: Some(video_ids.len()),
        }),
        source: InfoSource::Probe,
        partial: false,
    })
}

/// Direct-URL formats plus the number of listed entries that had none.
fn streaming_formats(streaming: &Value) -> (Vec<FormatCandidate>, usize) {
    let progressive = streaming["formats"].as_array().into_iter().flatten().map(|f| (f, true));
    let adaptive = streaming["adaptiveFormats"].as_array().into_iter().flatten().map(|f| (f, false));

    let mut withheld = 0;
    let formats = progressive
        .chain(adaptive)
        .filter_map(|(format, muxed)| {
            let candidate = player_format(format, muxed);
            if candidate.is_none() {
                withheld += 1;
            }
            candidate
        })
        .collect();
    (formats, withheld)
}

/// One `streamingData` entry; `None` for ciphered entries without a plain URL.
fn player_format(format: &Value, muxed: bool) -> Option<FormatCandidate> {
    let url = format["url"].as_str()?;
    let itag = format["itag"].as_u64()?;
    let mime = format["mimeType"].as_str().unwrap_or_default();

    let (kind, rest) = mime.split_once('/')?;
    let container = rest.split(';').next().unwrap_or_default().trim();
    let codec = mime
        .split("codecs=\"")
        .nth(1)
        .and_then(|c| c.split(['"', ',']).next())
        .unwrap_or_default()
        .trim();
    let audio_only = kind == "audio";

    Some(FormatCandidate {
        format_id: itag.to_string(),
        url: Some(url.to_string()),
        height: if audio_only { 0 } else { format["height"].as_u64().unwrap_or(0) as u32 },
        width: format["width"].as_u64().map(|w| w as u32),
        codec: codec.to_string(),
        container: if audio_only && container == "mp4" { "m4a".to_string() } else { container.to_string() },
        filesize: format["contentLength"].as_str().and_then(|s| s.parse().ok()),
        bitrate_kbps: format["bitrate"].as_f64().map(|bps| bps / 1000.0),
        audio_only,
        has_audio: audio_only || muxed,
    })
}
