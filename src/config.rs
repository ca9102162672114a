use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use config::{Config, Environment, File};
use crate::errors::{AppError, Result};

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const ENV_PREFIX: &str = "STREAM_SCRIBE";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub download_path: PathBuf,
    pub max_concurrent_downloads: usize,
    pub default_quality: Quality,
    pub container: Container,
    pub audio_codec: AudioCodec,
    pub write_info_json: bool,
    pub cache: CacheConfig,
    pub network: NetworkConfig,
    pub retry: RetryConfig,
    pub selection: SelectionConfig,
    pub playlist: PlaylistConfig,
    pub subtitles: SubtitleConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    pub media_capacity: usize,
    pub thumbnail_capacity: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub fast_probe_timeout_ms: u64,
    pub thumbnail_check_timeout_ms: u64,
    pub full_resolve_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub chunk_size: u64,
    pub user_agent: String,
    pub probe_base_url: String,
    pub thumbnail_base_url: String,
    pub ytdlp_path: String,
    pub ffmpeg_path: Option<PathBuf>,
    pub proxy: Option<String>,
    /// Skip TLS certificate checks. Only for broken corporate proxies.
    pub insecure_tls: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub probe_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FloorRule {
    pub ceiling: u32,
    pub floor: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SelectionConfig {
    pub floor_relaxation: Vec<FloorRule>,
    pub min_height: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaylistConfig {
    pub max_items: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubtitleConfig {
    pub languages: Vec<String>,
    pub auto_generated: bool,
    pub embed: bool,
}

/// Quality ceiling ladder.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    #[serde(rename = "4K")]
    Q2160,
    #[serde(rename = "1440p")]
    Q1440,
    #[serde(rename = "1080p")]
    Q1080,
    #[serde(rename = "720p")]
    Q720,
    #[serde(rename = "480p")]
    Q480,
    #[serde(rename = "360p")]
    Q360,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mkv,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Mp3,
    Original,
}

impl Quality {
    pub const ALL: [Quality; 6] = [
        Quality::Q2160,
        Quality::Q1440,
        Quality::Q1080,
        Quality::Q720,
        Quality::Q480,
        Quality::Q360,
    ];

    pub fn height(&self) -> u32 {
        match self {
            Quality::Q2160 => 2160,
            Quality::Q1440 => 1440,
            Quality::Q1080 => 1080,
            Quality::Q720 => 720,
            Quality::Q480 => 480,
            Quality::Q360 => 360,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Quality::Q2160 => "4K",
            Quality::Q1440 => "1440p",
            Quality::Q1080 => "1080p",
            Quality::Q720 => "720p",
            Quality::Q480 => "480p",
            Quality::Q360 => "360p",
        }
    }
}

impl FromStr for Quality {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Quality::ALL
            .iter()
            .copied()
            .find(|q| {
                q.label().eq_ignore_ascii_case(wanted)
                    || wanted.trim_end_matches(['p', 'P']) == q.height().to_string()
            })
            .ok_or_else(|| AppError::InputInvalid(format!("Unknown quality '{}'", s)))
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
        }
    }
}

impl FromStr for Container {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(Container::Mp4),
            "mkv" => Ok(Container::Mkv),
            other => Err(AppError::InputInvalid(format!("Unsupported container '{}'", other))),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_path: dirs::download_dir()
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            max_concurrent_downloads: 3,
            default_quality: Quality::Q1080,
            container: Container::Mp4,
            audio_codec: AudioCodec::Mp3,
            write_info_json: true,
            cache: CacheConfig::default(),
            network: NetworkConfig::default(),
            retry: RetryConfig::default(),
            selection: SelectionConfig::default(),
            playlist: PlaylistConfig::default(),
            subtitles: SubtitleConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            media_capacity: 50,
            thumbnail_capacity: 30,
            ttl_secs: 3600,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout_ms: 5_000,
            fast_probe_timeout_ms: 1_500,
            thumbnail_check_timeout_ms: 800,
            full_resolve_timeout_ms: 30_000,
            idle_timeout_ms: 15_000,
            chunk_size: 10 * 1024 * 1024,
            user_agent: USER_AGENT.to_string(),
            probe_base_url: "https://www.youtube.com".to_string(),
            thumbnail_base_url: "https://img.youtube.com".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: None,
            proxy: None,
            insecure_tls: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            probe_attempts: 2,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            jitter_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            floor_relaxation: vec![
                FloorRule { ceiling: 1080, floor: 900 },
                FloorRule { ceiling: 720, floor: 540 },
            ],
            min_height: 144,
        }
    }
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self { max_items: 50 }
    }
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            languages: vec!["tr".to_string(), "en".to_string()],
            auto_generated: true,
            embed: true,
        }
    }
}

impl AppConfig {
    /// Defaults, then the user config file, then `STREAM_SCRIBE__*` variables.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&AppConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        match explicit_path {
            Some(path) => {
                log::info!("📄 [CONFIG] Loading configuration from {:?}", path);
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                if let Some(stem) = Self::default_config_stem() {
                    builder = builder.add_source(File::from(stem).required(false));
                }
            }
        }

        let config: AppConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("subtitles.languages"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// `<config_dir>/stream-scribe/config`, extension resolved by the loader.
    fn default_config_stem() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stream-scribe").join("config"))
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(message: impl Into<String>) -> AppError {
            AppError::Config(config::ConfigError::Message(message.into()))
        }

        if self.max_concurrent_downloads == 0 {
            return Err(invalid("max_concurrent_downloads must be at least 1"));
        }
        if self.cache.media_capacity == 0 || self.cache.thumbnail_capacity == 0 {
            return Err(invalid("cache capacities must be at least 1"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs must be positive"));
        }

        let net = &self.network;
        if net.max_connections == 0 {
            return Err(invalid("network.max_connections must be at least 1"));
        }
        let budgets = [
            ("acquire_timeout_ms", net.acquire_timeout_ms),
            ("fast_probe_timeout_ms", net.fast_probe_timeout_ms),
            ("thumbnail_check_timeout_ms", net.thumbnail_check_timeout_ms),
            ("full_resolve_timeout_ms", net.full_resolve_timeout_ms),
            ("idle_timeout_ms", net.idle_timeout_ms),
        ];
        if let Some((name, _)) = budgets.iter().find(|(_, value)| *value == 0) {
            return Err(invalid(format!("network.{} must be positive", name)));
        }
        if net.fast_probe_timeout_ms > net.full_resolve_timeout_ms {
            return Err(invalid("fast probe timeout cannot exceed the full resolution timeout"));
        }
        if net.chunk_size == 0 {
            return Err(invalid("network.chunk_size must be positive"));
        }
        for (name, base) in [
            ("probe_base_url", &net.probe_base_url),
            ("thumbnail_base_url", &net.thumbnail_base_url),
        ] {
            url::Url::parse(base).map_err(|e| invalid(format!("network.{}: {}", name, e)))?;
        }
        if let Some(proxy) = &net.proxy {
            url::Url::parse(proxy).map_err(|e| invalid(format!("network.proxy: {}", e)))?;
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 || retry.probe_attempts == 0 {
            return Err(invalid("retry attempts must be at least 1"));
        }
        if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
            return Err(invalid("retry.multiplier must be >= 1.0"));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms cannot exceed retry.max_delay_ms"));
        }

        for rule in &self.selection.floor_relaxation {
            if rule.floor > rule.ceiling {
                return Err(invalid(format!(
                    "floor {} is above its ceiling {}",
                    rule.floor, rule.ceiling
                )));
            }
        }

        if self.playlist.max_items == 0 {
            return Err(invalid("playlist.max_items must be at least 1"));
        }
        if self.subtitles.languages.iter().all(|lang| lang.trim().is_empty()) {
            return Err(invalid("subtitles.languages cannot be empty"));
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}

impl NetworkConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn fast_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_probe_timeout_ms)
    }

    pub fn thumbnail_check_timeout(&self) -> Duration {
        Duration::from_millis(self.thumbnail_check_timeout_ms)
    }

    pub fn full_resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.full_resolve_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
