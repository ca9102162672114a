//! Canonical identity of a remote media resource.
//!
//! Every URL shape the site hands out (`watch?v=`, `youtu.be/`, `/shorts/`,
//! `/embed/`, playlist links, links with tracking noise) is reduced to a
//! video id and/or playlist id so that equivalent inputs share one cache entry.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::errors::{AppError, Result};

const SUPPORTED_DOMAINS: [&str; 3] = ["youtube.com", "youtu.be", "youtube-nocookie.com"];

/// Path prefixes that carry the video id as their next segment.
const ID_PATH_PREFIXES: [&str; 5] = ["embed", "shorts", "live", "v", "e"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Video,
    Playlist,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    kind: ResourceKind,
    id: String,
    /// Playlist a video link was opened from. Not part of the cache key.
    playlist_id: Option<String>,
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

pub fn is_video_id(candidate: &str) -> bool {
    candidate.len() == 11 && candidate.chars().all(is_id_char)
}

fn is_playlist_id(candidate: &str) -> bool {
    (2..=64).contains(&candidate.len()) && candidate.chars().all(is_id_char)
}

impl ResourceIdentity {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AppError::InputInvalid("URL cannot be empty".to_string()));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| AppError::InputInvalid(format!("Invalid URL '{}': {}", trimmed, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::InputInvalid(format!("Unsupported scheme '{}'", url.scheme())));
        }

        let host = url
            .host_str()
            .ok_or_else(|| AppError::InputInvalid("URL must have a host".to_string()))?
            .to_ascii_lowercase();

        let is_supported = SUPPORTED_DOMAINS
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)));
        if !is_supported {
            return Err(AppError::InputInvalid(format!("Unsupported site: {}", host)));
        }

        let video_id = Self::video_id_from(&url, &host);
        let playlist_id = url
            .query_pairs()
            .find(|(key, _)| key == "list")
            .map(|(_, value)| value.into_owned())
            .filter(|value| is_playlist_id(value));

        match (video_id, playlist_id) {
            (Some(id), playlist_id) => Ok(Self { kind: ResourceKind::Video, id, playlist_id }),
            (None, Some(list)) => Ok(Self::playlist(list)),
            (None, None) => Err(AppError::InputInvalid(format!(
                "No video or playlist id in '{}'",
                trimmed
            ))),
        }
    }

    fn video_id_from(url: &Url, host: &str) -> Option<String> {
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let candidate = if host == "youtu.be" || host.ends_with(".youtu.be") {
            segments.first().map(|s| s.to_string())
        } else if let Some(v) = url.query_pairs().find(|(key, _)| key == "v") {
            Some(v.1.into_owned())
        } else {
            segments
                .windows(2)
                .find(|pair| ID_PATH_PREFIXES.contains(&pair[0]))
                .map(|pair| pair[1].to_string())
        };

        candidate.filter(|id| is_video_id(id))
    }

    /// Identity for a single video id, e.g. from a flat playlist listing.
    pub fn video(id: &str) -> Result<Self> {
        if !is_video_id(id) {
            return Err(AppError::InputInvalid(format!("Invalid video id '{}'", id)));
        }
        Ok(Self { kind: ResourceKind::Video, id: id.to_string(), playlist_id: None })
    }

    fn playlist(id: String) -> Self {
        Self { kind: ResourceKind::Playlist, playlist_id: Some(id.clone()), id }
    }

    /// The playlist itself, for playlists and for videos opened from one.
    pub fn as_playlist(&self) -> Option<Self> {
        match self.kind {
            ResourceKind::Playlist => Some(self.clone()),
            ResourceKind::Video => self.playlist_id.clone().map(Self::playlist),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_playlist(&self) -> bool {
        self.kind == ResourceKind::Playlist
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn playlist_id(&self) -> Option<&str> {
        self.playlist_id.as_deref()
    }

    /// Cache key: playlist membership and URL noise do not participate.
    pub fn cache_key(&self) -> String {
        match self.kind {
            ResourceKind::Video => format!("video:{}", self.id),
            ResourceKind::Playlist => format!("playlist:{}", self.id),
        }
    }

    /// Same resource with the playlist membership stripped.
    pub fn canonical(&self) -> Self {
        match self.kind {
            ResourceKind::Video => Self { kind: self.kind, id: self.id.clone(), playlist_id: None },
            ResourceKind::Playlist => self.clone(),
        }
    }

    pub fn canonical_url(&self) -> String {
        match self.kind {
            ResourceKind::Video => format!("https://www.youtube.com/watch?v={}", self.id),
            ResourceKind::Playlist => format!("https://www.youtube.com/playlist?list={}", self.id),
        }
    }

    /// Page fetched by the fast probe, relative to the configured base.
    pub fn page_path(&self) -> String {
        match self.kind {
            ResourceKind::Video => format!("/watch?v={}", self.id),
            ResourceKind::Playlist => format!("/playlist?list={}", self.id),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}
