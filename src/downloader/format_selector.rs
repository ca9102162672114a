use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::{Container, FloorRule, SelectionConfig};
use crate::errors::{AppError, Result};

/// One concrete encoding/resolution option for a media item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatCandidate {
    pub format_id: String,
    pub url: Option<String>,
    /// 0 for audio-only streams.
    pub height: u32,
    pub width: Option<u32>,
    pub codec: String,
    pub container: String,
    pub filesize: Option<u64>,
    pub bitrate_kbps: Option<f64>,
    pub audio_only: bool,
    /// Pre-muxed audio+video when true on a video stream.
    pub has_audio: bool,
}

impl FormatCandidate {
    pub fn is_progressive(&self) -> bool {
        !self.audio_only && self.has_audio
    }

    pub fn is_video_only(&self) -> bool {
        !self.audio_only && !self.has_audio
    }

    /// H.264 first since it plays and muxes everywhere.
    pub fn codec_rank(&self) -> u8 {
        let codec = self.codec.to_ascii_lowercase();
        if codec.starts_with("avc1") || codec.starts_with("h264") || codec.starts_with("mp4a") {
            3
        } else if codec.starts_with("vp09") || codec.starts_with("vp9") || codec.starts_with("opus") {
            2
        } else if codec.starts_with("av01") {
            1
        } else {
            0
        }
    }

    pub fn container_rank(&self) -> u8 {
        match self.container.to_ascii_lowercase().as_str() {
            "mp4" | "m4a" => 2,
            "webm" => 1,
            _ => 0,
        }
    }
}

/// Ideal height band per ceiling, plus the hard minimum height.
#[derive(Debug, Clone, PartialEq)]
pub struct FloorPolicy {
    pub rules: Vec<FloorRule>,
    pub min_height: u32,
}

impl FloorPolicy {
    pub fn from_config(config: &SelectionConfig) -> Self {
        Self {
            rules: config.floor_relaxation.clone(),
            min_height: config.min_height,
        }
    }

    /// Bottom of the ideal band for `ceiling`; lower picks are logged.
    pub fn floor_for(&self, ceiling: u32) -> u32 {
        self.rules
            .iter()
            .find(|rule| rule.ceiling == ceiling)
            .map(|rule| rule.floor.min(ceiling))
            .unwrap_or(ceiling)
    }
}

impl Default for FloorPolicy {
    fn default() -> Self {
        Self::from_config(&SelectionConfig::default())
    }
}

/// Total order: greater is better.
fn compare_video(a: &FormatCandidate, b: &FormatCandidate) -> Ordering {
    a.height
        .cmp(&b.height)
        .then_with(|| a.codec_rank().cmp(&b.codec_rank()))
        .then_with(|| a.container_rank().cmp(&b.container_rank()))
        .then_with(|| a.is_progressive().cmp(&b.is_progressive()))
        .then_with(|| b.format_id.cmp(&a.format_id))
}

fn compare_audio(a: &FormatCandidate, b: &FormatCandidate) -> Ordering {
    let bitrate = |c: &FormatCandidate| c.bitrate_kbps.unwrap_or(0.0);
    bitrate(a)
        .partial_cmp(&bitrate(b))
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.container_rank().cmp(&b.container_rank()))
        .then_with(|| a.codec_rank().cmp(&b.codec_rank()))
        .then_with(|| b.format_id.cmp(&a.format_id))
}

/// Picks the best video format at or below `ceiling`.
///
/// Height always dominates: the tallest stream in `[min_height, ceiling]`
/// wins, with codec, container and muxing only breaking ties. The ceiling
/// is never raised.
pub fn select<'a>(
    candidates: &'a [FormatCandidate],
    ceiling: u32,
    floor: &FloorPolicy,
) -> Result<&'a FormatCandidate> {
    let best = candidates
        .iter()
        .filter(|c| !c.audio_only && c.height >= floor.min_height.max(1) && c.height <= ceiling)
        .max_by(|a, b| compare_video(a, b))
        .ok_or(AppError::NoAcceptableFormat { ceiling })?;

    let band_floor = floor.floor_for(ceiling);
    if best.height < band_floor {
        log::debug!(
            "🎚️ [SELECT] Sparse ladder under {}p: nothing above {}p, settled for {} ({}p)",
            ceiling, band_floor, best.format_id, best.height
        );
    }
    Ok(best)
}

/// Best audio-only stream; m4a wins ties when the target is mp4.
pub fn select_audio(candidates: &[FormatCandidate], container: Container) -> Result<&FormatCandidate> {
    let audio = candidates.iter().filter(|c| c.audio_only);

    let preferred = audio
        .clone()
        .filter(|c| container != Container::Mp4 || c.container.eq_ignore_ascii_case("m4a"))
        .max_by(|a, b| compare_audio(a, b));

    preferred
        .or_else(|| audio.max_by(|a, b| compare_audio(a, b)))
        .ok_or(AppError::NoAcceptableFormat { ceiling: 0 })
}
