use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use tokio::process::Command;

use crate::config::NetworkConfig;
use crate::errors::{AppError, Result};
use crate::processing::{MediaTags, Muxer};

/// ffmpeg-backed muxer; every call is one `ffmpeg -y -loglevel error ...` run.
pub struct FfmpegMuxer {
    binary: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Configured path first, then the first `ffmpeg` on PATH.
    pub fn from_config(config: &NetworkConfig) -> Self {
        let binary = locate(config.ffmpeg_path.as_deref()).unwrap_or_else(|| {
            log::warn!("⚠️ [FFMPEG] ffmpeg not found on PATH, merges and conversions will fail");
            PathBuf::from(binary_name())
        });
        Self::new(binary)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, args: Vec<OsString>) -> Result<()> {
        log::debug!("🎬 [FFMPEG] {:?} {:?}", self.binary, args);
        let output = Command::new(&self.binary)
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    AppError::Processing(format!("ffmpeg not found at {:?}", self.binary))
                }
                _ => AppError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.lines().last().unwrap_or("no output").trim().to_string();
            log::error!("❌ [FFMPEG] exited with {}: {}", output.status, message);
            return Err(AppError::Processing(format!("ffmpeg failed: {}", message)));
        }
        Ok(())
    }
}

fn binary_name() -> &'static str {
    if cfg!(windows) {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    }
}

pub fn locate(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        log::warn!("⚠️ [FFMPEG] Configured ffmpeg path {:?} does not exist", path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary_name()))
        .find(|candidate| candidate.is_file())
}

fn push_tags(args: &mut Vec<OsString>, tags: &MediaTags) {
    for (key, value) in tags.pairs() {
        args.push("-metadata".into());
        args.push(format!("{}={}", key, value).into());
    }
}

fn merge_args(video: &Path, audio: &Path, output: &Path, tags: &MediaTags) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-i".into(),
        video.into(),
        "-i".into(),
        audio.into(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "1:a:0".into(),
        "-c".into(),
        "copy".into(),
    ];
    push_tags(&mut args, tags);
    args.push(output.into());
    args
}

fn extract_audio_args(input: &Path, output: &Path, bitrate_kbps: u32, tags: &MediaTags) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-i".into(),
        input.into(),
        "-vn".into(),
        "-c:a".into(),
        "libmp3lame".into(),
        "-b:a".into(),
        format!("{}k", bitrate_kbps).into(),
    ];
    push_tags(&mut args, tags);
    args.push(output.into());
    args
}

fn embed_args(media: &Path, subtitles: &[PathBuf], output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-i".into(), media.into()];
    for subtitle in subtitles {
        args.push("-i".into());
        args.push(subtitle.into());
    }
    args.push("-map".into());
    args.push("0".into());
    for index in 1..=subtitles.len() {
        args.push("-map".into());
        args.push(index.to_string().into());
    }

    let is_mp4 = output
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("mp4"));
    args.extend(["-c".into(), "copy".into(), "-c:s".into()]);
    args.push(if is_mp4 { "mov_text" } else { "srt" }.into());

    for (index, subtitle) in subtitles.iter().enumerate() {
        if let Some(lang) = subtitle_language(subtitle) {
            args.push(format!("-metadata:s:s:{}", index).into());
            args.push(format!("language={}", lang).into());
        }
    }
    args.push(output.into());
    args
}

/// `Title [id].en.srt` -> `en`
fn subtitle_language(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let (_, lang) = stem.rsplit_once('.')?;
    (!lang.is_empty() && lang.len() <= 8).then(|| lang.to_string())
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn merge(&self, video: &Path, audio: &Path, output: &Path, tags: &MediaTags) -> Result<()> {
        log::info!("🎬 [FFMPEG] Merging streams into {:?}", output.file_name().unwrap_or_default());
        self.run(merge_args(video, audio, output, tags)).await
    }

    async fn remux(&self, input: &Path, output: &Path, tags: &MediaTags) -> Result<()> {
        let mut args: Vec<OsString> = vec!["-i".into(), input.into(), "-c".into(), "copy".into()];
        push_tags(&mut args, tags);
        args.push(output.into());
        self.run(args).await
    }

    async fn extract_audio(&self, input: &Path, output: &Path, bitrate_kbps: u32, tags: &MediaTags) -> Result<()> {
        log::info!("🎵 [FFMPEG] Converting audio to mp3 at {} kbps", bitrate_kbps);
        self.run(extract_audio_args(input, output, bitrate_kbps, tags)).await
    }

    async fn embed_subtitles(&self, media: &Path, subtitles: &[PathBuf], output: &Path) -> Result<()> {
        if subtitles.is_empty() {
            return Ok(());
        }
        log::info!("📝 [FFMPEG] Embedding {} subtitle track(s)", subtitles.len());
        self.run(embed_args(media, subtitles, output)).await
    }
}
