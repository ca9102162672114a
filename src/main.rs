use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::info;
use tokio::sync::mpsc::UnboundedReceiver;

use stream_scribe::config::{AppConfig, Container, Quality};
use stream_scribe::downloader::progress::{DownloadEvent, ProgressRecord};
use stream_scribe::downloader::{
    DownloadRequest, FormatConstraints, MediaInfo, PlaylistRequest, ResourceIdentity, TaskState,
};
use stream_scribe::utils::{format_duration, format_file_size};
use stream_scribe::{Collaborators, DownloadManager};

#[derive(Parser, Debug)]
#[command(name = "stream-scribe", version, about = "Download videos, audio and playlists with subtitles")]
struct Cli {
    /// Video or playlist URL
    url: String,

    /// Destination directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Quality ceiling: 4K, 1440p, 1080p, 720p, 480p or 360p
    #[arg(short, long)]
    quality: Option<Quality>,

    #[arg(long)]
    audio_only: bool,

    /// Output container for merged video: mp4 or mkv
    #[arg(long)]
    container: Option<Container>,

    /// Fetch subtitles after download
    #[arg(long)]
    subs: bool,

    /// Subtitle languages, comma separated
    #[arg(long, value_delimiter = ',')]
    sub_langs: Vec<String>,

    /// Only analyse the URL and print what is available
    #[arg(long)]
    info: bool,

    /// Configuration file (json, toml or yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    info!("Starting stream-scribe {}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            log::error!("❌ {:#}", e);
            std::process::exit(2);
        }
    }
}

/// `Ok(false)` when anything failed to download.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = &cli.output {
        config.download_path = dir.clone();
    }
    if !cli.sub_langs.is_empty() {
        config.subtitles.languages = cli.sub_langs.clone();
    }
    config.validate().context("validating configuration")?;
    let config = Arc::new(config);

    let (manager, events) = DownloadManager::new(config.clone(), Collaborators::from_config(&config))?;

    if cli.info {
        let media = manager.analyze(&cli.url).await?;
        print_info(&media);
        return Ok(true);
    }

    let multi = MultiProgress::new();
    let renderer = tokio::spawn(render_events(events, multi.clone()));
    let ctrl_c = tokio::spawn({
        let manager = manager.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("⏹️ Ctrl+C received, cancelling downloads...");
                manager.cancel_all();
            }
        }
    });

    let constraints = FormatConstraints {
        container: cli.container.unwrap_or(config.container),
        quality: cli.quality.unwrap_or(config.default_quality),
        audio_only: cli.audio_only,
    };
    let destination = config.download_path.clone();

    let identity = ResourceIdentity::parse(&cli.url)?;
    let succeeded = if identity.is_playlist() {
        // Warms the cache so the job summary carries the playlist title.
        match manager.analyze(&cli.url).await {
            Ok(media) => {
                let _ = multi.println(format!("📜 {}", media.title));
            }
            Err(e) => log::debug!("Playlist preview failed: {}", e),
        }
        let summary = manager
            .run_playlist(PlaylistRequest {
                url: cli.url.clone(),
                constraints,
                destination,
                subtitles: cli.subs,
            })
            .await?;
        summary.all_succeeded()
    } else {
        let task = manager
            .download(DownloadRequest {
                url: cli.url.clone(),
                constraints,
                destination,
                subtitles: cli.subs,
            })
            .await?;
        matches!(task.state, TaskState::Completed { .. })
    };

    ctrl_c.abort();
    drop(manager);
    let _ = tokio::time::timeout(Duration::from_secs(2), renderer).await;
    Ok(succeeded)
}

fn print_info(media: &MediaInfo) {
    println!("Title:    {}", media.title);
    if let Some(uploader) = &media.uploader {
        println!("Uploader: {}", uploader);
    }
    if let Some(duration) = media.duration {
        println!("Duration: {}", format_duration(duration));
    }
    if let Some(playlist) = &media.playlist {
        let count = playlist.item_count.map_or_else(|| "?".to_string(), |n| n.to_string());
        println!("Playlist: {} ({} items)", playlist.title.as_deref().unwrap_or(&playlist.id), count);
    }

    let mut video: Vec<_> = media.formats.iter().filter(|f| !f.audio_only).collect();
    video.sort_by(|a, b| b.height.cmp(&a.height).then_with(|| a.format_id.cmp(&b.format_id)));
    for format in video {
        let size = format.filesize.map(format_file_size).unwrap_or_default();
        let muxed = if format.is_progressive() { "av" } else { "v" };
        println!(
            "  {:>6} {:>5}p {:<4} {:<5} {:<14} {}",
            format.format_id, format.height, muxed, format.container, format.codec, size
        );
    }
    let audio = media.formats.iter().filter(|f| f.audio_only).count();
    if audio > 0 {
        println!("  + {} audio-only stream(s)", audio);
    }
}

/// Size line, plus rate and time left once they are known.
fn transfer_message(record: &ProgressRecord) -> String {
    let mut message = record.human_readable_size.clone();
    if let Some(speed) = record.speed_bps {
        message.push_str(&format!(" @ {}/s", format_file_size(speed as u64)));
    }
    if let Some(eta) = record.eta_secs {
        message.push_str(&format!(", ETA {}", format_duration(eta as f64)));
    }
    message
}

async fn render_events(mut events: UnboundedReceiver<DownloadEvent>, multi: MultiProgress) {
    let style = ProgressStyle::with_template("{spinner:.green} {prefix:>12} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            DownloadEvent::Progress(record) => {
                let bar = bars.entry(record.task_id.clone()).or_insert_with(|| {
                    let bar = multi.add(ProgressBar::new(1000));
                    bar.set_style(style.clone());
                    bar
                });
                bar.set_prefix(format!("{:?}", record.stage).to_lowercase());
                bar.set_position((record.percent * 10.0).round() as u64);
                bar.set_message(transfer_message(&record));
            }
            DownloadEvent::TaskFinished { task_id, title, state, error } => {
                if let Some(bar) = bars.remove(&task_id) {
                    bar.finish_and_clear();
                }
                let title = title.unwrap_or(task_id);
                let line = match state {
                    TaskState::Completed { path, size } => {
                        format!("✅ {} -> {} ({})", title, path.display(), format_file_size(size))
                    }
                    TaskState::Failed { kind } => {
                        format!("❌ {}: {} ({})", title, kind, error.unwrap_or_default())
                    }
                    other => format!("• {}: {}", title, other.name()),
                };
                let _ = multi.println(line);
            }
            DownloadEvent::PlaylistFinished(summary) => {
                let mut line = format!(
                    "🏁 {}: {} succeeded, {} failed, {} skipped of {}",
                    summary.title.as_deref().unwrap_or(&summary.playlist_id),
                    summary.succeeded,
                    summary.failed,
                    summary.skipped,
                    summary.total
                );
                if summary.truncated {
                    line.push_str(" (listing capped)");
                }
                if let Some(kind) = summary.error {
                    line.push_str(&format!(" [{}]", kind));
                }
                let _ = multi.println(line);
            }
        }
    }
}
