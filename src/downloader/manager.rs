use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, AudioCodec, Container};
use crate::downloader::cache::{CacheStats, MetadataCache};
use crate::downloader::format_selector::{select, select_audio, FloorPolicy};
use crate::downloader::http_pool::SessionPool;
use crate::downloader::playlist::{is_unavailable, PlaylistJob, PlaylistSummary, TaskOutcome};
use crate::downloader::progress::{DownloadEvent, ProgressAggregator, Stage};
use crate::downloader::retry::{RetryController, RetryPolicy};
use crate::downloader::transfer::ChunkedTransfer;
use crate::downloader::ytdlp::{Extractor, YtDlpExtractor};
use crate::downloader::{
    DownloadRequest, DownloadTask, FormatCandidate, FormatConstraints, JobId, MediaInfo, PlaylistRequest,
    ResourceIdentity, TaskId, TaskState,
};
use crate::errors::{AppError, Result};
use crate::processing::{
    FfmpegMuxer, MediaTags, Muxer, SubtitlePipeline, SubtitleRequest, YtDlpSubtitles, MP3_BITRATE_KBPS,
};
use crate::utils::{ensure_dir_exists, generate_download_id, media_file_stem, reserve_unique_path, sanitize_filename};

/// External tools the orchestrator hands work to.
pub struct Collaborators {
    pub extractor: Arc<dyn Extractor>,
    pub muxer: Arc<dyn Muxer>,
    pub subtitles: Arc<dyn SubtitlePipeline>,
}

impl Collaborators {
    /// yt-dlp for extraction and subtitles, ffmpeg for muxing.
    pub fn from_config(config: &AppConfig) -> Self {
        let net = &config.network;
        let muxer = FfmpegMuxer::from_config(net);
        let ffmpeg = Some(muxer.binary().to_path_buf()).filter(|path| path.is_absolute());

        Self {
            extractor: Arc::new(
                YtDlpExtractor::new(net.ytdlp_path.as_str(), net.user_agent.as_str())
                    .with_proxy(net.proxy.clone())
                    .with_insecure_tls(net.insecure_tls),
            ),
            subtitles: Arc::new(YtDlpSubtitles::new(net.ytdlp_path.as_str()).with_ffmpeg(ffmpeg)),
            muxer: Arc::new(muxer),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheReport {
    pub media: CacheStats,
    pub thumbnails: CacheStats,
}

/// How the transferred streams become the final file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    Merge,
    Single,
    AudioMp3,
    AudioOriginal,
}

#[derive(Debug, Clone)]
struct TransferPlan {
    streams: Vec<FormatCandidate>,
    output: OutputKind,
}

impl TransferPlan {
    fn build(
        info: &MediaInfo,
        constraints: &FormatConstraints,
        floor: &FloorPolicy,
        audio_codec: AudioCodec,
    ) -> Result<Self> {
        // Only streams with a direct URL can be fetched.
        let usable: Vec<FormatCandidate> = info.formats.iter().filter(|f| f.url.is_some()).cloned().collect();

        if constraints.audio_only {
            let audio = select_audio(&usable, constraints.container)?.clone();
            let output = match audio_codec {
                AudioCodec::Mp3 => OutputKind::AudioMp3,
                AudioCodec::Original => OutputKind::AudioOriginal,
            };
            return Ok(Self { streams: vec![audio], output });
        }

        let video = select(&usable, constraints.quality.height(), floor)?.clone();
        if video.is_video_only() {
            let audio = select_audio(&usable, constraints.container)?.clone();
            Ok(Self { streams: vec![video, audio], output: OutputKind::Merge })
        } else {
            Ok(Self { streams: vec![video], output: OutputKind::Single })
        }
    }

    fn extension(&self, container: Container) -> String {
        match self.output {
            OutputKind::Merge | OutputKind::Single => container.extension().to_string(),
            OutputKind::AudioMp3 => "mp3".to_string(),
            OutputKind::AudioOriginal => self
                .streams
                .first()
                .map(|s| s.container.to_ascii_lowercase())
                .unwrap_or_else(|| "m4a".to_string()),
        }
    }

    fn is_audio(&self) -> bool {
        matches!(self.output, OutputKind::AudioMp3 | OutputKind::AudioOriginal)
    }

    fn describe(&self) -> String {
        self.streams
            .iter()
            .map(|s| {
                if s.audio_only {
                    format!("{} ({}, audio)", s.format_id, s.container)
                } else {
                    format!("{} ({}p {} {})", s.format_id, s.height, s.codec, s.container)
                }
            })
            .collect::<Vec<_>>()
            .join(" + ")
    }
}

struct Finished {
    path: PathBuf,
    size: u64,
    subtitle_files: Vec<PathBuf>,
}

fn stage_of(state: &TaskState) -> Option<Stage> {
    match state {
        TaskState::Pending => None,
        TaskState::Resolving => Some(Stage::Resolving),
        TaskState::Selecting => Some(Stage::Selecting),
        TaskState::Transferring => Some(Stage::Transferring),
        TaskState::Finalizing => Some(Stage::Finalizing),
        TaskState::Completed { .. } => Some(Stage::Completed),
        TaskState::Failed { .. } => Some(Stage::Failed),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => log::debug!("🧹 [TASK] Removed {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("⚠️ [TASK] Could not remove {:?}: {}", path, e),
        }
    }
}

/// Owns the caches, the session pool and the worker pool, and drives each
/// task through `Resolving -> Selecting -> Transferring -> Finalizing`.
///
/// Cloning is cheap; every clone shares the same state.
#[derive(Clone)]
pub struct DownloadManager {
    config: Arc<AppConfig>,
    media_cache: Arc<MetadataCache<MediaInfo>>,
    thumbnail_cache: Arc<MetadataCache<Vec<u8>>>,
    pool: Arc<SessionPool>,
    muxer: Arc<dyn Muxer>,
    subtitles: Arc<dyn SubtitlePipeline>,
    floor: Arc<FloorPolicy>,
    retry: RetryPolicy,
    probe_retry: RetryPolicy,
    progress: ProgressAggregator,
    tasks: Arc<Mutex<HashMap<TaskId, DownloadTask>>>,
    task_tokens: Arc<StdMutex<HashMap<TaskId, CancellationToken>>>,
    job_tokens: Arc<StdMutex<HashMap<JobId, CancellationToken>>>,
    workers: Arc<Semaphore>,
}

impl DownloadManager {
    pub fn new(
        config: Arc<AppConfig>,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DownloadEvent>)> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pool = SessionPool::new(&config.network, collaborators.extractor)?;
        let retry = RetryPolicy::from_config(&config.retry);
        let probe_retry = retry.with_max_attempts(config.retry.probe_attempts);

        log::info!(
            "🚀 [MANAGER] Ready: {} workers, {} sessions, cache {}/{} entries",
            config.max_concurrent_downloads,
            config.network.max_connections,
            config.cache.media_capacity,
            config.cache.thumbnail_capacity
        );

        let manager = Self {
            media_cache: Arc::new(MetadataCache::new("media", config.cache.media_capacity, config.cache_ttl())),
            thumbnail_cache: Arc::new(MetadataCache::new(
                "thumbnails",
                config.cache.thumbnail_capacity,
                config.cache_ttl(),
            )),
            pool: Arc::new(pool),
            muxer: collaborators.muxer,
            subtitles: collaborators.subtitles,
            floor: Arc::new(FloorPolicy::from_config(&config.selection)),
            retry,
            probe_retry,
            progress: ProgressAggregator::new(events_tx),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            task_tokens: Arc::new(StdMutex::new(HashMap::new())),
            job_tokens: Arc::new(StdMutex::new(HashMap::new())),
            workers: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            config,
        };
        Ok((manager, events_rx))
    }

    fn lock_tokens(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.task_tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.job_tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- metadata ----

    /// Preview path: cached, probed, or fully resolved metadata for a URL.
    pub async fn analyze(&self, url: &str) -> Result<MediaInfo> {
        let identity = ResourceIdentity::parse(url)?;
        log::info!("🔍 [ANALYZE] {}", identity);
        self.resolve(&identity, false, &CancellationToken::new()).await
    }

    /// Cache, then fast probe, then full resolution. With `need_formats` a
    /// result without a downloadable format ladder does not count.
    async fn resolve(
        &self,
        identity: &ResourceIdentity,
        need_formats: bool,
        token: &CancellationToken,
    ) -> Result<MediaInfo> {
        if let Some(info) = self.media_cache.get(identity) {
            if !need_formats || info.is_complete() {
                log::debug!("💾 [CACHE] Hit for {}", identity);
                return Ok(info);
            }
            log::debug!("💾 [CACHE] {} has only probe data, resolving fully", identity);
        }

        let probe = RetryController::new(self.probe_retry)
            .with_cancellation(token.clone())
            .execute(&format!("probe {}", identity), move || self.pool.probe(identity))
            .await;

        match probe {
            Ok(info) if !need_formats || info.is_complete() => {
                self.media_cache.put(identity.clone(), info.clone());
                return Ok(info);
            }
            Ok(_) => log::info!("⚡ [PROBE] {} has an incomplete format ladder, using full resolution", identity),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => log::warn!("⚠️ [PROBE] {} failed ({}), using full resolution", identity, e),
        }

        let info = RetryController::new(self.retry)
            .with_cancellation(token.clone())
            .execute(&format!("resolve {}", identity), move || self.pool.resolve_full(identity))
            .await?;
        self.media_cache.put(identity.clone(), info.clone());
        Ok(info)
    }

    pub async fn thumbnail(&self, info: &MediaInfo) -> Result<Vec<u8>> {
        if let Some(bytes) = self.thumbnail_cache.get(&info.identity) {
            return Ok(bytes);
        }
        let url = info
            .thumbnail
            .as_deref()
            .ok_or_else(|| AppError::ResolutionFailed(format!("{} has no thumbnail", info.identity)))?;

        let bytes = RetryController::new(self.probe_retry)
            .execute("thumbnail", move || self.pool.fetch_thumbnail(url))
            .await?;
        self.thumbnail_cache.put(info.identity.clone(), bytes.clone());
        Ok(bytes)
    }

    /// Drops cached metadata and thumbnail for a URL so the next analysis
    /// starts fresh.
    pub fn invalidate(&self, url: &str) -> Result<bool> {
        let identity = ResourceIdentity::parse(url)?;
        let media = self.media_cache.invalidate(&identity);
        let thumbnail = self.thumbnail_cache.invalidate(&identity);
        if media || thumbnail {
            log::info!("🗑️ [CACHE] Invalidated {}", identity);
        }
        Ok(media || thumbnail)
    }

    pub fn cache_stats(&self) -> CacheReport {
        CacheReport {
            media: self.media_cache.stats(),
            thumbnails: self.thumbnail_cache.stats(),
        }
    }

    // ---- task registry ----

    pub async fn task(&self, task_id: &str) -> Option<DownloadTask> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Active tasks first, then by creation time and playlist position.
    pub async fn tasks(&self) -> Vec<DownloadTask> {
        let tasks = self.tasks.lock().await;
        let mut task_list: Vec<DownloadTask> = tasks.values().cloned().collect();

        let priority = |state: &TaskState| -> u8 {
            match state {
                TaskState::Transferring | TaskState::Finalizing => 1,
                TaskState::Resolving | TaskState::Selecting => 2,
                TaskState::Pending => 3,
                TaskState::Completed { .. } => 4,
                TaskState::Failed { .. } => 5,
            }
        };
        task_list.sort_by(|a, b| {
            priority(&a.state)
                .cmp(&priority(&b.state))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.order.cmp(&b.order))
        });
        task_list
    }

    async fn register(&self, task: DownloadTask, parent: Option<&CancellationToken>) -> TaskId {
        let id = task.id.clone();
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        self.lock_tokens().insert(id.clone(), token);
        self.tasks.lock().await.insert(id.clone(), task);
        id
    }

    async fn update<F>(&self, task_id: &str, apply: F)
    where
        F: FnOnce(&mut DownloadTask),
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(task_id) {
            apply(task);
        }
    }

    fn single_task(request: &DownloadRequest) -> Result<DownloadTask> {
        let identity = ResourceIdentity::parse(&request.url)?;
        if identity.is_playlist() {
            return Err(AppError::InputInvalid(format!(
                "'{}' is a playlist; submit it as a playlist job",
                request.url
            )));
        }
        Ok(DownloadTask::new(identity, request))
    }

    // ---- single downloads ----

    /// Validates the request, registers a `Pending` task and runs it on the
    /// worker pool in the background.
    pub async fn submit(&self, request: DownloadRequest) -> Result<TaskId> {
        let task = Self::single_task(&request)?;
        let task_id = self.register(task, None).await;
        log::info!("📥 [TASK] {} queued for {}", short_id(&task_id), request.url);

        let manager = self.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            manager.execute_task(&id).await;
        });
        Ok(task_id)
    }

    /// Same as [`submit`](Self::submit) but awaits the terminal snapshot.
    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadTask> {
        let task = Self::single_task(&request)?;
        let task_id = self.register(task, None).await;
        self.execute_task(&task_id)
            .await
            .ok_or_else(|| AppError::Processing(format!("task {} left the registry", task_id)))
    }

    /// Re-runs a failed task from scratch. Its progress is reset and its
    /// metadata re-resolved. A playlist member stays under its job's
    /// cancellation while the job is running.
    pub async fn retry_task(&self, task_id: &str) -> Result<bool> {
        let (identity, job_id) = {
            let mut tasks = self.tasks.lock().await;
            let Some(task) = tasks.get_mut(task_id) else {
                return Ok(false);
            };
            if !matches!(task.state, TaskState::Failed { .. }) {
                return Ok(false);
            }
            task.state = TaskState::Pending;
            task.error = None;
            task.started_at = None;
            task.completed_at = None;
            (task.identity.clone(), task.job_id.clone())
        };

        self.media_cache.invalidate(&identity);
        let token = job_id
            .as_deref()
            .and_then(|job_id| self.lock_jobs().get(job_id).map(CancellationToken::child_token))
            .unwrap_or_else(CancellationToken::new);
        self.lock_tokens().insert(task_id.to_string(), token);
        self.progress.reset(task_id);
        log::info!("🔁 [TASK] {} retrying", short_id(task_id));

        let manager = self.clone();
        let id = task_id.to_string();
        tokio::spawn(async move {
            manager.execute_task(&id).await;
        });
        Ok(true)
    }

    /// Drops finished tasks from the registry along with their progress
    /// state, and purges expired cache entries. Returns the tasks removed.
    pub async fn clear_finished(&self) -> usize {
        let removed: Vec<TaskId> = {
            let mut tasks = self.tasks.lock().await;
            let finished: Vec<TaskId> = tasks
                .iter()
                .filter(|(_, task)| task.state.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &finished {
                tasks.remove(id);
            }
            finished
        };
        for id in &removed {
            self.progress.forget(id);
        }

        let expired = self.media_cache.purge_expired() + self.thumbnail_cache.purge_expired();
        log::info!(
            "🧹 [MANAGER] Cleared {} finished task(s), {} expired cache entries",
            removed.len(),
            expired
        );
        removed.len()
    }

    /// Runs one registered task to a terminal state and returns its snapshot.
    async fn execute_task(&self, task_id: &str) -> Option<DownloadTask> {
        let token = self
            .lock_tokens()
            .get(task_id)
            .cloned()
            .unwrap_or_else(CancellationToken::new);

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(AppError::Cancelled),
            permit = self.workers.clone().acquire_owned() => match permit {
                Ok(_permit) => self.process(task_id, &token).await,
                Err(_) => Err(AppError::Processing("worker pool is closed".to_string())),
            },
        };

        let snapshot = self.complete(task_id, outcome).await;
        self.lock_tokens().remove(task_id);
        snapshot
    }

    async fn transition(&self, task_id: &str, state: TaskState, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        log::info!("🔄 [TASK] {} -> {}", short_id(task_id), state.name());
        let stage = stage_of(&state);
        self.update(task_id, |t| t.state = state).await;
        if let Some(stage) = stage {
            self.progress.stage(task_id, stage);
        }
        Ok(())
    }

    async fn process(&self, task_id: &str, token: &CancellationToken) -> Result<Finished> {
        let task = self
            .task(task_id)
            .await
            .ok_or_else(|| AppError::Processing(format!("unknown task {}", task_id)))?;
        self.update(task_id, |t| t.started_at = Some(chrono::Utc::now())).await;

        self.transition(task_id, TaskState::Resolving, token).await?;
        let info = self.resolve(&task.identity, true, token).await?;
        let title = info.title.clone();
        self.update(task_id, |t| t.title = Some(title)).await;

        self.transition(task_id, TaskState::Selecting, token).await?;
        let plan = TransferPlan::build(&info, &task.constraints, &self.floor, self.config.audio_codec)?;
        log::info!("🎯 [SELECT] {} -> {}", short_id(task_id), plan.describe());

        self.transition(task_id, TaskState::Transferring, token).await?;
        let parts = self.transfer(&task, &plan, token).await?;

        if let Err(e) = self.transition(task_id, TaskState::Finalizing, token).await {
            remove_files(&parts).await;
            return Err(e);
        }
        self.finalize(&task, &info, &plan, parts, token).await
    }

    async fn transfer(&self, task: &DownloadTask, plan: &TransferPlan, token: &CancellationToken) -> Result<Vec<PathBuf>> {
        ensure_dir_exists(&task.destination).await?;

        let combined: Option<u64> = plan.streams.iter().map(|s| s.filesize).sum();
        let mut parts = Vec::with_capacity(plan.streams.len());
        let mut done_before = 0u64;

        for stream in &plan.streams {
            let Some(url) = stream.url.as_deref() else {
                remove_files(&parts).await;
                return Err(AppError::NoAcceptableFormat { ceiling: stream.height });
            };
            let part = task
                .destination
                .join(format!(".{}.f{}.part", task.id, sanitize_filename(&stream.format_id)));
            parts.push(part.clone());

            let transfer = ChunkedTransfer::new(self.pool.client().clone(), &self.config.network, self.retry, token.clone());
            let progress = self.progress.clone();
            let task_id = task.id.clone();
            let base = done_before;
            let report = move |done: u64, total: Option<u64>| {
                let overall = combined.or_else(|| total.map(|t| base + t));
                progress.on_event(&task_id, Stage::Transferring, base + done, overall);
            };

            match transfer.run(url, &part, stream.filesize, &report).await {
                Ok(bytes) => {
                    log::debug!("📦 [TRANSFER] {} stream {} done ({} bytes)", short_id(&task.id), stream.format_id, bytes);
                    done_before += bytes;
                }
                Err(e) => {
                    remove_files(&parts).await;
                    return Err(e);
                }
            }
        }
        Ok(parts)
    }

    async fn finalize(
        &self,
        task: &DownloadTask,
        info: &MediaInfo,
        plan: &TransferPlan,
        parts: Vec<PathBuf>,
        token: &CancellationToken,
    ) -> Result<Finished> {
        if token.is_cancelled() {
            remove_files(&parts).await;
            return Err(AppError::Cancelled);
        }

        let ext = plan.extension(task.constraints.container);
        let stem = media_file_stem(&info.title, info.identity.id());
        let output = match reserve_unique_path(&task.destination, &stem, &ext).await {
            Ok(path) => path,
            Err(e) => {
                remove_files(&parts).await;
                return Err(e);
            }
        };

        let tags = MediaTags::from_media(info);
        let produced = match (plan.output, parts.as_slice()) {
            (OutputKind::Merge, [video, audio]) => self.muxer.merge(video, audio, &output, &tags).await,
            (OutputKind::AudioMp3, [audio]) => {
                self.muxer.extract_audio(audio, &output, MP3_BITRATE_KBPS, &tags).await
            }
            (OutputKind::Single, [single])
                if !plan.streams.first().map_or(false, |s| s.container.eq_ignore_ascii_case(&ext)) =>
            {
                self.muxer.remux(single, &output, &tags).await
            }
            (OutputKind::Single | OutputKind::AudioOriginal, [single]) => {
                tokio::fs::rename(single, &output).await.map_err(AppError::from)
            }
            (kind, parts) => Err(AppError::Processing(format!(
                "{:?} output cannot be built from {} stream(s)",
                kind,
                parts.len()
            ))),
        };
        remove_files(&parts).await;

        if let Err(e) = produced {
            remove_files(std::slice::from_ref(&output)).await;
            return Err(e);
        }

        if self.config.write_info_json {
            if let Err(e) = write_info_json(&output, info, plan).await {
                log::warn!("⚠️ [TASK] Could not write info.json for {:?}: {}", output, e);
            }
        }

        let mut subtitle_files = Vec::new();
        if task.subtitles {
            match self.attach_subtitles(&output, info, plan.is_audio()).await {
                Ok(files) => subtitle_files = files,
                Err(e) => log::warn!("⚠️ [SUBS] Subtitles for {:?} failed: {}", output, e),
            }
        }

        let size = tokio::fs::metadata(&output).await?.len();
        log::info!("✅ [TASK] {} saved {:?} ({} bytes)", short_id(&task.id), output, size);
        Ok(Finished { path: output, size, subtitle_files })
    }

    async fn attach_subtitles(&self, output: &Path, info: &MediaInfo, audio: bool) -> Result<Vec<PathBuf>> {
        let request = SubtitleRequest {
            source_url: info.identity.canonical_url(),
            languages: self.config.subtitles.languages.clone(),
            auto_generated: self.config.subtitles.auto_generated,
        };
        let files = self.subtitles.generate(output, &request).await?;

        if self.config.subtitles.embed && !audio && !files.is_empty() {
            let ext = output.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
            let embedded = output.with_extension(format!("subs.{}", ext));
            if let Err(e) = self.muxer.embed_subtitles(output, &files, &embedded).await {
                remove_files(std::slice::from_ref(&embedded)).await;
                return Err(e);
            }
            tokio::fs::rename(&embedded, output).await?;
        }
        Ok(files)
    }

    async fn complete(&self, task_id: &str, outcome: Result<Finished>) -> Option<DownloadTask> {
        let (state, error, subtitle_files, size) = match outcome {
            Ok(done) => (
                TaskState::Completed { path: done.path, size: done.size },
                None,
                done.subtitle_files,
                done.size,
            ),
            Err(e) => {
                let kind = e.kind();
                if e.is_cancelled() {
                    log::info!("⏹️ [TASK] {} cancelled", short_id(task_id));
                } else {
                    log::error!("❌ [TASK] {} failed ({}): {}", short_id(task_id), kind, e);
                }
                (TaskState::Failed { kind }, Some(e.to_string()), Vec::new(), 0)
            }
        };

        let success = matches!(state, TaskState::Completed { .. });
        let snapshot = {
            let mut tasks = self.tasks.lock().await;
            match tasks.get_mut(task_id) {
                Some(task) => {
                    task.state = state.clone();
                    task.error = error.clone();
                    task.subtitle_files = subtitle_files;
                    task.completed_at = Some(chrono::Utc::now());
                    Some(task.clone())
                }
                None => None,
            }
        };

        self.progress.finish(task_id, success, size);
        self.progress.emit(DownloadEvent::TaskFinished {
            task_id: task_id.to_string(),
            title: snapshot.as_ref().and_then(|t| t.title.clone()),
            state,
            error,
        });

        snapshot
    }

    // ---- playlists ----

    fn playlist_identity(url: &str) -> Result<ResourceIdentity> {
        ResourceIdentity::parse(url)?
            .as_playlist()
            .ok_or_else(|| AppError::InputInvalid(format!("'{}' is not a playlist URL", url)))
    }

    fn register_job(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock_jobs().insert(job_id.to_string(), token.clone());
        token
    }

    /// Starts a playlist job in the background and returns its id.
    pub async fn submit_playlist(&self, request: PlaylistRequest) -> Result<JobId> {
        let identity = Self::playlist_identity(&request.url)?;
        let job_id = generate_download_id();
        let token = self.register_job(&job_id);

        let manager = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.run_job(&id, &identity, &request, &token).await {
                log::error!("❌ [PLAYLIST] Job {} failed: {}", short_id(&id), e);
            }
        });
        Ok(job_id)
    }

    /// Runs a playlist job to completion and returns its summary.
    pub async fn run_playlist(&self, request: PlaylistRequest) -> Result<PlaylistSummary> {
        let identity = Self::playlist_identity(&request.url)?;
        let job_id = generate_download_id();
        let token = self.register_job(&job_id);
        self.run_job(&job_id, &identity, &request, &token).await
    }

    async fn run_job(
        &self,
        job_id: &str,
        identity: &ResourceIdentity,
        request: &PlaylistRequest,
        token: &CancellationToken,
    ) -> Result<PlaylistSummary> {
        let result = self.drive_job(job_id, identity, request, token).await;
        self.lock_jobs().remove(job_id);
        result
    }

    async fn drive_job(
        &self,
        job_id: &str,
        identity: &ResourceIdentity,
        request: &PlaylistRequest,
        token: &CancellationToken,
    ) -> Result<PlaylistSummary> {
        let limit = self.config.playlist.max_items;
        log::info!("📜 [PLAYLIST] Job {} enumerating {} (max {})", short_id(job_id), identity, limit);

        // One extra entry tells us whether the cap cut the listing short.
        let listing = RetryController::new(self.retry)
            .with_cancellation(token.clone())
            .execute(&format!("enumerate {}", identity), move || {
                self.pool.enumerate_playlist(identity, limit + 1)
            })
            .await;

        let mut entries = match listing {
            Ok(entries) => entries,
            Err(e) => {
                let job = PlaylistJob::new(job_id.to_string(), identity, None, 0, false);
                if let Some(summary) = job.finish_with(Some(e.kind())) {
                    self.progress.emit(DownloadEvent::PlaylistFinished(summary));
                }
                return Err(e);
            }
        };
        let truncated = entries.len() > limit;
        entries.truncate(limit);

        let title = self.media_cache.get(identity).map(|info| info.title);
        let job = PlaylistJob::new(job_id.to_string(), identity, title, entries.len(), truncated);
        if truncated {
            log::warn!("⚠️ [PLAYLIST] Listing capped at {} entries", limit);
        }

        let mut queue = VecDeque::with_capacity(entries.len());
        for entry in entries {
            let video = match ResourceIdentity::video(&entry.id) {
                Ok(video) if !is_unavailable(&entry) => video,
                _ => {
                    log::info!("⏭️ [PLAYLIST] Skipping entry {} ({:?})", entry.index, entry.title);
                    job.record(TaskOutcome::Skipped);
                    continue;
                }
            };

            let single = DownloadRequest {
                url: video.canonical_url(),
                constraints: request.constraints.clone(),
                destination: request.destination.clone(),
                subtitles: request.subtitles,
            };
            let mut task = DownloadTask::new(video, &single);
            task.job_id = Some(job_id.to_string());
            task.order = entry.index as u32;
            task.title = entry.title;
            queue.push_back(self.register(task, Some(token)).await);
        }

        let worker_count = self.config.max_concurrent_downloads.min(queue.len());
        log::info!(
            "📜 [PLAYLIST] Job {}: {} task(s) on {} worker(s)",
            short_id(job_id),
            queue.len(),
            worker_count
        );

        let queue = Mutex::new(queue);
        let (queue_ref, job_ref) = (&queue, &job);
        futures::future::join_all((0..worker_count).map(|_| async move {
            loop {
                let next = queue_ref.lock().await.pop_front();
                let Some(task_id) = next else { break };
                let outcome = self
                    .execute_task(&task_id)
                    .await
                    .map_or(TaskOutcome::Skipped, |snapshot| TaskOutcome::of(&snapshot.state));
                job_ref.record(outcome);
            }
        }))
        .await;

        let summary = job
            .finish()
            .ok_or_else(|| AppError::Processing(format!("playlist job {} finished twice", job_id)))?;
        log::info!(
            "🏁 [PLAYLIST] Job {} done: {} succeeded, {} failed, {} skipped",
            short_id(job_id),
            summary.succeeded,
            summary.failed,
            summary.skipped
        );
        self.progress.emit(DownloadEvent::PlaylistFinished(summary.clone()));
        Ok(summary)
    }

    // ---- cancellation ----

    pub fn cancel(&self, task_id: &str) -> bool {
        match self.lock_tokens().get(task_id) {
            Some(token) => {
                token.cancel();
                log::info!("⏹️ [TASK] Cancellation requested for {}", short_id(task_id));
                true
            }
            None => false,
        }
    }

    /// Cancels every task of a job. Tasks already completed stay completed.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        match self.lock_jobs().get(job_id) {
            Some(token) => {
                token.cancel();
                log::info!("⏹️ [PLAYLIST] Cancellation requested for job {}", short_id(job_id));
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let jobs: Vec<CancellationToken> = self.lock_jobs().values().cloned().collect();
        let tasks: Vec<CancellationToken> = self.lock_tokens().values().cloned().collect();
        log::info!("⏹️ [MANAGER] Cancelling {} job(s) and {} task(s)", jobs.len(), tasks.len());
        for token in jobs.iter().chain(tasks.iter()) {
            token.cancel();
        }
    }
}

async fn write_info_json(output: &Path, info: &MediaInfo, plan: &TransferPlan) -> Result<()> {
    let sidecar = serde_json::json!({
        "id": info.identity.id(),
        "title": info.title,
        "webpage_url": info.webpage_url,
        "uploader": info.uploader,
        "duration": info.duration,
        "format_ids": plan.streams.iter().map(|s| s.format_id.as_str()).collect::<Vec<_>>(),
        "height": plan.streams.iter().map(|s| s.height).max().filter(|h| *h > 0),
        "file": output.file_name().map(|name| name.to_string_lossy().into_owned()),
        "downloaded_at": chrono::Utc::now().to_rfc3339(),
    });
    let path = output.with_extension("info.json");
    tokio::fs::write(&path, serde_json::to_vec_pretty(&sidecar)?).await?;
    log::debug!("📝 [TASK] Wrote {:?}", path);
    Ok(())
}
