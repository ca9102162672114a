use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::downloader::playlist::PlaylistSummary;
use crate::downloader::{TaskId, TaskState};
use crate::utils::format_file_size;

/// Records closer than this (in percent) within one stage are coalesced.
const MIN_PERCENT_STEP: f32 = 0.1;

/// Shortest interval between two speed samples.
const SPEED_WINDOW: Duration = Duration::from_millis(250);

/// Weight of the newest sample in the smoothed speed.
const SPEED_SMOOTHING: f64 = 0.3;

/// Finished task ids remembered so late events stay dropped.
const FINISHED_MEMORY: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolving,
    Selecting,
    Transferring,
    Finalizing,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

/// Normalized progress record handed to the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub task_id: TaskId,
    pub percent: f32,
    pub stage: Stage,
    pub human_readable_size: String,
    /// Smoothed transfer rate in bytes per second, once measurable.
    pub speed_bps: Option<f64>,
    /// Seconds left at the current rate; needs a known total.
    pub eta_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DownloadEvent {
    Progress(ProgressRecord),
    TaskFinished { task_id: TaskId, title: Option<String>, state: TaskState, error: Option<String> },
    PlaylistFinished(PlaylistSummary),
}

#[derive(Debug, Default)]
struct TaskProgress {
    percent: f32,
    stage: Option<Stage>,
    sample: Option<(Instant, u64)>,
    speed_bps: Option<f64>,
}

impl TaskProgress {
    fn observe(&mut self, now: Instant, bytes_done: u64) {
        let (at, bytes) = match self.sample {
            Some(sample) => sample,
            None => {
                self.sample = Some((now, bytes_done));
                return;
            }
        };
        if bytes_done < bytes {
            // A restarted stream invalidates the rate.
            self.sample = Some((now, bytes_done));
            self.speed_bps = None;
            return;
        }
        let elapsed = now.saturating_duration_since(at);
        if elapsed < SPEED_WINDOW {
            return;
        }

        let current = (bytes_done - bytes) as f64 / elapsed.as_secs_f64();
        self.speed_bps = Some(match self.speed_bps {
            Some(previous) => SPEED_SMOOTHING * current + (1.0 - SPEED_SMOOTHING) * previous,
            None => current,
        });
        self.sample = Some((now, bytes_done));
    }

    fn eta_secs(&self, bytes_done: u64, bytes_total: Option<u64>) -> Option<u64> {
        let speed = self.speed_bps.filter(|s| *s > 0.0)?;
        let remaining = bytes_total?.saturating_sub(bytes_done);
        Some((remaining as f64 / speed).round() as u64)
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    active: HashMap<TaskId, TaskProgress>,
    finished: HashSet<TaskId>,
    finished_order: VecDeque<TaskId>,
}

impl ProgressState {
    /// Drops the live entry and remembers the id, oldest ids first out.
    fn retire(&mut self, task_id: &str) {
        self.active.remove(task_id);
        if self.finished.insert(task_id.to_string()) {
            self.finished_order.push_back(task_id.to_string());
        }
        while self.finished_order.len() > FINISHED_MEMORY {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    fn revive(&mut self, task_id: &str) {
        if self.finished.remove(task_id) {
            self.finished_order.retain(|id| id != task_id);
        }
        self.active.insert(task_id.to_string(), TaskProgress::default());
    }
}

/// Turns byte/stage events into monotonic per-task records.
///
/// Never blocks: the lock is held for a few arithmetic operations and the
/// channel is unbounded. Only running tasks keep live state; finished ones
/// leave a bounded tombstone behind.
#[derive(Clone)]
pub struct ProgressAggregator {
    state: Arc<Mutex<ProgressState>>,
    events: UnboundedSender<DownloadEvent>,
}

impl ProgressAggregator {
    pub fn new(events: UnboundedSender<DownloadEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProgressState::default())),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_event(&self, task_id: &str, stage: Stage, bytes_done: u64, bytes_total: Option<u64>) {
        self.on_event_at(Instant::now(), task_id, stage, bytes_done, bytes_total);
    }

    fn on_event_at(&self, now: Instant, task_id: &str, stage: Stage, bytes_done: u64, bytes_total: Option<u64>) {
        let record = {
            let mut state = self.lock();
            if state.finished.contains(task_id) {
                return;
            }
            let progress = state.active.entry(task_id.to_string()).or_default();

            if stage == Stage::Transferring {
                progress.observe(now, bytes_done);
            }

            let computed = match bytes_total {
                Some(total) if total > 0 => (bytes_done as f64 / total as f64 * 100.0) as f32,
                _ => progress.percent,
            };
            let percent = computed.clamp(0.0, 100.0).max(progress.percent);

            let stage_changed = progress.stage != Some(stage);
            let moved = percent - progress.percent >= MIN_PERCENT_STEP;
            let unknown_total = bytes_total.is_none() && stage == Stage::Transferring;
            if !(stage_changed || moved || unknown_total) {
                return;
            }

            progress.percent = percent;
            progress.stage = Some(stage);
            let (speed_bps, eta_secs) = if stage == Stage::Transferring {
                (progress.speed_bps, progress.eta_secs(bytes_done, bytes_total))
            } else {
                (None, None)
            };

            if stage.is_terminal() {
                state.retire(task_id);
            }

            ProgressRecord {
                task_id: task_id.to_string(),
                percent,
                stage,
                human_readable_size: human_size(bytes_done, bytes_total),
                speed_bps,
                eta_secs,
            }
        };

        self.emit(DownloadEvent::Progress(record));
    }

    pub fn stage(&self, task_id: &str, stage: Stage) {
        self.on_event(task_id, stage, 0, None);
    }

    /// Explicit restart of a task; the only way percent may go down.
    pub fn reset(&self, task_id: &str) {
        self.lock().revive(task_id);
        self.emit(DownloadEvent::Progress(ProgressRecord {
            task_id: task_id.to_string(),
            percent: 0.0,
            stage: Stage::Resolving,
            human_readable_size: human_size(0, None),
            speed_bps: None,
            eta_secs: None,
        }));
    }

    /// Final record for a task; later events for it are dropped.
    pub fn finish(&self, task_id: &str, success: bool, bytes: u64) {
        if success {
            self.on_event(task_id, Stage::Completed, bytes, Some(bytes.max(1)));
        } else {
            // Failure keeps the last percent rather than jumping anywhere.
            let record = {
                let mut state = self.lock();
                if state.finished.contains(task_id) {
                    return;
                }
                let percent = state.active.get(task_id).map_or(0.0, |p| p.percent);
                state.retire(task_id);
                ProgressRecord {
                    task_id: task_id.to_string(),
                    percent,
                    stage: Stage::Failed,
                    human_readable_size: human_size(bytes, None),
                    speed_bps: None,
                    eta_secs: None,
                }
            };
            self.emit(DownloadEvent::Progress(record));
        }
    }

    /// Drops every trace of a task, tombstone included.
    pub fn forget(&self, task_id: &str) {
        let mut state = self.lock();
        state.active.remove(task_id);
        if state.finished.remove(task_id) {
            state.finished_order.retain(|id| id != task_id);
        }
    }

    pub fn emit(&self, event: DownloadEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.events.send(event);
    }
}

fn human_size(done: u64, total: Option<u64>) -> String {
    match total {
        Some(total) if total > 0 => format!("{} / {}", format_file_size(done), format_file_size(total)),
        _ => format_file_size(done),
    }
}
