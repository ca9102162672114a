use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use serde::{Deserialize, Serialize};

use crate::downloader::identity::is_video_id;
use crate::downloader::{JobId, PlaylistEntry, ResourceIdentity, TaskState};
use crate::errors::ErrorKind;

/// Placeholder titles the site uses for entries that cannot be fetched.
const UNAVAILABLE_TITLES: [&str; 2] = ["[Private video]", "[Deleted video]"];

/// Aggregate result of one playlist job, emitted exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistSummary {
    pub job_id: JobId,
    pub playlist_id: String,
    pub title: Option<String>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// The playlist had more entries than the enumeration cap.
    pub truncated: bool,
    /// Set when the job could not even enumerate its members.
    pub error: Option<ErrorKind>,
}

impl PlaylistSummary {
    pub fn all_succeeded(&self) -> bool {
        self.error.is_none() && self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl TaskOutcome {
    /// Cancellation is a skip, not a failure, for reporting.
    pub fn of(state: &TaskState) -> Self {
        match state {
            TaskState::Completed { .. } => TaskOutcome::Succeeded,
            TaskState::Failed { kind: ErrorKind::Cancelled } => TaskOutcome::Skipped,
            TaskState::Failed { .. } => TaskOutcome::Failed,
            // A task that never reached a terminal state never ran.
            _ => TaskOutcome::Skipped,
        }
    }
}

/// Entries without a usable id, or known-unavailable placeholders.
pub fn is_unavailable(entry: &PlaylistEntry) -> bool {
    !is_video_id(&entry.id)
        || entry
            .title
            .as_deref()
            .map_or(false, |title| UNAVAILABLE_TITLES.contains(&title.trim()))
}

/// Counters for one running job. Workers record outcomes concurrently;
/// `finish` hands out the summary once.
#[derive(Debug)]
pub struct PlaylistJob {
    id: JobId,
    playlist_id: String,
    title: Option<String>,
    total: usize,
    truncated: bool,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    finished: AtomicBool,
}

impl PlaylistJob {
    pub fn new(id: JobId, identity: &ResourceIdentity, title: Option<String>, total: usize, truncated: bool) -> Self {
        Self {
            id,
            playlist_id: identity.id().to_string(),
            title,
            total,
            truncated,
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    pub fn record(&self, outcome: TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Succeeded => &self.succeeded,
            TaskOutcome::Failed => &self.failed,
            TaskOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst) + self.skipped.load(Ordering::SeqCst)
    }

    fn snapshot(&self, error: Option<ErrorKind>) -> PlaylistSummary {
        PlaylistSummary {
            job_id: self.id.clone(),
            playlist_id: self.playlist_id.clone(),
            title: self.title.clone(),
            total: self.total,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            truncated: self.truncated,
            error,
        }
    }

    /// `Some` on the first call only.
    pub fn finish(&self) -> Option<PlaylistSummary> {
        self.finish_with(None)
    }

    pub fn finish_with(&self, error: Option<ErrorKind>) -> Option<PlaylistSummary> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return None;
        }
        if self.recorded() != self.total && error.is_none() {
            log::warn!(
                "⚠️ [PLAYLIST] Job {} finishing with {} of {} outcomes recorded",
                self.id, self.recorded(), self.total
            );
        }
        Some(self.snapshot(error))
    }
}
