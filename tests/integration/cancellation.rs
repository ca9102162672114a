use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer};

use stream_scribe::downloader::progress::{DownloadEvent, Stage};
use stream_scribe::downloader::{DownloadRequest, PlaylistRequest, TaskState};
use stream_scribe::ErrorKind;

use super::common::*;

const STALL: Duration = Duration::from_secs(30);

/// Video responses hang for `STALL`; audio is served normally.
async fn mount_stalled_video(server: &MockServer, times: Option<u64>) {
    let mock = Mock::given(method("GET"))
        .and(path_regex(r"^/media/[^/]+/video$"))
        .respond_with(RangeResponder::new(video_body()).delayed(STALL));
    let mock = match times {
        Some(n) => mock.up_to_n_times(n),
        None => mock,
    };
    mock.mount(server).await;
}

async fn next_event(events: &mut UnboundedReceiver<DownloadEvent>) -> DownloadEvent {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn wait_for_transfer(events: &mut UnboundedReceiver<DownloadEvent>, task_id: Option<&str>) -> String {
    loop {
        if let DownloadEvent::Progress(record) = next_event(events).await {
            if record.stage == Stage::Transferring && task_id.map_or(true, |id| id == record.task_id) {
                return record.task_id;
            }
        }
    }
}

async fn wait_for_finish(events: &mut UnboundedReceiver<DownloadEvent>, wanted: &str) -> TaskState {
    loop {
        if let DownloadEvent::TaskFinished { task_id, state, .. } = next_event(events).await {
            if task_id == wanted {
                return state;
            }
        }
    }
}

fn single_request(dir: &std::path::Path) -> DownloadRequest {
    DownloadRequest {
        url: watch_url(VIDEO_ID),
        constraints: constraints(false),
        destination: dir.to_path_buf(),
        subtitles: false,
    }
}

fn slow_config(server: &MockServer, dir: &std::path::Path) -> stream_scribe::AppConfig {
    let mut config = test_config(server, dir);
    config.network.idle_timeout_ms = 60_000;
    config.network.full_resolve_timeout_ms = 60_000;
    config
}

#[tokio::test]
async fn test_cancel_mid_transfer() {
    let server = MockServer::start().await;
    mount_stalled_video(&server, None).await;
    mount_media(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(slow_config(&server, dir.path()), FakeExtractor::new(&server.uri()));

    let task_id = h.manager.submit(single_request(dir.path())).await.unwrap();
    wait_for_transfer(&mut h.events, Some(&task_id)).await;

    assert!(h.manager.cancel(&task_id));
    let state = wait_for_finish(&mut h.events, &task_id).await;
    assert_eq!(state, TaskState::Failed { kind: ErrorKind::Cancelled });

    // Nothing about this task may arrive after its terminal event.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let late = drain(&mut h.events);
    assert!(!late.iter().any(|e| matches!(
        e,
        DownloadEvent::Progress(record) if record.task_id == task_id
    )));

    let snapshot = h.manager.task(&task_id).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Failed { kind: ErrorKind::Cancelled });
    assert!(file_names(dir.path()).is_empty(), "{:?}", file_names(dir.path()));

    assert!(!h.manager.cancel(&task_id), "token is released after completion");
}

#[tokio::test]
async fn test_retry_after_cancel_completes() {
    let server = MockServer::start().await;
    // First video request stalls; later ones are served.
    mount_stalled_video(&server, Some(1)).await;
    mount_media(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(slow_config(&server, dir.path()), FakeExtractor::new(&server.uri()));

    let task_id = h.manager.submit(single_request(dir.path())).await.unwrap();
    wait_for_transfer(&mut h.events, Some(&task_id)).await;
    h.manager.cancel(&task_id);
    wait_for_finish(&mut h.events, &task_id).await;

    assert!(h.manager.retry_task(&task_id).await.unwrap());
    match next_event(&mut h.events).await {
        DownloadEvent::Progress(record) => {
            assert_eq!(record.task_id, task_id);
            assert_eq!(record.percent, 0.0);
        }
        other => panic!("expected a progress reset, got {:?}", other),
    }

    let state = wait_for_finish(&mut h.events, &task_id).await;
    assert!(matches!(state, TaskState::Completed { .. }), "{:?}", state);
    // The retry resolves again instead of trusting the old cache entry.
    assert_eq!(h.extractor.calls(), 2);

    // Completed tasks cannot be retried.
    assert!(!h.manager.retry_task(&task_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_job_skips_running_and_queued_tasks() {
    let server = MockServer::start().await;
    mount_stalled_video(&server, None).await;
    mount_media(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let entries: Vec<_> = (1..=3).map(|i| entry(i, &video_id(i), &format!("Track {}", i))).collect();
    let mut config = slow_config(&server, dir.path());
    config.max_concurrent_downloads = 1;
    let mut h = harness(config, FakeExtractor::new(&server.uri()).with_playlist(entries));

    let job_id = h
        .manager
        .submit_playlist(PlaylistRequest {
            url: PLAYLIST_URL.to_string(),
            constraints: constraints(false),
            destination: dir.path().to_path_buf(),
            subtitles: false,
        })
        .await
        .unwrap();

    wait_for_transfer(&mut h.events, None).await;
    assert!(h.manager.cancel_job(&job_id));

    let summary = loop {
        if let DownloadEvent::PlaylistFinished(summary) = next_event(&mut h.events).await {
            break summary;
        }
    };
    assert_eq!(summary.job_id, job_id);
    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (0, 0, 3));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, DownloadEvent::PlaylistFinished(_))));
    assert!(!h.manager.cancel_job(&job_id));
}

#[tokio::test]
async fn test_cancel_unknown_ids() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let h = harness(test_config(&server, dir.path()), FakeExtractor::new(&server.uri()));
    assert!(!h.manager.cancel("missing"));
    assert!(!h.manager.cancel_job("missing"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_retries_start_one_run() {
    let server = MockServer::start().await;
    mount_stalled_video(&server, None).await;
    mount_media(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = slow_config(&server, dir.path());
    config.max_concurrent_downloads = 1;
    let mut h = harness(config, FakeExtractor::new(&server.uri()).failing(VIDEO_ID));

    let task = h.manager.download(single_request(dir.path())).await.unwrap();
    assert_eq!(task.state, TaskState::Failed { kind: ErrorKind::ResolutionFailed });

    // Park the only worker so the accepted retry stays queued meanwhile.
    let mut blocker = single_request(dir.path());
    blocker.url = watch_url(&video_id(5));
    let blocker_id = h.manager.submit(blocker).await.unwrap();
    wait_for_transfer(&mut h.events, Some(&blocker_id)).await;
    assert_eq!(h.extractor.calls(), 2);

    let retries: Vec<_> = (0..8)
        .map(|_| {
            let manager = h.manager.clone();
            let id = task.id.clone();
            tokio::spawn(async move { manager.retry_task(&id).await.unwrap() })
        })
        .collect();
    let mut accepted = 0;
    for retry in retries {
        if retry.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(h.manager.task(&task.id).await.unwrap().state, TaskState::Pending);

    assert!(h.manager.cancel(&blocker_id));
    let state = wait_for_finish(&mut h.events, &task.id).await;
    assert_eq!(state, TaskState::Failed { kind: ErrorKind::ResolutionFailed });
    tokio::time::sleep(Duration::from_millis(200)).await;
    // One extra resolution, from the single accepted retry.
    assert_eq!(h.extractor.calls(), 3);
    assert!(!drain(&mut h.events).iter().any(|e| matches!(
        e,
        DownloadEvent::TaskFinished { task_id, .. } if *task_id == task.id
    )));
}

#[tokio::test]
async fn test_retried_playlist_member_follows_job_cancellation() {
    let server = MockServer::start().await;
    mount_stalled_video(&server, None).await;
    mount_media(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let entries: Vec<_> = (1..=3).map(|i| entry(i, &video_id(i), &format!("Track {}", i))).collect();
    let mut config = slow_config(&server, dir.path());
    config.max_concurrent_downloads = 1;
    let mut h = harness(
        config,
        FakeExtractor::new(&server.uri()).with_playlist(entries).failing(&video_id(1)),
    );

    let job_id = h
        .manager
        .submit_playlist(PlaylistRequest {
            url: PLAYLIST_URL.to_string(),
            constraints: constraints(false),
            destination: dir.path().to_path_buf(),
            subtitles: false,
        })
        .await
        .unwrap();

    let failed_id = loop {
        if let DownloadEvent::TaskFinished { task_id, state: TaskState::Failed { .. }, .. } = next_event(&mut h.events).await {
            break task_id;
        }
    };
    // The next member now holds the only worker slot.
    wait_for_transfer(&mut h.events, None).await;

    assert!(h.manager.retry_task(&failed_id).await.unwrap());
    assert!(h.manager.cancel_job(&job_id));

    let state = wait_for_finish(&mut h.events, &failed_id).await;
    assert_eq!(state, TaskState::Failed { kind: ErrorKind::Cancelled });
}
