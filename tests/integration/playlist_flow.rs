use stream_scribe::downloader::progress::DownloadEvent;
use stream_scribe::downloader::{PlaylistRequest, TaskState};
use stream_scribe::ErrorKind;
use wiremock::MockServer;

use super::common::*;

fn playlist_request(dir: &std::path::Path) -> PlaylistRequest {
    PlaylistRequest {
        url: PLAYLIST_URL.to_string(),
        constraints: constraints(false),
        destination: dir.to_path_buf(),
        subtitles: false,
    }
}

fn finished_summaries(events: &[DownloadEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, DownloadEvent::PlaylistFinished(_)))
        .count()
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_job() {
    let server = MockServer::start().await;
    mount_media(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let entries: Vec<_> = (1..=5).map(|i| entry(i, &video_id(i), &format!("Track {}", i))).collect();
    let extractor = FakeExtractor::new(&server.uri())
        .with_playlist(entries)
        .failing(&video_id(3));
    let mut config = test_config(&server, dir.path());
    config.max_concurrent_downloads = 2;
    let mut h = harness(config, extractor);

    let summary = h.manager.run_playlist(playlist_request(dir.path())).await.unwrap();
    assert_eq!(summary.total, 5);
    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (4, 1, 0));
    assert!(!summary.truncated);
    assert!(summary.error.is_none());
    assert!(!summary.all_succeeded());

    let tasks = h.manager.tasks().await;
    assert_eq!(tasks.len(), 5);
    assert!(tasks.iter().all(|t| t.job_id.as_deref() == Some(summary.job_id.as_str())));
    let failed: Vec<_> = tasks
        .iter()
        .filter(|t| matches!(t.state, TaskState::Failed { .. }))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].identity.id(), video_id(3));
    assert_eq!(failed[0].order, 3);

    let media_files = file_names(dir.path())
        .into_iter()
        .filter(|name| name.ends_with(".mp4"))
        .count();
    assert_eq!(media_files, 4);

    assert_eq!(finished_summaries(&drain(&mut h.events)), 1);
}

#[tokio::test]
async fn test_cap_and_unavailable_entries() {
    let server = MockServer::start().await;
    mount_media(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let entries = vec![
        entry(1, &video_id(1), "Track 1"),
        entry(2, &video_id(2), "[Private video]"),
        entry(3, &video_id(3), "Track 3"),
        entry(4, &video_id(4), "Track 4"),
        entry(5, &video_id(5), "Track 5"),
    ];
    let mut config = test_config(&server, dir.path());
    config.playlist.max_items = 3;
    let h = harness(config, FakeExtractor::new(&server.uri()).with_playlist(entries));

    let summary = h.manager.run_playlist(playlist_request(dir.path())).await.unwrap();
    assert!(summary.truncated);
    assert_eq!(summary.total, 3);
    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (2, 0, 1));
    assert!(summary.all_succeeded());

    // The private entry never became a task.
    assert_eq!(h.manager.tasks().await.len(), 2);
}

#[tokio::test]
async fn test_enumeration_failure_still_reports_once() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let extractor = FakeExtractor::new(&server.uri()).failing("PLtestlist01");
    let mut h = harness(test_config(&server, dir.path()), extractor);

    let err = h.manager.run_playlist(playlist_request(dir.path())).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResolutionFailed);

    let events = drain(&mut h.events);
    assert_eq!(finished_summaries(&events), 1);
    let summary = events
        .iter()
        .find_map(|e| match e {
            DownloadEvent::PlaylistFinished(summary) => Some(summary.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(summary.error, Some(ErrorKind::ResolutionFailed));
    assert_eq!(summary.total, 0);
}

#[tokio::test]
async fn test_video_link_with_list_runs_the_playlist() {
    let server = MockServer::start().await;
    mount_media(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![entry(1, &video_id(1), "Track 1"), entry(2, &video_id(2), "Track 2")];
    let h = harness(test_config(&server, dir.path()), FakeExtractor::new(&server.uri()).with_playlist(entries));

    let mut request = playlist_request(dir.path());
    request.url = format!("https://www.youtube.com/watch?v={}&list=PLtestlist01&index=2", VIDEO_ID);
    let summary = h.manager.run_playlist(request).await.unwrap();
    assert_eq!(summary.playlist_id, "PLtestlist01");
    assert_eq!(summary.succeeded, 2);
}
