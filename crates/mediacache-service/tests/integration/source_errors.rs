use std::time::Duration;

use mediacache_service::fetch::{FetchError, FetchState};

use crate::setup_registry;

#[tokio::test]
async fn test_missing_media() {
    let (registry, work_dir) = setup_registry(|_| {});
    let server = mediacache_test::Server::new();

    let url = server.url("/respond_statuscode/404/gone.mp4");
    let entry = registry.get_cache(url.as_str(), None);

    assert!(matches!(
        entry.get_file_async().await,
        Err(FetchError::SourceUnavailable(_))
    ));
    entry.release();

    // the failure sticks to the resident entry
    let entry = registry.get_cache(url.as_str(), None);
    assert_eq!(entry.state(), FetchState::Error);
    assert!(entry.get_file_async().await.is_err());
    assert_eq!(server.accesses(), 1);

    // nothing is left behind in the work directory
    assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_download_timeout() {
    let (registry, _work_dir) = setup_registry(|config| {
        config.max_download_timeout = Duration::from_millis(100);
    });
    let server = mediacache_test::Server::new();

    let url = server.url("/delay/2s/media/slow.mp4");
    let entry = registry.get_cache(url.as_str(), None);

    assert_eq!(
        entry.get_file_async().await,
        Err(FetchError::Timeout(Duration::from_millis(100)))
    );
    assert_eq!(entry.error(), Some(FetchError::Timeout(Duration::from_millis(100))));
}

#[tokio::test]
async fn test_retry_after_invalidate() {
    let (registry, _work_dir) = setup_registry(|_| {});
    let server = mediacache_test::Server::new();

    let url = server.url("/respond_statuscode/503/busy.mp4");
    let entry = registry.get_cache(url.as_str(), None);
    assert!(matches!(
        entry.get_file_async().await,
        Err(FetchError::TransferFailure(_))
    ));

    registry.invalidate(&entry);
    let retried = registry.get_cache(url.as_str(), None);
    assert!(retried.get_file_async().await.is_err());
    assert_eq!(server.accesses(), 2);
}
