use std::fs;
use std::sync::Arc;

use futures::future::join_all;
use mediacache_service::fetch::FetchState;

use crate::setup_registry;

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_consumers() {
    let (registry, _work_dir) = setup_registry(|config| config.capacity = 3);
    let server = mediacache_test::Server::new();

    let clips: Vec<_> = (0..5).map(|i| format!("clip{i}.mp4")).collect();
    let tasks = (0..20).map(|i| {
        let registry = Arc::clone(&registry);
        let name = clips[i % clips.len()].clone();
        let url = server.url(&format!("/media/{name}"));
        tokio::spawn(async move {
            let entry = registry.get_cache(url.as_str(), None);
            let result = entry
                .get_file_async()
                .await
                .map(|path| fs::read_to_string(path).unwrap());
            entry.release();
            (name, result)
        })
    });

    for result in join_all(tasks).await {
        // referenced entries are never evicted, so every consumer gets its file
        let (name, contents) = result.unwrap();
        assert_eq!(contents.unwrap(), mediacache_test::media_body(&name));
    }

    assert!(registry.cache_count() <= 3);
    let stats = registry.statistics();
    assert_eq!(stats.count, registry.cache_count());

    registry.clear_all_cache();
    assert_eq!(registry.statistics().total_size, 0);
}

#[tokio::test]
async fn test_consumer_flow() {
    let (registry, _work_dir) = setup_registry(|config| config.capacity = 2);
    let server = mediacache_test::Server::new();

    let first = server.url("/media/first.mp4");
    let second = server.url("/media/second.mp4");
    let third = server.url("/media/third.mp4");

    let entry = registry.get_cache(first.as_str(), None);
    let path = entry.get_file_async().await.unwrap();
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        mediacache_test::media_body("first.mp4")
    );

    // a second consumer of the same clip is served from disk
    let again = registry.get_cache(first.as_str(), None);
    assert_eq!(again.get_file_async().await.unwrap(), path);
    assert_eq!(server.accesses(), 1);
    again.release();

    let other = registry.get_cache(second.as_str(), None);
    other.get_file_async().await.unwrap();
    other.release();

    // `first` is still referenced, so `second` has to go
    let last = registry.get_cache(third.as_str(), None);
    assert!(registry.has_cache(first.as_str(), None));
    assert!(!registry.has_cache(second.as_str(), None));
    assert_eq!(entry.state(), FetchState::Done);
    assert!(path.exists());

    entry.release();
    last.release();
    registry.shutdown();
    assert!(!path.exists());
}
