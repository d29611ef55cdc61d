use std::sync::Arc;

use mediacache_service::caching::CacheRegistry;
use mediacache_service::config::Config;
use mediacache_test::TempDir;

mod e2e;
mod source_errors;

/// Creates a registry on a fresh work directory.
///
/// The returned [`TempDir`] has to be held for the duration of the test.
pub fn setup_registry(update_config: impl FnOnce(&mut Config)) -> (Arc<CacheRegistry>, TempDir) {
    mediacache_test::setup();

    let work_dir = mediacache_test::tempdir();
    let mut config = Config {
        work_dir: work_dir.path().to_owned(),
        ..Default::default()
    };
    update_config(&mut config);

    let registry = CacheRegistry::new(&config, tokio::runtime::Handle::current()).unwrap();
    (Arc::new(registry), work_dir)
}
