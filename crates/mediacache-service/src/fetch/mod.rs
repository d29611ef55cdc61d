//! Asynchronous production of local files.
//!
//! A [`Fetcher`] turns one [`FetchSource`] into a temporary file inside the work directory. The
//! fetch runs at most once on the runtime it was created with; every caller of
//! [`Fetcher::get_file`] awaits the same outcome. The temporary file is owned by the fetcher and
//! removed when it is closed or dropped, unless it was [detached](Fetcher::detach) first.
//!
//! State changes are published on a [`watch`] channel. The file, the stored error and the handle
//! of the running task sit behind a mutex, and every state transition happens while holding it.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::Instrument;

use crate::types::ResourceKey;

mod copy;
mod error;
mod http;

pub use copy::CopySource;
pub use error::FetchError;
pub use http::{HttpSource, ProgressFn};

/// Prefix of every temporary file the cache creates.
pub const TEMP_PREFIX: &str = "mc-";
/// Suffix of every temporary file the cache creates.
pub const TEMP_SUFFIX: &str = ".tmp";

/// The state of a [`Fetcher`].
///
/// `Done` and `Error` are terminal: a fetcher never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Fetching,
    Done,
    Error,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Done | FetchState::Error)
    }
}

/// Something that can write the contents of a resource into a file.
pub trait FetchSource: Send + Sync + fmt::Debug {
    /// Writes the full contents of the resource into `destination`.
    ///
    /// The returned future may be dropped at any point when the fetch is cancelled.
    fn fetch<'a>(&'a self, destination: &'a mut File) -> BoxFuture<'a, Result<(), FetchError>>;
}

/// A source that always fails, used for locators that cannot be resolved.
#[derive(Debug, Clone)]
pub struct UnavailableSource {
    reason: String,
}

impl UnavailableSource {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl FetchSource for UnavailableSource {
    fn fetch<'a>(&'a self, _destination: &'a mut File) -> BoxFuture<'a, Result<(), FetchError>> {
        Box::pin(futures::future::ready(Err(FetchError::SourceUnavailable(
            self.reason.clone(),
        ))))
    }
}

#[derive(Default)]
struct Slot {
    file: Option<TempPath>,
    error: Option<FetchError>,
    task: Option<AbortHandle>,
    closed: bool,
}

struct Shared {
    state: watch::Sender<FetchState>,
    slot: Mutex<Slot>,
}

impl Shared {
    fn state(&self) -> FetchState {
        *self.state.borrow()
    }

    /// Records the outcome of the fetch task.
    fn settle(&self, result: Result<TempPath, FetchError>) {
        let mut slot = self.slot.lock().unwrap();
        slot.task = None;

        if slot.closed {
            // dropping the path deletes the file
            drop(slot);
            drop(result);
            return;
        }

        match result {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "fetch finished");
                slot.file = Some(path);
                self.state.send_replace(FetchState::Done);
            }
            Err(error) => {
                tracing::debug!(error = &error as &dyn std::error::Error, "fetch failed");
                metric!(counter("fetch.failure") += 1, "reason" => error.metric_tag());
                slot.error = Some(error);
                self.state.send_replace(FetchState::Error);
            }
        }
    }
}

/// Produces a local file from a [`FetchSource`] at most once.
pub struct Fetcher {
    key: ResourceKey,
    source: Arc<dyn FetchSource>,
    work_dir: PathBuf,
    runtime: Handle,
    shared: Arc<Shared>,
}

impl Fetcher {
    pub fn new(
        key: ResourceKey,
        source: Arc<dyn FetchSource>,
        work_dir: PathBuf,
        runtime: Handle,
    ) -> Self {
        let (state, _) = watch::channel(FetchState::Idle);
        Self {
            key,
            source,
            work_dir,
            runtime,
            shared: Arc::new(Shared {
                state,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Creates a fetcher that is already [`Done`](FetchState::Done) with the given file.
    pub(crate) fn completed(key: ResourceKey, file: TempPath, runtime: Handle) -> Self {
        let work_dir = file.parent().map(Path::to_path_buf).unwrap_or_default();
        let fetcher = Self::new(key, Arc::new(CopySource::empty()), work_dir, runtime);
        fetcher.shared.slot.lock().unwrap().file = Some(file);
        fetcher.shared.state.send_replace(FetchState::Done);
        fetcher
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn state(&self) -> FetchState {
        self.shared.state()
    }

    /// The fetched file, if the fetch is done and the file is still owned by this fetcher.
    pub fn file(&self) -> Option<PathBuf> {
        let slot = self.shared.slot.lock().unwrap();
        match self.shared.state() {
            FetchState::Done => slot.file.as_ref().map(|path| path.to_path_buf()),
            _ => None,
        }
    }

    /// The error the fetch failed with.
    pub fn error(&self) -> Option<FetchError> {
        self.shared.slot.lock().unwrap().error.clone()
    }

    /// Starts fetching in the background.
    ///
    /// Does nothing unless the fetcher is [`Idle`](FetchState::Idle).
    pub fn start(&self) {
        let mut slot = self.shared.slot.lock().unwrap();
        if slot.closed || self.shared.state() != FetchState::Idle {
            return;
        }
        self.shared.state.send_replace(FetchState::Fetching);
        metric!(counter("fetch.start") += 1);

        let cache_id = self.key.cache_id();
        let span = tracing::info_span!(
            "fetch",
            cache_id = &cache_id[..12],
            locator = self.key.locator()
        );
        let prefix = format!("{TEMP_PREFIX}{}-", &cache_id[..12]);
        let source = Arc::clone(&self.source);
        let work_dir = self.work_dir.clone();
        let shared = Arc::clone(&self.shared);

        let task = self.runtime.spawn(
            async move {
                tracing::debug!(source = ?source, "fetch started");
                let started = Instant::now();
                let result = fetch_into_tempfile(source.as_ref(), &work_dir, &prefix).await;
                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(error) => error.metric_tag(),
                };
                metric!(timer("fetch.duration") = started.elapsed(), "outcome" => outcome);
                shared.settle(result);
            }
            .instrument(span),
        );
        slot.task = Some(task.abort_handle());
    }

    /// Fetches the file, or waits for an in-flight fetch, and returns its path.
    ///
    /// A failed fetch is reported again on every call without retrying.
    pub async fn get_file(&self) -> Result<PathBuf, FetchError> {
        self.start();

        let mut state = self.shared.state.subscribe();
        let settled = *state
            .wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| FetchError::Cancelled)?;

        let slot = self.shared.slot.lock().unwrap();
        match settled {
            FetchState::Done => match &slot.file {
                Some(path) => Ok(path.to_path_buf()),
                None if slot.closed => Err(FetchError::Cancelled),
                None => Err(FetchError::SourceUnavailable(
                    "file has been detached".into(),
                )),
            },
            _ => Err(slot.error.clone().unwrap_or(FetchError::Cancelled)),
        }
    }

    /// Like [`get_file`](Self::get_file), but logs the error and returns `None` instead.
    pub async fn get_file_or_none(&self) -> Option<PathBuf> {
        match self.get_file().await {
            Ok(path) => Some(path),
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    key = %self.key,
                    "could not fetch media"
                );
                None
            }
        }
    }

    /// Hands the fetched file over to the caller.
    ///
    /// The file is no longer deleted when the fetcher is closed. Returns `None` if there is no
    /// fetched file.
    pub fn detach(&self) -> Option<PathBuf> {
        let mut slot = self.shared.slot.lock().unwrap();
        let path = slot.file.take()?;
        match path.keep() {
            Ok(path) => Some(path),
            Err(error) => {
                tracing::error!(
                    error = &error.error as &dyn std::error::Error,
                    "failed to detach fetched file"
                );
                slot.file = Some(error.path);
                None
            }
        }
    }

    /// Cancels a running fetch and deletes the owned file.
    ///
    /// Waiters of an unfinished fetch observe [`FetchError::Cancelled`]. Calling this more than
    /// once has no further effect.
    pub fn close(&self) {
        if let Some(file) = self.shut_down() {
            delete_file(file);
        }
    }

    /// Like [`close`](Self::close), but hands the owned file out instead of deleting it.
    ///
    /// The fetcher is terminal once this returns. Dropping the returned path deletes the file.
    pub(crate) fn shut_down(&self) -> Option<TempPath> {
        let mut slot = self.shared.slot.lock().unwrap();
        if slot.closed {
            return None;
        }
        slot.closed = true;

        if let Some(task) = slot.task.take() {
            task.abort();
        }
        if !self.shared.state().is_terminal() {
            tracing::debug!(key = %self.key, "fetch cancelled");
            metric!(counter("fetch.cancel") += 1);
            slot.error = Some(FetchError::Cancelled);
            self.shared.state.send_replace(FetchState::Error);
        }
        slot.file.take()
    }
}

/// Deletes a file handed out by [`Fetcher::shut_down`], logging failures.
pub(crate) fn delete_file(file: TempPath) {
    let shown = file.display().to_string();
    if let Err(error) = file.close() {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            path = %shown,
            "failed to delete fetched file"
        );
    }
}

impl Drop for Fetcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("key", &self.key)
            .field("source", &self.source)
            .field("state", &self.state())
            .finish()
    }
}

async fn fetch_into_tempfile(
    source: &dyn FetchSource,
    work_dir: &Path,
    prefix: &str,
) -> Result<TempPath, FetchError> {
    let (file, path) = create_tempfile(work_dir, prefix)
        .map_err(|e| FetchError::TransferFailure(format!("failed to create temp file: {e}")))?
        .into_parts();

    let mut destination = File::from_std(file);
    source.fetch(&mut destination).await?;
    destination.flush().await?;

    Ok(path)
}

/// Creates a new temporary file in `work_dir`.
///
/// Cleanup of the work directory may remove it from under us, so creating it is retried a
/// couple of times.
pub(crate) fn create_tempfile(work_dir: &Path, prefix: &str) -> io::Result<NamedTempFile> {
    const MAX_RETRIES: usize = 2;

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = fs::create_dir_all(work_dir).and_then(|_| {
            tempfile::Builder::new()
                .prefix(prefix)
                .suffix(TEMP_SUFFIX)
                .tempfile_in(work_dir)
        });

        match result {
            Ok(file) => return Ok(file),
            Err(error) if attempt <= MAX_RETRIES => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    attempt,
                    "failed to create temp file, retrying"
                );
            }
            Err(error) => {
                sentry::with_scope(
                    |scope| scope.set_extra("work_dir", work_dir.display().to_string().into()),
                    || tracing::error!("Failed to create temp file: {:?}", error),
                );
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Debug)]
    struct TestSource {
        calls: AtomicUsize,
        delay: Duration,
        result: Result<&'static [u8], FetchError>,
    }

    impl TestSource {
        fn ok(contents: &'static [u8], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                result: Ok(contents),
            })
        }

        fn failing(error: FetchError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                result: Err(error),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FetchSource for TestSource {
        fn fetch<'a>(
            &'a self,
            destination: &'a mut File,
        ) -> BoxFuture<'a, Result<(), FetchError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let contents = self.result.clone()?;
                destination.write_all(&contents[..contents.len() / 2]).await?;
                destination.flush().await?;
                tokio::time::sleep(self.delay).await;
                destination.write_all(&contents[contents.len() / 2..]).await?;
                Ok(())
            })
        }
    }

    fn fetcher(source: Arc<dyn FetchSource>, work_dir: &Path) -> Fetcher {
        Fetcher::new(
            ResourceKey::new("test://clip.mp4", None),
            source,
            work_dir.to_owned(),
            Handle::current(),
        )
    }

    fn dir_entries(path: &Path) -> Vec<PathBuf> {
        fs::read_dir(path)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_fetch_once() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let source = TestSource::ok(b"frames", Duration::from_millis(50));
        let fetcher = fetcher(source.clone(), dir.path());

        assert_eq!(fetcher.state(), FetchState::Idle);

        let (a, b, c) = futures::join!(fetcher.get_file(), fetcher.get_file(), fetcher.get_file());
        let path = a.unwrap();
        assert_eq!(b.unwrap(), path);
        assert_eq!(c.unwrap(), path);

        assert_eq!(source.calls(), 1);
        assert_eq!(fetcher.state(), FetchState::Done);
        assert_eq!(fs::read(&path).unwrap(), b"frames");
        assert_eq!(fetcher.file(), Some(path.clone()));

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(TEMP_PREFIX));
        assert!(name.ends_with(TEMP_SUFFIX));

        // a finished fetcher does not fetch again
        fetcher.start();
        assert_eq!(fetcher.get_file().await.unwrap(), path);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_error_is_sticky() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let error = FetchError::TransferFailure("connection reset".into());
        let source = TestSource::failing(error.clone());
        let fetcher = fetcher(source.clone(), dir.path());

        assert_eq!(fetcher.get_file().await, Err(error.clone()));
        assert_eq!(fetcher.get_file().await, Err(error.clone()));
        assert_eq!(fetcher.get_file_or_none().await, None);

        assert_eq!(source.calls(), 1);
        assert_eq!(fetcher.state(), FetchState::Error);
        assert_eq!(fetcher.error(), Some(error));
        // the partially written file is gone
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let fetcher = fetcher(TestSource::ok(b"frames", Duration::ZERO), dir.path());

        let path = fetcher.get_file().await.unwrap();
        assert!(path.exists());

        fetcher.close();
        assert!(!path.exists());
        fetcher.close();

        assert_eq!(fetcher.state(), FetchState::Done);
        assert_eq!(fetcher.file(), None);
        assert_eq!(fetcher.get_file().await, Err(FetchError::Cancelled));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_while_fetching() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let source = TestSource::ok(b"frames", Duration::from_secs(60));
        let fetcher = Arc::new(fetcher(source, dir.path()));

        let waiter = tokio::spawn({
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.get_file().await }
        });

        // the partial file shows up once the first half is written
        wait_until(|| !dir_entries(dir.path()).is_empty()).await;
        assert_eq!(fetcher.state(), FetchState::Fetching);

        fetcher.close();

        assert_eq!(waiter.await.unwrap(), Err(FetchError::Cancelled));
        assert_eq!(fetcher.state(), FetchState::Error);
        assert_eq!(fetcher.error(), Some(FetchError::Cancelled));
        wait_until(|| dir_entries(dir.path()).is_empty()).await;
    }

    #[tokio::test]
    async fn test_close_before_start() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let source = TestSource::ok(b"frames", Duration::ZERO);
        let fetcher = fetcher(source.clone(), dir.path());

        fetcher.close();
        fetcher.start();

        assert_eq!(fetcher.get_file().await, Err(FetchError::Cancelled));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_shut_down_hands_out_file() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let fetcher = fetcher(TestSource::ok(b"frames", Duration::ZERO), dir.path());

        let path = fetcher.get_file().await.unwrap();
        let file = fetcher.shut_down().unwrap();

        // terminal right away, the file lives until the handed out path goes
        assert_eq!(fetcher.file(), None);
        assert_eq!(fetcher.get_file().await, Err(FetchError::Cancelled));
        assert!(fetcher.shut_down().is_none());
        assert_eq!(fs::read(&path).unwrap(), b"frames");

        delete_file(file);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_detach() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let fetcher = fetcher(TestSource::ok(b"frames", Duration::ZERO), dir.path());

        assert_eq!(fetcher.detach(), None);

        let path = fetcher.get_file().await.unwrap();
        assert_eq!(fetcher.detach(), Some(path.clone()));
        assert_eq!(fetcher.detach(), None);
        assert!(matches!(
            fetcher.get_file().await,
            Err(FetchError::SourceUnavailable(_))
        ));

        drop(fetcher);
        assert_eq!(fs::read(&path).unwrap(), b"frames");
    }

    #[tokio::test]
    async fn test_drop_deletes_file() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let fetcher = fetcher(TestSource::ok(b"frames", Duration::ZERO), dir.path());

        let path = fetcher.get_file().await.unwrap();
        drop(fetcher);

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unavailable_source() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let source = Arc::new(UnavailableSource::new("no content access"));
        let fetcher = fetcher(source, dir.path());

        assert_eq!(
            fetcher.get_file().await,
            Err(FetchError::SourceUnavailable("no content access".into()))
        );
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_recreates_work_dir() {
        mediacache_test::setup();
        let dir = mediacache_test::tempdir();
        let work_dir = dir.path().join("nested").join("work");
        let fetcher = fetcher(TestSource::ok(b"frames", Duration::ZERO), &work_dir);

        let path = fetcher.get_file().await.unwrap();
        assert_eq!(path.parent(), Some(work_dir.as_path()));
    }
}
