use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempPath;
use tokio::runtime::Handle;
use url::Url;

use crate::config::Config;
use crate::fetch::{
    CopySource, FetchSource, Fetcher, HttpSource, TEMP_PREFIX, UnavailableSource, create_tempfile,
    delete_file,
};
use crate::types::ResourceKey;
use crate::utils::http::{DownloadTimeouts, create_client};
use crate::vfile::{ContentAccess, VirtualFile};

use super::CacheEntry;

/// Receives download progress of a resource, see [`ProgressFn`](crate::fetch::ProgressFn).
pub type KeyProgressFn = Arc<dyn Fn(&ResourceKey, u64, Option<u64>) + Send + Sync>;

/// A snapshot of the registry contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Number of resident entries.
    pub count: usize,
    /// Combined size in bytes of all locally available files.
    pub total_size: u64,
}

struct Inner {
    work_dir: PathBuf,
    capacity: usize,
    max_cache_size: Option<u64>,
    entries: HashMap<ResourceKey, Arc<CacheEntry>>,
}

impl Inner {
    /// Removes unreferenced entries, least recently touched first, until there is room for one
    /// more entry of `incoming` bytes.
    ///
    /// Removed entries are invalidated right away. Returns their files, which still need to be
    /// deleted.
    fn make_room(&mut self, incoming: u64) -> Vec<TempPath> {
        let mut total_size: u64 = match self.max_cache_size {
            Some(_) => self.entries.values().map(|entry| file_size(entry)).sum(),
            None => 0,
        };

        let mut files = Vec::new();
        loop {
            let over_capacity = self.entries.len() >= self.capacity;
            let over_size = self
                .max_cache_size
                .is_some_and(|max| total_size.saturating_add(incoming) > max);
            if !over_capacity && !over_size {
                break;
            }

            let victim = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.ref_count() == 0)
                .min_by_key(|(_, entry)| entry.last_touched())
                .map(|(key, _)| key.clone());

            let Some(key) = victim else {
                tracing::debug!(
                    count = self.entries.len(),
                    capacity = self.capacity,
                    total_size,
                    max_cache_size = ?self.max_cache_size,
                    "all cache entries are referenced, exceeding limits"
                );
                metric!(counter("cache.overflow") += 1);
                break;
            };

            if let Some(entry) = self.entries.remove(&key) {
                total_size = total_size.saturating_sub(file_size(&entry));
                tracing::debug!(key = %key, "evicting cache entry");
                metric!(counter("cache.evict") += 1);
                files.extend(entry.evict());
            }
        }
        files
    }

    fn insert(&mut self, key: ResourceKey, entry: Arc<CacheEntry>) {
        self.entries.insert(key, entry);
        metric!(gauge("cache.count") = self.entries.len() as u64);
    }

    /// Removes and invalidates every entry.
    ///
    /// Returns the number of removed entries and their files, which still need to be deleted.
    fn drain(&mut self) -> (usize, Vec<TempPath>) {
        let count = self.entries.len();
        let files = self
            .entries
            .drain()
            .filter_map(|(_, entry)| entry.evict())
            .collect();
        metric!(gauge("cache.count") = 0u64);
        (count, files)
    }
}

/// A capacity bounded registry of [`CacheEntry`]s backed by a work directory.
///
/// Looking up a key hands out a reference on its entry, creating the entry on first use. Once
/// the number of resident entries reaches the capacity, the least recently touched entries
/// without references are evicted to make room. Referenced entries are never evicted, so the
/// registry may temporarily hold more entries than its capacity. An optional size bound on the
/// combined size of fetched files evicts the same way.
///
/// Fetches run on the runtime given to [`new`](Self::new); the registry itself never waits for
/// them.
pub struct CacheRegistry {
    inner: Mutex<Inner>,
    stale_file_age: Duration,
    runtime: Handle,
    client: reqwest::Client,
    timeouts: DownloadTimeouts,
    content_access: Option<Arc<dyn ContentAccess>>,
    progress: Option<KeyProgressFn>,
}

impl CacheRegistry {
    /// Creates a registry and [initializes](Self::initialize) its work directory.
    pub fn new(config: &Config, runtime: Handle) -> io::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts).map_err(io::Error::other)?;

        let registry = Self {
            inner: Mutex::new(Inner {
                work_dir: config.work_dir.clone(),
                capacity: config.capacity.max(1),
                max_cache_size: config.max_cache_size,
                entries: HashMap::new(),
            }),
            stale_file_age: config.stale_file_age,
            runtime,
            client,
            timeouts,
            content_access: None,
            progress: None,
        };
        registry.initialize(&config.work_dir, config.capacity)?;

        Ok(registry)
    }

    /// Sets the capability used to resolve content locators.
    ///
    /// Without it, locators that are neither HTTP URLs nor files fail to fetch.
    pub fn with_content_access(mut self, access: Arc<dyn ContentAccess>) -> Self {
        self.content_access = Some(access);
        self
    }

    /// Sets a callback receiving the download progress of HTTP resources.
    pub fn with_progress(mut self, progress: KeyProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Resets the registry onto `work_dir` with the given capacity.
    ///
    /// All resident entries are dropped and their files deleted, as are temporary files that a
    /// previous process left behind. Only temporary files that were not modified for the
    /// configured `stale_file_age` count as left behind, younger ones may belong to another
    /// registry sharing the directory. A capacity of `0` is treated as `1`.
    pub fn initialize(&self, work_dir: &Path, capacity: usize) -> io::Result<()> {
        fs::create_dir_all(work_dir)?;

        let (dropped, files) = {
            let mut inner = self.inner.lock().unwrap();
            inner.work_dir = work_dir.to_owned();
            inner.capacity = capacity.max(1);
            inner.drain()
        };
        files.into_iter().for_each(delete_file);

        let swept = sweep_stale_files(work_dir, self.stale_file_age)?;
        tracing::info!(
            work_dir = %work_dir.display(),
            capacity = capacity.max(1),
            dropped,
            swept,
            "initialized media cache"
        );
        Ok(())
    }

    /// Drops every entry and deletes its file. The registry stays usable.
    pub fn shutdown(&self) {
        let count = self.clear_all_cache();
        tracing::debug!(count, "media cache shut down");
    }

    /// Looks up the entry for a resource, creating it if needed, and takes a reference on it.
    ///
    /// The returned entry has to be [released](CacheEntry::release) once the caller is done.
    pub fn get_cache(&self, locator: &str, discriminator: Option<&str>) -> Arc<CacheEntry> {
        let key = ResourceKey::new(locator, discriminator);
        metric!(counter("cache.access") += 1);

        let (entry, evicted) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.entries.get(&key) {
                tracing::trace!(key = %key, "cache hit");
                metric!(counter("cache.hit") += 1);
                entry.add_ref();
                return Arc::clone(entry);
            }

            tracing::trace!(key = %key, "cache miss");
            let evicted = inner.make_room(0);

            let source = self.resolve_source(&key);
            let fetcher = Fetcher::new(
                key.clone(),
                source,
                inner.work_dir.clone(),
                self.runtime.clone(),
            );
            let entry = Arc::new(CacheEntry::new(
                key.clone(),
                fetcher,
                self.runtime.clone(),
                1,
            ));
            inner.insert(key, Arc::clone(&entry));
            (entry, evicted)
        };

        evicted.into_iter().for_each(delete_file);
        entry
    }

    /// Looks up a resident entry without creating it.
    ///
    /// Takes a reference on the entry if found.
    pub fn peek_cache(&self, key: &ResourceKey) -> Option<Arc<CacheEntry>> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(key)?;
        entry.add_ref();
        Some(Arc::clone(entry))
    }

    /// Adopts an existing local file as the cached contents of `key`.
    ///
    /// The file is moved into the work directory if `prefer_move` is set and the move succeeds,
    /// and copied otherwise. The new entry is unreferenced. Returns `false` without touching
    /// the file if `key` is already resident.
    pub fn put_cache(&self, key: ResourceKey, file: &Path, prefer_move: bool) -> io::Result<bool> {
        let work_dir = {
            let inner = self.inner.lock().unwrap();
            if inner.entries.contains_key(&key) {
                return Ok(false);
            }
            inner.work_dir.clone()
        };

        let prefix = format!("{TEMP_PREFIX}{}-", &key.cache_id()[..12]);
        let target = create_tempfile(&work_dir, &prefix)?.into_temp_path();
        let moved = prefer_move && fs::rename(file, &target).is_ok();
        if !moved {
            fs::copy(file, &target)?;
        }
        let size = fs::metadata(&target)?.len();

        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            if inner.entries.contains_key(&key) {
                drop(inner);
                if moved {
                    fs::rename(&target, file)?;
                }
                return Ok(false);
            }

            let evicted = inner.make_room(size);
            let fetcher = Fetcher::completed(key.clone(), target, self.runtime.clone());
            let entry = CacheEntry::new(key.clone(), fetcher, self.runtime.clone(), 0);
            tracing::debug!(key = %key, moved, "adopted file into cache");
            inner.insert(key, Arc::new(entry));
            evicted
        };

        evicted.into_iter().for_each(delete_file);
        Ok(true)
    }

    pub fn has_cache(&self, locator: &str, discriminator: Option<&str>) -> bool {
        let key = ResourceKey::new(locator, discriminator);
        self.inner.lock().unwrap().entries.contains_key(&key)
    }

    pub fn cache_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    pub fn work_dir(&self) -> PathBuf {
        self.inner.lock().unwrap().work_dir.clone()
    }

    /// Removes `entry` from the registry regardless of its references and deletes its file.
    ///
    /// Holders of the entry observe it as cancelled from then on.
    pub fn invalidate(&self, entry: &CacheEntry) {
        let file = {
            let mut inner = self.inner.lock().unwrap();
            let resident = inner
                .entries
                .get(entry.key())
                .is_some_and(|resident| std::ptr::eq(Arc::as_ptr(resident), entry));
            if resident {
                inner.entries.remove(entry.key());
                metric!(gauge("cache.count") = inner.entries.len() as u64);
            }
            tracing::debug!(key = %entry.key(), "invalidating cache entry");
            entry.evict()
        };
        if let Some(file) = file {
            delete_file(file);
        }
    }

    pub fn statistics(&self) -> CacheStatistics {
        let entries: Vec<_> = self.inner.lock().unwrap().entries.values().cloned().collect();

        CacheStatistics {
            count: entries.len(),
            total_size: entries.iter().map(|entry| file_size(entry)).sum(),
        }
    }

    /// Drops every entry, referenced or not, and deletes its file.
    ///
    /// Returns the number of dropped entries.
    pub fn clear_all_cache(&self) -> usize {
        let (dropped, files) = self.inner.lock().unwrap().drain();
        files.into_iter().for_each(delete_file);
        dropped
    }

    /// Picks the way a resource is fetched based on the scheme of its locator.
    fn resolve_source(&self, key: &ResourceKey) -> Arc<dyn FetchSource> {
        let locator = key.locator();
        match Url::parse(locator) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                let mut source = HttpSource::new(self.client.clone(), url, self.timeouts);
                if let Some(progress) = &self.progress {
                    let progress = Arc::clone(progress);
                    let key = key.clone();
                    source = source.with_progress(Arc::new(move |received, total| {
                        progress(&key, received, total)
                    }));
                }
                Arc::new(source)
            }
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => Arc::new(CopySource::new(VirtualFile::from_path(path))),
                Err(()) => Arc::new(UnavailableSource::new(format!(
                    "invalid file URL `{locator}`"
                ))),
            },
            Ok(_) => match &self.content_access {
                Some(access) => Arc::new(CopySource::new(VirtualFile::from_content(
                    locator,
                    Arc::clone(access),
                ))),
                None => Arc::new(UnavailableSource::new(format!(
                    "no content access to resolve `{locator}`"
                ))),
            },
            // anything that is not a URL is a plain path
            Err(_) => Arc::new(CopySource::new(VirtualFile::from_path(locator))),
        }
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("CacheRegistry")
            .field("work_dir", &inner.work_dir)
            .field("capacity", &inner.capacity)
            .field("max_cache_size", &inner.max_cache_size)
            .field("count", &inner.entries.len())
            .finish_non_exhaustive()
    }
}

/// Size of the locally available file of `entry`, `0` if there is none.
fn file_size(entry: &CacheEntry) -> u64 {
    entry
        .cache_file()
        .and_then(|path| fs::metadata(path).ok())
        .map_or(0, |metadata| metadata.len())
}

/// Deletes temporary files from `work_dir` that were not modified for `max_age` and returns how
/// many were removed.
fn sweep_stale_files(work_dir: &Path, max_age: Duration) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(work_dir)? {
        let entry = entry?;
        let is_temp = entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX)
            && entry.file_type().is_ok_and(|ty| ty.is_file());
        if !is_temp {
            continue;
        }

        // a file that vanished or has no mtime is left to whoever owns it
        let Ok(mtime) = entry.metadata().and_then(|metadata| metadata.modified()) else {
            continue;
        };
        if mtime.elapsed().unwrap_or_default() < max_age {
            continue;
        }

        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => tracing::error!(
                error = &error as &dyn std::error::Error,
                path = %path.display(),
                "failed to remove stale cache file"
            ),
        }
    }
    Ok(removed)
}
