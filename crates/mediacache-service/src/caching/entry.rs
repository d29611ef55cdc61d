use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tempfile::TempPath;
use tokio::runtime::Handle;

use crate::fetch::{FetchError, FetchState, Fetcher, delete_file};
use crate::types::ResourceKey;

type FileCallback = Box<dyn FnOnce(&ResourceKey, Option<PathBuf>) + Send>;

struct EntryState {
    ref_count: usize,
    last_touched: Instant,
    sticky_error: Option<FetchError>,
    /// Callbacks waiting for the in-flight fetch, in call order.
    waiters: VecDeque<FileCallback>,
    /// Whether a task is currently driving the fetch for `waiters`.
    driving: bool,
    invalidated: bool,
}

/// A reference counted handle on one cached resource.
///
/// Entries are handed out by [`CacheRegistry`](super::CacheRegistry). Every handout counts as
/// one reference that has to be given back with [`release`](Self::release). While references
/// are held the entry is pinned and never evicted.
pub struct CacheEntry {
    key: ResourceKey,
    fetcher: Fetcher,
    runtime: Handle,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    pub(super) fn new(key: ResourceKey, fetcher: Fetcher, runtime: Handle, ref_count: usize) -> Self {
        Self {
            key,
            fetcher,
            runtime,
            state: Mutex::new(EntryState {
                ref_count,
                last_touched: Instant::now(),
                sticky_error: None,
                waiters: VecDeque::new(),
                driving: false,
                invalidated: false,
            }),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Takes another reference and returns the new count.
    pub fn add_ref(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.ref_count += 1;
        state.last_touched = Instant::now();
        state.ref_count
    }

    /// Gives a reference back and returns the new count.
    ///
    /// Reaching zero makes the entry evictable but leaves the cached file in place.
    ///
    /// # Panics
    ///
    /// Panics if no reference is held.
    pub fn release(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        if state.ref_count == 0 {
            drop(state);
            panic!("reference count underflow on cache entry `{}`", self.key);
        }
        state.ref_count -= 1;
        state.ref_count
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().unwrap().ref_count
    }

    pub fn last_touched(&self) -> Instant {
        self.state.lock().unwrap().last_touched
    }

    pub fn state(&self) -> FetchState {
        self.fetcher.state()
    }

    /// The error the fetch of this entry failed with.
    pub fn error(&self) -> Option<FetchError> {
        let sticky = self.state.lock().unwrap().sticky_error.clone();
        sticky.or_else(|| self.fetcher.error())
    }

    /// The local file, if it has already been fetched.
    pub fn cache_file(&self) -> Option<PathBuf> {
        self.fetcher.file()
    }

    pub fn is_valid(&self) -> bool {
        !self.state.lock().unwrap().invalidated
    }

    /// Fetches the file if needed and invokes `callback` exactly once with the outcome.
    ///
    /// A finished entry calls back right away. Otherwise the callback is queued and invoked from
    /// a runtime task once the fetch settles; queued callbacks run in the order they were added.
    /// Failures are reported as `None`, see [`error`](Self::error) for the reason.
    pub fn get_file<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(&ResourceKey, Option<PathBuf>) + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        if state.invalidated {
            state.sticky_error.get_or_insert(FetchError::Cancelled);
            drop(state);
            return callback(&self.key, None);
        }

        match self.fetcher.state() {
            FetchState::Done => {
                let file = self.fetcher.file();
                match file {
                    Some(_) => state.last_touched = Instant::now(),
                    // closed after finishing
                    None => {
                        state.sticky_error.get_or_insert(FetchError::Cancelled);
                    }
                }
                drop(state);
                return callback(&self.key, file);
            }
            FetchState::Error => {
                if state.sticky_error.is_none() {
                    state.sticky_error = self.fetcher.error();
                }
                drop(state);
                return callback(&self.key, None);
            }
            FetchState::Idle | FetchState::Fetching => {}
        }

        state.waiters.push_back(Box::new(callback));
        if !state.driving {
            state.driving = true;
            let entry = Arc::clone(self);
            self.runtime.spawn(async move { entry.drive().await });
        }
    }

    /// Runs the fetch and hands the outcome to every queued callback.
    async fn drive(&self) {
        let file = self.get_file_async().await.ok();

        let waiters = {
            let mut state = self.state.lock().unwrap();
            state.driving = false;
            std::mem::take(&mut state.waiters)
        };
        tracing::trace!(key = %self.key, waiters = waiters.len(), "notifying waiters");
        for callback in waiters {
            callback(&self.key, file.clone());
        }
    }

    /// Fetches the file if needed and returns its path.
    ///
    /// A failed fetch is remembered and reported again on every call without retrying.
    pub async fn get_file_async(&self) -> Result<PathBuf, FetchError> {
        if !self.is_valid() {
            return Err(FetchError::Cancelled);
        }

        let result = self.fetcher.get_file().await;

        let mut state = self.state.lock().unwrap();
        match &result {
            Ok(_) => state.last_touched = Instant::now(),
            Err(error) => {
                if state.sticky_error.is_none() {
                    state.sticky_error = Some(error.clone());
                }
            }
        }
        result
    }

    /// Cancels an in-flight fetch and deletes the fetched file.
    ///
    /// Queued callbacks receive `None`. The entry stays in the registry with its error, which is
    /// [`FetchError::Cancelled`] unless the fetch had already failed.
    pub fn cancel(&self) {
        let file = {
            let mut state = self.state.lock().unwrap();
            self.shut_down(&mut state)
        };
        if let Some(file) = file {
            delete_file(file);
        }
    }

    /// Marks the entry as no longer part of the cache and hands out its file for deletion.
    ///
    /// The entry is terminal once this returns, so this can run under the registry lock while
    /// the file is deleted after it was released.
    pub(super) fn evict(&self) -> Option<TempPath> {
        let mut state = self.state.lock().unwrap();
        state.invalidated = true;
        self.shut_down(&mut state)
    }

    fn shut_down(&self, state: &mut EntryState) -> Option<TempPath> {
        let file = self.fetcher.shut_down();
        if state.sticky_error.is_none() {
            state.sticky_error = Some(self.fetcher.error().unwrap_or(FetchError::Cancelled));
        }
        file
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("ref_count", &state.ref_count)
            .field("fetch_state", &self.fetcher.state())
            .field("invalidated", &state.invalidated)
            .finish()
    }
}
