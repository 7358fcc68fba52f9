//! The database handle.
//!
//! One `Database` owns everything a caller touches: the underlying store
//! (shared across handles on the same path), the monotonic clock, the
//! registry of log handles, the freshness table and local value cache,
//! the cooperative lock table, user shared buffers, listeners, and the
//! worker pool serving the async entry points. Closing the handle cancels
//! pending operations, aborts outstanding transactions, drops log
//! buffers, and flushes commit state; every operation afterwards fails
//! with `NOT_OPEN`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::{wall_now_millis, MonotonicClock};
use crate::error::{Error, ErrorKind, Result};
use crate::fresh::{hash_key, FreshnessTable, ValueCache};
use crate::key::CacheKey;
use crate::locktab::{LockTable, ReleaseCallback};
use crate::param::{
    DEFAULT_CACHE_BUDGET, DEFAULT_LOG_RETENTION, DEFAULT_MAX_AGE_THRESHOLD, DEFAULT_WORKERS,
    FRESHNESS_FILE, REVALIDATE_INTERVAL, TXN_LOG_DIR,
};
use crate::shbuf::{BufferCallback, BufferRegistry, SharedBuffer};
use crate::store::{CommitRequest, MemStore, DEFAULT_CF};
use crate::txn::{Transaction, TxnRegistry};
use crate::txnlog::{LogConfig, LogFileInfo, LogHandle, LogStore};
use crate::worker::{CloseToken, WorkerPool};

/// Granularity of collected statistics: `Counters` tracks operation and
/// commit counts; `Detailed` adds the cache hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsLevel {
    #[default]
    Counters,
    Detailed,
}

/// Open options of a database handle.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Column family served by the cached read/write paths; `None` uses
    /// the default family.
    pub name: Option<String>,
    /// Detect conflicts at write time with record locks instead of at
    /// commit time.
    pub pessimistic: bool,
    /// Skip the local value cache entirely.
    pub no_block_cache: bool,
    /// Ask the underlying store to skip its own write-ahead log.
    pub disable_wal: bool,
    /// Worker threads serving async operations.
    pub parallelism_threads: usize,
    /// Rotate transaction log files past this size; 0 never rotates.
    pub transaction_log_max_size: u64,
    /// Age after which transaction log files may be purged.
    pub transaction_log_retention: Duration,
    /// Fraction of the retention window after which the active file
    /// rotates pre-emptively.
    pub transaction_log_max_age_threshold: f64,
    /// Override of the `transaction_logs` directory.
    pub transaction_logs_path: Option<PathBuf>,
    /// Collect counters, reported by `get_stats`.
    pub enable_stats: bool,
    pub stats_level: StatsLevel,
    /// Key under which shared structure metadata is kept by outer codecs.
    pub shared_structures_key: Option<Vec<u8>>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            name: None,
            pessimistic: false,
            no_block_cache: false,
            disable_wal: false,
            parallelism_threads: DEFAULT_WORKERS,
            transaction_log_max_size: 0,
            transaction_log_retention: DEFAULT_LOG_RETENTION,
            transaction_log_max_age_threshold: DEFAULT_MAX_AGE_THRESHOLD,
            transaction_logs_path: None,
            enable_stats: false,
            stats_level: StatsLevel::Counters,
            shared_structures_key: None,
        }
    }
}

/// Options of [`Database::purge_logs`].
#[derive(Debug, Clone, Default)]
pub struct PurgeOptions {
    /// Purge files last modified before this instant; defaults to the
    /// retention cutoff.
    pub before: Option<SystemTime>,
    /// Remove the log (or logs) entirely.
    pub destroy: bool,
    /// Restrict to one log; `None` covers every log of the database.
    pub name: Option<String>,
}

/// One log and its files, as returned by [`Database::list_logs`].
#[derive(Debug, Clone)]
pub struct LogListing {
    pub name: String,
    pub files: Vec<LogFileInfo>,
}

/// Counters kept when `enable_stats` is set.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    gets: AtomicU64,
    puts: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Stats {
    pub(crate) fn get(&self) {
        let _ = self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn put(&self) {
        let _ = self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn commit(&self) {
        let _ = self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn conflict(&self) {
        let _ = self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_hit(&self) {
        let _ = self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_miss(&self) {
        let _ = self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub gets: u64,
    pub puts: u64,
    pub commits: u64,
    pub conflicts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Invoked on `notify_listeners` of the subscribed event.
pub type ListenerCallback = Arc<dyn Fn(Option<&[u8]>) + Send + Sync>;

/// State shared by every handle open on one database path in this
/// process: the store itself and the log stores (serialized appenders).
#[derive(Debug)]
struct PathShared {
    store: Arc<MemStore>,
    log_stores: Mutex<HashMap<PathBuf, Arc<LogStore>>>,
}

static SHARED_PATHS: Lazy<Mutex<HashMap<PathBuf, Weak<PathShared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static OPEN_DATABASES: Lazy<Mutex<Vec<Weak<DbCore>>>> = Lazy::new(|| Mutex::new(Vec::new()));

static BLOCK_CACHE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_CACHE_BUDGET);

fn shared_for(path: &Path) -> Arc<PathShared> {
    let mut paths = SHARED_PATHS.lock();
    paths.retain(|_, weak| weak.strong_count() > 0);
    if let Some(shared) = paths.get(path).and_then(Weak::upgrade) {
        return shared;
    }
    let shared = Arc::new(PathShared {
        store: MemStore::new(),
        log_stores: Mutex::new(HashMap::new()),
    });
    let _ = paths.insert(path.to_owned(), Arc::downgrade(&shared));
    shared
}

/// Everything one handle owns; `Transaction` and the async paths hold an
/// `Arc` of it.
pub(crate) struct DbCore {
    pub(crate) path: PathBuf,
    pub(crate) options: DbOptions,
    /// Column family served by the cached paths.
    pub(crate) cf: String,
    shared: Arc<PathShared>,
    pub(crate) store: Arc<MemStore>,
    pub(crate) clock: MonotonicClock,
    pub(crate) txns: Arc<TxnRegistry>,
    logs: Mutex<HashMap<String, Arc<LogHandle>>>,
    logs_dir: PathBuf,
    log_config: LogConfig,
    /// `None` when the shared mapping could not be established; reads
    /// then bypass the cache entirely instead of failing.
    freshness: Option<FreshnessTable>,
    pub(crate) cache: ValueCache,
    locks: LockTable,
    buffers: BufferRegistry,
    listeners: Mutex<HashMap<String, Vec<(u64, ListenerCallback)>>>,
    next_listener: AtomicU64,
    next_txn: AtomicU64,
    pub(crate) closed: Arc<CloseToken>,
    workers: WorkerPool,
    pub(crate) stats: Stats,
    revalidator: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DbCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCore")
            .field("path", &self.path)
            .field("cf", &self.cf)
            .field("closed", &self.closed.is_closed())
            .finish()
    }
}

impl DbCore {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.is_closed() {
            Err(Error::not_open())
        } else {
            Ok(())
        }
    }

    /// Returns (creating on first use) this handle's `LogHandle` for the
    /// named log. The underlying `LogStore` is shared across handles.
    pub(crate) fn log_handle(&self, name: &str) -> Result<Arc<LogHandle>> {
        if let Some(handle) = self.logs.lock().get(name) {
            return Ok(Arc::clone(handle));
        }
        let store = {
            let key = self.logs_dir.join(name);
            let mut stores = self.shared.log_stores.lock();
            match stores.get(&key) {
                Some(store) => Arc::clone(store),
                None => {
                    let store = Arc::new(LogStore::open(
                        &self.logs_dir,
                        name,
                        self.log_config.clone(),
                    )?);
                    let _ = stores.insert(key, Arc::clone(&store));
                    store
                }
            }
        };
        let mut logs = self.logs.lock();
        let handle = logs.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(LogHandle::new(
                name.to_owned(),
                store,
                Arc::clone(&self.txns),
            ))
        });
        Ok(Arc::clone(handle))
    }

    /// Tags `key` (its encoded form) recently-written and drops any local
    /// cache entry, so no reader serves a pre-write value.
    pub(crate) fn invalidate_written_key(&self, encoded: &[u8]) {
        if let Some(freshness) = &self.freshness {
            let key = CacheKey::decode(encoded)
                .unwrap_or_else(|| CacheKey::Bytes(encoded.to_vec()));
            let index = hash_key(&key, 0).index;
            freshness.mark_write(index, self.clock.now());
        }
        self.cache.remove(encoded);
    }

    fn next_txn_id(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs `body` on the worker pool, resolving through the close token.
    pub(crate) async fn run_job<T, F>(self: &Arc<Self>, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.workers.run(&self.closed, body).await
    }
}

/// The cached read path: local cache guarded by the shared table, then
/// read-through with a freshness CAS.
fn cached_get(core: &Arc<DbCore>, key: &CacheKey) -> Result<Option<Vec<u8>>> {
    core.check_open()?;
    key.validate()?;
    core.stats.get();
    let encoded = key.encode();
    let freshness = core.freshness.as_ref();

    if !core.options.no_block_cache {
        if let (Some(freshness), Some(entry)) = (freshness, core.cache.get(&encoded)) {
            let hash = hash_key(key, entry.version);
            if freshness.load(hash.index) == hash.tag as i64 {
                if core.options.stats_level == StatsLevel::Detailed {
                    core.stats.cache_hit();
                }
                return Ok(Some(entry.value));
            }
        }
    }
    if core.options.stats_level == StatsLevel::Detailed {
        core.stats.cache_miss();
    }

    let got = core.store.get_committed(&core.cf, &encoded);
    if let (Some(freshness), Some((value, version))) = (freshness, &got) {
        let index = hash_key(key, 0).index;
        let prev = freshness.load(index);
        if prev >= 0 {
            let hash = hash_key(key, *version);
            let _ = freshness.try_freshen(hash.index, prev, hash.tag);
            if !core.options.no_block_cache {
                core.cache.insert(encoded, value.clone(), *version);
            }
        }
        // prev < 0: a recent write; serving is fine, caching is not.
    }
    Ok(got.map(|(value, _)| value))
}

/// The write path: tag the slot first, then delegate to the store as an
/// autocommitted single-key transaction.
fn cached_write(core: &Arc<DbCore>, key: &CacheKey, value: Option<Vec<u8>>) -> Result<()> {
    core.check_open()?;
    key.validate()?;
    core.stats.put();
    let encoded = key.encode();
    if let Some(freshness) = &core.freshness {
        let index = hash_key(key, 0).index;
        freshness.mark_write(index, core.clock.now());
    }
    core.cache.remove(&encoded);

    let mut writes = HashMap::new();
    let _ = writes.insert((core.cf.clone(), encoded), value);
    let _ = core.store.commit(CommitRequest {
        baseline: None,
        check: &[],
        writes: &writes,
        ts: core.clock.now(),
    })?;
    Ok(())
}

fn flush_all_logs(core: &Arc<DbCore>) -> Result<()> {
    let handles: Vec<Arc<LogHandle>> = core.logs.lock().values().cloned().collect();
    for handle in handles {
        handle.flush()?;
    }
    Ok(())
}

/// An embeddable MVCC database handle. See the module docs.
#[derive(Debug)]
pub struct Database {
    core: Arc<DbCore>,
}

impl Database {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let canonical = fs::canonicalize(path)?;
        let shared = shared_for(&canonical);
        let logs_dir = options
            .transaction_logs_path
            .clone()
            .unwrap_or_else(|| canonical.join(TXN_LOG_DIR));
        fs::create_dir_all(&logs_dir)?;
        // A failed mapping disables caching but never the database: reads
        // fall back to going straight through to the store.
        let freshness = match FreshnessTable::open(&canonical.join(FRESHNESS_FILE)) {
            Ok(table) => Some(table),
            Err(err) => {
                warn!(path = %canonical.display(), %err, "freshness table unavailable; caching disabled");
                None
            }
        };
        let cf = options.name.clone().unwrap_or_else(|| DEFAULT_CF.to_owned());
        shared.store.ensure_cf(&cf);
        let log_config = LogConfig {
            max_file_size: options.transaction_log_max_size,
            retention: options.transaction_log_retention,
            max_age_threshold: options.transaction_log_max_age_threshold,
        };
        let workers = WorkerPool::new(options.parallelism_threads.max(1));
        let store = Arc::clone(&shared.store);
        let core = Arc::new(DbCore {
            path: canonical,
            cf,
            shared,
            store,
            clock: MonotonicClock::new(),
            txns: Arc::new(TxnRegistry::default()),
            logs: Mutex::new(HashMap::new()),
            logs_dir,
            log_config,
            freshness,
            cache: ValueCache::new(BLOCK_CACHE_SIZE.load(Ordering::Relaxed)),
            locks: LockTable::default(),
            buffers: BufferRegistry::default(),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            next_txn: AtomicU64::new(1),
            closed: Arc::new(CloseToken::default()),
            workers,
            stats: Stats::default(),
            revalidator: Mutex::new(None),
            options,
        });
        spawn_revalidator(&core);
        OPEN_DATABASES.lock().push(Arc::downgrade(&core));
        info!(path = %core.path.display(), cf = %core.cf, "database opened");
        Ok(Self { core })
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn is_open(&self) -> bool {
        !self.core.closed.is_closed()
    }

    /// Closes the handle: cancels pending async operations, aborts
    /// outstanding transactions, drops buffered log entries, flushes
    /// commit state, and stops the background threads. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.core.closed.is_closed() {
            return Ok(());
        }
        self.core.closed.close();
        // Outstanding transactions: their registrations vanish, so late
        // commits fail and their Drop impls clean the rest.
        self.core.txns.clear();
        self.core.store.clear_row_locks();
        for handle in self.core.logs.lock().values() {
            handle.clear_buffers();
            if let Err(err) = handle.flush() {
                warn!(log = handle.name(), %err, "flush on close failed");
            }
        }
        self.core.cache.clear();
        self.core.workers.shutdown();
        let revalidator = self.core.revalidator.lock().take();
        if let Some(handle) = revalidator {
            let _ = handle.join();
        }
        OPEN_DATABASES
            .lock()
            .retain(|weak| weak.strong_count() > 0 && !weak.ptr_eq(&Arc::downgrade(&self.core)));
        info!(path = %self.core.path.display(), "database closed");
        Ok(())
    }

    /// Closes the handle and deletes every file under the database path.
    pub fn drop_database(self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.core.path)?;
        Ok(())
    }

    /// A strictly increasing millisecond timestamp, monotonic on this
    /// handle even when the wall clock steps backwards.
    pub fn get_monotonic_timestamp(&self) -> Result<u64> {
        self.core.check_open()?;
        Ok(self.core.clock.now())
    }

    /// Start timestamp of the oldest live snapshot on this path, 0 when
    /// none exists.
    pub fn get_oldest_snapshot_timestamp(&self) -> Result<u64> {
        self.core.check_open()?;
        Ok(self.core.store.oldest_snapshot_ts())
    }

    /// Starts a transaction in the mode the handle was opened with.
    pub fn begin(&self) -> Result<Transaction> {
        self.core.check_open()?;
        Ok(Transaction::begin(
            Arc::clone(&self.core),
            self.core.next_txn_id(),
            self.core.options.pessimistic,
        ))
    }

    /// Runs `body` in a transaction: committed on `Ok` (unless the body
    /// aborted it), aborted on `Err`.
    pub fn transaction<T>(
        &self,
        body: impl FnOnce(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut txn = self.begin()?;
        match body(&mut txn) {
            Ok(value) => {
                if txn.is_active() {
                    let _ = txn.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                let _ = txn.abort();
                Err(err)
            }
        }
    }

    /// Returns (creating if absent) the handle of the named log.
    pub fn use_log(&self, name: &str) -> Result<Arc<LogHandle>> {
        self.core.check_open()?;
        self.core.log_handle(name)
    }

    /// Every log under this database and its files.
    pub fn list_logs(&self) -> Result<Vec<LogListing>> {
        self.core.check_open()?;
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.core.logs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let handle = self.core.log_handle(&name)?;
            out.push(LogListing {
                files: handle.list_files(),
                name,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Purges expired log files, or destroys logs outright.
    pub fn purge_logs(&self, opts: PurgeOptions) -> Result<()> {
        self.core.check_open()?;
        let names: Vec<String> = match &opts.name {
            Some(name) => vec![name.clone()],
            None => self
                .list_logs()?
                .into_iter()
                .map(|listing| listing.name)
                .collect(),
        };
        for name in names {
            let handle = self.core.log_handle(&name)?;
            handle.store().purge(opts.before, opts.destroy)?;
            if opts.destroy {
                let _ = self.core.logs.lock().remove(&name);
                let _ = self
                    .core
                    .shared
                    .log_stores
                    .lock()
                    .remove(&self.core.logs_dir.join(&name));
            }
        }
        Ok(())
    }

    /// Cached read of `key`; see the freshness module for the protocol.
    pub fn get_sync(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        cached_get(&self.core, key)
    }

    /// Async variant of [`Database::get_sync`], served by a worker.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let core = Arc::clone(&self.core);
        let key = key.clone();
        self.core
            .workers
            .run(&self.core.closed, move || cached_get(&core, &key))
            .await
    }

    /// Writes `key`, tagging its freshness slot before the store sees the
    /// value.
    pub fn put_sync(&self, key: &CacheKey, value: &[u8]) -> Result<()> {
        cached_write(&self.core, key, Some(value.to_vec()))
    }

    /// Async variant of [`Database::put_sync`].
    pub async fn put(&self, key: &CacheKey, value: Vec<u8>) -> Result<()> {
        let core = Arc::clone(&self.core);
        let key = key.clone();
        self.core
            .workers
            .run(&self.core.closed, move || {
                cached_write(&core, &key, Some(value))
            })
            .await
    }

    /// Removes `key`, with the same freshness discipline as a write.
    pub fn remove_sync(&self, key: &CacheKey) -> Result<()> {
        cached_write(&self.core, key, None)
    }

    /// Async variant of [`Database::remove_sync`].
    pub async fn remove(&self, key: &CacheKey) -> Result<()> {
        let core = Arc::clone(&self.core);
        let key = key.clone();
        self.core
            .workers
            .run(&self.core.closed, move || cached_write(&core, &key, None))
            .await
    }

    /// Drops every value in every column family.
    pub fn clear_sync(&self) -> Result<()> {
        self.core.check_open()?;
        self.core.store.clear();
        self.core.cache.clear();
        Ok(())
    }

    /// Async variant of [`Database::clear_sync`].
    pub async fn clear(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        self.core
            .workers
            .run(&self.core.closed, move || {
                core.check_open()?;
                core.store.clear();
                core.cache.clear();
                Ok(())
            })
            .await
    }

    /// Flushes every log store and persists commit state.
    pub fn flush_sync(&self) -> Result<()> {
        self.core.check_open()?;
        flush_all_logs(&self.core)
    }

    /// Async variant of [`Database::flush_sync`].
    pub async fn flush(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        self.core
            .workers
            .run(&self.core.closed, move || {
                core.check_open()?;
                flush_all_logs(&core)
            })
            .await
    }

    /// Attempts to take the in-process lock on `key`; a refused attempt
    /// may register a callback fired when the holder releases.
    pub fn try_lock(&self, key: &[u8], on_release: Option<ReleaseCallback>) -> Result<bool> {
        self.core.check_open()?;
        Ok(self.core.locks.try_lock(key, on_release))
    }

    /// Releases the in-process lock on `key`.
    pub fn unlock(&self, key: &[u8]) -> Result<bool> {
        self.core.check_open()?;
        Ok(self.core.locks.unlock(key))
    }

    /// Whether `key` is currently locked.
    pub fn has_lock(&self, key: &[u8]) -> Result<bool> {
        self.core.check_open()?;
        Ok(self.core.locks.has_lock(key))
    }

    /// Runs `body` holding the lock on `key`, waiting if needed.
    pub fn with_lock_sync<T>(&self, key: &[u8], body: impl FnOnce() -> T) -> Result<T> {
        self.core.check_open()?;
        self.core.locks.with_lock(key, self.core.closed.flag(), body)
    }

    /// Async variant of [`Database::with_lock_sync`]; the wait happens on
    /// a worker thread.
    pub async fn with_lock<T, F>(&self, key: &[u8], body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        let key = key.to_vec();
        self.core
            .workers
            .run(&self.core.closed, move || {
                core.locks.with_lock(&key, core.closed.flag(), body)
            })
            .await
    }

    /// Returns the named shared buffer, creating it from `default` on
    /// first request; `callback` (if any) fires on every notify.
    pub fn get_user_shared_buffer(
        &self,
        name: &str,
        default: &[u8],
        callback: Option<BufferCallback>,
    ) -> Result<Arc<SharedBuffer>> {
        self.core.check_open()?;
        Ok(self.core.buffers.get_or_create(name, default, callback))
    }

    /// Subscribes `callback` to `event`; returns a listener id for `off`.
    pub fn on(&self, event: &str, callback: ListenerCallback) -> Result<u64> {
        self.core.check_open()?;
        let id = self.core.next_listener.fetch_add(1, Ordering::Relaxed);
        self.core
            .listeners
            .lock()
            .entry(event.to_owned())
            .or_default()
            .push((id, callback));
        Ok(id)
    }

    /// Removes one listener; true when it existed.
    pub fn off(&self, event: &str, id: u64) -> Result<bool> {
        self.core.check_open()?;
        let mut listeners = self.core.listeners.lock();
        match listeners.get_mut(event) {
            Some(list) => {
                let before = list.len();
                list.retain(|(lid, _)| *lid != id);
                Ok(list.len() < before)
            }
            None => Ok(false),
        }
    }

    /// Fires every listener of `event`; returns how many ran.
    pub fn notify_listeners(&self, event: &str, bytes: Option<&[u8]>) -> Result<usize> {
        self.core.check_open()?;
        let callbacks: Vec<ListenerCallback> = self
            .core
            .listeners
            .lock()
            .get(event)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for callback in &callbacks {
            callback(bytes);
        }
        Ok(callbacks.len())
    }

    /// Creates the named column family if it does not exist.
    pub fn column_family(&self, name: &str) -> Result<()> {
        self.core.check_open()?;
        self.core.store.ensure_cf(name);
        Ok(())
    }

    pub fn column_families(&self) -> Result<Vec<String>> {
        self.core.check_open()?;
        let mut names = self.core.store.cf_names();
        names.sort();
        Ok(names)
    }

    /// Counter snapshot; requires `enable_stats` at open.
    pub fn get_stats(&self) -> Result<StatsSnapshot> {
        self.core.check_open()?;
        if !self.core.options.enable_stats {
            return Err(Error::new(
                ErrorKind::StatsNotEnabled,
                "statistics were not enabled when the database was opened",
            ));
        }
        Ok(self.core.stats.snapshot())
    }

    /// Reads a named introspection property.
    pub fn get_property(&self, name: &str) -> Result<String> {
        self.core.check_open()?;
        match name {
            "db.path" => Ok(self.core.path.display().to_string()),
            "db.column-families" => Ok(self.core.store.cf_names().len().to_string()),
            "db.oldest-snapshot-timestamp" => {
                Ok(self.core.store.oldest_snapshot_ts().to_string())
            }
            "txnlog.open-logs" => Ok(self.core.logs.lock().len().to_string()),
            _ => Err(Error::new(
                ErrorKind::PropertyUnavailable,
                format!("unknown property {name:?}"),
            )),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn spawn_revalidator(core: &Arc<DbCore>) {
    let weak = Arc::downgrade(core);
    let handle = std::thread::Builder::new()
        .name("woofdb-revalidator".into())
        .spawn(move || {
            let mut last_sweep = Instant::now();
            loop {
                // Short naps so a close is noticed promptly.
                std::thread::sleep(Duration::from_millis(200));
                let core = match weak.upgrade() {
                    Some(core) => core,
                    None => return,
                };
                if core.closed.is_closed() {
                    return;
                }
                if last_sweep.elapsed() >= REVALIDATE_INTERVAL {
                    if let Some(freshness) = &core.freshness {
                        let oldest = core.store.oldest_snapshot_ts();
                        let _ = freshness.sweep(oldest, wall_now_millis());
                    }
                    last_sweep = Instant::now();
                }
            }
        })
        .expect("failed to spawn revalidator thread");
    *core.revalidator.lock() = Some(handle);
}

/// Closes every database still open in this process.
pub fn shutdown() {
    let cores: Vec<Arc<DbCore>> = {
        let mut open = OPEN_DATABASES.lock();
        let cores = open.iter().filter_map(Weak::upgrade).collect();
        open.clear();
        cores
    };
    for core in cores {
        let db = Database { core };
        let _ = db.close();
    }
    SHARED_PATHS.lock().clear();
}

/// Sets the process-wide soft budget of local value caches; existing
/// handles adopt it immediately.
pub fn set_block_cache_size(bytes: usize) {
    BLOCK_CACHE_SIZE.store(bytes, Ordering::Relaxed);
    for core in OPEN_DATABASES.lock().iter().filter_map(Weak::upgrade) {
        core.cache.set_budget(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_on_one_path_share_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let a = Database::open(dir.path(), DbOptions::default()).unwrap();
        let b = Database::open(dir.path(), DbOptions::default()).unwrap();

        a.transaction(|txn| txn.put(b"shared", b"value")).unwrap();
        let mut txn = b.begin().unwrap();
        assert_eq!(txn.get(b"shared").unwrap(), Some(b"value".to_vec()));
        txn.abort().unwrap();
    }

    #[test]
    fn handles_on_distinct_paths_are_isolated() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = Database::open(dir_a.path(), DbOptions::default()).unwrap();
        let b = Database::open(dir_b.path(), DbOptions::default()).unwrap();

        a.transaction(|txn| txn.put(b"k", b"v")).unwrap();
        let mut txn = b.begin().unwrap();
        assert_eq!(txn.get(b"k").unwrap(), None);
        txn.abort().unwrap();
    }

    #[test]
    fn transaction_helper_aborts_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), DbOptions::default()).unwrap();
        let err = db
            .transaction(|txn| {
                txn.put(b"k", b"never")?;
                Err::<(), _>(Error::invalid_argument("caller bail"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut txn = db.begin().unwrap();
        assert_eq!(txn.get(b"k").unwrap(), None);
        txn.abort().unwrap();
    }

    #[test]
    fn transaction_helper_respects_an_explicit_abort() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), DbOptions::default()).unwrap();
        db.transaction(|txn| {
            txn.put(b"k", b"gone")?;
            txn.abort()
        })
        .unwrap();
        let mut txn = db.begin().unwrap();
        assert_eq!(txn.get(b"k").unwrap(), None);
        txn.abort().unwrap();
    }

    #[test]
    fn log_handles_are_cached_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), DbOptions::default()).unwrap();
        let a = db.use_log("same").unwrap();
        let b = db.use_log("same").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = db.use_log("other").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn list_logs_is_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), DbOptions::default()).unwrap();
        for name in ["zeta", "alpha", "mid"] {
            let log = db.use_log(name).unwrap();
            db.transaction(|txn| log.add_entry(b"x", txn.id())).unwrap();
        }
        let names: Vec<String> = db
            .list_logs()
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn invalid_log_names_are_rejected_at_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), DbOptions::default()).unwrap();
        assert_eq!(
            db.use_log("../escape").unwrap_err().kind(),
            ErrorKind::InvalidLogName
        );
    }

    #[test]
    fn properties_reflect_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), DbOptions::default()).unwrap();
        assert_eq!(db.get_property("db.oldest-snapshot-timestamp").unwrap(), "0");
        let _ = db.use_log("p").unwrap();
        assert_eq!(db.get_property("txnlog.open-logs").unwrap(), "1");
        db.column_family("extra").unwrap();
        assert!(db.column_families().unwrap().contains(&"extra".to_owned()));
    }
}
