//! `Dispatcher`: shards users across N [`Pool`]s by hashing the user id,
//! derives each user's on-disk path, and is the sole public entry point
//! the (out of scope) HTTP layer calls into.
//!
//! Grounded on `dispatcher::DBExecutor` for the overall shape (one lock
//! per user, "get or open, run the op, return") generalized from a single
//! `HashMap` guard to N sharded [`Pool`]s, and on `settings::Pool` (§6)
//! for the shard count / pool size / maintenance knobs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use syncstorage_common::{DbError, SyncTimestamp};
use syncstorage_settings::Settings;

use crate::maintenance;
use crate::models::{Bso, BsoWrite, GetBsosRequest, GetBsosResponse, PostBsosResult, Usage};
use crate::pool::Pool;

/// How long `Acquire` will wait for a free pool slot before giving up.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    data_dir: String,
    shards: Vec<Pool>,
    acquire_timeout: Duration,
    pool_settings: syncstorage_settings::Pool,
    closed: AtomicBool,
}

/// For every user id `u`, the path produced is
/// `<base>/<reverse(u)[0:2]>/<reverse(u)[2:4]>/<u>.db`: the reversed
/// decimal id fans requests out across two levels of subdirectories so a
/// single directory never accumulates every user's file.
pub fn path_for(base_dir: &str, uid: i64) -> PathBuf {
    let mut reversed: String = uid.to_string().chars().rev().collect();
    while reversed.len() < 4 {
        reversed.push('0');
    }
    let (first, rest) = reversed.split_at(2);
    let second = &rest[0..2];
    PathBuf::from(base_dir)
        .join(first)
        .join(second)
        .join(format!("{}.db", uid))
}

impl Dispatcher {
    pub fn new(settings: &Settings) -> Self {
        let shards = (0..settings.pool.num.max(1))
            .map(|_| Pool::new(settings.pool.size as usize))
            .collect();
        Dispatcher {
            data_dir: settings.data_dir.clone(),
            shards,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            pool_settings: settings.pool.clone(),
            closed: AtomicBool::new(false),
        }
    }

    fn shard_index(&self, uid: i64) -> usize {
        (uid as u64 as usize) % self.shards.len()
    }

    fn database_url(&self, uid: i64) -> String {
        if self.data_dir == ":memory:" {
            return ":memory:".to_string();
        }
        path_for(&self.data_dir, uid).to_string_lossy().into_owned()
    }

    /// Whether `uid` already has a database file on disk. Always true in
    /// `:memory:` mode, where there's no filesystem existence to check and
    /// the usual per-uid caching in `Pool` is what makes repeated
    /// `Acquire`s for the same uid observe the same in-memory database.
    fn file_exists(&self, uid: i64) -> bool {
        self.data_dir == ":memory:" || path_for(&self.data_dir, uid).is_file()
    }

    /// Entry point for operations that must not create a user's database
    /// file merely by looking at it (§3 Lifecycle: "read-only operations on
    /// an unknown user return not found without creating the file"). If the
    /// file doesn't exist yet, `absent` supplies the result as though the
    /// user's database existed but were empty, without opening anything.
    fn with_db_readonly<R>(
        &self,
        uid: i64,
        absent: impl FnOnce() -> Result<R, DbError>,
        op: impl FnOnce(&crate::models::UserDb) -> Result<R, DbError>,
    ) -> Result<R, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::closed());
        }
        if !self.file_exists(uid) {
            return absent();
        }
        self.with_db(uid, op)
    }

    fn with_db<R>(&self, uid: i64, op: impl FnOnce(&crate::models::UserDb) -> Result<R, DbError>) -> Result<R, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::closed());
        }

        let database_url = self.database_url(uid);
        if self.data_dir != ":memory:" {
            if let Some(parent) = PathBuf::from(&database_url).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DbError::io(format!("failed to create {:?}: {}", parent, e)))?;
            }
        }

        let pool = &self.shards[self.shard_index(uid)];
        let deadline = Instant::now() + self.acquire_timeout;
        let guard = pool.acquire(uid, &database_url, deadline)?;

        let result = op(&guard);

        if guard.should_run_purge() {
            // Best-effort: a maintenance failure must never fail the
            // request it piggybacked on.
            let _ = maintenance::maybe_run(&guard, &self.pool_settings);
        }

        result
    }

    pub fn get_collection_id(&self, uid: i64, name: &str) -> Result<i32, DbError> {
        self.with_db_readonly(uid, || Err(DbError::collection_not_found()), |db| db.get_collection_id(name))
    }

    pub fn create_collection(&self, uid: i64, name: &str) -> Result<i32, DbError> {
        self.with_db(uid, |db| db.create_collection(name))
    }

    pub fn delete_collection(&self, uid: i64, collection_id: i32) -> Result<(), DbError> {
        self.with_db(uid, |db| db.delete_collection(collection_id))
    }

    pub fn touch_collection(&self, uid: i64, collection_id: i32, modified: SyncTimestamp) -> Result<(), DbError> {
        self.with_db(uid, |db| db.touch_collection(collection_id, modified))
    }

    pub fn info_collections(&self, uid: i64) -> Result<std::collections::HashMap<String, SyncTimestamp>, DbError> {
        self.with_db_readonly(uid, || Ok(Default::default()), |db| db.info_collections())
    }

    pub fn info_collection_usage(&self, uid: i64) -> Result<std::collections::HashMap<String, i64>, DbError> {
        self.with_db_readonly(uid, || Ok(Default::default()), |db| db.info_collection_usage())
    }

    pub fn info_collection_counts(&self, uid: i64) -> Result<std::collections::HashMap<String, i64>, DbError> {
        self.with_db_readonly(uid, || Ok(Default::default()), |db| db.info_collection_counts())
    }

    pub fn info_quota(&self, uid: i64) -> Result<(i64, Option<i64>), DbError> {
        self.with_db_readonly(uid, || Ok((0, None)), |db| db.info_quota())
    }

    pub fn put_bso(&self, uid: i64, collection_id: i32, write: BsoWrite) -> Result<SyncTimestamp, DbError> {
        self.with_db(uid, |db| db.put_bso(collection_id, &write))
    }

    pub fn post_bsos(&self, uid: i64, collection_id: i32, writes: Vec<BsoWrite>) -> Result<PostBsosResult, DbError> {
        self.with_db(uid, |db| db.post_bsos(collection_id, writes))
    }

    pub fn get_bso(&self, uid: i64, collection_id: i32, bso_id: &str) -> Result<Bso, DbError> {
        self.with_db_readonly(uid, || Err(DbError::bso_not_found()), |db| db.get_bso(collection_id, bso_id))
    }

    pub fn get_bso_modified(&self, uid: i64, collection_id: i32, bso_id: &str) -> Result<SyncTimestamp, DbError> {
        self.with_db_readonly(
            uid,
            || Err(DbError::bso_not_found()),
            |db| db.get_bso_modified(collection_id, bso_id),
        )
    }

    pub fn get_bsos(&self, uid: i64, collection_id: i32, request: GetBsosRequest) -> Result<GetBsosResponse, DbError> {
        self.with_db_readonly(uid, || Ok(Default::default()), |db| db.get_bsos(collection_id, request))
    }

    pub fn delete_bso(&self, uid: i64, collection_id: i32, bso_id: &str) -> Result<SyncTimestamp, DbError> {
        self.with_db(uid, |db| db.delete_bso(collection_id, bso_id))
    }

    pub fn delete_bsos(&self, uid: i64, collection_id: i32, ids: &[String]) -> Result<SyncTimestamp, DbError> {
        self.with_db(uid, |db| db.delete_bsos(collection_id, ids))
    }

    pub fn delete_everything(&self, uid: i64) -> Result<(), DbError> {
        self.with_db(uid, |db| db.delete_everything())
    }

    pub fn purge_expired(&self, uid: i64) -> Result<i64, DbError> {
        self.with_db_readonly(uid, || Ok(0), |db| db.purge_expired())
    }

    pub fn usage(&self, uid: i64) -> Result<Usage, DbError> {
        self.with_db_readonly(uid, || Ok(Default::default()), |db| db.usage())
    }

    pub fn optimize(&self, uid: i64, free_pct_threshold: u32) -> Result<bool, DbError> {
        self.with_db_readonly(uid, || Ok(false), |db| db.optimize(free_pct_threshold))
    }

    pub fn batch_create(&self, uid: i64, collection_id: i32, bsos: Vec<BsoWrite>, ttl_millis: i64) -> Result<i64, DbError> {
        self.with_db(uid, |db| db.batch_create(collection_id, bsos, ttl_millis))
    }

    pub fn batch_append(&self, uid: i64, batch_id: i64, bsos: Vec<BsoWrite>) -> Result<(), DbError> {
        self.with_db_readonly(uid, || Err(DbError::batch_not_found()), |db| db.batch_append(batch_id, bsos))
    }

    pub fn batch_exists(&self, uid: i64, batch_id: i64, collection_id: i32) -> Result<bool, DbError> {
        self.with_db_readonly(uid, || Ok(false), |db| db.batch_exists(batch_id, collection_id))
    }

    pub fn batch_load(&self, uid: i64, batch_id: i64) -> Result<Vec<BsoWrite>, DbError> {
        self.with_db_readonly(uid, || Err(DbError::batch_not_found()), |db| db.batch_load(batch_id))
    }

    pub fn batch_remove(&self, uid: i64, batch_id: i64) -> Result<(), DbError> {
        self.with_db_readonly(uid, || Err(DbError::batch_not_found()), |db| db.batch_remove(batch_id))
    }

    pub fn batch_commit(&self, uid: i64, batch_id: i64, collection_id: i32) -> Result<SyncTimestamp, DbError> {
        self.with_db_readonly(
            uid,
            || Err(DbError::batch_not_found()),
            |db| db.batch_commit(batch_id, collection_id),
        )
    }

    /// Closes every shard's pool, draining in-flight checkouts first.
    /// Every subsequent call returns `DbError::closed()`.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for pool in &self.shards {
            pool.drain();
        }
    }

    #[cfg(test)]
    pub(crate) fn open_count(&self, uid: i64) -> usize {
        self.shards[self.shard_index(uid)].open_count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_derivation_matches_reverse_prefix_scheme() {
        let path = path_for("/data", 100_001_234);
        assert_eq!(path, PathBuf::from("/data/43/21/100001234.db"));
    }

    #[test]
    fn path_derivation_pads_short_ids() {
        let path = path_for("/data", 5);
        assert_eq!(path, PathBuf::from("/data/50/00/5.db"));
    }

    fn test_settings(shards: u32, pool_size: u32, data_dir: &str) -> Settings {
        let mut settings = Settings::default();
        settings.pool.num = shards;
        settings.pool.size = pool_size;
        settings.data_dir = data_dir.to_string();
        settings
    }

    #[test]
    fn lru_eviction_closes_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(1, 2, dir.path().to_str().unwrap());
        let dispatcher = Dispatcher::new(&settings);

        // A write actually opens (and lazily creates) the user's file;
        // a read on an as-yet-untouched user must not (see
        // `read_only_ops_do_not_create_the_file` below).
        dispatcher.create_collection(1, "my-coll").unwrap();
        dispatcher.create_collection(2, "my-coll").unwrap();
        assert_eq!(dispatcher.open_count(1), 2);

        dispatcher.create_collection(3, "my-coll").unwrap();
        // 1 was the LRU entry and had to make room for 3.
        assert_eq!(dispatcher.open_count(1), 2);

        // Touching 2 again doesn't grow the open set past the cap; 1
        // stays evicted since 2 and 3 are the two most-recently used. 2's
        // file already exists by now, so a read op still goes through the
        // pool (rather than being short-circuited by `file_exists`).
        dispatcher.get_collection_id(2, "my-coll").unwrap();
        assert_eq!(dispatcher.open_count(1), 2);
    }

    #[test]
    fn read_only_ops_do_not_create_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(1, 4, dir.path().to_str().unwrap());
        let dispatcher = Dispatcher::new(&settings);

        let info = dispatcher.info_collections(1).unwrap();
        assert!(info.is_empty());
        assert!(!path_for(dir.path().to_str().unwrap(), 1).exists());
        assert_eq!(dispatcher.open_count(1), 0);

        let err = dispatcher.get_bso(1, 1, "missing").unwrap_err();
        assert!(matches!(err.kind, syncstorage_common::DbErrorKind::BsoNotFound));
        assert!(!path_for(dir.path().to_str().unwrap(), 1).exists());

        // A write against the same uid does create it, lazily.
        dispatcher.create_collection(1, "my-coll").unwrap();
        assert!(path_for(dir.path().to_str().unwrap(), 1).is_file());
    }

    #[test]
    fn closed_dispatcher_rejects_new_work() {
        let settings = test_settings(1, 4, ":memory:");
        let dispatcher = Dispatcher::new(&settings);
        dispatcher.shutdown();
        let err = dispatcher.info_collections(1).unwrap_err();
        assert!(matches!(err.kind, syncstorage_common::DbErrorKind::Closed));
    }
}
