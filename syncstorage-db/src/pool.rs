//! `Pool`: a bounded cache of open [`UserDb`] handles, keyed by user id,
//! with the "is this entry currently checked out" flag doubling as the
//! per-user mutual-exclusion lock.
//!
//! Grounded on `dispatcher::DBExecutor`'s `HashMap<String, Mutex<DBManager>>`
//! (the shape of "one handle per user, guarded individually") generalized
//! with bounded eviction, the same way the teacher's own `CollectionCache`
//! hand-rolls a bounded `RwLock<HashMap<..>>` with a `last_used` instant
//! rather than reaching for a generic LRU crate.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use syncstorage_common::DbError;

use crate::models::UserDb;

struct Slot {
    db: Arc<UserDb>,
    in_use: bool,
    purge_ran: bool,
    last_used: Instant,
}

struct Inner {
    entries: HashMap<i64, Slot>,
}

/// A bounded cache of open per-user database handles for one shard.
pub struct Pool {
    capacity: usize,
    inner: Mutex<Inner>,
    /// Signalled whenever a slot is released or evicted, so a blocked
    /// `acquire` can recheck for room.
    released: Condvar,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Pool {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
            }),
            released: Condvar::new(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Pins and returns the `UserDb` for `uid`, opening it via
    /// `database_url` if it isn't already cached. Blocks (bounded by
    /// `deadline`) if the user's existing entry is already checked out by
    /// another caller, or if the cache is full and every entry is pinned.
    pub fn acquire(&self, uid: i64, database_url: &str, deadline: Instant) -> Result<PoolGuard<'_>, DbError> {
        loop {
            let mut guard = self.inner.lock().unwrap();

            if let Some(slot) = guard.entries.get_mut(&uid) {
                if !slot.in_use {
                    slot.in_use = true;
                    slot.last_used = Instant::now();
                    let db = slot.db.clone();
                    return Ok(PoolGuard { pool: self, uid, db: Some(db) });
                }
                // Checked out by someone else: wait for a release.
                guard = self.wait(guard, deadline)?;
                drop(guard);
                continue;
            }

            if guard.entries.len() < self.capacity {
                // Opening a file is I/O; never do it with the pool lock
                // held.
                drop(guard);
                let db = Arc::new(UserDb::open(database_url)?);
                let mut guard = self.inner.lock().unwrap();
                // Another thread may have opened this uid while we didn't
                // hold the lock; prefer the one already inserted.
                if let Some(slot) = guard.entries.get_mut(&uid) {
                    if slot.in_use {
                        drop(db);
                        guard = self.wait(guard, deadline)?;
                        drop(guard);
                        continue;
                    }
                    slot.in_use = true;
                    slot.last_used = Instant::now();
                    let db = slot.db.clone();
                    return Ok(PoolGuard { pool: self, uid, db: Some(db) });
                }
                // Other threads may also have opened and inserted distinct
                // uids while we didn't hold the lock, so the capacity check
                // above is stale; re-check before inserting. If the shard
                // filled up in the meantime, drop the connection we just
                // opened and fall through to the evict/wait path below
                // instead of pushing the open count past `capacity`.
                if guard.entries.len() < self.capacity {
                    guard.entries.insert(
                        uid,
                        Slot {
                            db: db.clone(),
                            in_use: true,
                            purge_ran: false,
                            last_used: Instant::now(),
                        },
                    );
                    return Ok(PoolGuard { pool: self, uid, db: Some(db) });
                }
                drop(db);
                if self.evict_one_unpinned(&mut guard) {
                    continue;
                }
                guard = self.wait(guard, deadline)?;
                drop(guard);
                continue;
            }

            if self.evict_one_unpinned(&mut guard) {
                continue;
            }

            guard = self.wait(guard, deadline)?;
            drop(guard);
        }
    }

    /// Removes and closes (by dropping) the least-recently-used entry
    /// with a zero refcount. Returns whether one was found.
    fn evict_one_unpinned(&self, guard: &mut std::sync::MutexGuard<'_, Inner>) -> bool {
        let victim = guard
            .entries
            .iter()
            .filter(|(_, slot)| !slot.in_use)
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(&uid, _)| uid);
        match victim {
            Some(uid) => {
                guard.entries.remove(&uid);
                true
            }
            None => false,
        }
    }

    fn wait<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, Inner>,
        deadline: Instant,
    ) -> Result<std::sync::MutexGuard<'a, Inner>, DbError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(DbError::timeout());
        }
        let (guard, timeout) = self
            .released
            .wait_timeout(guard, deadline - now)
            .map_err(|_| DbError::internal("pool lock poisoned"))?;
        if timeout.timed_out() && Instant::now() >= deadline {
            return Err(DbError::timeout());
        }
        Ok(guard)
    }

    fn release(&self, uid: i64) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(slot) = guard.entries.get_mut(&uid) {
            slot.in_use = false;
            slot.last_used = Instant::now();
        }
        drop(guard);
        self.released.notify_all();
    }

    /// Whether `uid`'s maintenance worker already ran a purge for the
    /// current checkout, set/cleared by the dispatcher's maintenance
    /// scheduling.
    fn take_purge_ran(&self, uid: i64) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if let Some(slot) = guard.entries.get_mut(&uid) {
            std::mem::replace(&mut slot.purge_ran, true)
        } else {
            false
        }
    }

    /// Drains every entry (blocking until none are pinned) and closes
    /// them, for dispatcher shutdown.
    pub fn drain(&self) {
        loop {
            let mut guard = self.inner.lock().unwrap();
            if guard.entries.values().all(|slot| !slot.in_use) {
                guard.entries.clear();
                return;
            }
            let deadline = Instant::now() + Duration::from_secs(30);
            let (new_guard, _) = self
                .released
                .wait_timeout(guard, deadline - Instant::now())
                .unwrap();
            guard = new_guard;
            drop(guard);
        }
    }
}

/// An acquired, pinned `UserDb`. Dropping it (or calling
/// [`PoolGuard::release`] explicitly) unpins the entry and makes it
/// eligible for eviction again.
pub struct PoolGuard<'p> {
    pool: &'p Pool,
    uid: i64,
    db: Option<Arc<UserDb>>,
}

impl<'p> PoolGuard<'p> {
    pub fn db(&self) -> &UserDb {
        self.db.as_ref().expect("db taken after release")
    }

    /// Whether this checkout should run a purge before releasing, per the
    /// dispatcher's maintenance schedule: true the first time this flag
    /// is observed since the entry was opened or last purged.
    pub fn should_run_purge(&self) -> bool {
        !self.pool.take_purge_ran(self.uid)
    }
}

impl<'p> std::ops::Deref for PoolGuard<'p> {
    type Target = UserDb;

    fn deref(&self) -> &UserDb {
        self.db()
    }
}

impl<'p> Drop for PoolGuard<'p> {
    fn drop(&mut self) {
        self.db.take();
        self.pool.release(self.uid);
    }
}
