//! `UserDb`: one user's entire storage, backed by a single SQLite file.
//!
//! Grounded on the legacy `db::models::DBManager` (the shape of `put_bso`'s
//! exists-then-update-or-insert transaction, `touch_collection_and_storage`,
//! `info_collections`'s `modified != 0` filter) and cross-checked against
//! `db::mysql::models` for the BSO query/sort/limit shape. Unlike either of
//! those, there is no `user_id` column anywhere: the file itself is the
//! user, and a single exclusive lock (held by whichever `Pool` `Entry` owns
//! this `UserDb`) serializes every operation, so no statement here needs to
//! run inside its own additional mutex.

use std::cell::Cell;
use std::collections::HashMap;
use std::{thread, time::Duration};

use diesel::{
    connection::SimpleConnection,
    delete,
    dsl::sql,
    insert_into,
    query_builder::BoxedSelectStatement,
    result::{DatabaseErrorInformation, Error as DieselError, Error::NotFound},
    sql_query,
    sql_types::{BigInt, Integer},
    sqlite::{Sqlite, SqliteConnection},
    update, Connection, ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl,
};
use serde::{Deserialize, Serialize};

use syncstorage_common::{DbError, SyncTimestamp};

use crate::connection;
use crate::schema::{batches, bso, collections, keyvalues};

/// Default TTL applied to a BSO when none is supplied: effectively
/// "never", the same 100-year convention the legacy implementation used.
pub const DEFAULT_BSO_TTL_MILLIS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Key under which the last successful purge's timestamp is stored in the
/// per-user `keyvalues` table.
const LASTPURGE_KEY: &str = "lastpurge";

/// First id handed out to a user-created collection; ids below this are
/// reserved for the well-known names seeded by `schema.sql`.
const FIRST_USER_COLLECTION_ID: i32 = 100;

/// Attempts (including the first) `retry_on_busy` makes before giving up
/// on a `DatabaseBusy` error and surfacing it as `DbError::io` instead of
/// retrying again.
const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sorting {
    None,
    Newest,
    Oldest,
    Index,
}

#[derive(Debug, Clone, Queryable, Serialize)]
pub struct Bso {
    pub collection_id: i32,
    pub id: String,
    pub sortindex: Option<i32>,
    pub payload: String,
    pub payload_size: i64,
    pub modified: i64,
    pub expiry: i64,
}

/// A single record supplied to `put_bso`/`post_bsos`/batch append: any of
/// `payload`/`sortindex`/`ttl` may be absent, meaning "leave unchanged" on
/// an update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BsoWrite {
    pub id: String,
    pub payload: Option<String>,
    pub sortindex: Option<i32>,
    /// Seconds, not milliseconds, matching the wire `ttl` field.
    pub ttl: Option<i64>,
}

#[derive(Debug, Default)]
pub struct GetBsosRequest {
    pub ids: Option<Vec<String>>,
    pub newer_than: Option<i64>,
    pub older_than: Option<i64>,
    pub sort: Sorting,
    pub limit: Option<i64>,
    pub offset: i64,
    /// Whether to run the extra `COUNT(*)` needed to populate `total`.
    pub need_total: bool,
}

#[derive(Debug, Default)]
pub struct GetBsosResponse {
    pub items: Vec<Bso>,
    pub next_offset: Option<i64>,
    pub total: Option<i64>,
    pub modified: SyncTimestamp,
}

#[derive(Debug, Default)]
pub struct PostBsosResult {
    pub success: Vec<String>,
    pub failed: HashMap<String, String>,
    pub modified: SyncTimestamp,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Usage {
    pub total_pages: i64,
    pub free_pages: i64,
    pub page_size_bytes: i64,
}

impl Default for Sorting {
    fn default() -> Self {
        Sorting::None
    }
}

pub struct UserDb {
    conn: SqliteConnection,
    /// In-memory high-water mark for this user's `modified` clock,
    /// initialized from the database on open. Every mutation advances it;
    /// see [`UserDb::bump_modified`].
    last_modified: Cell<SyncTimestamp>,
}

fn validate_bso_id(id: &str) -> Result<(), DbError> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(DbError::invalid(format!("invalid bso id: {:?}", id)))
    }
}

fn validate_collection_name(name: &str) -> Result<(), DbError> {
    let ok = !name.is_empty()
        && name.len() <= 32
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(DbError::invalid(format!("invalid collection name: {:?}", name)))
    }
}

impl UserDb {
    pub fn open(database_url: &str) -> Result<Self, DbError> {
        let conn = connection::open(database_url)?;
        let last_modified: i64 = retry_on_busy(|| {
            collections::table
                .select(sql::<BigInt>("COALESCE(MAX(modified), 0)"))
                .first(&conn)
        })?;
        Ok(UserDb {
            conn,
            last_modified: Cell::new(SyncTimestamp::from_i64(last_modified)),
        })
    }

    /// The monotonic "now" used by every mutating operation: never less
    /// than the wall clock, and always strictly greater than the last
    /// value this user's db has ever recorded.
    fn bump_modified(&self) -> SyncTimestamp {
        let next = SyncTimestamp::advance_from(self.last_modified.get());
        self.last_modified.set(next);
        next
    }

    pub fn timestamp(&self) -> SyncTimestamp {
        self.last_modified.get()
    }

    /// Runs `body` inside a SQLite transaction, retrying the whole thing
    /// on `DatabaseBusy` per [`retry_on_busy`]. `body` is re-entered from
    /// scratch on each attempt (the prior attempt's writes were already
    /// rolled back by the failed `COMMIT`), so it must not depend on
    /// mutating state outside of what it captures by value or shared
    /// reference.
    pub(crate) fn transaction<T>(
        &self,
        mut body: impl FnMut() -> Result<T, DieselError>,
    ) -> Result<T, DbError> {
        retry_on_busy(|| self.conn.transaction(&mut body))
    }

    pub fn get_collection_id(&self, name: &str) -> Result<i32, DbError> {
        retry_on_busy(|| {
            collections::table
                .select(collections::id)
                .filter(collections::name.eq(name))
                .first(&self.conn)
                .optional()
        })?
        .ok_or_else(DbError::collection_not_found)
    }

    pub fn create_collection(&self, name: &str) -> Result<i32, DbError> {
        validate_collection_name(name)?;

        // Held under the pool's per-user lock for this UserDb's whole
        // lifetime, so there's no concurrent writer to race against
        // between this check and the insert below.
        let exists = retry_on_busy(|| {
            collections::table
                .select(sql::<Integer>("1"))
                .filter(collections::name.eq(name))
                .get_result::<i32>(&self.conn)
                .optional()
        })?
        .is_some();
        if exists {
            return Err(DbError::conflict(format!("collection {:?} already exists", name)));
        }

        self.transaction(|| {
            let next_id: Option<i32> = collections::table
                .select(sql::<diesel::sql_types::Nullable<Integer>>("MAX(id)"))
                .filter(collections::id.ge(FIRST_USER_COLLECTION_ID))
                .first(&self.conn)?;
            let new_id = next_id.map(|id| id + 1).unwrap_or(FIRST_USER_COLLECTION_ID);

            insert_into(collections::table)
                .values((
                    collections::id.eq(new_id),
                    collections::name.eq(name),
                    collections::modified.eq(0),
                ))
                .execute(&self.conn)?;
            Ok(new_id)
        })
    }

    pub fn delete_collection(&self, collection_id: i32) -> Result<(), DbError> {
        // Checked outside the transaction (same pattern as
        // `create_collection`'s conflict check) so a missing row can be
        // reported as `CollectionNotFound` rather than riding through
        // `map_diesel`'s generic `NotFound -> BsoNotFound` mapping, which
        // is meant for `Bso` queries, not this one.
        let exists = retry_on_busy(|| {
            collections::table
                .select(sql::<Integer>("1"))
                .filter(collections::id.eq(collection_id))
                .get_result::<i32>(&self.conn)
                .optional()
        })?
        .is_some();
        if !exists {
            return Err(DbError::collection_not_found());
        }

        self.transaction(|| {
            delete(collections::table.filter(collections::id.eq(collection_id))).execute(&self.conn)?;
            delete(bso::table.filter(bso::collection_id.eq(collection_id))).execute(&self.conn)?;
            delete(batches::table.filter(batches::collection_id.eq(collection_id)))
                .execute(&self.conn)?;
            Ok(())
        })
    }

    pub fn touch_collection(&self, collection_id: i32, modified: SyncTimestamp) -> Result<(), DbError> {
        let rows = retry_on_busy(|| {
            update(collections::table)
                .filter(collections::id.eq(collection_id))
                .set(collections::modified.eq(modified.as_i64()))
                .execute(&self.conn)
        })?;
        if rows == 0 {
            return Err(DbError::collection_not_found());
        }
        Ok(())
    }

    pub fn info_collections(&self) -> Result<HashMap<String, SyncTimestamp>, DbError> {
        Ok(retry_on_busy(|| {
            collections::table
                .select((collections::name, collections::modified))
                .filter(collections::modified.ne(0))
                .load::<(String, i64)>(&self.conn)
        })?
        .into_iter()
        .map(|(name, modified)| (name, SyncTimestamp::from_i64(modified)))
        .collect())
    }

    pub fn info_collection_usage(&self) -> Result<HashMap<String, i64>, DbError> {
        let cut_off = SyncTimestamp::now().as_i64();
        Ok(retry_on_busy(|| {
            bso::table
                .inner_join(collections::table.on(collections::id.eq(bso::collection_id)))
                .select((collections::name, sql::<BigInt>("COALESCE(SUM(payload_size), 0)")))
                .filter(bso::expiry.gt(cut_off))
                .group_by(collections::name)
                .load::<(String, i64)>(&self.conn)
        })?
        .into_iter()
        .collect())
    }

    pub fn info_collection_counts(&self) -> Result<HashMap<String, i64>, DbError> {
        let cut_off = SyncTimestamp::now().as_i64();
        Ok(retry_on_busy(|| {
            bso::table
                .inner_join(collections::table.on(collections::id.eq(bso::collection_id)))
                .select((collections::name, sql::<BigInt>("COUNT(*)")))
                .filter(bso::expiry.gt(cut_off))
                .group_by(collections::name)
                .load::<(String, i64)>(&self.conn)
        })?
        .into_iter()
        .collect())
    }

    /// `(used_kb, quota_kb)`; `quota_kb` is always `None` since this
    /// storage engine enforces no per-user quota (one file per user, sized
    /// only by the filesystem).
    pub fn info_quota(&self) -> Result<(i64, Option<i64>), DbError> {
        let used: i64 = retry_on_busy(|| {
            bso::table
                .select(sql::<BigInt>("COALESCE(SUM(payload_size), 0)"))
                .first(&self.conn)
        })?;
        Ok((used / 1024, None))
    }

    pub fn put_bso(
        &self,
        collection_id: i32,
        write: &BsoWrite,
    ) -> Result<SyncTimestamp, DbError> {
        validate_bso_id(&write.id)?;
        let modified = self.bump_modified();
        self.transaction(|| {
            let exists = bso::table
                .select(sql::<Integer>("1"))
                .filter(bso::collection_id.eq(collection_id))
                .filter(bso::id.eq(&write.id))
                .get_result::<i32>(&self.conn)
                .optional()?
                .is_some();

            if exists {
                let modified_i64 = if write.payload.is_some() || write.sortindex.is_some() {
                    Some(modified.as_i64())
                } else {
                    None
                };
                let expiry = write.ttl.map(|ttl| modified.as_i64() + ttl * 1000);
                update(bso::table)
                    .filter(bso::collection_id.eq(collection_id))
                    .filter(bso::id.eq(&write.id))
                    .set(BsoChangeset {
                        sortindex: write.sortindex,
                        payload: write.payload.as_deref(),
                        payload_size: write.payload.as_ref().map(|p| p.len() as i64),
                        modified: modified_i64,
                        expiry,
                    })
                    .execute(&self.conn)?;
            } else {
                let payload = write.payload.clone().unwrap_or_default();
                let ttl_millis = write.ttl.map(|ttl| ttl * 1000).unwrap_or(DEFAULT_BSO_TTL_MILLIS);
                insert_into(bso::table)
                    .values((
                        bso::collection_id.eq(collection_id),
                        bso::id.eq(&write.id),
                        bso::sortindex.eq(write.sortindex),
                        bso::payload.eq(&payload),
                        bso::payload_size.eq(payload.len() as i64),
                        bso::modified.eq(modified.as_i64()),
                        bso::expiry.eq(modified.as_i64() + ttl_millis),
                    ))
                    .execute(&self.conn)?;
            }

            update(collections::table)
                .filter(collections::id.eq(collection_id))
                .set(collections::modified.eq(modified.as_i64()))
                .execute(&self.conn)?;
            Ok(())
        })?;
        Ok(modified)
    }

    pub fn post_bsos(
        &self,
        collection_id: i32,
        writes: Vec<BsoWrite>,
    ) -> Result<PostBsosResult, DbError> {
        let modified = self.bump_modified();

        // `writes` is borrowed, not moved, and `success`/`failed` are
        // built fresh inside the closure rather than mutated from
        // outside it, so a `DatabaseBusy` retry re-runs this from a
        // clean slate instead of double-counting a prior attempt's
        // partial results.
        let (success, failed) = self.transaction(|| {
            let mut success = Vec::with_capacity(writes.len());
            let mut failed = HashMap::new();

            for write in &writes {
                if let Err(e) = validate_bso_id(&write.id) {
                    failed.insert(write.id.clone(), e.to_string());
                    continue;
                }

                let exists = bso::table
                    .select(sql::<Integer>("1"))
                    .filter(bso::collection_id.eq(collection_id))
                    .filter(bso::id.eq(&write.id))
                    .get_result::<i32>(&self.conn)
                    .optional()?
                    .is_some();

                if exists {
                    let modified_i64 = if write.payload.is_some() || write.sortindex.is_some() {
                        Some(modified.as_i64())
                    } else {
                        None
                    };
                    let expiry = write.ttl.map(|ttl| modified.as_i64() + ttl * 1000);
                    update(bso::table)
                        .filter(bso::collection_id.eq(collection_id))
                        .filter(bso::id.eq(&write.id))
                        .set(BsoChangeset {
                            sortindex: write.sortindex,
                            payload: write.payload.as_deref(),
                            payload_size: write.payload.as_ref().map(|p| p.len() as i64),
                            modified: modified_i64,
                            expiry,
                        })
                        .execute(&self.conn)?;
                } else {
                    let payload = write.payload.clone().unwrap_or_default();
                    let ttl_millis =
                        write.ttl.map(|ttl| ttl * 1000).unwrap_or(DEFAULT_BSO_TTL_MILLIS);
                    insert_into(bso::table)
                        .values((
                            bso::collection_id.eq(collection_id),
                            bso::id.eq(&write.id),
                            bso::sortindex.eq(write.sortindex),
                            bso::payload.eq(&payload),
                            bso::payload_size.eq(payload.len() as i64),
                            bso::modified.eq(modified.as_i64()),
                            bso::expiry.eq(modified.as_i64() + ttl_millis),
                        ))
                        .execute(&self.conn)?;
                }
                success.push(write.id.clone());
            }

            update(collections::table)
                .filter(collections::id.eq(collection_id))
                .set(collections::modified.eq(modified.as_i64()))
                .execute(&self.conn)?;
            Ok((success, failed))
        })?;

        Ok(PostBsosResult {
            success,
            failed,
            modified,
        })
    }

    pub fn get_bso(&self, collection_id: i32, bso_id: &str) -> Result<Bso, DbError> {
        let cut_off = SyncTimestamp::now().as_i64();
        retry_on_busy(|| {
            bso::table
                .select(bso::all_columns)
                .filter(bso::collection_id.eq(collection_id))
                .filter(bso::id.eq(bso_id))
                .filter(bso::expiry.gt(cut_off))
                .first::<Bso>(&self.conn)
                .optional()
        })?
        .ok_or_else(DbError::bso_not_found)
    }

    pub fn get_bso_modified(&self, collection_id: i32, bso_id: &str) -> Result<SyncTimestamp, DbError> {
        self.get_bso(collection_id, bso_id)
            .map(|bso| SyncTimestamp::from_i64(bso.modified))
    }

    pub fn get_bsos(
        &self,
        collection_id: i32,
        request: GetBsosRequest,
    ) -> Result<GetBsosResponse, DbError> {
        let cut_off = SyncTimestamp::now().as_i64();
        let limit = request.limit.filter(|&l| l >= 0);

        let mut query = bso_filters(
            bso::table.select(bso::all_columns).into_boxed(),
            collection_id,
            cut_off,
            &request,
        );

        query = match request.sort {
            Sorting::Index => query.order((bso::sortindex.desc(), bso::id.asc())),
            Sorting::Newest => query.order(bso::modified.desc()),
            Sorting::Oldest => query.order(bso::modified.asc()),
            Sorting::None => query,
        };

        if let Some(limit) = limit {
            // Fetch one extra row so we can tell whether the result was
            // truncated without a second COUNT query.
            query = query.limit(limit + 1);
        }
        if request.offset != 0 {
            query = query.offset(request.offset);
        }

        // `query` is a boxed statement already consumed by `.load`, so it
        // can't be re-run through `retry_on_busy` without rebuilding it;
        // the `busy_timeout` pragma (connection.rs) already covers this
        // single statement.
        let mut items = query.load::<Bso>(&self.conn).map_err(map_diesel)?;

        let next_offset = match limit {
            Some(limit) if items.len() as i64 > limit => {
                items.truncate(limit as usize);
                Some(request.offset + limit)
            }
            _ => None,
        };

        let total = if request.need_total {
            // Same predicate chain as `items` above (minus order/limit/
            // offset, which don't affect a count), so `total` always
            // describes the same filtered result set `items` was drawn
            // from rather than the whole collection.
            let count: i64 = retry_on_busy(|| {
                bso_filters(
                    bso::table.select(sql::<BigInt>("COUNT(*)")).into_boxed(),
                    collection_id,
                    cut_off,
                    &request,
                )
                .first(&self.conn)
            })?;
            Some(count)
        } else {
            None
        };

        let modified = retry_on_busy(|| {
            collections::table
                .select(collections::modified)
                .filter(collections::id.eq(collection_id))
                .first::<i64>(&self.conn)
                .optional()
        })?
        .map(SyncTimestamp::from_i64)
        .unwrap_or_default();

        Ok(GetBsosResponse {
            items,
            next_offset,
            total,
            modified,
        })
    }

    pub fn delete_bso(&self, collection_id: i32, bso_id: &str) -> Result<SyncTimestamp, DbError> {
        let modified = self.bump_modified();
        self.transaction(|| {
            let deleted = delete(bso::table)
                .filter(bso::collection_id.eq(collection_id))
                .filter(bso::id.eq(bso_id))
                .execute(&self.conn)?;
            if deleted == 0 {
                return Err(NotFound);
            }
            update(collections::table)
                .filter(collections::id.eq(collection_id))
                .set(collections::modified.eq(modified.as_i64()))
                .execute(&self.conn)?;
            Ok(())
        })?;
        Ok(modified)
    }

    pub fn delete_bsos(&self, collection_id: i32, ids: &[String]) -> Result<SyncTimestamp, DbError> {
        let modified = self.bump_modified();
        self.transaction(|| {
            delete(bso::table)
                .filter(bso::collection_id.eq(collection_id))
                .filter(bso::id.eq_any(ids))
                .execute(&self.conn)?;
            update(collections::table)
                .filter(collections::id.eq(collection_id))
                .set(collections::modified.eq(modified.as_i64()))
                .execute(&self.conn)?;
            Ok(())
        })?;
        Ok(modified)
    }

    pub fn delete_everything(&self) -> Result<(), DbError> {
        warn!("wiping all collections for this user");
        self.transaction(|| {
            delete(bso::table).execute(&self.conn)?;
            delete(batches::table).execute(&self.conn)?;
            update(collections::table)
                .set(collections::modified.eq(0))
                .execute(&self.conn)?;
            Ok(())
        })
    }

    pub fn purge_expired(&self) -> Result<i64, DbError> {
        let now = SyncTimestamp::now().as_i64();
        let purged = self.transaction(|| {
            let bsos = delete(bso::table.filter(bso::expiry.le(now))).execute(&self.conn)?;
            let batches = delete(batches::table.filter(batches::expiry.le(now))).execute(&self.conn)?;
            Ok((bsos + batches) as i64)
        })?;
        if purged > 0 {
            debug!("purged expired rows"; "count" => purged);
        }
        Ok(purged)
    }

    pub fn usage(&self) -> Result<Usage, DbError> {
        #[derive(QueryableByName)]
        struct Row {
            #[sql_type = "BigInt"]
            value: i64,
        }
        let page_count: Row =
            retry_on_busy(|| sql_query("PRAGMA page_count;").get_result(&self.conn))?;
        let freelist: Row =
            retry_on_busy(|| sql_query("PRAGMA freelist_count;").get_result(&self.conn))?;
        let page_size: Row =
            retry_on_busy(|| sql_query("PRAGMA page_size;").get_result(&self.conn))?;
        Ok(Usage {
            total_pages: page_count.value,
            free_pages: freelist.value,
            page_size_bytes: page_size.value,
        })
    }

    /// If the fraction of free pages is at or above `free_pct_threshold`,
    /// rewrites the file with `VACUUM` to reclaim the space and returns
    /// `true`. A no-op (and `false`) otherwise, including on an empty
    /// database (`total_pages == 0`).
    pub fn optimize(&self, free_pct_threshold: u32) -> Result<bool, DbError> {
        let usage = self.usage()?;
        if usage.total_pages == 0 {
            return Ok(false);
        }
        let free_pct = usage.free_pages.saturating_mul(100) / usage.total_pages;
        if free_pct >= free_pct_threshold as i64 {
            self.conn
                .batch_execute("VACUUM;")
                .map_err(|e| DbError::io(format!("vacuum failed: {}", e)))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Unconditionally rewrites the file to reclaim space. Unlike
    /// `optimize`, which gates on a free-page percentage for the public
    /// API, background maintenance gates on an absolute free-byte
    /// threshold and calls this directly once it's decided to vacuum.
    pub fn vacuum(&self) -> Result<(), DbError> {
        self.conn
            .batch_execute("VACUUM;")
            .map_err(|e| DbError::io(format!("vacuum failed: {}", e)))
    }

    pub fn last_purge(&self) -> Result<Option<i64>, DbError> {
        retry_on_busy(|| {
            keyvalues::table
                .select(keyvalues::value)
                .filter(keyvalues::key.eq(LASTPURGE_KEY))
                .first::<String>(&self.conn)
                .optional()
        })?
        .map(|v| v.parse().map_err(|_| DbError::internal("corrupt lastpurge value")))
        .transpose()
    }

    pub fn record_purge(&self, at: i64) -> Result<(), DbError> {
        retry_on_busy(|| {
            diesel::replace_into(keyvalues::table)
                .values((keyvalues::key.eq(LASTPURGE_KEY), keyvalues::value.eq(at.to_string())))
                .execute(&self.conn)
        })?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &SqliteConnection {
        &self.conn
    }

    pub(crate) fn advance_modified(&self) -> SyncTimestamp {
        self.bump_modified()
    }
}

#[derive(AsChangeset)]
#[table_name = "bso"]
struct BsoChangeset<'a> {
    sortindex: Option<i32>,
    payload: Option<&'a str>,
    payload_size: Option<i64>,
    modified: Option<i64>,
    expiry: Option<i64>,
}

/// Applies `get_bsos`'s filter predicates (collection, expiry, and
/// whichever of `ids`/`newer_than`/`older_than` the request set) to a
/// boxed statement, shared between the `items` query and the `total`
/// `COUNT(*)` query so the two always agree on which rows they're
/// counting.
fn bso_filters<'a, ST>(
    query: BoxedSelectStatement<'a, ST, bso::table, Sqlite>,
    collection_id: i32,
    cut_off: i64,
    request: &'a GetBsosRequest,
) -> BoxedSelectStatement<'a, ST, bso::table, Sqlite> {
    let mut query = query
        .filter(bso::collection_id.eq(collection_id))
        .filter(bso::expiry.gt(cut_off));

    if let Some(ids) = &request.ids {
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        query = query.filter(bso::id.eq_any(ids));
    }
    if let Some(newer) = request.newer_than {
        query = query.filter(bso::modified.gt(newer));
    }
    if let Some(older) = request.older_than {
        query = query.filter(bso::modified.lt(older));
    }
    query
}

/// Retries `op` while it returns `DatabaseBusy`, with a linearly growing
/// backoff, up to `BUSY_RETRY_ATTEMPTS` attempts. The `busy_timeout`
/// pragma (connection.rs) already makes this rare; this is the bounded
/// last-resort so a caller of `UserDb`/`Dispatcher` never observes
/// `DbErrorKind::Locked` itself, only an `io` error once the budget is
/// exhausted.
pub(crate) fn retry_on_busy<T>(mut op: impl FnMut() -> Result<T, DieselError>) -> Result<T, DbError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(DieselError::DatabaseError(diesel::result::DatabaseErrorKind::DatabaseBusy, info)) => {
                attempt += 1;
                if attempt >= BUSY_RETRY_ATTEMPTS {
                    return Err(DbError::io(format!(
                        "database still busy after {} attempts: {}",
                        attempt,
                        info.message()
                    )));
                }
                thread::sleep(BUSY_RETRY_BASE_DELAY * attempt);
            }
            Err(e) => return Err(map_diesel(e)),
        }
    }
}

pub(crate) fn map_diesel(e: DieselError) -> DbError {
    match e {
        NotFound => DbError::bso_not_found(),
        DieselError::DatabaseError(diesel::result::DatabaseErrorKind::DatabaseBusy, _) => {
            DbError::locked()
        }
        e => DbError::io(e.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use syncstorage_common::DbErrorIntrospect;

    fn db() -> UserDb {
        UserDb::open(":memory:").unwrap()
    }

    fn write(id: &str, payload: Option<&str>, sortindex: Option<i32>, ttl: Option<i64>) -> BsoWrite {
        BsoWrite {
            id: id.to_owned(),
            payload: payload.map(str::to_owned),
            sortindex,
            ttl,
        }
    }

    #[test]
    fn well_known_collections_are_preseeded() {
        let db = db();
        assert_eq!(db.get_collection_id("bookmarks").unwrap(), 1);
        assert_eq!(db.get_collection_id("clients").unwrap(), 10);
        assert_eq!(db.get_collection_id("reading-list").unwrap(), 12);
    }

    #[test]
    fn create_collection_assigns_ids_at_or_above_100() {
        let db = db();
        let first = db.create_collection("my-coll").unwrap();
        assert!(first >= FIRST_USER_COLLECTION_ID);
        let second = db.create_collection("another-coll").unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn create_collection_rejects_duplicate_name() {
        let db = db();
        db.create_collection("my-coll").unwrap();
        let err = db.create_collection("my-coll").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn create_collection_rejects_invalid_name() {
        let db = db();
        let err = db.create_collection("has a space").unwrap_err();
        assert!(matches!(err.kind, syncstorage_common::DbErrorKind::Invalid(_)));
    }

    #[test]
    fn put_bso_round_trips_every_supplied_field() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        db.put_bso(cid, &write("b1", Some("hello"), Some(7), Some(3600)))
            .unwrap();

        let bso = db.get_bso(cid, "b1").unwrap();
        assert_eq!(bso.payload, "hello");
        assert_eq!(bso.sortindex, Some(7));
    }

    #[test]
    fn put_bso_update_preserves_unsupplied_fields() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        db.put_bso(cid, &write("b1", Some("initial"), Some(1), Some(3600)))
            .unwrap();

        // Only sortindex supplied on the update: payload and ttl must be
        // left exactly as they were.
        db.put_bso(cid, &write("b1", None, Some(2), None)).unwrap();

        let bso = db.get_bso(cid, "b1").unwrap();
        assert_eq!(bso.payload, "initial");
        assert_eq!(bso.sortindex, Some(2));
    }

    #[test]
    fn ttl_only_update_does_not_bump_bso_modified() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let created = db.put_bso(cid, &write("b1", Some("hello"), Some(1), Some(10))).unwrap();

        // A later mutation elsewhere in the user's db, so "now" has
        // definitely advanced past `created`.
        db.put_bso(cid, &write("b2", Some("other"), None, None)).unwrap();
        let ttl_touch = db.put_bso(cid, &write("b1", None, None, Some(7200))).unwrap();
        assert!(ttl_touch > created);

        let bso = db.get_bso(cid, "b1").unwrap();
        // The bso's own `modified` is untouched by a ttl-only write...
        assert_eq!(bso.modified, created.as_i64());
        // ...but the new ttl did take effect.
        assert_eq!(bso.expiry, ttl_touch.as_i64() + 7200 * 1000);
    }

    #[test]
    fn modified_is_strictly_monotonic_even_within_one_millisecond() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let m1 = db.put_bso(cid, &write("b1", Some("a"), None, None)).unwrap();
        let m2 = db.put_bso(cid, &write("b2", Some("b"), None, None)).unwrap();
        assert!(m2 > m1);
    }

    #[test]
    fn touching_a_bso_touches_its_collection() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let modified = db.put_bso(cid, &write("b1", Some("a"), None, None)).unwrap();
        let info = db.info_collections().unwrap();
        assert_eq!(info.get("my-coll").copied(), Some(modified));
    }

    #[test]
    fn info_collections_omits_untouched_collections() {
        let db = db();
        db.create_collection("my-coll").unwrap();
        let info = db.info_collections().unwrap();
        assert!(!info.contains_key("my-coll"));
        // The well-known names are pre-seeded with modified=0 too.
        assert!(!info.contains_key("bookmarks"));
    }

    #[test]
    fn expired_bso_reads_as_not_found() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        db.put_bso(cid, &write("b1", Some("hello"), None, Some(-1))).unwrap();

        let err = db.get_bso(cid, "b1").unwrap_err();
        assert!(err.is_bso_not_found());
    }

    #[test]
    fn expired_bso_excluded_from_counts_and_usage() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        db.put_bso(cid, &write("live", Some("keep"), None, None)).unwrap();
        db.put_bso(cid, &write("dead", Some("drop"), None, Some(-1))).unwrap();

        let counts = db.info_collection_counts().unwrap();
        assert_eq!(counts.get("my-coll").copied(), Some(1));

        let usage = db.info_collection_usage().unwrap();
        assert_eq!(usage.get("my-coll").copied(), Some(4)); // len("keep")
    }

    #[test]
    fn purge_expired_removes_expired_rows_and_counts_them() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        db.put_bso(cid, &write("dead", Some("x"), None, Some(-1))).unwrap();
        db.put_bso(cid, &write("live", Some("y"), None, None)).unwrap();

        assert_eq!(db.purge_expired().unwrap(), 1);
        // Idempotent: nothing left to purge the second time.
        assert_eq!(db.purge_expired().unwrap(), 0);
        assert!(db.get_bso(cid, "live").is_ok());
    }

    #[test]
    fn delete_collection_of_absent_collection_is_collection_not_found() {
        let db = db();
        let err = db.delete_collection(12345).unwrap_err();
        assert!(matches!(
            err.kind,
            syncstorage_common::DbErrorKind::CollectionNotFound
        ));
    }

    #[test]
    fn delete_collection_removes_its_bsos_and_batches() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        db.put_bso(cid, &write("b1", Some("x"), None, None)).unwrap();
        db.batch_create(cid, vec![write("b2", Some("y"), None, None)], 3_600_000)
            .unwrap();

        db.delete_collection(cid).unwrap();

        assert!(db.get_bso(cid, "b1").is_err());
        let err = db.get_collection_id("my-coll").unwrap_err();
        assert!(matches!(
            err.kind,
            syncstorage_common::DbErrorKind::CollectionNotFound
        ));
    }

    #[test]
    fn delete_bso_of_absent_bso_is_not_found() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let err = db.delete_bso(cid, "nope").unwrap_err();
        assert!(err.is_bso_not_found());
    }

    #[test]
    fn delete_everything_then_read_is_empty() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        db.put_bso(cid, &write("b1", Some("x"), None, None)).unwrap();

        db.delete_everything().unwrap();

        assert!(db.info_collections().unwrap().is_empty());
        assert!(db.get_bso(cid, "b1").is_err());
    }

    #[test]
    fn post_bsos_reports_partial_success() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let result = db
            .post_bsos(
                cid,
                vec![
                    write("good", Some("ok"), None, None),
                    write("bad id with spaces", Some("nope"), None, None),
                ],
            )
            .unwrap();

        assert_eq!(result.success, vec!["good".to_string()]);
        assert!(result.failed.contains_key("bad id with spaces"));
        assert!(db.get_bso(cid, "good").is_ok());
    }

    #[test]
    fn get_bsos_sort_newest_orders_descending_by_modified() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        db.put_bso(cid, &write("a", Some("1"), None, None)).unwrap();
        db.put_bso(cid, &write("b", Some("2"), None, None)).unwrap();
        db.put_bso(cid, &write("c", Some("3"), None, None)).unwrap();

        let resp = db
            .get_bsos(
                cid,
                GetBsosRequest {
                    sort: Sorting::Newest,
                    ..Default::default()
                },
            )
            .unwrap();
        let ids: Vec<&str> = resp.items.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn get_bsos_limit_sets_next_offset_when_truncated() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        for id in ["a", "b", "c"] {
            db.put_bso(cid, &write(id, Some("x"), None, None)).unwrap();
        }

        let resp = db
            .get_bsos(
                cid,
                GetBsosRequest {
                    sort: Sorting::Oldest,
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(resp.items.len(), 2);
        assert_eq!(resp.next_offset, Some(2));

        let resp = db
            .get_bsos(
                cid,
                GetBsosRequest {
                    sort: Sorting::Oldest,
                    limit: Some(2),
                    offset: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(resp.items.len(), 1);
        assert_eq!(resp.next_offset, None);
    }

    #[test]
    fn get_bsos_total_respects_ids_and_time_range_filters() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        db.put_bso(cid, &write("a", Some("1"), None, None)).unwrap();
        db.put_bso(cid, &write("b", Some("2"), None, None)).unwrap();
        db.put_bso(cid, &write("c", Some("3"), None, None)).unwrap();

        let resp = db
            .get_bsos(
                cid,
                GetBsosRequest {
                    ids: Some(vec!["a".to_string(), "b".to_string()]),
                    need_total: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(resp.items.len(), 2);
        assert_eq!(resp.total, Some(2));

        // A `newer_than` cutoff past every row's `modified` should drop
        // `total` to zero too, not just `items`.
        let resp = db
            .get_bsos(
                cid,
                GetBsosRequest {
                    newer_than: Some(SyncTimestamp::now().as_i64() + 1),
                    need_total: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(resp.items.len(), 0);
        assert_eq!(resp.total, Some(0));
    }

    #[test]
    fn optimize_is_a_noop_below_threshold() {
        let db = db();
        db.create_collection("my-coll").unwrap();
        assert_eq!(db.optimize(100).unwrap(), false);
    }
}
