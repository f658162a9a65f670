//! The POST-batch protocol: a staging area that lets a client upload
//! records across several HTTP requests and have them all become visible
//! atomically on commit.
//!
//! Grounded on `db::mysql::batch`'s create/append/get/commit shape (the
//! legacy MySQL implementation joins a `batch_upload_items` staging table
//! into `bso` on commit); this crate's schema has no such per-record
//! staging table, so instead the whole staged set is kept as one
//! serialized blob per the `Batches` table in `schema.sql`, merged record
//! by record on append the same way `post_bsos` merges writes into `bso`.
//!
//! Every method here runs under the same per-user exclusive lock as the
//! rest of `UserDb`, so a read-then-write pair (append, commit) never
//! races a concurrent caller; only a single diesel statement at a time
//! needs its own transaction.

use diesel::{
    delete, dsl::sql, insert_into, sql_types::BigInt, update, ExpressionMethods, OptionalExtension,
    QueryDsl, RunQueryDsl,
};

use syncstorage_common::{DbError, SyncTimestamp};

use crate::models::{retry_on_busy, BsoWrite, PostBsosResult, UserDb};
use crate::schema::batches;

impl UserDb {
    pub fn batch_create(
        &self,
        collection_id: i32,
        bsos: Vec<BsoWrite>,
        ttl_millis: i64,
    ) -> Result<i64, DbError> {
        let batch_id = self.advance_modified().as_i64();
        let expiry = batch_id + ttl_millis;
        let payload = serde_json::to_string(&bsos)
            .map_err(|e| DbError::internal(format!("failed to serialize batch: {}", e)))?;

        retry_on_busy(|| {
            insert_into(batches::table)
                .values((
                    batches::id.eq(batch_id),
                    batches::collection_id.eq(collection_id),
                    batches::bsos.eq(&payload),
                    batches::expiry.eq(expiry),
                ))
                .execute(self.conn())
        })?;

        Ok(batch_id)
    }

    pub fn batch_append(&self, batch_id: i64, bsos: Vec<BsoWrite>) -> Result<(), DbError> {
        let row: Option<(String, i64)> = retry_on_busy(|| {
            batches::table
                .select((batches::bsos, batches::expiry))
                .filter(batches::id.eq(batch_id))
                .first(self.conn())
                .optional()
        })?;
        let (existing, expiry) = row.ok_or_else(DbError::batch_not_found)?;
        if expiry <= SyncTimestamp::now().as_i64() {
            return Err(DbError::expired());
        }

        let merged = merge_bsos(&existing, bsos)?;
        let serialized =
            serde_json::to_string(&merged).map_err(|e| DbError::internal(format!("failed to serialize batch: {}", e)))?;

        retry_on_busy(|| {
            update(batches::table)
                .filter(batches::id.eq(batch_id))
                .set(batches::bsos.eq(&serialized))
                .execute(self.conn())
        })?;
        Ok(())
    }

    pub fn batch_exists(&self, batch_id: i64, collection_id: i32) -> Result<bool, DbError> {
        let now = SyncTimestamp::now().as_i64();
        Ok(retry_on_busy(|| {
            batches::table
                .select(sql::<BigInt>("1"))
                .filter(batches::id.eq(batch_id))
                .filter(batches::collection_id.eq(collection_id))
                .filter(batches::expiry.gt(now))
                .get_result::<i64>(self.conn())
                .optional()
        })?
        .is_some())
    }

    pub fn batch_load(&self, batch_id: i64) -> Result<Vec<BsoWrite>, DbError> {
        let blob: Option<String> = retry_on_busy(|| {
            batches::table
                .select(batches::bsos)
                .filter(batches::id.eq(batch_id))
                .first(self.conn())
                .optional()
        })?;
        let blob = blob.ok_or_else(DbError::batch_not_found)?;
        serde_json::from_str(&blob).map_err(|e| DbError::internal(format!("corrupt batch: {}", e)))
    }

    pub fn batch_remove(&self, batch_id: i64) -> Result<(), DbError> {
        let deleted = retry_on_busy(|| {
            delete(batches::table.filter(batches::id.eq(batch_id))).execute(self.conn())
        })?;
        if deleted == 0 {
            return Err(DbError::batch_not_found());
        }
        Ok(())
    }

    /// Atomically applies every record staged in `batch_id` to
    /// `collection_id` with a single shared `modified` value, touches the
    /// collection, and removes the batch. Reuses `post_bsos`'s per-record
    /// validation and upsert semantics.
    pub fn batch_commit(&self, batch_id: i64, collection_id: i32) -> Result<SyncTimestamp, DbError> {
        let expiry: Option<i64> = retry_on_busy(|| {
            batches::table
                .select(batches::expiry)
                .filter(batches::id.eq(batch_id))
                .first(self.conn())
                .optional()
        })?;
        let expiry = expiry.ok_or_else(DbError::batch_not_found)?;
        if expiry <= SyncTimestamp::now().as_i64() {
            retry_on_busy(|| {
                delete(batches::table.filter(batches::id.eq(batch_id))).execute(self.conn())
            })?;
            return Err(DbError::expired());
        }

        let bsos = self.batch_load(batch_id)?;
        let PostBsosResult { modified, .. } = self.post_bsos(collection_id, bsos)?;

        retry_on_busy(|| {
            delete(batches::table.filter(batches::id.eq(batch_id))).execute(self.conn())
        })?;

        Ok(modified)
    }
}

/// Merges newly-appended records into the existing staged set: a record
/// sharing an id with an already-staged one replaces it outright (the
/// batch protocol doesn't do partial-field merges mid-batch, only
/// `batch_commit`'s eventual `post_bsos` does), everything else is
/// appended.
fn merge_bsos(existing_json: &str, incoming: Vec<BsoWrite>) -> Result<Vec<BsoWrite>, DbError> {
    let mut existing: Vec<BsoWrite> = serde_json::from_str(existing_json)
        .map_err(|e| DbError::internal(format!("corrupt batch: {}", e)))?;
    for write in incoming {
        if let Some(slot) = existing.iter_mut().find(|b| b.id == write.id) {
            *slot = write;
        } else {
            existing.push(write);
        }
    }
    Ok(existing)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::UserDb;
    use syncstorage_common::DbErrorIntrospect;

    fn db() -> UserDb {
        UserDb::open(":memory:").unwrap()
    }

    fn write(id: &str, payload: &str) -> BsoWrite {
        BsoWrite {
            id: id.to_owned(),
            payload: Some(payload.to_owned()),
            sortindex: None,
            ttl: None,
        }
    }

    #[test]
    fn create_append_commit_round_trip() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();

        let batch_id = db.batch_create(cid, vec![write("b1", "one")], 3_600_000).unwrap();
        db.batch_append(batch_id, vec![write("b2", "two")]).unwrap();

        let modified = db.batch_commit(batch_id, cid).unwrap();

        let b1 = db.get_bso(cid, "b1").unwrap();
        let b2 = db.get_bso(cid, "b2").unwrap();
        assert_eq!(b1.modified, modified.as_i64());
        assert_eq!(b2.modified, modified.as_i64());
        assert_eq!(b1.payload, "one");
        assert_eq!(b2.payload, "two");

        // The batch row is gone once committed.
        assert!(db.batch_load(batch_id).is_err());
    }

    #[test]
    fn append_replaces_a_record_sharing_an_id() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let batch_id = db.batch_create(cid, vec![write("b1", "first")], 3_600_000).unwrap();

        db.batch_append(batch_id, vec![write("b1", "second")]).unwrap();

        let staged = db.batch_load(batch_id).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].payload.as_deref(), Some("second"));
    }

    #[test]
    fn batch_exists_is_scoped_to_its_collection() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let other_cid = db.create_collection("other-coll").unwrap();
        let batch_id = db.batch_create(cid, vec![write("b1", "one")], 3_600_000).unwrap();

        assert!(db.batch_exists(batch_id, cid).unwrap());
        assert!(!db.batch_exists(batch_id, other_cid).unwrap());
    }

    #[test]
    fn append_to_expired_batch_is_rejected() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let batch_id = db.batch_create(cid, vec![write("b1", "one")], -1).unwrap();

        let err = db.batch_append(batch_id, vec![write("b2", "two")]).unwrap_err();
        assert!(matches!(err.kind, syncstorage_common::DbErrorKind::Expired));
    }

    #[test]
    fn commit_of_expired_batch_is_rejected_and_removes_the_batch() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let batch_id = db.batch_create(cid, vec![write("b1", "one")], -1).unwrap();

        let err = db.batch_commit(batch_id, cid).unwrap_err();
        assert!(matches!(err.kind, syncstorage_common::DbErrorKind::Expired));
        assert!(db.batch_load(batch_id).is_err());
    }

    #[test]
    fn remove_of_absent_batch_is_not_found() {
        let db = db();
        let err = db.batch_remove(999).unwrap_err();
        assert!(err.is_batch_not_found());
    }

    #[test]
    fn remove_drops_a_staged_batch() {
        let db = db();
        let cid = db.create_collection("my-coll").unwrap();
        let batch_id = db.batch_create(cid, vec![write("b1", "one")], 3_600_000).unwrap();

        db.batch_remove(batch_id).unwrap();
        assert!(db.batch_load(batch_id).is_err());
    }
}
