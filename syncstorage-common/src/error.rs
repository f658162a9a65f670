use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use thiserror::Error;

use crate::{impl_fmt_display, ReportableError};

/// The storage engine's error taxonomy. Every `UserDb`/`Pool`/`Dispatcher`
/// operation returns one of these kinds, never a backend-specific error
/// type (e.g. `diesel::result::Error` is always wrapped before it escapes
/// `syncstorage-db`).
#[derive(Debug, Error)]
pub enum DbErrorKind {
    #[error("Collection not found")]
    CollectionNotFound,
    #[error("Bso not found")]
    BsoNotFound,
    #[error("Batch not found")]
    BatchNotFound,
    #[error("Conflict: {}", _0)]
    Conflict(String),
    #[error("Invalid: {}", _0)]
    Invalid(String),
    #[error("Expired")]
    Expired,
    #[error("Database busy, retry")]
    Locked,
    #[error("Timed out waiting for a pool slot")]
    Timeout,
    #[error("Dispatcher is closed")]
    Closed,
    #[error("Internal error: {}", _0)]
    Internal(String),
    #[error("{}", _0)]
    Io(String),
}

#[derive(Debug)]
pub struct DbError {
    pub kind: DbErrorKind,
    pub status: StatusCode,
    pub backtrace: Box<Backtrace>,
}

impl DbError {
    fn build(kind: DbErrorKind, status: StatusCode) -> Self {
        Self {
            kind,
            status,
            backtrace: Box::new(Backtrace::new()),
        }
    }

    pub fn collection_not_found() -> Self {
        Self::build(DbErrorKind::CollectionNotFound, StatusCode::NOT_FOUND)
    }

    pub fn bso_not_found() -> Self {
        Self::build(DbErrorKind::BsoNotFound, StatusCode::NOT_FOUND)
    }

    pub fn batch_not_found() -> Self {
        // Matches the sync client's expectation that a missing/expired batch
        // is reported the same way a malformed batch id would be.
        Self::build(DbErrorKind::BatchNotFound, StatusCode::BAD_REQUEST)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::build(DbErrorKind::Conflict(msg.into()), StatusCode::CONFLICT)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::build(DbErrorKind::Invalid(msg.into()), StatusCode::BAD_REQUEST)
    }

    pub fn expired() -> Self {
        Self::build(DbErrorKind::Expired, StatusCode::BAD_REQUEST)
    }

    pub fn locked() -> Self {
        Self::build(DbErrorKind::Locked, StatusCode::SERVICE_UNAVAILABLE)
    }

    pub fn timeout() -> Self {
        Self::build(DbErrorKind::Timeout, StatusCode::SERVICE_UNAVAILABLE)
    }

    pub fn closed() -> Self {
        Self::build(DbErrorKind::Closed, StatusCode::SERVICE_UNAVAILABLE)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::build(DbErrorKind::Internal(msg.into()), StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::build(DbErrorKind::Io(msg.into()), StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Lets callers ask what kind of failure occurred without matching on
/// `DbErrorKind` directly, the way `syncstorage-db-common`'s
/// `DbErrorIntrospect` lets call sites stay backend-agnostic.
pub trait DbErrorIntrospect {
    fn is_collection_not_found(&self) -> bool;
    fn is_bso_not_found(&self) -> bool;
    fn is_batch_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_retryable(&self) -> bool;
}

impl DbErrorIntrospect for DbError {
    fn is_collection_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::CollectionNotFound)
    }

    fn is_bso_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::BsoNotFound)
    }

    fn is_batch_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::BatchNotFound)
    }

    fn is_conflict(&self) -> bool {
        matches!(self.kind, DbErrorKind::Conflict(_))
    }

    fn is_retryable(&self) -> bool {
        matches!(self.kind, DbErrorKind::Locked | DbErrorKind::Timeout)
    }
}

impl ReportableError for DbError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        // Transient lock contention and expected not-found/conflict
        // responses aren't worth an event; everything else is.
        !matches!(
            self.kind,
            DbErrorKind::Locked
                | DbErrorKind::Timeout
                | DbErrorKind::CollectionNotFound
                | DbErrorKind::BsoNotFound
                | DbErrorKind::BatchNotFound
                | DbErrorKind::Conflict(_)
                | DbErrorKind::Expired
        )
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            DbErrorKind::Locked => Some("storage.locked".to_owned()),
            DbErrorKind::Timeout => Some("storage.pool_timeout".to_owned()),
            DbErrorKind::Io(_) => Some("storage.io".to_owned()),
            _ => None,
        }
    }
}

impl_fmt_display!(DbError, DbErrorKind);

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
