//! SQLite-backed storage for Sync 1.5 collections: one file per user,
//! opened and pinned through a sharded, bounded-size [`pool::Pool`] and
//! addressed through [`dispatcher::Dispatcher`].

#[macro_use]
extern crate diesel;
#[macro_use]
extern crate slog_scope;

pub mod batch;
pub mod connection;
pub mod dispatcher;
pub mod maintenance;
pub mod models;
pub mod pool;
pub mod schema;

pub use dispatcher::Dispatcher;
pub use models::{
    Bso, BsoWrite, GetBsosRequest, GetBsosResponse, PostBsosResult, Sorting, Usage,
    DEFAULT_BSO_TTL_MILLIS,
};
