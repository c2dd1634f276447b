//! The initial-sync cloner pipeline.
//!
//! Three cloners nest to move a whole logical dataset from the sync source
//! into local storage: [`AllDatabaseCloner`] enumerates databases and drives
//! one [`DatabaseCloner`] per database, which enumerates collections and
//! drives one [`CollectionCloner`] per collection. All three are built on the
//! staged runtime in [`base`]: an ordered list of retryable stages with
//! pre/post hooks, sharing one [`SyncSharedData`] so the first fatal error
//! anywhere stops the whole attempt.

mod all_database;
mod base;
mod collection;
mod database;
mod shared_data;

use std::fmt;

pub use all_database::{AllDatabaseCloner, AllDatabaseClonerStats, AllDatabaseStatsHandle};
pub use base::{AfterStage, Cloner, ClonerCore, ClonerHandle, Stage};
pub use collection::{CollectionCloner, CollectionClonerStats, CollectionStatsHandle};
pub use database::{DatabaseCloner, DatabaseClonerStats, DatabaseStatsHandle};
pub use shared_data::SyncSharedData;

/// A database + collection name pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Namespace {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}
