mod bson_helper;
mod config;
mod error;

pub mod blocking;

const ADMIN_DB_NAME: &str = "admin";
const LOCAL_DB_NAME: &str = "local";
const ID_INDEX_NAME: &str = "_id_";

pub use blocking::cloner::{
    AllDatabaseCloner, AllDatabaseClonerStats, CollectionCloner, CollectionClonerStats,
    DatabaseCloner, DatabaseClonerStats, Namespace, SyncSharedData,
};
pub use blocking::{
    BulkLoader, CheckpointMatcher, CheckpointSite, Checkpoints, Clock, Cloner, ClonerHandle,
    ManualClock, MongoSourceClient, MongoStorage, SourceClient, StorageInterface, SystemClock,
};
pub use config::CloneConfig;
pub use error::{CloneError, Result};
