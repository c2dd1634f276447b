//! Clone one database: list its collections, then clone each in the order
//! the sync source returned them.

use crate::blocking::client::SourceClient;
use crate::blocking::cloner::base::{AfterStage, Cloner, ClonerCore, Stage};
use crate::blocking::cloner::collection::{CollectionCloner, CollectionStatsHandle};
use crate::blocking::cloner::{CollectionClonerStats, Namespace, SyncSharedData};
use crate::blocking::clock::Clock;
use crate::blocking::storage::StorageInterface;
use crate::bson_helper;
use crate::error::{CloneError, Result};
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use rayon::ThreadPool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Statistics for one database clone.
#[derive(Clone, Debug, Default)]
pub struct DatabaseClonerStats {
    pub db_name: String,
    pub collection_count: u64,
    pub cloned_collections: u64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub collection_stats: Vec<CollectionClonerStats>,
}

impl DatabaseClonerStats {
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "collectionCount": self.collection_count as i64,
            "clonedCollections": self.cloned_collections as i64,
        };
        if let Some(start) = self.start {
            doc.insert("start", Bson::DateTime(bson::DateTime::from_chrono(start)));
        }
        if let Some(end) = self.end {
            doc.insert("end", Bson::DateTime(bson::DateTime::from_chrono(end)));
        }
        let collections: Vec<Bson> = self
            .collection_stats
            .iter()
            .map(|c| Bson::Document(c.to_document()))
            .collect();
        doc.insert("collections", collections);
        doc
    }
}

struct DatabaseState {
    stats: DatabaseClonerStats,
    /// Stats of the collection clone currently running, if any.
    current: Option<CollectionStatsHandle>,
}

/// Read-only view of a running database clone's statistics, including the
/// collection currently being cloned.
#[derive(Clone)]
pub struct DatabaseStatsHandle {
    state: Arc<Mutex<DatabaseState>>,
}

impl DatabaseStatsHandle {
    pub fn snapshot(&self) -> DatabaseClonerStats {
        let state = self.state.lock().unwrap();
        let mut stats = state.stats.clone();
        if let Some(current) = &state.current {
            stats.collection_stats.push(current.snapshot());
        }
        stats
    }
}

/// A collection to clone, as parsed out of a listCollections reply.
struct CollectionInfo {
    ns: Namespace,
    uuid: Uuid,
    options: Document,
}

pub struct DatabaseCloner<'a> {
    core: ClonerCore,
    db_name: String,
    batch_size: u32,
    client: &'a mut dyn SourceClient,
    storage: Arc<dyn StorageInterface>,
    pool: Arc<ThreadPool>,
    collections: Vec<CollectionInfo>,
    state: Arc<Mutex<DatabaseState>>,
}

impl<'a> DatabaseCloner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_name: impl Into<String>,
        shared: Arc<SyncSharedData>,
        source: &str,
        client: &'a mut dyn SourceClient,
        storage: Arc<dyn StorageInterface>,
        pool: Arc<ThreadPool>,
        clock: Arc<dyn Clock>,
        batch_size: u32,
    ) -> DatabaseCloner<'a> {
        let db_name = db_name.into();
        let stats = DatabaseClonerStats {
            db_name: db_name.clone(),
            ..DatabaseClonerStats::default()
        };
        DatabaseCloner {
            core: ClonerCore::new("DatabaseCloner", source, shared, clock),
            db_name,
            batch_size,
            client,
            storage,
            pool,
            collections: Vec::new(),
            state: Arc::new(Mutex::new(DatabaseState {
                stats,
                current: None,
            })),
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn stats(&self) -> DatabaseClonerStats {
        self.stats_handle().snapshot()
    }

    pub fn stats_handle(&self) -> DatabaseStatsHandle {
        DatabaseStatsHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn set_stop_after_stage_for_test(&mut self, stage: impl Into<String>) {
        self.core.set_stop_after_stage_for_test(stage);
    }

    /// The collections that will be cloned, in the order the sync source
    /// returned them.
    pub fn collection_namespaces(&self) -> Vec<Namespace> {
        self.collections.iter().map(|c| c.ns.clone()).collect()
    }

    fn list_collections_stage(&mut self) -> Result<AfterStage> {
        let records = self.client.list_collections(&self.db_name)?;
        self.collections.clear();
        let mut seen = HashSet::new();
        for record in records {
            // Later server versions add fields to listCollections replies;
            // unknown fields must not break the clone.
            let name = record
                .get_str("name")
                .map_err(|_| CloneError::parse("listCollections entry", "missing 'name' field"))?;
            if name.is_empty() {
                return Err(CloneError::parse(
                    "listCollections entry",
                    "empty 'name' field",
                ));
            }
            if !seen.insert(name.to_string()) {
                return Err(CloneError::DuplicateCollectionName {
                    db: self.db_name.clone(),
                    name: name.to_string(),
                });
            }
            let options = record
                .get_document("options")
                .map_err(|_| CloneError::parse("listCollections entry", "missing 'options' field"))?
                .clone();
            validate_collection_options(&options)?;
            let info = record
                .get_document("info")
                .map_err(|_| CloneError::parse("listCollections entry", "missing 'info' field"))?;
            let uuid = bson_helper::get_uuid(info, "uuid").map_err(|_| {
                CloneError::parse("listCollections entry", "missing or invalid 'info.uuid' field")
            })?;
            self.collections.push(CollectionInfo {
                ns: Namespace::new(&self.db_name, name),
                uuid,
                options,
            });
        }
        self.state.lock().unwrap().stats.collection_count = self.collections.len() as u64;
        Ok(AfterStage::Continue)
    }
}

/// Well-formedness check over a listCollections `options` sub-document. The
/// storage layer validates the semantics; here a known field with the wrong
/// BSON type is rejected as a parse error.
fn validate_collection_options(options: &Document) -> Result<()> {
    for (key, value) in options {
        let well_formed = match key.as_str() {
            "capped" | "autoIndexId" | "temp" => matches!(value, Bson::Boolean(_)),
            "size" | "max" => matches!(
                value,
                Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)
            ),
            "storageEngine" | "validator" | "collation" | "indexOptionDefaults" => {
                matches!(value, Bson::Document(_))
            }
            "validationLevel" | "validationAction" | "viewOn" => {
                matches!(value, Bson::String(_))
            }
            "pipeline" => matches!(value, Bson::Array(_)),
            _ => true,
        };
        if !well_formed {
            return Err(CloneError::parse(
                "collection options",
                format!("field '{}' has the wrong type", key),
            ));
        }
    }
    Ok(())
}

impl Cloner for DatabaseCloner<'_> {
    fn core(&self) -> &ClonerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ClonerCore {
        &mut self.core
    }

    fn stages(&self) -> Vec<Stage<Self>> {
        vec![Stage::retryable(
            "listCollections",
            Self::list_collections_stage,
        )]
    }

    fn pre_stage(&mut self) -> Result<()> {
        self.state.lock().unwrap().stats.start = Some(Utc::now());
        Ok(())
    }

    /// Clone each listed collection, stopping at the first failure.
    fn post_stage(&mut self) -> Result<()> {
        let collections = std::mem::take(&mut self.collections);
        for info in collections {
            let shared = Arc::clone(self.core.shared());
            let clock = Arc::clone(self.core.clock());
            let source = self.core.source().to_string();
            let ns = info.ns.clone();
            let mut cloner = CollectionCloner::new(
                info.ns,
                info.uuid,
                info.options,
                shared,
                &source,
                &mut *self.client,
                Arc::clone(&self.storage),
                Arc::clone(&self.pool),
                clock,
                self.batch_size,
            );
            self.state.lock().unwrap().current = Some(cloner.stats_handle());
            let result = cloner.run();
            let coll_stats = cloner.stats();
            drop(cloner);
            let mut state = self.state.lock().unwrap();
            state.current = None;
            match result {
                Ok(()) => {
                    debug!(ns = %ns, "Collection clone finished. ");
                    state.stats.collection_stats.push(coll_stats);
                    state.stats.cloned_collections += 1;
                }
                Err(e) => {
                    warn!(ns = %ns, error = %e, "Collection clone failed. ");
                    return Err(e);
                }
            }
        }
        self.state.lock().unwrap().stats.end = Some(Utc::now());
        Ok(())
    }

    fn checkpoint_tag(&self) -> String {
        self.db_name.clone()
    }

    fn reconnect(&mut self) -> Result<()> {
        self.client.reconnect()
    }
}
