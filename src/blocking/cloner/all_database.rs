//! Clone every database on the sync source.
//!
//! Connects and authenticates, lists the databases (dropping `local`, moving
//! `admin` to the front because it holds the authentication state the other
//! databases depend on), then clones them one at a time, validating the
//! `admin` database through the storage interface as soon as its clone
//! finishes.

use crate::blocking::client::SourceClient;
use crate::blocking::cloner::base::{AfterStage, Cloner, ClonerCore, Stage};
use crate::blocking::cloner::database::{DatabaseCloner, DatabaseStatsHandle};
use crate::blocking::cloner::{DatabaseClonerStats, SyncSharedData};
use crate::blocking::clock::Clock;
use crate::blocking::storage::StorageInterface;
use crate::error::Result;
use bson::{doc, Document};
use rayon::ThreadPool;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Statistics for a whole initial-sync clone.
#[derive(Clone, Debug, Default)]
pub struct AllDatabaseClonerStats {
    pub databases_cloned: u64,
    pub database_count: u64,
    pub database_stats: Vec<DatabaseClonerStats>,
}

impl AllDatabaseClonerStats {
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "databasesCloned": self.databases_cloned as i64,
            "databaseCount": self.database_count as i64,
        };
        for db in &self.database_stats {
            doc.insert(db.db_name.clone(), db.to_document());
        }
        doc
    }
}

impl fmt::Display for AllDatabaseClonerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

struct AllDatabaseState {
    stats: AllDatabaseClonerStats,
    /// Stats of the database clone currently running, if any.
    current: Option<DatabaseStatsHandle>,
}

/// Read-only view of a running clone's statistics, live down to the
/// collection currently being copied.
#[derive(Clone)]
pub struct AllDatabaseStatsHandle {
    state: Arc<Mutex<AllDatabaseState>>,
}

impl AllDatabaseStatsHandle {
    pub fn snapshot(&self) -> AllDatabaseClonerStats {
        let state = self.state.lock().unwrap();
        let mut stats = state.stats.clone();
        if let Some(current) = &state.current {
            stats.database_stats.push(current.snapshot());
        }
        stats
    }
}

pub struct AllDatabaseCloner {
    core: ClonerCore,
    client: Box<dyn SourceClient>,
    storage: Arc<dyn StorageInterface>,
    pool: Arc<ThreadPool>,
    batch_size: u32,
    databases: Vec<String>,
    state: Arc<Mutex<AllDatabaseState>>,
}

impl AllDatabaseCloner {
    pub fn new(
        shared: Arc<SyncSharedData>,
        source: impl Into<String>,
        client: Box<dyn SourceClient>,
        storage: Arc<dyn StorageInterface>,
        pool: Arc<ThreadPool>,
        clock: Arc<dyn Clock>,
        batch_size: u32,
    ) -> AllDatabaseCloner {
        AllDatabaseCloner {
            core: ClonerCore::new("AllDatabaseCloner", source, shared, clock),
            client,
            storage,
            pool,
            batch_size,
            databases: Vec::new(),
            state: Arc::new(Mutex::new(AllDatabaseState {
                stats: AllDatabaseClonerStats::default(),
                current: None,
            })),
        }
    }

    pub fn stats(&self) -> AllDatabaseClonerStats {
        self.stats_handle().snapshot()
    }

    pub fn stats_handle(&self) -> AllDatabaseStatsHandle {
        AllDatabaseStatsHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn set_stop_after_stage_for_test(&mut self, stage: impl Into<String>) {
        self.core.set_stop_after_stage_for_test(stage);
    }

    /// The databases that will be cloned, in clone order: `admin` first if
    /// the sync source has one, then the rest as the sync source listed them.
    pub fn databases(&self) -> Vec<String> {
        self.databases.clone()
    }

    fn list_databases_stage(&mut self) -> Result<AfterStage> {
        let entries = self.client.list_databases(true)?;
        self.databases.clear();
        for entry in entries {
            let name = match entry.get_str("name") {
                Ok(name) => name,
                Err(_) => {
                    warn!(
                        entry = %entry,
                        "Excluding database entry without a 'name' field from the listDatabases response. "
                    );
                    continue;
                }
            };
            if name == crate::LOCAL_DB_NAME {
                debug!(db = name, "Excluding database from cloning. ");
                continue;
            }
            self.databases.push(name.to_string());
            // Make sure "admin" comes first.
            if name == crate::ADMIN_DB_NAME && self.databases.len() > 1 {
                let last = self.databases.len() - 1;
                self.databases.swap(0, last);
            }
        }
        Ok(AfterStage::Continue)
    }
}

impl Cloner for AllDatabaseCloner {
    fn core(&self) -> &ClonerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ClonerCore {
        &mut self.core
    }

    fn stages(&self) -> Vec<Stage<Self>> {
        vec![Stage::retryable("listDatabases", Self::list_databases_stage)]
    }

    /// Connect to the sync source and authenticate.
    // TODO: route the initial connect through the stage retry loop so a
    // briefly unreachable sync source does not fail the whole attempt.
    fn pre_stage(&mut self) -> Result<()> {
        self.client.connect()
    }

    /// Clone each database in order, stopping at the first failure, and
    /// validate `admin` as soon as it is done.
    fn post_stage(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.stats.database_count = self.databases.len() as u64;
            state.stats.databases_cloned = 0;
        }
        let databases = self.databases.clone();
        let total = databases.len();
        for (i, db_name) in databases.iter().enumerate() {
            let shared = Arc::clone(self.core.shared());
            let clock = Arc::clone(self.core.clock());
            let source = self.core.source().to_string();
            let mut db_cloner = DatabaseCloner::new(
                db_name.clone(),
                shared,
                &source,
                self.client.as_mut(),
                Arc::clone(&self.storage),
                Arc::clone(&self.pool),
                clock,
                self.batch_size,
            );
            self.state.lock().unwrap().current = Some(db_cloner.stats_handle());
            let result = db_cloner.run();
            let db_stats = db_cloner.stats();
            drop(db_cloner);
            if let Err(e) = result {
                warn!(
                    db = %db_name,
                    position = i + 1,
                    total,
                    error = %e,
                    "Database clone failed. "
                );
                self.state.lock().unwrap().current = None;
                return Err(e);
            }
            debug!(db = %db_name, "Database clone finished. ");
            if db_name.eq_ignore_ascii_case(crate::ADMIN_DB_NAME) {
                // The admin database holds the auth collections; a bad copy
                // makes everything else unusable.
                debug!("Finished the 'admin' db clone, validating it. ");
                if let Err(e) = self.storage.validate_admin_database() {
                    warn!(error = %e, "Validation failed on the 'admin' db. ");
                    self.state.lock().unwrap().current = None;
                    return Err(e);
                }
            }
            let mut state = self.state.lock().unwrap();
            state.current = None;
            state.stats.database_stats.push(db_stats);
            state.stats.databases_cloned += 1;
        }
        Ok(())
    }

    fn checkpoint_tag(&self) -> String {
        self.core.source().to_string()
    }

    fn reconnect(&mut self) -> Result<()> {
        self.client.reconnect()
    }
}
