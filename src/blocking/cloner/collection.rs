//! Clone one collection: count its documents, fetch its index specs, create
//! it locally, then stream every document into the bulk loader.

use crate::blocking::client::SourceClient;
use crate::blocking::cloner::base::{AfterStage, Cloner, ClonerCore, Stage};
use crate::blocking::cloner::{Namespace, SyncSharedData};
use crate::blocking::clock::Clock;
use crate::blocking::progress::ProgressMeter;
use crate::blocking::storage::{BulkLoader, StorageInterface};
use crate::blocking::task_runner::TaskRunner;
use crate::error::{CloneError, Result};
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use rayon::ThreadPool;
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

/// Statistics for one collection clone.
#[derive(Clone, Debug, Default)]
pub struct CollectionClonerStats {
    pub ns: String,
    pub documents_to_copy: u64,
    pub documents_copied: u64,
    pub indexes: u64,
    /// Batches handed to the bulk loader.
    pub fetched_batches: u64,
    /// Batches received from the sync source, including replays after a
    /// query restart.
    pub received_batches: u64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl CollectionClonerStats {
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "ns": self.ns.clone(),
            "documentsToCopy": self.documents_to_copy as i64,
            "documentsCopied": self.documents_copied as i64,
            "indexes": self.indexes as i64,
            "fetchedBatches": self.fetched_batches as i64,
            "receivedBatches": self.received_batches as i64,
        };
        if let Some(start) = self.start {
            doc.insert("start", Bson::DateTime(bson::DateTime::from_chrono(start)));
        }
        if let Some(end) = self.end {
            doc.insert("end", Bson::DateTime(bson::DateTime::from_chrono(end)));
        }
        doc
    }
}

struct CollectionState {
    /// Documents received from the sync source, not yet handed to the bulk
    /// loader. Drained by worker-pool tasks.
    pending: Vec<Document>,
    stats: CollectionClonerStats,
}

/// Read-only view of a running collection clone's statistics.
#[derive(Clone)]
pub struct CollectionStatsHandle {
    state: Arc<Mutex<CollectionState>>,
}

impl CollectionStatsHandle {
    pub fn snapshot(&self) -> CollectionClonerStats {
        self.state.lock().unwrap().stats.clone()
    }
}

pub struct CollectionCloner<'a> {
    core: ClonerCore,
    ns: Namespace,
    coll_uuid: Uuid,
    options: Document,
    batch_size: u32,
    client: &'a mut dyn SourceClient,
    storage: Arc<dyn StorageInterface>,
    task_runner: TaskRunner,
    state: Arc<Mutex<CollectionState>>,
    id_index_spec: Document,
    index_specs: Vec<Document>,
    loader: Option<Arc<dyn BulkLoader>>,
}

impl<'a> CollectionCloner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ns: Namespace,
        coll_uuid: Uuid,
        options: Document,
        shared: Arc<SyncSharedData>,
        source: &str,
        client: &'a mut dyn SourceClient,
        storage: Arc<dyn StorageInterface>,
        pool: Arc<ThreadPool>,
        clock: Arc<dyn Clock>,
        batch_size: u32,
    ) -> CollectionCloner<'a> {
        let stats = CollectionClonerStats {
            ns: ns.to_string(),
            ..CollectionClonerStats::default()
        };
        CollectionCloner {
            core: ClonerCore::new("CollectionCloner", source, shared, clock),
            ns,
            coll_uuid,
            options,
            batch_size,
            client,
            storage,
            task_runner: TaskRunner::new(pool),
            state: Arc::new(Mutex::new(CollectionState {
                pending: Vec::new(),
                stats,
            })),
            id_index_spec: Document::new(),
            index_specs: Vec::new(),
            loader: None,
        }
    }

    pub fn source_ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn source_uuid(&self) -> Uuid {
        self.coll_uuid
    }

    pub fn stats(&self) -> CollectionClonerStats {
        self.state.lock().unwrap().stats.clone()
    }

    pub fn stats_handle(&self) -> CollectionStatsHandle {
        CollectionStatsHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn set_stop_after_stage_for_test(&mut self, stage: impl Into<String>) {
        self.core.set_stop_after_stage_for_test(stage);
    }

    /// Ask the sync source for an approximate document count, for progress
    /// reporting only. Cloning is not gated on progress metrics: a failed
    /// count leaves the total at zero and the clone proceeds.
    fn count_stage(&mut self) -> Result<AfterStage> {
        match self.client.count(&self.ns.db, self.coll_uuid) {
            Ok(count) => {
                self.state.lock().unwrap().stats.documents_to_copy = count;
            }
            Err(e) if e.is_network() => return Err(e),
            Err(e) => {
                warn!(
                    ns = %self.ns,
                    error = %e,
                    "Failed to count documents on the sync source; proceeding without a total. "
                );
                self.state.lock().unwrap().stats.documents_to_copy = 0;
            }
        }
        Ok(AfterStage::Continue)
    }

    /// Fetch the index specs, separating the `_id` index from the secondary
    /// indexes. A missing `_id` index is tolerated; storage decides what to
    /// do with an empty spec.
    fn list_indexes_stage(&mut self) -> Result<AfterStage> {
        let specs = self.client.list_indexes(&self.ns.db, self.coll_uuid)?;
        if specs.is_empty() {
            warn!(ns = %self.ns, "No indexes found on the sync source for collection. ");
        }
        // The stage may be restarted after a transient error.
        self.id_index_spec = Document::new();
        self.index_specs.clear();
        for spec in specs {
            let name = spec.get_str("name").map_err(|_| {
                CloneError::parse("listIndexes entry", "missing 'name' field")
            })?;
            if name == crate::ID_INDEX_NAME {
                self.id_index_spec = spec;
            } else {
                self.index_specs.push(spec);
            }
        }
        let total = self.index_specs.len() as u64 + u64::from(!self.id_index_spec.is_empty());
        self.state.lock().unwrap().stats.indexes = total;
        Ok(AfterStage::Continue)
    }

    /// Create the local collection and obtain the bulk loader. No network
    /// I/O happens here; a storage failure is fatal.
    fn create_collection_stage(&mut self) -> Result<AfterStage> {
        let loader = self.storage.create_collection_for_bulk_load(
            &self.ns,
            self.coll_uuid,
            &self.options,
            &self.id_index_spec,
            &self.index_specs,
        )?;
        self.loader = Some(loader);
        Ok(AfterStage::Continue)
    }

    /// Stream every document, buffering each received batch and handing it to
    /// the worker pool for insertion. On a transient error the cursor is
    /// discarded and the whole query restarts from the beginning; replayed
    /// documents are ignored by the loader's duplicate-`_id` handling.
    fn query_stage(&mut self) -> Result<AfterStage> {
        let loader = Arc::clone(self.loader.as_ref().ok_or_else(|| {
            CloneError::storage("bulk loader missing at query time")
        })?);
        let shared = Arc::clone(self.core.shared());
        let state = Arc::clone(&self.state);
        let documents_to_copy = state.lock().unwrap().stats.documents_to_copy;
        let mut progress = ProgressMeter::new(self.ns.to_string(), documents_to_copy);
        let db = self.ns.db.clone();
        let runner = &self.task_runner;

        let mut handle_batch = |batch: Vec<Document>| -> Result<()> {
            shared.status()?;
            if let Some(e) = runner.first_error() {
                return Err(e);
            }
            let received = batch.len() as u64;
            {
                let mut st = state.lock().unwrap();
                st.pending.extend(batch);
                st.stats.received_batches += 1;
            }
            progress.hit(received);
            let task_state = Arc::clone(&state);
            let task_loader = Arc::clone(&loader);
            runner.schedule(move || insert_pending(&task_state, task_loader.as_ref()));
            Ok(())
        };
        let query_result =
            self.client
                .query(&db, self.coll_uuid, self.batch_size, &mut handle_batch);
        drop(handle_batch);
        // Wait out in-flight inserts before retrying or committing.
        let insert_result = self.task_runner.join();
        query_result?;
        insert_result?;
        Ok(AfterStage::Continue)
    }
}

fn insert_pending(state: &Mutex<CollectionState>, loader: &dyn BulkLoader) -> Result<()> {
    let docs = {
        let mut st = state.lock().unwrap();
        std::mem::take(&mut st.pending)
    };
    if docs.is_empty() {
        return Ok(());
    }
    let inserted = loader.insert(docs)?;
    let mut st = state.lock().unwrap();
    st.stats.documents_copied += inserted;
    st.stats.fetched_batches += 1;
    Ok(())
}

impl Cloner for CollectionCloner<'_> {
    fn core(&self) -> &ClonerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ClonerCore {
        &mut self.core
    }

    fn stages(&self) -> Vec<Stage<Self>> {
        vec![
            Stage::retryable("count", Self::count_stage),
            Stage::retryable("listIndexes", Self::list_indexes_stage),
            Stage::fatal_on_error("createCollection", Self::create_collection_stage),
            Stage::retryable("query", Self::query_stage),
        ]
    }

    fn pre_stage(&mut self) -> Result<()> {
        self.state.lock().unwrap().stats.start = Some(Utc::now());
        Ok(())
    }

    /// Commit the bulk load, which also builds the secondary indexes.
    fn post_stage(&mut self) -> Result<()> {
        let loader = self.loader.take().ok_or_else(|| {
            CloneError::storage("bulk loader missing at commit time")
        })?;
        loader.commit()?;
        self.state.lock().unwrap().stats.end = Some(Utc::now());
        Ok(())
    }

    fn checkpoint_tag(&self) -> String {
        self.ns.to_string()
    }

    fn reconnect(&mut self) -> Result<()> {
        self.client.reconnect()
    }
}
