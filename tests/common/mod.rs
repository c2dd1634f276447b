//! Mock adapters and fixtures shared by the cloner tests.
#![allow(dead_code)]

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Document};
use mongo_initial_sync::{
    BulkLoader, CloneError, ManualClock, Namespace, Result, SourceClient, StorageInterface,
    SyncSharedData,
};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn bson_uuid(uuid: Uuid) -> Binary {
    Binary {
        subtype: BinarySubtype::Uuid,
        bytes: uuid.as_bytes().to_vec(),
    }
}

/// A listCollections record the way the sync source shapes them.
pub fn coll_record(name: &str, uuid: Uuid) -> Document {
    doc! {
        "name": name,
        "type": "collection",
        "options": {},
        "info": {"readOnly": false, "uuid": bson_uuid(uuid)},
    }
}

pub fn id_index_spec() -> Document {
    doc! {"v": 2, "key": {"_id": 1}, "name": "_id_"}
}

pub fn network_error(message: &str) -> CloneError {
    CloneError::Network {
        message: message.to_string(),
    }
}

fn no_scripted_reply(command: &str) -> CloneError {
    CloneError::UpstreamCommand {
        code: 0,
        message: format!("no scripted reply for {}", command),
    }
}

/// One scripted find cursor: the batches it delivers, then an optional error
/// ending the stream.
pub struct FindScript {
    pub batches: Vec<Vec<Document>>,
    pub error: Option<CloneError>,
}

#[derive(Default)]
struct ClientInner {
    connect_results: VecDeque<Result<()>>,
    reconnect_results: VecDeque<Result<()>>,
    list_databases_replies: VecDeque<Result<Vec<Document>>>,
    list_collections_replies: VecDeque<Result<Vec<Document>>>,
    list_indexes_replies: VecDeque<Result<Vec<Document>>>,
    count_replies: VecDeque<Result<u64>>,
    find_scripts: VecDeque<FindScript>,
    connect_calls: u32,
    reconnect_calls: u32,
}

/// Scripted [`SourceClient`]: every command pops the next queued reply for
/// its kind, like a mock server keyed by command name. Clones share state so
/// a test can keep inspecting a client it moved into a cloner.
#[derive(Clone, Default)]
pub struct MockSourceClient {
    inner: Arc<Mutex<ClientInner>>,
}

impl MockSourceClient {
    pub fn new() -> MockSourceClient {
        MockSourceClient::default()
    }

    pub fn push_connect_result(&self, result: Result<()>) {
        self.inner.lock().unwrap().connect_results.push_back(result);
    }

    pub fn push_reconnect_result(&self, result: Result<()>) {
        self.inner
            .lock()
            .unwrap()
            .reconnect_results
            .push_back(result);
    }

    pub fn push_list_databases(&self, reply: Result<Vec<Document>>) {
        self.inner
            .lock()
            .unwrap()
            .list_databases_replies
            .push_back(reply);
    }

    pub fn push_list_collections(&self, reply: Result<Vec<Document>>) {
        self.inner
            .lock()
            .unwrap()
            .list_collections_replies
            .push_back(reply);
    }

    pub fn push_list_indexes(&self, reply: Result<Vec<Document>>) {
        self.inner
            .lock()
            .unwrap()
            .list_indexes_replies
            .push_back(reply);
    }

    pub fn push_count(&self, reply: Result<u64>) {
        self.inner.lock().unwrap().count_replies.push_back(reply);
    }

    pub fn push_find_script(&self, script: FindScript) {
        self.inner.lock().unwrap().find_scripts.push_back(script);
    }

    pub fn connect_calls(&self) -> u32 {
        self.inner.lock().unwrap().connect_calls
    }

    pub fn reconnect_calls(&self) -> u32 {
        self.inner.lock().unwrap().reconnect_calls
    }
}

impl SourceClient for MockSourceClient {
    fn connect(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.connect_calls += 1;
        inner.connect_results.pop_front().unwrap_or(Ok(()))
    }

    fn reconnect(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.reconnect_calls += 1;
        inner.reconnect_results.pop_front().unwrap_or(Ok(()))
    }

    fn list_databases(&mut self, _name_only: bool) -> Result<Vec<Document>> {
        self.inner
            .lock()
            .unwrap()
            .list_databases_replies
            .pop_front()
            .unwrap_or_else(|| Err(no_scripted_reply("listDatabases")))
    }

    fn list_collections(&mut self, _db: &str) -> Result<Vec<Document>> {
        self.inner
            .lock()
            .unwrap()
            .list_collections_replies
            .pop_front()
            .unwrap_or_else(|| Err(no_scripted_reply("listCollections")))
    }

    fn list_indexes(&mut self, _db: &str, _coll_uuid: Uuid) -> Result<Vec<Document>> {
        self.inner
            .lock()
            .unwrap()
            .list_indexes_replies
            .pop_front()
            .unwrap_or_else(|| Err(no_scripted_reply("listIndexes")))
    }

    fn count(&mut self, _db: &str, _coll_uuid: Uuid) -> Result<u64> {
        self.inner
            .lock()
            .unwrap()
            .count_replies
            .pop_front()
            .unwrap_or_else(|| Err(no_scripted_reply("count")))
    }

    fn query(
        &mut self,
        _db: &str,
        _coll_uuid: Uuid,
        _batch_size: u32,
        handle_batch: &mut dyn FnMut(Vec<Document>) -> Result<()>,
    ) -> Result<()> {
        let script = self
            .inner
            .lock()
            .unwrap()
            .find_scripts
            .pop_front()
            .ok_or_else(|| no_scripted_reply("find"))?;
        for batch in script.batches {
            handle_batch(batch)?;
        }
        match script.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct CreatedCollection {
    pub ns: Namespace,
    pub uuid: Uuid,
    pub options: Document,
    pub id_index: Document,
    pub secondary_indexes: Vec<Document>,
}

#[derive(Default)]
struct StorageInner {
    created: Vec<CreatedCollection>,
    loaders: HashMap<String, Arc<MockBulkLoader>>,
    create_error: Option<CloneError>,
    insert_error: Option<CloneError>,
    commit_error: Option<CloneError>,
    admin_validations: u32,
    admin_validation_error: Option<CloneError>,
}

/// Recording [`StorageInterface`] handing out duplicate-tolerant mock
/// loaders.
#[derive(Clone, Default)]
pub struct MockStorage {
    inner: Arc<Mutex<StorageInner>>,
}

impl MockStorage {
    pub fn created(&self) -> Vec<CreatedCollection> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn loader(&self, ns: &str) -> Option<Arc<MockBulkLoader>> {
        self.inner.lock().unwrap().loaders.get(ns).cloned()
    }

    pub fn set_create_error(&self, error: CloneError) {
        self.inner.lock().unwrap().create_error = Some(error);
    }

    pub fn set_insert_error(&self, error: CloneError) {
        self.inner.lock().unwrap().insert_error = Some(error);
    }

    pub fn set_commit_error(&self, error: CloneError) {
        self.inner.lock().unwrap().commit_error = Some(error);
    }

    pub fn set_admin_validation_error(&self, error: CloneError) {
        self.inner.lock().unwrap().admin_validation_error = Some(error);
    }

    pub fn admin_validations(&self) -> u32 {
        self.inner.lock().unwrap().admin_validations
    }
}

impl StorageInterface for MockStorage {
    fn create_collection_for_bulk_load(
        &self,
        ns: &Namespace,
        uuid: Uuid,
        options: &Document,
        id_index: &Document,
        secondary_indexes: &[Document],
    ) -> Result<Arc<dyn BulkLoader>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = &inner.create_error {
            return Err(e.clone());
        }
        inner.created.push(CreatedCollection {
            ns: ns.clone(),
            uuid,
            options: options.clone(),
            id_index: id_index.clone(),
            secondary_indexes: secondary_indexes.to_vec(),
        });
        let loader = Arc::new(MockBulkLoader {
            state: Mutex::new(LoaderState {
                inserted: Vec::new(),
                seen_ids: HashSet::new(),
                insert_error: inner.insert_error.clone(),
                commits: 0,
                commit_error: inner.commit_error.clone(),
            }),
        });
        inner.loaders.insert(ns.to_string(), Arc::clone(&loader));
        Ok(loader)
    }

    fn validate_admin_database(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.admin_validations += 1;
        match &inner.admin_validation_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

struct LoaderState {
    inserted: Vec<Document>,
    seen_ids: HashSet<String>,
    insert_error: Option<CloneError>,
    commits: u32,
    commit_error: Option<CloneError>,
}

/// Mock loader that ignores duplicate `_id`s, like the real one must.
pub struct MockBulkLoader {
    state: Mutex<LoaderState>,
}

impl MockBulkLoader {
    pub fn inserted(&self) -> Vec<Document> {
        self.state.lock().unwrap().inserted.clone()
    }

    pub fn inserted_count(&self) -> usize {
        self.state.lock().unwrap().inserted.len()
    }

    pub fn commits(&self) -> u32 {
        self.state.lock().unwrap().commits
    }
}

impl BulkLoader for MockBulkLoader {
    fn insert(&self, docs: Vec<Document>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = &state.insert_error {
            return Err(e.clone());
        }
        let mut inserted = 0;
        for doc in docs {
            match doc.get("_id") {
                Some(id) => {
                    let key = format!("{:?}", id);
                    if state.seen_ids.insert(key) {
                        state.inserted.push(doc);
                        inserted += 1;
                    }
                }
                None => {
                    state.inserted.push(doc);
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = &state.commit_error {
            return Err(e.clone());
        }
        state.commits += 1;
        Ok(())
    }
}

pub struct Fixture {
    pub shared: Arc<SyncSharedData>,
    pub storage: MockStorage,
    pub pool: Arc<ThreadPool>,
    pub clock: Arc<ManualClock>,
    pub source: String,
}

/// A fixture whose retry window is zero: the first failed reconnect makes a
/// transient error fatal.
pub fn fixture() -> Fixture {
    fixture_with_retry_window(Duration::ZERO)
}

pub fn fixture_with_retry_window(window: Duration) -> Fixture {
    Fixture {
        shared: Arc::new(SyncSharedData::new("4.4", 1, window)),
        storage: MockStorage::default(),
        pool: Arc::new(ThreadPoolBuilder::new().num_threads(2).build().unwrap()),
        clock: Arc::new(ManualClock::default()),
        source: "localhost:27017".to_string(),
    }
}
