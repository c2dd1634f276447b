//! Local storage consumed by the cloners.

use crate::blocking::cloner::Namespace;
use crate::bson_helper;
use crate::error::{CloneError, Result};
use bson::{doc, Bson, Document};
use mongodb::options::InsertManyOptions;
use mongodb::sync::{Client, Collection, Database};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const DUPLICATE_KEY: i32 = 11000;
const NAMESPACE_NOT_FOUND: i32 = 26;

/// What the cloners need from local storage. All failures are fatal to the
/// attempt; storage operations are never retried.
pub trait StorageInterface: Send + Sync {
    /// Create the local collection with the source collection's uuid, its
    /// options, `_id` index and secondary index specs, and hand back a
    /// loader for its documents.
    fn create_collection_for_bulk_load(
        &self,
        ns: &Namespace,
        uuid: Uuid,
        options: &Document,
        id_index: &Document,
        secondary_indexes: &[Document],
    ) -> Result<Arc<dyn BulkLoader>>;

    /// Check the cloned `admin` database, which gates the usefulness of
    /// everything else because it holds the authentication state.
    fn validate_admin_database(&self) -> Result<()>;
}

/// Accepts batches of documents for one collection.
pub trait BulkLoader: Send + Sync {
    /// Insert a batch. Duplicate `_id` conflicts are ignored so a restarted
    /// query can replay documents; returns how many were actually inserted.
    fn insert(&self, docs: Vec<Document>) -> Result<u64>;

    /// Finish the load and build the secondary indexes.
    fn commit(&self) -> Result<()>;
}

/// [`StorageInterface`] backed by a target MongoDB deployment.
pub struct MongoStorage {
    client: Client,
}

impl MongoStorage {
    pub fn connect(uri: &str) -> Result<MongoStorage> {
        let client = Client::with_uri_str(uri)
            .map_err(|e| CloneError::storage(format!("failed to connect to local storage: {}", e)))?;
        client
            .database(crate::ADMIN_DB_NAME)
            .run_command(doc! {"ping": 1}, None)
            .map_err(|e| CloneError::storage(format!("failed to reach local storage: {}", e)))?;
        Ok(MongoStorage { client })
    }
}

impl StorageInterface for MongoStorage {
    fn create_collection_for_bulk_load(
        &self,
        ns: &Namespace,
        uuid: Uuid,
        options: &Document,
        _id_index: &Document,
        secondary_indexes: &[Document],
    ) -> Result<Arc<dyn BulkLoader>> {
        let db = self.client.database(&ns.db);
        let coll = db.collection::<Document>(&ns.coll);

        // Start from an empty collection; a previous failed attempt may have
        // left one behind.
        if let Err(e) = coll.drop(None) {
            if command_code(&e) != Some(NAMESPACE_NOT_FOUND) {
                return Err(CloneError::storage(format!(
                    "failed to drop {} before cloning: {}",
                    ns, e
                )));
            }
        }

        let mut create = doc! {"create": ns.coll.clone()};
        for (key, value) in options {
            create.insert(key.clone(), value.clone());
        }
        // A plain create command assigns a fresh uuid; applyOps is the only
        // path that lets the local collection keep the source collection's.
        let apply_ops = doc! {
            "applyOps": [{
                "op": "c",
                "ns": format!("{}.$cmd", ns.db),
                "ui": bson_helper::new_bson_binary(uuid),
                "o": create,
            }]
        };
        self.client
            .database(crate::ADMIN_DB_NAME)
            .run_command(apply_ops, None)
            .map_err(|e| CloneError::storage(format!("failed to create {}: {}", ns, e)))?;
        debug!(ns = %ns, uuid = %uuid, "Created local collection for bulk load. ");

        Ok(Arc::new(MongoBulkLoader {
            db,
            coll,
            ns: ns.clone(),
            secondary_indexes: secondary_indexes.to_vec(),
        }))
    }

    fn validate_admin_database(&self) -> Result<()> {
        let admin = self.client.database(crate::ADMIN_DB_NAME);

        let schema_doc = admin
            .collection::<Document>("system.version")
            .find_one(doc! {"_id": "authSchema"}, None)
            .map_err(|e| CloneError::storage(format!("failed to read auth schema: {}", e)))?;
        if let Some(schema) = schema_doc {
            let version = match schema.get("currentVersion") {
                Some(Bson::Int32(v)) => i64::from(*v),
                Some(Bson::Int64(v)) => *v,
                Some(Bson::Double(v)) => *v as i64,
                _ => {
                    return Err(CloneError::storage(
                        "auth schema document has no numeric 'currentVersion'",
                    ))
                }
            };
            // Schema 3 is MONGODB-CR era, 5 is SCRAM; anything else cannot
            // be used to authenticate against the cloned data.
            if version != 3 && version != 5 {
                return Err(CloneError::storage(format!(
                    "unsupported auth schema version {}",
                    version
                )));
            }
        }

        let users = admin
            .collection::<Document>("system.users")
            .find(None, None)
            .map_err(|e| CloneError::storage(format!("failed to read admin users: {}", e)))?;
        for user in users {
            let user =
                user.map_err(|e| CloneError::storage(format!("failed to read admin users: {}", e)))?;
            if user.get_str("user").is_err()
                || user.get_str("db").is_err()
                || user.get_document("credentials").is_err()
            {
                return Err(CloneError::storage(format!(
                    "malformed admin user document: {}",
                    user
                )));
            }
        }
        Ok(())
    }
}

fn command_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        mongodb::error::ErrorKind::Command(c) => Some(c.code),
        _ => None,
    }
}

struct MongoBulkLoader {
    db: Database,
    coll: Collection<Document>,
    ns: Namespace,
    secondary_indexes: Vec<Document>,
}

impl BulkLoader for MongoBulkLoader {
    fn insert(&self, docs: Vec<Document>) -> Result<u64> {
        if docs.is_empty() {
            return Ok(0);
        }
        let total = docs.len() as u64;
        let options = InsertManyOptions::builder().ordered(false).build();
        match self.coll.insert_many(docs, options) {
            Ok(_) => Ok(total),
            Err(e) => match e.kind.as_ref() {
                mongodb::error::ErrorKind::BulkWrite(failure) => {
                    let write_errors = failure.write_errors.clone().unwrap_or_default();
                    let duplicates = write_errors
                        .iter()
                        .filter(|we| we.code == DUPLICATE_KEY)
                        .count();
                    if duplicates == write_errors.len() && failure.write_concern_error.is_none() {
                        Ok(total - duplicates as u64)
                    } else {
                        Err(CloneError::storage(format!(
                            "bulk insert into {} failed: {}",
                            self.ns, e
                        )))
                    }
                }
                _ => Err(CloneError::storage(format!(
                    "bulk insert into {} failed: {}",
                    self.ns, e
                ))),
            },
        }
    }

    fn commit(&self) -> Result<()> {
        if self.secondary_indexes.is_empty() {
            return Ok(());
        }
        self.db
            .run_command(
                doc! {
                    "createIndexes": self.ns.coll.clone(),
                    "indexes": self.secondary_indexes.clone(),
                },
                None,
            )
            .map_err(|e| {
                CloneError::storage(format!("failed to build indexes on {}: {}", self.ns, e))
            })?;
        Ok(())
    }
}
