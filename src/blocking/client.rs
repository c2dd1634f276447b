//! Upstream client used by the cloners.

use crate::bson_helper;
use crate::error::{CloneError, Result};
use bson::{doc, Bson, Document};
use mongodb::sync::Client;
use uuid::Uuid;

/// Receives batches of documents from a streaming query, in arrival order.
pub type BatchHandler<'h> = &'h mut dyn FnMut(Vec<Document>) -> Result<()>;

/// Everything the cloners need from the sync source.
///
/// Errors returned by implementations must already be classified: connection
/// level failures as [`CloneError::Network`] (which the stage retry loop will
/// reconnect for), everything else as a fatal kind.
pub trait SourceClient: Send {
    /// Connect to the sync source and authenticate.
    fn connect(&mut self) -> Result<()>;

    /// Re-establish and re-authenticate the connection after a transient
    /// failure.
    fn reconnect(&mut self) -> Result<()>;

    /// The `databases` entries of a listDatabases reply.
    fn list_databases(&mut self, name_only: bool) -> Result<Vec<Document>>;

    /// All collection records of a listCollections reply for `db`.
    fn list_collections(&mut self, db: &str) -> Result<Vec<Document>>;

    /// All index specs of the collection identified by `coll_uuid`.
    fn list_indexes(&mut self, db: &str, coll_uuid: Uuid) -> Result<Vec<Document>>;

    /// Approximate document count of the collection identified by `coll_uuid`.
    fn count(&mut self, db: &str, coll_uuid: Uuid) -> Result<u64>;

    /// Stream every document of the collection identified by `coll_uuid` in
    /// batches of at most `batch_size`, delivering each batch to
    /// `handle_batch` in arrival order.
    fn query(
        &mut self,
        db: &str,
        coll_uuid: Uuid,
        batch_size: u32,
        handle_batch: BatchHandler<'_>,
    ) -> Result<()>;
}

/// Server error codes that indicate the connection rather than the request
/// went bad; a cursor death on a live stream is retried the same way.
const TRANSIENT_ERROR_CODES: &[i32] = &[
    6,    // HostUnreachable
    7,    // HostNotFound
    43,   // CursorNotFound
    89,   // NetworkTimeout
    9001, // SocketException
];

fn classify(uri: &str, err: mongodb::error::Error) -> CloneError {
    use mongodb::error::ErrorKind;
    match err.kind.as_ref() {
        ErrorKind::Io(e) => CloneError::Network {
            message: e.to_string(),
        },
        ErrorKind::ServerSelection { message, .. } => CloneError::Network {
            message: message.clone(),
        },
        ErrorKind::ConnectionPoolCleared { message, .. } => CloneError::Network {
            message: message.clone(),
        },
        ErrorKind::DnsResolve { message, .. } => CloneError::Network {
            message: message.clone(),
        },
        ErrorKind::Authentication { message, .. } => CloneError::AuthenticationFailed {
            source_uri: uri.to_string(),
            message: message.clone(),
        },
        ErrorKind::Command(c) if TRANSIENT_ERROR_CODES.contains(&c.code) => CloneError::Network {
            message: format!("{} ({})", c.message, c.code_name),
        },
        ErrorKind::Command(c) => CloneError::UpstreamCommand {
            code: c.code,
            message: c.message.clone(),
        },
        _ => CloneError::UpstreamCommand {
            code: 0,
            message: err.to_string(),
        },
    }
}

/// [`SourceClient`] backed by the MongoDB driver.
///
/// Credentials ride on the connection string; `connect` verifies both the
/// connection and the authentication with a ping.
pub struct MongoSourceClient {
    uri: String,
    client: Option<Client>,
}

impl MongoSourceClient {
    pub fn new(uri: impl Into<String>) -> MongoSourceClient {
        MongoSourceClient {
            uri: uri.into(),
            client: None,
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or_else(|| CloneError::Network {
            message: "not connected to the sync source".to_string(),
        })
    }

    fn run_command(&self, db: &str, command: Document) -> Result<Document> {
        self.client()?
            .database(db)
            .run_command(command, None)
            .map_err(|e| classify(&self.uri, e))
    }

    /// Run a cursor-shaped command and deliver every batch to `handle_batch`.
    fn exhaust_cursor(
        &self,
        db: &str,
        initial: Document,
        batch_size: u32,
        handle_batch: BatchHandler<'_>,
    ) -> Result<()> {
        let mut reply = self.run_command(db, initial)?;
        let mut first = true;
        loop {
            let cursor = reply
                .get_document("cursor")
                .map_err(|_| CloneError::parse("cursor reply", "missing 'cursor' field"))?;
            let id = cursor
                .get_i64("id")
                .map_err(|_| CloneError::parse("cursor reply", "missing 'cursor.id' field"))?;
            let ns = cursor
                .get_str("ns")
                .map_err(|_| CloneError::parse("cursor reply", "missing 'cursor.ns' field"))?
                .to_string();
            let key = if first { "firstBatch" } else { "nextBatch" };
            let raw = cursor.get_array(key).map_err(|_| {
                CloneError::parse("cursor reply", format!("missing '{}' field", key))
            })?;
            let mut batch = Vec::with_capacity(raw.len());
            for item in raw {
                match item {
                    Bson::Document(d) => batch.push(d.clone()),
                    other => {
                        return Err(CloneError::parse(
                            "cursor reply",
                            format!("non-document batch entry: {}", other),
                        ))
                    }
                }
            }
            if !batch.is_empty() {
                handle_batch(batch)?;
            }
            if id == 0 {
                return Ok(());
            }
            let coll = ns
                .splitn(2, '.')
                .nth(1)
                .ok_or_else(|| CloneError::parse("cursor reply", "invalid 'cursor.ns' field"))?
                .to_string();
            first = false;
            let mut get_more = doc! {"getMore": id, "collection": coll};
            if batch_size > 0 {
                get_more.insert("batchSize", batch_size as i64);
            }
            reply = self.run_command(db, get_more)?;
        }
    }

    /// Feature compatibility version of the sync source, recorded at the
    /// start of an attempt.
    pub fn fetch_feature_compatibility_version(&self) -> Result<String> {
        let reply = self.run_command(
            crate::ADMIN_DB_NAME,
            doc! {"getParameter": 1, "featureCompatibilityVersion": 1},
        )?;
        match reply.get("featureCompatibilityVersion") {
            Some(Bson::Document(d)) => d
                .get_str("version")
                .map(|v| v.to_string())
                .map_err(|_| CloneError::parse("getParameter reply", "missing 'version' field")),
            Some(Bson::String(v)) => Ok(v.clone()),
            _ => Err(CloneError::parse(
                "getParameter reply",
                "missing 'featureCompatibilityVersion' field",
            )),
        }
    }

    /// Rollback id of the sync source, recorded at the start of an attempt.
    pub fn fetch_rollback_id(&self) -> Result<i32> {
        let reply = self.run_command(crate::ADMIN_DB_NAME, doc! {"replSetGetRBID": 1})?;
        reply
            .get_i32("rbid")
            .map_err(|_| CloneError::parse("replSetGetRBID reply", "missing 'rbid' field"))
    }
}

impl SourceClient for MongoSourceClient {
    fn connect(&mut self) -> Result<()> {
        let client = Client::with_uri_str(&self.uri).map_err(|e| classify(&self.uri, e))?;
        client
            .database(crate::ADMIN_DB_NAME)
            .run_command(doc! {"ping": 1}, None)
            .map_err(|e| classify(&self.uri, e))?;
        self.client = Some(client);
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.client = None;
        self.connect()
    }

    fn list_databases(&mut self, name_only: bool) -> Result<Vec<Document>> {
        let reply = self.run_command(
            crate::ADMIN_DB_NAME,
            doc! {"listDatabases": 1, "nameOnly": name_only},
        )?;
        let raw = reply
            .get_array("databases")
            .map_err(|_| CloneError::parse("listDatabases reply", "missing 'databases' field"))?;
        let mut databases = Vec::with_capacity(raw.len());
        for entry in raw {
            match entry {
                Bson::Document(d) => databases.push(d.clone()),
                other => {
                    return Err(CloneError::parse(
                        "listDatabases reply",
                        format!("non-document database entry: {}", other),
                    ))
                }
            }
        }
        Ok(databases)
    }

    fn list_collections(&mut self, db: &str) -> Result<Vec<Document>> {
        let mut collections = Vec::new();
        self.exhaust_cursor(
            db,
            doc! {"listCollections": 1, "filter": {"type": "collection"}},
            0,
            &mut |batch| {
                collections.extend(batch);
                Ok(())
            },
        )?;
        Ok(collections)
    }

    fn list_indexes(&mut self, db: &str, coll_uuid: Uuid) -> Result<Vec<Document>> {
        let mut specs = Vec::new();
        self.exhaust_cursor(
            db,
            doc! {"listIndexes": bson_helper::new_bson_binary(coll_uuid)},
            0,
            &mut |batch| {
                specs.extend(batch);
                Ok(())
            },
        )?;
        Ok(specs)
    }

    fn count(&mut self, db: &str, coll_uuid: Uuid) -> Result<u64> {
        let reply = self.run_command(db, doc! {"count": bson_helper::new_bson_binary(coll_uuid)})?;
        let n = match reply.get("n") {
            Some(Bson::Int32(v)) => i64::from(*v),
            Some(Bson::Int64(v)) => *v,
            Some(Bson::Double(v)) => *v as i64,
            _ => return Err(CloneError::parse("count reply", "missing 'n' field")),
        };
        Ok(n.max(0) as u64)
    }

    fn query(
        &mut self,
        db: &str,
        coll_uuid: Uuid,
        batch_size: u32,
        handle_batch: BatchHandler<'_>,
    ) -> Result<()> {
        self.exhaust_cursor(
            db,
            doc! {
                "find": bson_helper::new_bson_binary(coll_uuid),
                "noCursorTimeout": true,
                "batchSize": batch_size as i64,
            },
            batch_size,
            handle_batch,
        )
    }
}
