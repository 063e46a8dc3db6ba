//! Contains the types of results returned by CRUD operations.

use std::collections::HashMap;

use bson::{Bson, Document};
use serde::Deserialize;

/// The result of an insert of a single document.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct InsertOneResult {
    /// The `_id` field of the document inserted.
    pub inserted_id: Bson,
}

/// The result of an insert of many documents.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The `_id` field of the documents inserted, keyed by their index in the
    /// input.
    pub inserted_ids: HashMap<usize, Bson>,
}

/// The result of an update operation.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct UpdateResult {
    /// The number of documents that matched the filter.
    pub matched_count: u64,

    /// The number of documents that were modified.
    pub modified_count: u64,

    /// The `_id` field of the upserted document, if an upsert took place.
    pub upserted_id: Option<Bson>,
}

/// The result of a delete operation.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct DeleteResult {
    /// The number of documents deleted.
    pub deleted_count: u64,
}

/// The aggregate result of a bulk write.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct BulkWriteResult {
    /// The number of documents inserted.
    pub inserted_count: u64,

    /// The number of documents matched by update filters.
    pub matched_count: u64,

    /// The number of documents modified.
    pub modified_count: u64,

    /// The number of documents deleted.
    pub deleted_count: u64,

    /// The number of documents upserted.
    pub upserted_count: u64,

    /// The `_id` of each upserted document, keyed by the index of the request
    /// that produced it in the caller's original list.
    pub upserted_ids: HashMap<usize, Bson>,

    /// The `_id` of each inserted document, keyed by request index.
    pub inserted_ids: HashMap<usize, Bson>,
}

/// Describes one database returned by `listDatabases`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DatabaseSpecification {
    /// The name of the database.
    pub name: String,

    /// The total size of the database, in bytes.
    #[serde(default)]
    pub size_on_disk: Option<i64>,

    /// Whether the database has any data.
    #[serde(default)]
    pub empty: Option<bool>,
}

/// The portion of a cursor reply returned by a `getMore`.
#[derive(Debug)]
pub(crate) struct GetMoreResult {
    /// The next batch of documents.
    pub(crate) batch: Vec<Document>,

    /// Whether the server closed the cursor.
    pub(crate) exhausted: bool,

    /// The resume token covering everything up to the end of this batch, for
    /// change stream cursors.
    pub(crate) post_batch_resume_token: Option<Document>,
}
