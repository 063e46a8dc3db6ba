//! Options for the operations a [`Collection`](crate::Collection) supports.

use std::time::Duration;

use bson::Document;
use typed_builder::TypedBuilder;

use crate::{
    concern::{ReadConcern, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// The type of cursor a find operation creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CursorType {
    /// The cursor closes once the last result is returned.
    NonTailable,

    /// The cursor remains open after the last result; subsequent `getMore`
    /// calls return documents appended to a capped collection since.
    Tailable,

    /// A tailable cursor where the server additionally blocks a `getMore` for
    /// up to `max_await_time` waiting for new results.
    TailableAwait,
}

/// Options for a find operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct FindOptions {
    /// The number of documents the server returns per batch.
    pub batch_size: Option<u32>,

    /// The maximum number of documents to yield. The cursor is closed once
    /// the limit is reached.
    pub limit: Option<i64>,

    /// The number of matching documents to skip.
    pub skip: Option<u64>,

    /// The order of the returned documents.
    pub sort: Option<Document>,

    /// Limits the fields of the returned documents.
    pub projection: Option<Document>,

    /// The maximum amount of server execution time.
    pub max_time: Option<Duration>,

    /// For TailableAwait cursors, how long the server may block each `getMore`
    /// waiting for new results; sent as `maxTimeMS` on the getMore.
    pub max_await_time: Option<Duration>,

    /// The type of cursor to create.
    pub cursor_type: Option<CursorType>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The selection criteria for the operation.
    pub selection_criteria: Option<SelectionCriteria>,
}

/// Options for a find_one operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct FindOneOptions {
    /// The number of matching documents to skip.
    pub skip: Option<u64>,

    /// The order applied before taking the first document.
    pub sort: Option<Document>,

    /// Limits the fields of the returned document.
    pub projection: Option<Document>,

    /// The maximum amount of server execution time.
    pub max_time: Option<Duration>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The selection criteria for the operation.
    pub selection_criteria: Option<SelectionCriteria>,
}

impl From<FindOneOptions> for FindOptions {
    fn from(options: FindOneOptions) -> Self {
        FindOptions {
            limit: Some(1),
            skip: options.skip,
            sort: options.sort,
            projection: options.projection,
            max_time: options.max_time,
            read_concern: options.read_concern,
            selection_criteria: options.selection_criteria,
            ..Default::default()
        }
    }
}

/// Options for an insert_one operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct InsertOneOptions {
    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Options for an insert_many operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct InsertManyOptions {
    /// Whether the server should stop at the first failed insert. Defaults to
    /// true.
    pub ordered: Option<bool>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Options for update_one / update_many operations.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct UpdateOptions {
    /// Insert the modified document if no document matches the filter.
    pub upsert: Option<bool>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Options for a replace_one operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct ReplaceOptions {
    /// Insert the replacement document if no document matches the filter.
    pub upsert: Option<bool>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

impl From<ReplaceOptions> for UpdateOptions {
    fn from(options: ReplaceOptions) -> Self {
        UpdateOptions {
            upsert: options.upsert,
            write_concern: options.write_concern,
        }
    }
}

/// Options for delete_one / delete_many operations.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct DeleteOptions {
    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Which version of a modified document a findAndModify-style operation
/// returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReturnDocument {
    /// Return the document after modification.
    After,

    /// Return the document before modification.
    Before,
}

/// Options for a find_one_and_delete operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct FindOneAndDeleteOptions {
    /// The order applied before deleting the first matching document.
    pub sort: Option<Document>,

    /// Limits the fields of the returned document.
    pub projection: Option<Document>,

    /// The maximum amount of server execution time.
    pub max_time: Option<Duration>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Options for a find_one_and_update operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct FindOneAndUpdateOptions {
    /// The order applied before updating the first matching document.
    pub sort: Option<Document>,

    /// Limits the fields of the returned document.
    pub projection: Option<Document>,

    /// Insert the modified document if no document matches the filter.
    pub upsert: Option<bool>,

    /// Which version of the document to return.
    pub return_document: Option<ReturnDocument>,

    /// The maximum amount of server execution time.
    pub max_time: Option<Duration>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Options for a find_one_and_replace operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct FindOneAndReplaceOptions {
    /// The order applied before replacing the first matching document.
    pub sort: Option<Document>,

    /// Limits the fields of the returned document.
    pub projection: Option<Document>,

    /// Insert the replacement document if no document matches the filter.
    pub upsert: Option<bool>,

    /// Which version of the document to return.
    pub return_document: Option<ReturnDocument>,

    /// The maximum amount of server execution time.
    pub max_time: Option<Duration>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Options for a count_documents operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct CountOptions {
    /// The number of matching documents to skip before counting.
    pub skip: Option<u64>,

    /// The maximum number of documents to count.
    pub limit: Option<u64>,

    /// The maximum amount of server execution time.
    pub max_time: Option<Duration>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The selection criteria for the operation.
    pub selection_criteria: Option<SelectionCriteria>,
}

/// Options for an estimated_document_count operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct EstimatedDocumentCountOptions {
    /// The maximum amount of server execution time.
    pub max_time: Option<Duration>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The selection criteria for the operation.
    pub selection_criteria: Option<SelectionCriteria>,
}

/// Options for a distinct operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct DistinctOptions {
    /// The maximum amount of server execution time.
    pub max_time: Option<Duration>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The selection criteria for the operation.
    pub selection_criteria: Option<SelectionCriteria>,
}

/// Options for an aggregate operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct AggregateOptions {
    /// The number of documents the server returns per batch.
    pub batch_size: Option<u32>,

    /// The maximum amount of server execution time.
    pub max_time: Option<Duration>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The selection criteria for the operation.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The write concern to apply when the pipeline contains `$out` or
    /// `$merge`.
    pub write_concern: Option<WriteConcern>,
}

/// Options for a bulk_write operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct BulkWriteOptions {
    /// Whether the requests are applied in order, stopping at the first
    /// failure. Defaults to true.
    pub ordered: Option<bool>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}
