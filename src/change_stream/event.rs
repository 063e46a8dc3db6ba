//! The change event document model.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::Namespace;

/// An opaque token used to resume a change stream: the `_id` of a change
/// event, or the server's post-batch token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken(pub(crate) Bson);

impl ResumeToken {
    pub(crate) fn from_document(doc: Document) -> Self {
        Self(Bson::Document(doc))
    }

    /// The raw BSON value of the token.
    pub fn as_bson(&self) -> &Bson {
        &self.0
    }
}

/// The operation that a change event describes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted.
    Insert,

    /// A document was updated.
    Update,

    /// A document was replaced.
    Replace,

    /// A document was deleted.
    Delete,

    /// A collection was dropped.
    Drop,

    /// A collection was renamed.
    Rename,

    /// A database was dropped.
    DropDatabase,

    /// The stream can no longer be resumed past this point.
    Invalidate,

    /// An operation type this driver does not know about.
    #[serde(other)]
    Other,
}

/// A change event observed by a change stream.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/change-events/) for
/// more details.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamEvent {
    /// The resume token for this event.
    #[serde(rename = "_id")]
    pub id: ResumeToken,

    /// The operation that occurred.
    pub operation_type: OperationType,

    /// The namespace the event occurred on.
    #[serde(default)]
    pub ns: Option<ChangeNamespace>,

    /// The `_id` of the document the event concerns.
    #[serde(default)]
    pub document_key: Option<Document>,

    /// For updates, a description of the changed and removed fields.
    #[serde(default)]
    pub update_description: Option<UpdateDescription>,

    /// The full document, for inserts and replaces always, and for updates
    /// when `fullDocument: updateLookup` was requested.
    #[serde(default)]
    pub full_document: Option<Document>,

    /// The cluster time at which the change occurred.
    #[serde(default)]
    pub cluster_time: Option<bson::Timestamp>,
}

/// The changed and removed fields of an update event.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateDescription {
    /// The fields that were set, with their new values.
    pub updated_fields: Document,

    /// The dotted names of the fields that were removed.
    pub removed_fields: Vec<String>,
}

/// The namespace a change event occurred on.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ChangeNamespace {
    /// The database name.
    pub db: String,

    /// The collection name, absent for database-level events.
    #[serde(default)]
    pub coll: Option<String>,
}

impl From<Namespace> for ChangeNamespace {
    fn from(ns: Namespace) -> Self {
        Self {
            db: ns.db,
            coll: Some(ns.coll),
        }
    }
}
