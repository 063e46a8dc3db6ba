mod aggregate;
mod count;
mod delete;
mod distinct;
mod find;
mod find_and_modify;
mod get_more;
mod insert;
mod kill_cursors;
mod list_collections;
mod list_databases;
mod list_indexes;
mod run_command;
mod update;

use std::collections::HashSet;

use bson::{Bson, Document};
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::{
    concern::WriteConcern,
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    error::{BulkWriteError, CommandError, Error, ErrorKind, Result, WriteConcernError},
    selection_criteria::SelectionCriteria,
};

pub(crate) use aggregate::{Aggregate, AggregateTarget, ChangeStreamAggregate};
pub(crate) use count::Count;
pub(crate) use delete::{Delete, DeleteModel};
pub(crate) use distinct::Distinct;
pub(crate) use find::Find;
pub(crate) use find_and_modify::{FindAndModify, FindAndModifyCommonOptions, Modification};
pub(crate) use get_more::GetMore;
pub(crate) use insert::Insert;
pub(crate) use kill_cursors::KillCursors;
pub(crate) use list_collections::ListCollections;
pub(crate) use list_databases::ListDatabases;
pub(crate) use list_indexes::ListIndexes;
pub(crate) use run_command::RunCommand;
pub(crate) use update::{Update, UpdateModel, UpdateOrReplace};

/// Commands that must never carry an `lsid`, even when a session is active.
pub(crate) static SESSIONS_UNSUPPORTED_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut hash_set = HashSet::new();
    hash_set.insert("killcursors");
    hash_set.insert("parallelcollectionscan");
    hash_set
});

/// The level of retry support a given operation has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Retryability {
    /// The operation is a retryable write: it may carry a `txnNumber` and be
    /// re-sent once after a retryable failure.
    Write,

    /// The operation is a retryable read.
    Read,

    /// The operation must not be retried.
    None,
}

/// A trait modeling the behavior of a server-side operation: how to build the
/// command for a given connection and how to interpret the reply.
pub(crate) trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server-side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server for this
    /// operation, sized against the connection's negotiated limits.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server's successful (`ok: 1`) response to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Criteria to use for selecting the server to execute this operation on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// The write concern this operation will apply, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// Whether the server will acknowledge this operation.
    fn is_acknowledged(&self) -> bool {
        self.write_concern()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true)
    }

    /// Whether this operation may carry a session.
    fn supports_sessions(&self) -> bool {
        !SESSIONS_UNSUPPORTED_COMMANDS.contains(Self::NAME.to_lowercase().as_str())
    }

    /// Whether this command accepts a `readConcern` field (and therefore
    /// `afterClusterTime` for causally consistent sessions).
    fn supports_read_concern(&self) -> bool {
        false
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    fn name(&self) -> &str {
        Self::NAME
    }
}

/// The shape of an `ok: 0` reply: a command error plus any server-attached
/// labels.
#[derive(Debug, Deserialize)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(body: CommandErrorBody) -> Error {
        Error::new(
            ErrorKind::Command(body.command_error),
            body.error_labels,
        )
    }
}

/// The common portion of replies to `insert`, `update` and `delete`.
///
/// Per-write errors and write concern errors arrive inside an `ok: 1` reply;
/// they are carried here as data and surfaced by the collection/bulk layer so
/// that partial results survive.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct WriteResponseBody {
    #[serde(default)]
    pub(crate) n: u64,

    #[serde(rename = "nModified", default)]
    pub(crate) n_modified: u64,

    #[serde(default)]
    pub(crate) upserted: Vec<UpsertedId>,

    #[serde(rename = "writeErrors", default)]
    pub(crate) write_errors: Vec<BulkWriteError>,

    #[serde(rename = "writeConcernError")]
    pub(crate) write_concern_error: Option<WriteConcernError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpsertedId {
    pub(crate) index: usize,

    #[serde(rename = "_id")]
    pub(crate) id: Bson,
}

/// The standard cursor-bearing reply shape shared by `find`, `aggregate`,
/// `listCollections`, `listIndexes` and `getMore`.
#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: String,

    #[serde(rename = "firstBatch", default)]
    pub(crate) first_batch: Option<Vec<Document>>,

    #[serde(rename = "nextBatch", default)]
    pub(crate) next_batch: Option<Vec<Document>>,

    #[serde(rename = "postBatchResumeToken")]
    pub(crate) post_batch_resume_token: Option<Document>,
}

/// Returns the command error carried by the response, if it is an `ok: 0`
/// reply. The dispatcher never silently swallows such a reply.
pub(crate) fn check_command_response(response: &RawCommandResponse) -> Result<()> {
    match response.command_error() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
