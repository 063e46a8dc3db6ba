use bson::{Bson, Document, Timestamp};
use serde::de::DeserializeOwned;

use super::wire::{DocumentSequence, Message};
use crate::{
    bson_util,
    client::session::{ClientSession, ClusterTime},
    error::{CommandError, Error, ErrorKind, Result},
    operation::CommandErrorBody,
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// A driver-side abstraction of a server command, containing everything needed
/// to serialize it to a wire message.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) document_sequences: Vec<DocumentSequence>,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            document_sequences: Vec::new(),
        }
    }

    /// Attaches an out-of-line document sequence that will be sent as an
    /// OP_MSG Type-1 section and spliced into the body server-side.
    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl Into<String>,
        documents: Vec<Document>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
    }

    pub(crate) fn set_session(&mut self, session: &ClientSession) {
        self.body.insert("lsid", session.id().clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if let Ok(doc) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: &ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.to_document());
    }

    /// Sets `readConcern.afterClusterTime` for a causally consistent read,
    /// preserving any read concern level already present on the command.
    pub(crate) fn set_after_cluster_time(&mut self, operation_time: Timestamp) {
        let concern = match self.body.get_mut("readConcern") {
            Some(Bson::Document(doc)) => doc,
            _ => {
                self.body.insert("readConcern", Document::new());
                match self.body.get_mut("readConcern") {
                    Some(Bson::Document(doc)) => doc,
                    _ => unreachable!(),
                }
            }
        };
        concern.insert("afterClusterTime", Bson::Timestamp(operation_time));
    }
}

/// The decoded body of a server reply to a command, along with the address of
/// the server that produced it.
#[derive(Clone, Debug)]
pub(crate) struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    body: Document,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, message: Message) -> Self {
        Self {
            source,
            body: message.into_command_body(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_document(doc: Document) -> Self {
        Self {
            source: ServerAddress::default(),
            body: doc,
        }
    }

    /// Whether this response indicates command success (`ok: 1`).
    pub(crate) fn is_success(&self) -> bool {
        self.body
            .get("ok")
            .and_then(bson_util::get_int)
            .map(|ok| ok == 1)
            .unwrap_or(false)
    }

    /// The error this response describes, if it is an `ok: 0` reply. The
    /// server's error labels are carried on the returned error; an `ok: 0`
    /// reply is never silently discarded by the callers of this method.
    pub(crate) fn command_error(&self) -> Option<Error> {
        if self.is_success() {
            return None;
        }
        match bson::from_document::<CommandErrorBody>(self.body.clone()) {
            Ok(body) => Some(body.into()),
            Err(_) => Some(
                ErrorKind::Command(CommandError {
                    code: self
                        .body
                        .get("code")
                        .and_then(bson_util::get_int)
                        .unwrap_or(0) as i32,
                    code_name: String::new(),
                    message: "server returned an unparseable error reply".to_string(),
                })
                .into(),
            ),
        }
    }

    /// The `$clusterTime` the server attached to this reply, if any.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.body
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| bson::from_document(doc.clone()).ok())
    }

    /// The `operationTime` the server attached to this reply, if any.
    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        match self.body.get("operationTime") {
            Some(Bson::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// Deserializes the body of this response into a `T`.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_document(self.body.clone()).map_err(|e| {
            ErrorKind::InvalidResponse {
                message: format!("invalid server response: {}", e),
            }
            .into()
        })
    }

    pub(crate) fn raw_body(&self) -> &Document {
        &self.body
    }

    /// The address of the server that sent this response.
    #[allow(unused)]
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}
