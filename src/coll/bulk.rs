//! Batch-splitting for mixed writes.
//!
//! Contiguous requests of the same kind (insert / update / delete) are
//! grouped into sub-batches bounded by the server's `maxWriteBatchSize`,
//! `maxBsonObjectSize` and `maxMessageSizeBytes`; each sub-batch is
//! dispatched as its own command (and therefore allocates its own
//! `txnNumber` when retryable).

use std::collections::HashMap;

use bson::{oid::ObjectId, Bson, Document};

use crate::{
    bson_util,
    client::{session::ClientSession, Client},
    concern::WriteConcern,
    error::{BulkWriteFailure, Error, ErrorKind, Result},
    operation::{
        Delete,
        DeleteModel,
        Insert,
        Update,
        UpdateModel,
        UpdateOrReplace,
        WriteResponseBody,
    },
    options::BulkWriteOptions,
    results::BulkWriteResult,
    sdam::ServerDescription,
    selection_criteria::{ReadPreference, SelectionCriteria},
    Namespace,
};

/// Bytes reserved for the command body around a document sequence.
const COMMAND_OVERHEAD_SIZE: usize = 16_000;

/// One requested write within a bulk operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteModel {
    /// Insert one document.
    InsertOne {
        /// The document to insert.
        document: Document,
    },

    /// Update the first document matching a filter.
    UpdateOne {
        /// The filter selecting the document.
        filter: Document,
        /// The update modifiers to apply.
        update: Document,
        /// Insert the document if none matches.
        upsert: Option<bool>,
    },

    /// Update every document matching a filter.
    UpdateMany {
        /// The filter selecting the documents.
        filter: Document,
        /// The update modifiers to apply.
        update: Document,
        /// Insert a document if none matches.
        upsert: Option<bool>,
    },

    /// Replace the first document matching a filter.
    ReplaceOne {
        /// The filter selecting the document.
        filter: Document,
        /// The replacement document.
        replacement: Document,
        /// Insert the replacement if none matches.
        upsert: Option<bool>,
    },

    /// Delete the first document matching a filter.
    DeleteOne {
        /// The filter selecting the document.
        filter: Document,
    },

    /// Delete every document matching a filter.
    DeleteMany {
        /// The filter selecting the documents.
        filter: Document,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BatchKind {
    Insert,
    Update,
    Delete,
}

impl WriteModel {
    fn kind(&self) -> BatchKind {
        match self {
            WriteModel::InsertOne { .. } => BatchKind::Insert,
            WriteModel::UpdateOne { .. }
            | WriteModel::UpdateMany { .. }
            | WriteModel::ReplaceOne { .. } => BatchKind::Update,
            WriteModel::DeleteOne { .. } | WriteModel::DeleteMany { .. } => BatchKind::Delete,
        }
    }

    /// The encoded size this model contributes to its command's document
    /// sequence.
    fn encoded_size(&self) -> Result<usize> {
        let size = match self {
            WriteModel::InsertOne { document } => bson_util::doc_size_bytes(document)?,
            WriteModel::UpdateOne { filter, update, .. }
            | WriteModel::UpdateMany { filter, update, .. } => {
                bson_util::doc_size_bytes(filter)? + bson_util::doc_size_bytes(update)? + 64
            }
            WriteModel::ReplaceOne {
                filter,
                replacement,
                ..
            } => bson_util::doc_size_bytes(filter)? + bson_util::doc_size_bytes(replacement)? + 64,
            WriteModel::DeleteOne { filter } | WriteModel::DeleteMany { filter } => {
                bson_util::doc_size_bytes(filter)? + 32
            }
        };
        Ok(size)
    }
}

/// The batch limits advertised by the server a bulk write targets.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BatchLimits {
    pub(crate) max_write_batch_size: usize,
    pub(crate) max_bson_object_size: usize,
    pub(crate) max_message_size_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_write_batch_size: 100_000,
            max_bson_object_size: 16 * 1024 * 1024,
            max_message_size_bytes: 48_000_000,
        }
    }
}

impl BatchLimits {
    fn from_server_description(description: &ServerDescription) -> Self {
        let mut limits = Self::default();
        if let Ok(Some(ref reply)) = description.reply {
            let response = &reply.command_response;
            if let Some(max) = response.max_write_batch_size {
                limits.max_write_batch_size = max as usize;
            }
            if let Some(max) = response.max_bson_object_size {
                limits.max_bson_object_size = max as usize;
            }
            if let Some(max) = response.max_message_size_bytes {
                limits.max_message_size_bytes = max as usize;
            }
        }
        limits
    }
}

/// A contiguous run of same-kind models, small enough for one command.
#[derive(Debug)]
pub(crate) struct SubBatch {
    pub(crate) start_index: usize,
    pub(crate) models: Vec<WriteModel>,
}

/// Groups the models into dispatchable sub-batches.
pub(crate) fn split_batches(models: Vec<WriteModel>, limits: &BatchLimits) -> Result<Vec<SubBatch>> {
    let size_budget = limits
        .max_message_size_bytes
        .saturating_sub(COMMAND_OVERHEAD_SIZE)
        .max(1);

    let mut batches: Vec<SubBatch> = Vec::new();
    let mut current: Option<(BatchKind, SubBatch, usize)> = None;

    for (index, model) in models.into_iter().enumerate() {
        let kind = model.kind();
        let size = model.encoded_size()?;
        if size > limits.max_bson_object_size {
            return Err(Error::invalid_argument(format!(
                "write at index {} exceeds the server's maximum document size",
                index
            )));
        }

        let start_new = match current {
            Some((current_kind, ref batch, bytes)) => {
                current_kind != kind
                    || batch.models.len() >= limits.max_write_batch_size
                    || bytes + size > size_budget
            }
            None => true,
        };

        if start_new {
            if let Some((_, batch, _)) = current.take() {
                batches.push(batch);
            }
            current = Some((
                kind,
                SubBatch {
                    start_index: index,
                    models: Vec::new(),
                },
                0,
            ));
        }

        if let Some((_, ref mut batch, ref mut bytes)) = current {
            batch.models.push(model);
            *bytes += size;
        }
    }

    if let Some((_, batch, _)) = current {
        batches.push(batch);
    }

    Ok(batches)
}

/// Executes a bulk write: split, dispatch each sub-batch, aggregate.
///
/// In ordered mode execution stops at the first sub-batch that reports a
/// write error (or fails outright); unordered mode runs every sub-batch and
/// aggregates all results. Either way, partial results are preserved in the
/// returned failure.
pub(crate) async fn execute_bulk_write(
    client: &Client,
    ns: &Namespace,
    mut models: Vec<WriteModel>,
    options: BulkWriteOptions,
    mut session: Option<&mut ClientSession>,
) -> Result<BulkWriteResult> {
    if models.is_empty() {
        return Err(Error::invalid_argument(
            "a bulk write requires at least one write",
        ));
    }

    let ordered = options.ordered.unwrap_or(true);
    let write_concern = options.write_concern;

    // Assign `_id`s up front so inserted ids can be reported per input index
    // even across batch splits.
    let mut inserted_ids: HashMap<usize, Bson> = HashMap::new();
    for (index, model) in models.iter_mut().enumerate() {
        if let WriteModel::InsertOne { ref mut document } = model {
            let id = document
                .entry("_id".to_string())
                .or_insert_with(|| Bson::ObjectId(ObjectId::new()))
                .clone();
            inserted_ids.insert(index, id);
        }
    }

    // The batch limits come from the server a write would select right now.
    let primary = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    let (_, description) = client.topology().select_server(&primary).await?;
    let limits = BatchLimits::from_server_description(&description);

    let batches = split_batches(models, &limits)?;

    // All sub-batches share one session so that each gets a distinct
    // transaction number from the same monotonic sequence; it is returned to
    // the pool only after the final outcome.
    let mut owned_session: Option<ClientSession> = None;
    if session.is_none() {
        owned_session = Some(client.start_session_internal(None, true).await);
    }

    let mut result = BulkWriteResult::default();
    let mut failure = BulkWriteFailure::default();
    let mut labels: Vec<String> = Vec::new();

    let mut batch_iter = batches.into_iter();
    while let Some(batch) = batch_iter.next() {
        let start_index = batch.start_index;
        let batch_len = batch.models.len();

        let sub_session = session.as_deref_mut().or(owned_session.as_mut());
        let response = execute_sub_batch(
            client,
            ns,
            batch,
            ordered,
            write_concern.clone(),
            sub_session,
        )
        .await;

        match response {
            Ok((body, kind)) => {
                accumulate(&mut result, &body, kind, start_index);
                for mut write_error in body.write_errors {
                    write_error.index += start_index;
                    inserted_ids.remove(&write_error.index);
                    failure.write_errors.push(write_error);
                }
                if let Some(wc_error) = body.write_concern_error {
                    labels.extend(wc_error.labels.iter().cloned());
                    failure.write_concern_error = Some(wc_error);
                }
            }
            Err(error) => {
                // A command-level failure: every write in this batch is
                // unaccounted for.
                for index in start_index..start_index + batch_len {
                    inserted_ids.remove(&index);
                }
                if ordered {
                    return Err(error);
                }
                labels.extend(error.labels().iter().cloned());
                match *error.kind {
                    ErrorKind::Command(command_error) => {
                        failure.write_errors.push(crate::error::BulkWriteError {
                            index: start_index,
                            code: command_error.code,
                            code_name: Some(command_error.code_name),
                            message: command_error.message,
                        });
                    }
                    kind => return Err(Error::new(kind, Some(labels))),
                }
            }
        }

        if ordered && !failure.write_errors.is_empty() {
            // Ordered mode stops here; writes in unexecuted batches never
            // happened and must not report ids.
            for unexecuted in batch_iter.by_ref() {
                let range = unexecuted.start_index
                    ..unexecuted.start_index + unexecuted.models.len();
                for index in range {
                    inserted_ids.remove(&index);
                }
            }
            break;
        }
    }

    // Only writes that actually succeeded contribute ids.
    result.inserted_ids = inserted_ids;

    if !failure.write_errors.is_empty() || failure.write_concern_error.is_some() {
        failure.inserted_ids = result.inserted_ids.clone();
        return Err(Error::new(ErrorKind::BulkWrite(failure), Some(labels)));
    }

    Ok(result)
}

async fn execute_sub_batch(
    client: &Client,
    ns: &Namespace,
    batch: SubBatch,
    ordered: bool,
    write_concern: Option<WriteConcern>,
    session: Option<&mut ClientSession>,
) -> Result<(WriteResponseBody, BatchKind)> {
    let kind = batch
        .models
        .first()
        .map(WriteModel::kind)
        .unwrap_or(BatchKind::Insert);

    let body = match kind {
        BatchKind::Insert => {
            let documents = batch
                .models
                .into_iter()
                .map(|model| match model {
                    WriteModel::InsertOne { document } => document,
                    _ => Document::new(),
                })
                .collect();
            let op = Insert::new(ns.clone(), documents, ordered, write_concern);
            client.execute_operation(op, session).await?
        }
        BatchKind::Update => {
            let updates = batch
                .models
                .into_iter()
                .filter_map(|model| match model {
                    WriteModel::UpdateOne {
                        filter,
                        update,
                        upsert,
                    } => Some(UpdateModel {
                        filter,
                        update: UpdateOrReplace::UpdateModifications(update),
                        multi: false,
                        upsert,
                    }),
                    WriteModel::UpdateMany {
                        filter,
                        update,
                        upsert,
                    } => Some(UpdateModel {
                        filter,
                        update: UpdateOrReplace::UpdateModifications(update),
                        multi: true,
                        upsert,
                    }),
                    WriteModel::ReplaceOne {
                        filter,
                        replacement,
                        upsert,
                    } => Some(UpdateModel {
                        filter,
                        update: UpdateOrReplace::Replacement(replacement),
                        multi: false,
                        upsert,
                    }),
                    _ => None,
                })
                .collect();
            let op = Update::new(ns.clone(), updates, ordered, write_concern)?;
            client.execute_operation(op, session).await?
        }
        BatchKind::Delete => {
            let deletes = batch
                .models
                .into_iter()
                .filter_map(|model| match model {
                    WriteModel::DeleteOne { filter } => Some(DeleteModel {
                        filter,
                        multi: false,
                    }),
                    WriteModel::DeleteMany { filter } => Some(DeleteModel {
                        filter,
                        multi: true,
                    }),
                    _ => None,
                })
                .collect();
            let op = Delete::new(ns.clone(), deletes, ordered, write_concern);
            client.execute_operation(op, session).await?
        }
    };

    Ok((body, kind))
}

fn accumulate(
    result: &mut BulkWriteResult,
    body: &WriteResponseBody,
    kind: BatchKind,
    start_index: usize,
) {
    match kind {
        BatchKind::Insert => {
            result.inserted_count += body.n;
        }
        BatchKind::Update => {
            let upserted = body.upserted.len() as u64;
            result.matched_count += body.n.saturating_sub(upserted);
            result.modified_count += body.n_modified;
            result.upserted_count += upserted;
            for upsert in &body.upserted {
                result
                    .upserted_ids
                    .insert(upsert.index + start_index, upsert.id.clone());
            }
        }
        BatchKind::Delete => {
            result.deleted_count += body.n;
        }
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    fn insert_model(size: usize) -> WriteModel {
        WriteModel::InsertOne {
            document: doc! { "_id": ObjectId::new(), "payload": "x".repeat(size) },
        }
    }

    #[test]
    fn contiguous_same_kind_models_share_a_batch() {
        let models = vec![
            insert_model(1),
            insert_model(1),
            WriteModel::DeleteOne { filter: doc! {} },
            insert_model(1),
        ];
        let batches = split_batches(models, &BatchLimits::default()).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].start_index, 0);
        assert_eq!(batches[0].models.len(), 2);
        assert_eq!(batches[1].start_index, 2);
        assert_eq!(batches[2].start_index, 3);
    }

    #[test]
    fn batches_split_at_max_write_batch_size() {
        let limits = BatchLimits {
            max_write_batch_size: 2,
            ..Default::default()
        };
        let models = (0..5).map(|_| insert_model(1)).collect();
        let batches = split_batches(models, &limits).unwrap();
        assert_eq!(
            batches.iter().map(|b| b.models.len()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(
            batches.iter().map(|b| b.start_index).collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
    }

    #[test]
    fn batches_split_by_total_size() {
        // Documents of ~1KB with a message budget that fits two of them.
        let limits = BatchLimits {
            max_message_size_bytes: COMMAND_OVERHEAD_SIZE + 2_200,
            ..Default::default()
        };
        let models = (0..4).map(|_| insert_model(1000)).collect();
        let batches = split_batches(models, &limits).unwrap();
        assert!(batches.len() >= 2);
        let total: usize = batches.iter().map(|b| b.models.len()).sum();
        assert_eq!(total, 4);

        // Every input index appears in exactly one batch.
        let mut indices: Vec<usize> = batches
            .iter()
            .flat_map(|b| (b.start_index..b.start_index + b.models.len()))
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn oversized_single_document_is_rejected() {
        let limits = BatchLimits {
            max_bson_object_size: 512,
            ..Default::default()
        };
        let models = vec![insert_model(1024)];
        assert!(split_batches(models, &limits).is_err());
    }
}
