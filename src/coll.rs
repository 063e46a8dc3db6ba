pub(crate) mod bulk;
pub(crate) mod options;

use std::{borrow::Borrow, fmt, marker::PhantomData};

use bson::{doc, Bson, Document};
use futures_util::stream::TryStreamExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    bson_util,
    change_stream::{event::ChangeStreamEvent, execute_watch, ChangeStream, WatchArgs},
    client::{session::ClientSession, Client},
    concern::{ReadConcern, WriteConcern},
    cursor::Cursor,
    error::{Error, ErrorKind, Result, WriteConcernError, WriteError, WriteFailure},
    operation::{
        Aggregate,
        AggregateTarget,
        Count,
        Distinct,
        Find,
        FindAndModify,
        FindAndModifyCommonOptions,
        ListIndexes,
        Modification,
        UpdateOrReplace,
    },
    options::{
        AggregateOptions,
        BulkWriteOptions,
        ChangeStreamOptions,
        CountOptions,
        DeleteOptions,
        DistinctOptions,
        EstimatedDocumentCountOptions,
        FindOneAndDeleteOptions,
        FindOneAndReplaceOptions,
        FindOneAndUpdateOptions,
        FindOneOptions,
        FindOptions,
        InsertManyOptions,
        InsertOneOptions,
        ReplaceOptions,
        SelectionCriteria,
        UpdateOptions,
    },
    results::{
        BulkWriteResult,
        DeleteResult,
        InsertManyResult,
        InsertOneResult,
        UpdateResult,
    },
    Namespace,
};

pub(crate) use bulk::WriteModel;

/// A handle to a collection within a database. `Collection` is parameterized
/// by the type the collection's documents deserialize to (and serialize
/// from); the default is a raw [`Document`].
///
/// `Collection` is cheap to clone.
#[derive(Debug)]
pub struct Collection<T = Document> {
    client: Client,
    ns: Namespace,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
    selection_criteria: Option<SelectionCriteria>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            ns: self.ns.clone(),
            read_concern: self.read_concern.clone(),
            write_concern: self.write_concern.clone(),
            selection_criteria: self.selection_criteria.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> Collection<T> {
    pub(crate) fn new(client: Client, ns: Namespace) -> Self {
        let read_concern = client.inner.options.read_concern.clone();
        let write_concern = client.inner.options.write_concern.clone();
        let selection_criteria = client.inner.options.selection_criteria.clone();
        Self {
            client,
            ns,
            read_concern,
            write_concern,
            selection_criteria,
            _phantom: PhantomData,
        }
    }

    /// The name of this collection.
    pub fn name(&self) -> &str {
        &self.ns.coll
    }

    /// The namespace of this collection.
    pub fn namespace(&self) -> Namespace {
        self.ns.clone()
    }

    /// A clone of this handle deserializing documents to a different type.
    pub fn clone_with_type<U>(&self) -> Collection<U> {
        Collection {
            client: self.client.clone(),
            ns: self.ns.clone(),
            read_concern: self.read_concern.clone(),
            write_concern: self.write_concern.clone(),
            selection_criteria: self.selection_criteria.clone(),
            _phantom: PhantomData,
        }
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    fn write_concern_for(&self, options: Option<&WriteConcern>) -> Option<WriteConcern> {
        options.cloned().or_else(|| self.write_concern.clone())
    }

    fn apply_read_defaults(
        &self,
        read_concern: &mut Option<ReadConcern>,
        selection_criteria: &mut Option<SelectionCriteria>,
    ) {
        if read_concern.is_none() {
            *read_concern = self.read_concern.clone();
        }
        if selection_criteria.is_none() {
            *selection_criteria = self.selection_criteria.clone();
        }
    }

    /// Deletes the first document matching `query`.
    pub async fn delete_one(
        &self,
        query: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        self.delete(query, false, options.into(), None).await
    }

    /// Deletes the first document matching `query` using the provided
    /// session.
    pub async fn delete_one_with_session(
        &self,
        query: Document,
        options: impl Into<Option<DeleteOptions>>,
        session: &mut ClientSession,
    ) -> Result<DeleteResult> {
        self.delete(query, false, options.into(), Some(session))
            .await
    }

    /// Deletes all documents matching `query`.
    pub async fn delete_many(
        &self,
        query: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        self.delete(query, true, options.into(), None).await
    }

    async fn delete(
        &self,
        query: Document,
        multi: bool,
        options: Option<DeleteOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<DeleteResult> {
        let write_concern =
            self.write_concern_for(options.as_ref().and_then(|o| o.write_concern.as_ref()));
        let model = if multi {
            WriteModel::DeleteMany { filter: query }
        } else {
            WriteModel::DeleteOne { filter: query }
        };
        let result = self
            .execute_single_write(model, write_concern, session)
            .await?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    /// Updates the first document matching `query`. The update document must
    /// only contain update operators.
    pub async fn update_one(
        &self,
        query: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update(query, UpdateOrReplace::UpdateModifications(update), false, options.into(), None)
            .await
    }

    /// Updates the first document matching `query` using the provided
    /// session.
    pub async fn update_one_with_session(
        &self,
        query: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        self.update(
            query,
            UpdateOrReplace::UpdateModifications(update),
            false,
            options.into(),
            Some(session),
        )
        .await
    }

    /// Updates all documents matching `query`.
    pub async fn update_many(
        &self,
        query: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update(query, UpdateOrReplace::UpdateModifications(update), true, options.into(), None)
            .await
    }

    async fn update(
        &self,
        query: Document,
        update: UpdateOrReplace,
        multi: bool,
        options: Option<UpdateOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<UpdateResult> {
        let write_concern =
            self.write_concern_for(options.as_ref().and_then(|o| o.write_concern.as_ref()));
        let upsert = options.as_ref().and_then(|o| o.upsert);
        let model = match (update, multi) {
            (UpdateOrReplace::UpdateModifications(update), false) => WriteModel::UpdateOne {
                filter: query,
                update,
                upsert,
            },
            (UpdateOrReplace::UpdateModifications(update), true) => WriteModel::UpdateMany {
                filter: query,
                update,
                upsert,
            },
            (UpdateOrReplace::Replacement(replacement), _) => WriteModel::ReplaceOne {
                filter: query,
                replacement,
                upsert,
            },
        };
        let result = self
            .execute_single_write(model, write_concern, session)
            .await?;
        Ok(UpdateResult {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_ids.get(&0).cloned(),
        })
    }

    /// Replaces the first document matching `query` with `replacement`.
    pub async fn replace_one(
        &self,
        query: Document,
        replacement: impl Borrow<T>,
        options: impl Into<Option<ReplaceOptions>>,
    ) -> Result<UpdateResult>
    where
        T: Serialize,
    {
        let replacement = bson::to_document(replacement.borrow())?;
        let options: Option<UpdateOptions> = options.into().map(Into::into);
        self.update(
            query,
            UpdateOrReplace::Replacement(replacement),
            false,
            options,
            None,
        )
        .await
    }

    /// Runs a single write model through the bulk machinery, converting bulk
    /// failures into single-write failures.
    async fn execute_single_write(
        &self,
        model: WriteModel,
        write_concern: Option<WriteConcern>,
        session: Option<&mut ClientSession>,
    ) -> Result<BulkWriteResult> {
        let options = BulkWriteOptions {
            ordered: Some(true),
            write_concern,
        };
        bulk::execute_bulk_write(self.client(), &self.ns, vec![model], options, session)
            .await
            .map_err(convert_bulk_errors)
    }

    /// Inserts `doc` into the collection.
    pub async fn insert_one(
        &self,
        doc: impl Borrow<T>,
        options: impl Into<Option<InsertOneOptions>>,
    ) -> Result<InsertOneResult>
    where
        T: Serialize,
    {
        self.insert_one_inner(bson::to_document(doc.borrow())?, options.into(), None)
            .await
    }

    /// Inserts `doc` into the collection using the provided session.
    pub async fn insert_one_with_session(
        &self,
        doc: impl Borrow<T>,
        options: impl Into<Option<InsertOneOptions>>,
        session: &mut ClientSession,
    ) -> Result<InsertOneResult>
    where
        T: Serialize,
    {
        self.insert_one_inner(bson::to_document(doc.borrow())?, options.into(), Some(session))
            .await
    }

    async fn insert_one_inner(
        &self,
        doc: Document,
        options: Option<InsertOneOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<InsertOneResult> {
        let write_concern =
            self.write_concern_for(options.as_ref().and_then(|o| o.write_concern.as_ref()));
        let result = self
            .execute_single_write(
                WriteModel::InsertOne { document: doc },
                write_concern,
                session,
            )
            .await?;
        let inserted_id = result
            .inserted_ids
            .get(&0)
            .cloned()
            .unwrap_or(Bson::Null);
        Ok(InsertOneResult { inserted_id })
    }

    /// Inserts the given documents. Batches whose encoded size exceeds the
    /// server's limits are split into multiple `insert` commands, each within
    /// the limit; the returned ids cover every input index exactly once.
    pub async fn insert_many(
        &self,
        docs: impl IntoIterator<Item = impl Borrow<T>>,
        options: impl Into<Option<InsertManyOptions>>,
    ) -> Result<InsertManyResult>
    where
        T: Serialize,
    {
        let options = options.into();
        let write_concern =
            self.write_concern_for(options.as_ref().and_then(|o| o.write_concern.as_ref()));
        let ordered = options.and_then(|o| o.ordered).unwrap_or(true);

        let mut models = Vec::new();
        for doc in docs {
            models.push(WriteModel::InsertOne {
                document: bson::to_document(doc.borrow())?,
            });
        }
        if models.is_empty() {
            return Err(Error::invalid_argument(
                "insert_many requires at least one document",
            ));
        }

        let bulk_options = BulkWriteOptions {
            ordered: Some(ordered),
            write_concern,
        };
        let result =
            bulk::execute_bulk_write(self.client(), &self.ns, models, bulk_options, None).await?;
        Ok(InsertManyResult {
            inserted_ids: result.inserted_ids,
        })
    }

    /// Executes a mixed batch of write models, grouping contiguous models of
    /// the same kind into as few commands as the server's batch limits allow.
    pub async fn bulk_write(
        &self,
        models: Vec<WriteModel>,
        options: impl Into<Option<BulkWriteOptions>>,
    ) -> Result<BulkWriteResult> {
        let mut options = options.into().unwrap_or_default();
        if options.write_concern.is_none() {
            options.write_concern = self.write_concern.clone();
        }
        bulk::execute_bulk_write(self.client(), &self.ns, models, options, None).await
    }

    /// Finds the documents matching `filter`.
    pub async fn find(
        &self,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor<T>>
    where
        T: DeserializeOwned + Unpin + Send + Sync,
    {
        let mut options = options.into().unwrap_or_default();
        self.apply_read_defaults(&mut options.read_concern, &mut options.selection_criteria);
        let op = Find::new(self.ns.clone(), filter, Some(options));
        self.client.execute_cursor_operation(op).await
    }

    /// Finds the first document matching `filter`.
    pub async fn find_one(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneOptions>>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned + Unpin + Send + Sync,
    {
        let options: FindOptions = options.into().unwrap_or_default().into();
        let mut cursor = self.find(filter, options).await?;
        cursor.try_next().await
    }

    /// Finds the first document matching `filter` using the provided session.
    /// The read carries `readConcern.afterClusterTime` when the session is
    /// causally consistent and has observed an operation time.
    pub async fn find_one_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneOptions>>,
        session: &mut ClientSession,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned + Unpin + Send + Sync,
    {
        let mut options: FindOptions = options.into().unwrap_or_default().into();
        self.apply_read_defaults(&mut options.read_concern, &mut options.selection_criteria);
        let op = Find::new(self.ns.clone(), filter, Some(options));
        let details = self
            .client
            .execute_operation_with_details(op, Some(session))
            .await?;
        let mut spec = details.output;

        // With limit 1 the server closes the cursor after the first batch;
        // anything still open is released without waiting.
        let first = spec.initial_buffer.pop_front();
        if spec.id() != 0 {
            crate::cursor::kill_cursor(
                self.client.clone(),
                spec.info.ns.clone(),
                spec.id(),
                spec.info.address.clone(),
                None,
                None,
            );
        }

        match first {
            Some(doc) => Ok(Some(bson::from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Atomically finds and deletes the first document matching `filter`,
    /// returning it.
    pub async fn find_one_and_delete(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneAndDeleteOptions>>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let options = options.into();
        let common = FindAndModifyCommonOptions {
            sort: options.as_ref().and_then(|o| o.sort.clone()),
            projection: options.as_ref().and_then(|o| o.projection.clone()),
            max_time: options.as_ref().and_then(|o| o.max_time),
            write_concern: self
                .write_concern_for(options.as_ref().and_then(|o| o.write_concern.as_ref())),
        };
        self.find_and_modify(filter, Modification::Delete, common)
            .await
    }

    /// Atomically finds and updates the first document matching `filter`.
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<FindOneAndUpdateOptions>>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let options = options.into();
        let modification = Modification::Update {
            update,
            upsert: options.as_ref().and_then(|o| o.upsert),
            return_document: options.as_ref().and_then(|o| o.return_document),
        };
        let common = FindAndModifyCommonOptions {
            sort: options.as_ref().and_then(|o| o.sort.clone()),
            projection: options.as_ref().and_then(|o| o.projection.clone()),
            max_time: options.as_ref().and_then(|o| o.max_time),
            write_concern: self
                .write_concern_for(options.as_ref().and_then(|o| o.write_concern.as_ref())),
        };
        self.find_and_modify(filter, modification, common).await
    }

    /// Atomically finds and replaces the first document matching `filter`.
    pub async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: impl Borrow<T>,
        options: impl Into<Option<FindOneAndReplaceOptions>>,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let options = options.into();
        let modification = Modification::Replace {
            replacement: bson::to_document(replacement.borrow())?,
            upsert: options.as_ref().and_then(|o| o.upsert),
            return_document: options.as_ref().and_then(|o| o.return_document),
        };
        let common = FindAndModifyCommonOptions {
            sort: options.as_ref().and_then(|o| o.sort.clone()),
            projection: options.as_ref().and_then(|o| o.projection.clone()),
            max_time: options.as_ref().and_then(|o| o.max_time),
            write_concern: self
                .write_concern_for(options.as_ref().and_then(|o| o.write_concern.as_ref())),
        };
        self.find_and_modify(filter, modification, common).await
    }

    async fn find_and_modify(
        &self,
        filter: Document,
        modification: Modification,
        options: FindAndModifyCommonOptions,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let op = FindAndModify::new(self.ns.clone(), filter, modification, options);
        let value = self.client.execute_operation(op, None).await?;
        match value {
            Some(doc) => Ok(Some(bson::from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Counts the documents matching `filter`, by running an aggregation.
    pub async fn count_documents(
        &self,
        filter: Document,
        options: impl Into<Option<CountOptions>>,
    ) -> Result<u64> {
        let options = options.into();

        let mut pipeline = vec![doc! { "$match": filter }];
        if let Some(skip) = options.as_ref().and_then(|o| o.skip) {
            pipeline.push(doc! { "$skip": skip as i64 });
        }
        if let Some(limit) = options.as_ref().and_then(|o| o.limit) {
            pipeline.push(doc! { "$limit": limit as i64 });
        }
        pipeline.push(doc! { "$group": { "_id": 1, "n": { "$sum": 1 } } });

        let mut aggregate_options = AggregateOptions {
            max_time: options.as_ref().and_then(|o| o.max_time),
            read_concern: options.as_ref().and_then(|o| o.read_concern.clone()),
            selection_criteria: options.and_then(|o| o.selection_criteria),
            ..Default::default()
        };
        self.apply_read_defaults(
            &mut aggregate_options.read_concern,
            &mut aggregate_options.selection_criteria,
        );

        let op = Aggregate::new(
            AggregateTarget::Collection(self.ns.clone()),
            pipeline,
            Some(aggregate_options),
        );
        let mut cursor: Cursor<Document> = self.client.execute_cursor_operation(op).await?;
        let result = match cursor.try_next().await? {
            Some(doc) => doc,
            None => return Ok(0),
        };

        result
            .get("n")
            .and_then(bson_util::get_u64)
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: "server did not return a count".to_string(),
                }
                .into()
            })
    }

    /// Estimates the number of documents from collection metadata.
    pub async fn estimated_document_count(
        &self,
        options: impl Into<Option<EstimatedDocumentCountOptions>>,
    ) -> Result<u64> {
        let mut options = options.into().unwrap_or_default();
        self.apply_read_defaults(&mut options.read_concern, &mut options.selection_criteria);
        let op = Count::new(self.ns.clone(), Some(options));
        self.client.execute_operation(op, None).await
    }

    /// The distinct values of `field_name` across the documents matching
    /// `filter`.
    pub async fn distinct(
        &self,
        field_name: impl AsRef<str>,
        filter: Option<Document>,
        options: impl Into<Option<DistinctOptions>>,
    ) -> Result<Vec<Bson>> {
        let mut options = options.into().unwrap_or_default();
        self.apply_read_defaults(&mut options.read_concern, &mut options.selection_criteria);
        let op = Distinct::new(self.ns.clone(), field_name.as_ref(), filter, Some(options));
        self.client.execute_operation(op, None).await
    }

    /// Runs an aggregation pipeline over the collection.
    pub async fn aggregate(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<AggregateOptions>>,
    ) -> Result<Cursor<Document>> {
        let mut options = options.into().unwrap_or_default();
        self.apply_read_defaults(&mut options.read_concern, &mut options.selection_criteria);
        let op = Aggregate::new(
            AggregateTarget::Collection(self.ns.clone()),
            pipeline,
            Some(options),
        );
        self.client.execute_cursor_operation(op).await
    }

    /// Opens a change stream over this collection's change events.
    pub async fn watch(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
    ) -> Result<ChangeStream<ChangeStreamEvent>> {
        let args = WatchArgs {
            pipeline: pipeline.into_iter().collect(),
            target: AggregateTarget::Collection(self.ns.clone()),
            options: options.into(),
        };
        execute_watch(self.client.clone(), args, None, None).await
    }

    /// Lists the index specifications on this collection.
    pub async fn list_indexes(&self) -> Result<Cursor<Document>> {
        let op = ListIndexes::new(self.ns.clone(), None);
        self.client.execute_cursor_operation(op).await
    }

    /// Lists the names of the indexes on this collection.
    pub async fn list_index_names(&self) -> Result<Vec<String>> {
        let mut cursor = self.list_indexes().await?;
        let mut names = Vec::new();
        while let Some(spec) = cursor.try_next().await? {
            if let Ok(name) = spec.get_str("name") {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

impl<T> fmt::Display for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.ns)
    }
}

/// Converts a bulk write failure on a single-model write into the
/// corresponding single-write failure.
fn convert_bulk_errors(error: Error) -> Error {
    let labels = Some(error.labels().iter().cloned().collect::<Vec<_>>());
    match *error.kind {
        ErrorKind::BulkWrite(bulk_failure) => {
            if let Some(bulk_write_error) = bulk_failure.write_errors.into_iter().next() {
                let write_error = WriteError {
                    code: bulk_write_error.code,
                    code_name: bulk_write_error.code_name,
                    message: bulk_write_error.message,
                };
                Error::new(
                    ErrorKind::Write(WriteFailure::WriteError(write_error)),
                    labels,
                )
            } else if let Some(wc_error) = bulk_failure.write_concern_error {
                Error::new(
                    ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)),
                    labels,
                )
            } else {
                Error::new(
                    ErrorKind::Write(WriteFailure::WriteConcernError(WriteConcernError {
                        code: 0,
                        code_name: String::new(),
                        message: "bulk write failure with no write errors".to_string(),
                        labels: Vec::new(),
                    })),
                    labels,
                )
            }
        }
        _ => error,
    }
}
