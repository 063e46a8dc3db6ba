use bson::{doc, Bson, Document, Timestamp};

use crate::{
    change_stream::{event::ResumeToken, WatchArgs},
    coll::options::AggregateOptions,
    concern::WriteConcern,
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    cursor::CursorSpecification,
    error::Result,
    operation::{check_command_response, CursorBody, Operation, Retryability},
    selection_criteria::SelectionCriteria,
    Namespace,
};

/// What an aggregation runs against: a collection or a whole database.
#[derive(Clone, Debug)]
pub(crate) enum AggregateTarget {
    Database(String),
    Collection(Namespace),
}

impl AggregateTarget {
    fn db_name(&self) -> &str {
        match self {
            AggregateTarget::Database(db) => db.as_str(),
            AggregateTarget::Collection(ns) => ns.db.as_str(),
        }
    }

    fn aggregate_value(&self) -> Bson {
        match self {
            // A database-level aggregation addresses the pseudo-collection 1.
            AggregateTarget::Database(_) => Bson::Int32(1),
            AggregateTarget::Collection(ns) => Bson::String(ns.coll.clone()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Aggregate {
    target: AggregateTarget,
    pipeline: Vec<Document>,
    options: Option<AggregateOptions>,
}

impl Aggregate {
    pub(crate) fn new(
        target: AggregateTarget,
        pipeline: impl IntoIterator<Item = Document>,
        options: Option<AggregateOptions>,
    ) -> Self {
        Self {
            target,
            pipeline: pipeline.into_iter().collect(),
            options,
        }
    }

    /// Whether the pipeline writes its output server-side. Such pipelines
    /// must run on a writable server and are not retryable reads.
    fn is_out_or_merge(&self) -> bool {
        self.pipeline.last().map_or(false, |stage| {
            matches!(
                crate::bson_util::first_key(stage),
                Some("$out") | Some("$merge")
            )
        })
    }
}

impl Operation for Aggregate {
    type O = CursorSpecification;
    const NAME: &'static str = "aggregate";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut cursor = Document::new();
        let mut body = doc! {
            Self::NAME: self.target.aggregate_value(),
            "pipeline": self.pipeline.clone(),
        };

        if let Some(ref options) = self.options {
            if let Some(batch_size) = options.batch_size {
                cursor.insert("batchSize", batch_size as i32);
            }
            if let Some(max_time) = options.max_time {
                body.insert("maxTimeMS", max_time.as_millis() as i64);
            }
            if let Some(ref read_concern) = options.read_concern {
                body.insert("readConcern", read_concern.to_document());
            }
            if self.is_out_or_merge() {
                if let Some(ref write_concern) = options.write_concern {
                    if write_concern.is_some() {
                        body.insert("writeConcern", write_concern.to_document());
                    }
                }
            }
        }
        body.insert("cursor", cursor);

        Ok(Command::new(
            Self::NAME,
            self.target.db_name().to_string(),
            body,
        ))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        let body: CursorBody = response.body()?;
        CursorSpecification::new(
            body.cursor,
            response.source,
            self.options.as_ref().and_then(|options| options.batch_size),
            None,
        )
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|options| options.selection_criteria.as_ref())
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        if self.is_out_or_merge() {
            self.options
                .as_ref()
                .and_then(|options| options.write_concern.as_ref())
        } else {
            None
        }
    }

    fn supports_read_concern(&self) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        // Aggregations with $out or $merge perform writes and are excluded
        // from read retry.
        if self.is_out_or_merge() {
            Retryability::None
        } else {
            Retryability::Read
        }
    }
}

/// The aggregation underlying a change stream: a `$changeStream` first stage
/// followed by the user's pipeline. On resume, the cached token is re-issued
/// as `resumeAfter` while everything else stays the same.
#[derive(Debug)]
pub(crate) struct ChangeStreamAggregate {
    inner: Aggregate,
    args: WatchArgs,
    resume_token: Option<ResumeToken>,
}

impl ChangeStreamAggregate {
    pub(crate) fn new(args: &WatchArgs, resume_token: Option<ResumeToken>) -> Self {
        let mut stage = Document::new();
        let options = args.options.as_ref();

        if let Some(full_document) = options.and_then(|o| o.full_document.as_ref()) {
            stage.insert("fullDocument", full_document.as_str());
        }

        match &resume_token {
            Some(token) => {
                stage.insert("resumeAfter", token.0.clone());
            }
            None => {
                if let Some(resume_after) = options.and_then(|o| o.resume_after.as_ref()) {
                    stage.insert("resumeAfter", resume_after.0.clone());
                } else if let Some(start_after) = options.and_then(|o| o.start_after.as_ref()) {
                    stage.insert("startAfter", start_after.0.clone());
                } else if let Some(start_at) = options.and_then(|o| o.start_at_operation_time) {
                    stage.insert("startAtOperationTime", Bson::Timestamp(start_at));
                }
            }
        }

        let mut pipeline = vec![doc! { "$changeStream": stage }];
        pipeline.extend(args.pipeline.iter().cloned());

        let inner = Aggregate::new(
            args.target.clone(),
            pipeline,
            options.map(|o| AggregateOptions {
                batch_size: o.batch_size,
                max_time: None,
                read_concern: None,
                selection_criteria: o.selection_criteria.clone(),
                write_concern: None,
            }),
        );

        Self {
            inner,
            args: args.clone(),
            resume_token,
        }
    }
}

impl Operation for ChangeStreamAggregate {
    type O = (CursorSpecification, Option<Timestamp>);
    const NAME: &'static str = "aggregate";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.inner.build(description)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        let operation_time = response.operation_time();
        let mut spec = self.inner.handle_response(response, description)?;
        spec.info.max_time = self
            .args
            .options
            .as_ref()
            .and_then(|o| o.max_await_time);
        Ok((spec, operation_time))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria()
    }

    fn supports_read_concern(&self) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
