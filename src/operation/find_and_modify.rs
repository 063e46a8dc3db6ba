use bson::{doc, Document};
use serde::Deserialize;

use crate::{
    coll::options::ReturnDocument,
    concern::WriteConcern,
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    error::Result,
    operation::{check_command_response, Operation, Retryability},
    Namespace,
};

/// The modification a `findAndModify` applies to the matched document.
#[derive(Clone, Debug)]
pub(crate) enum Modification {
    Delete,
    Update {
        update: Document,
        upsert: Option<bool>,
        return_document: Option<ReturnDocument>,
    },
    Replace {
        replacement: Document,
        upsert: Option<bool>,
        return_document: Option<ReturnDocument>,
    },
}

/// Options shared by the findAndModify family of operations.
#[derive(Clone, Debug, Default)]
pub(crate) struct FindAndModifyCommonOptions {
    pub(crate) sort: Option<Document>,
    pub(crate) projection: Option<Document>,
    pub(crate) max_time: Option<std::time::Duration>,
    pub(crate) write_concern: Option<WriteConcern>,
}

#[derive(Debug)]
pub(crate) struct FindAndModify {
    ns: Namespace,
    query: Document,
    modification: Modification,
    options: FindAndModifyCommonOptions,
}

impl FindAndModify {
    pub(crate) fn new(
        ns: Namespace,
        query: Document,
        modification: Modification,
        options: FindAndModifyCommonOptions,
    ) -> Self {
        Self {
            ns,
            query,
            modification,
            options,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FindAndModifyBody {
    value: Option<Document>,
}

impl Operation for FindAndModify {
    type O = Option<Document>;
    const NAME: &'static str = "findAndModify";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "query": self.query.clone(),
        };

        match &self.modification {
            Modification::Delete => {
                body.insert("remove", true);
            }
            Modification::Update {
                update,
                upsert,
                return_document,
            } => {
                body.insert("update", update.clone());
                if let Some(upsert) = upsert {
                    body.insert("upsert", *upsert);
                }
                body.insert(
                    "new",
                    matches!(return_document, Some(ReturnDocument::After)),
                );
            }
            Modification::Replace {
                replacement,
                upsert,
                return_document,
            } => {
                body.insert("update", replacement.clone());
                if let Some(upsert) = upsert {
                    body.insert("upsert", *upsert);
                }
                body.insert(
                    "new",
                    matches!(return_document, Some(ReturnDocument::After)),
                );
            }
        }

        if let Some(ref sort) = self.options.sort {
            body.insert("sort", sort.clone());
        }
        if let Some(ref projection) = self.options.projection {
            body.insert("fields", projection.clone());
        }
        if let Some(max_time) = self.options.max_time {
            body.insert("maxTimeMS", max_time.as_millis() as i64);
        }
        if let Some(ref write_concern) = self.options.write_concern {
            if write_concern.is_some() {
                body.insert("writeConcern", write_concern.to_document());
            }
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        let body: FindAndModifyBody = response.body()?;
        Ok(body.value)
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
