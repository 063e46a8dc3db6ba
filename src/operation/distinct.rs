use bson::{doc, Bson, Document};
use serde::Deserialize;

use crate::{
    coll::options::DistinctOptions,
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    error::Result,
    operation::{check_command_response, Operation, Retryability},
    selection_criteria::SelectionCriteria,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Distinct {
    ns: Namespace,
    field_name: String,
    filter: Option<Document>,
    options: Option<DistinctOptions>,
}

impl Distinct {
    pub(crate) fn new(
        ns: Namespace,
        field_name: impl Into<String>,
        filter: Option<Document>,
        options: Option<DistinctOptions>,
    ) -> Self {
        Self {
            ns,
            field_name: field_name.into(),
            filter,
            options,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DistinctBody {
    values: Vec<Bson>,
}

impl Operation for Distinct {
    type O = Vec<Bson>;
    const NAME: &'static str = "distinct";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "key": self.field_name.clone(),
        };
        if let Some(ref filter) = self.filter {
            body.insert("query", filter.clone());
        }
        if let Some(ref options) = self.options {
            if let Some(max_time) = options.max_time {
                body.insert("maxTimeMS", max_time.as_millis() as i64);
            }
            if let Some(ref read_concern) = options.read_concern {
                body.insert("readConcern", read_concern.to_document());
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
        let body: DistinctBody = response.body()?;
        Ok(body.values)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|options| options.selection_criteria.as_ref())
    }

    fn supports_read_concern(&self) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
