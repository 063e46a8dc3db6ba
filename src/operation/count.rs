use bson::doc;
use serde::Deserialize;

use crate::{
    coll::options::EstimatedDocumentCountOptions,
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    error::Result,
    operation::{check_command_response, Operation, Retryability},
    selection_criteria::SelectionCriteria,
    Namespace,
};

/// The `count` command, used for estimated (collection-metadata based)
/// counts. Filtered counts go through an aggregation instead.
#[derive(Debug)]
pub(crate) struct Count {
    ns: Namespace,
    options: Option<EstimatedDocumentCountOptions>,
}

impl Count {
    pub(crate) fn new(ns: Namespace, options: Option<EstimatedDocumentCountOptions>) -> Self {
        Self { ns, options }
    }
}

#[derive(Debug, Deserialize)]
struct CountBody {
    n: u64,
}

impl Operation for Count {
    type O = u64;
    const NAME: &'static str = "count";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! { Self::NAME: self.ns.coll.clone() };

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
        let body: CountBody = response.body()?;
        Ok(body.n)
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
