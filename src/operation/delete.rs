use bson::{doc, Document};

use crate::{
    concern::WriteConcern,
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    error::Result,
    operation::{check_command_response, Operation, Retryability, WriteResponseBody},
    Namespace,
};

/// One entry of a `delete` command's `deletes` sequence.
#[derive(Clone, Debug)]
pub(crate) struct DeleteModel {
    pub(crate) filter: Document,
    pub(crate) multi: bool,
}

impl DeleteModel {
    fn to_document(&self) -> Document {
        doc! {
            "q": self.filter.clone(),
            "limit": if self.multi { 0 } else { 1 },
        }
    }
}

#[derive(Debug)]
pub(crate) struct Delete {
    ns: Namespace,
    deletes: Vec<DeleteModel>,
    ordered: bool,
    write_concern: Option<WriteConcern>,
}

impl Delete {
    pub(crate) fn new(
        ns: Namespace,
        deletes: Vec<DeleteModel>,
        ordered: bool,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            deletes,
            ordered,
            write_concern,
        }
    }
}

impl Operation for Delete {
    type O = WriteResponseBody;
    const NAME: &'static str = "delete";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "ordered": self.ordered,
        };
        if let Some(ref write_concern) = self.write_concern {
            if write_concern.is_some() {
                body.insert("writeConcern", write_concern.to_document());
            }
        }

        let mut command = Command::new(Self::NAME, self.ns.db.clone(), body);
        command.add_document_sequence(
            "deletes",
            self.deletes.iter().map(DeleteModel::to_document).collect(),
        );
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        response.body()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.deletes.iter().any(|delete| delete.multi) {
            Retryability::None
        } else {
            Retryability::Write
        }
    }
}
