use bson::doc;

use crate::{
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    cursor::CursorSpecification,
    error::Result,
    operation::{check_command_response, CursorBody, Operation, Retryability},
    Namespace,
};

#[derive(Debug)]
pub(crate) struct ListIndexes {
    ns: Namespace,
    batch_size: Option<u32>,
}

impl ListIndexes {
    pub(crate) fn new(ns: Namespace, batch_size: Option<u32>) -> Self {
        Self { ns, batch_size }
    }
}

impl Operation for ListIndexes {
    type O = CursorSpecification;
    const NAME: &'static str = "listIndexes";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut cursor = doc! {};
        if let Some(batch_size) = self.batch_size {
            cursor.insert("batchSize", batch_size as i32);
        }
        let body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "cursor": cursor,
        };
        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        let body: CursorBody = response.body()?;
        CursorSpecification::new(body.cursor, response.source, self.batch_size, None)
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
