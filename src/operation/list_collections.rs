use bson::{doc, Document};

use crate::{
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    cursor::CursorSpecification,
    error::Result,
    operation::{check_command_response, CursorBody, Operation, Retryability},
};

#[derive(Debug)]
pub(crate) struct ListCollections {
    db: String,
    filter: Option<Document>,
    name_only: bool,
}

impl ListCollections {
    pub(crate) fn new(db: impl Into<String>, filter: Option<Document>, name_only: bool) -> Self {
        Self {
            db: db.into(),
            filter,
            name_only,
        }
    }
}

impl Operation for ListCollections {
    type O = CursorSpecification;
    const NAME: &'static str = "listCollections";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
            "cursor": {},
        };
        if let Some(ref filter) = self.filter {
            body.insert("filter", filter.clone());
        }
        // Filtering on any non-name field requires full collection specs.
        let name_only = self.name_only
            && !self
                .filter
                .as_ref()
                .map(|f| f.keys().any(|k| k != "name"))
                .unwrap_or(false);
        body.insert("nameOnly", name_only);

        Ok(Command::new(Self::NAME, self.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        let body: CursorBody = response.body()?;
        CursorSpecification::new(body.cursor, response.source, None, None)
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
