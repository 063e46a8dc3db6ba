use bson::{doc, Document};
use serde::Deserialize;

use crate::{
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    error::Result,
    operation::{check_command_response, Operation, Retryability},
    results::DatabaseSpecification,
};

#[derive(Debug)]
pub(crate) struct ListDatabases {
    filter: Option<Document>,
    name_only: bool,
}

impl ListDatabases {
    pub(crate) fn new(filter: Option<Document>, name_only: bool) -> Self {
        Self { filter, name_only }
    }
}

#[derive(Debug, Deserialize)]
struct ListDatabasesBody {
    databases: Vec<DatabaseSpecification>,
}

impl Operation for ListDatabases {
    type O = Vec<DatabaseSpecification>;
    const NAME: &'static str = "listDatabases";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
            "nameOnly": self.name_only,
        };
        if let Some(ref filter) = self.filter {
            body.insert("filter", filter.clone());
        }

        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        let body: ListDatabasesBody = response.body()?;
        Ok(body.databases)
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
