use bson::doc;

use crate::{
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    cursor::CursorInformation,
    error::Result,
    operation::{check_command_response, CursorBody, Operation},
    results::GetMoreResult,
    selection_criteria::SelectionCriteria,
};

/// Fetches the next batch from a server-side cursor. Always targeted, via an
/// address predicate, at the server that owns the cursor.
#[derive(Debug)]
pub(crate) struct GetMore {
    info: CursorInformation,
    selection_criteria: SelectionCriteria,
}

impl GetMore {
    pub(crate) fn new(info: CursorInformation) -> Self {
        let selection_criteria = SelectionCriteria::from_address(info.address.clone());
        Self {
            info,
            selection_criteria,
        }
    }
}

impl Operation for GetMore {
    type O = GetMoreResult;
    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.info.id,
            "collection": self.info.ns.coll.clone(),
        };

        if let Some(batch_size) = self.info.batch_size {
            if batch_size > 0 {
                body.insert("batchSize", batch_size as i32);
            }
        }

        // For awaitData cursors this is how long the server may block waiting
        // for new results.
        if let Some(max_time) = self.info.max_time {
            body.insert("maxTimeMS", max_time.as_millis() as i64);
        }

        Ok(Command::new(Self::NAME, self.info.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        let body: CursorBody = response.body()?;

        Ok(GetMoreResult {
            batch: body.cursor.next_batch.unwrap_or_default(),
            exhausted: body.cursor.id == 0,
            post_batch_resume_token: body.cursor.post_batch_resume_token,
        })
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }
}
