use bson::Document;

use crate::{
    bson_util,
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    error::{Error, Result},
    operation::{check_command_response, Operation, SESSIONS_UNSUPPORTED_COMMANDS},
    selection_criteria::SelectionCriteria,
};

/// Runs a caller-supplied command document verbatim. No retry classification
/// is applied: the driver cannot know whether an arbitrary command is safe to
/// re-send.
#[derive(Debug)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        db: impl Into<String>,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if bson_util::first_key(&command).is_none() {
            return Err(Error::invalid_argument(
                "an empty document cannot be passed to a run_command operation",
            ));
        }
        Ok(Self {
            db: db.into(),
            command,
            selection_criteria,
        })
    }

    fn command_name(&self) -> &str {
        // Validated non-empty at construction.
        bson_util::first_key(&self.command).unwrap_or_default()
    }
}

impl Operation for RunCommand {
    type O = Document;
    const NAME: &'static str = "runCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.command_name().to_string(),
            self.db.clone(),
            self.command.clone(),
        ))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        Ok(response.raw_body().clone())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_sessions(&self) -> bool {
        !SESSIONS_UNSUPPORTED_COMMANDS.contains(self.command_name().to_lowercase().as_str())
    }
}
