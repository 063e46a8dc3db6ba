//! Options for opening a change stream.

use std::time::Duration;

use bson::Timestamp;
use typed_builder::TypedBuilder;

use super::event::ResumeToken;
use crate::selection_criteria::SelectionCriteria;

/// When a change stream populates the `full_document` field for update
/// events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum FullDocumentType {
    /// Update events include a point-in-time lookup of the current document.
    UpdateLookup,
}

impl FullDocumentType {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateLookup => "updateLookup",
        }
    }
}

/// Options passed to the `$changeStream` stage.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct ChangeStreamOptions {
    /// Whether update events should carry the current version of the changed
    /// document.
    pub full_document: Option<FullDocumentType>,

    /// Start the stream just after the event identified by this token.
    pub resume_after: Option<ResumeToken>,

    /// Start the stream just after the event identified by this token, also
    /// permitting resumption past an invalidate event.
    pub start_after: Option<ResumeToken>,

    /// Start the stream at the given cluster time.
    pub start_at_operation_time: Option<Timestamp>,

    /// How long the server may block an awaiting `getMore` when no events are
    /// ready.
    pub max_await_time: Option<Duration>,

    /// The number of events the server returns per batch.
    pub batch_size: Option<u32>,

    /// The selection criteria for the initial aggregate and any resumes.
    pub selection_criteria: Option<SelectionCriteria>,
}
