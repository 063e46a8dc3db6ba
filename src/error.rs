//! Contains the `Error` and `Result` types that `mongolite` uses.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use bson::Bson;
use serde::Deserialize;
use thiserror::Error;

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];

// The retryable code tables have grown over server releases; they are keyed by
// the connection's max wire version so older deployments keep the set that was
// current for them.
const RETRYABLE_READ_CODES: [i32; 13] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 134, 262,
];
const RETRYABLE_WRITE_CODES: [i32; 13] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 64, 50, 9001, 262,
];
const RESUMABLE_CHANGE_STREAM_CODES: [i32; 17] = [
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436, 63, 150, 13388, 234, 133,
];

/// The label a server (or this driver, for older servers) attaches to an error
/// that is safe to retry as a write.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// The label attached to change-stream errors that are safe to resume from.
pub const RESUMABLE_CHANGE_STREAM_ERROR: &str = "ResumableChangeStreamError";

pub(crate) fn retryable_read_codes(_max_wire_version: Option<i32>) -> &'static [i32] {
    &RETRYABLE_READ_CODES
}

pub(crate) fn retryable_write_codes(_max_wire_version: Option<i32>) -> &'static [i32] {
    &RETRYABLE_WRITE_CODES
}

/// The result type for all fallible methods in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while using the driver. The inner [`ErrorKind`] is
/// boxed so that errors stay cheap to move, and the whole struct is cloneable
/// so that a single failure can be recorded in a `ServerDescription` and also
/// surfaced to the caller.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) wire_version: Option<i32>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        if let Some(wc) = kind.get_write_concern_error() {
            labels.extend(wc.labels.iter().cloned());
        }
        Self {
            kind: Box::new(kind),
            labels,
            wire_version: None,
            source: None,
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn authentication_error(message: impl Into<String>) -> Self {
        ErrorKind::Authentication {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Self {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    pub(crate) fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The labels attached to this error, by the server or by the driver.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    /// The server-reported error code, if this error originated from the
    /// server. Write error codes are ignored; write concern error codes are
    /// not, matching how topology state updates classify errors.
    pub fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            ErrorKind::BulkWrite(BulkWriteFailure {
                write_concern_error: Some(wc_error),
                ..
            }) => Some(wc_error.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)) => Some(wc_error.code),
            _ => None,
        }
        .or_else(|| self.source.as_ref().and_then(|s| s.sdam_code()))
    }

    /// The numeric code from this error, if any.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(e)) => Some(e.code),
            _ => self.sdam_code(),
        }
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    #[allow(unused)]
    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    #[allow(unused)]
    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    /// Whether an error originated from the server.
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Authentication { .. }
                | ErrorKind::BulkWrite(_)
                | ErrorKind::Command(_)
                | ErrorKind::Write(_)
        )
    }

    /// Whether a read operation should be retried if this error occurs.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => retryable_read_codes(self.wire_version).contains(&code),
            None => false,
        }
    }

    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether the driver should attach a "RetryableWriteError" label to this
    /// error. Servers at wire version 9+ (4.4+) attach the label themselves,
    /// so only network errors are labeled client-side there; for older
    /// servers the code table applies.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > 8 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => retryable_write_codes(Some(max_wire_version)).contains(&code),
            None => false,
        }
    }

    /// Whether this error corresponds to a "not writable primary" state change.
    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.sdam_code()
            .map(|code| NOTWRITABLEPRIMARY_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// Whether this error corresponds to a "node is recovering" state change.
    pub(crate) fn is_recovering(&self) -> bool {
        self.sdam_code()
            .map(|code| RECOVERING_CODES.contains(&code))
            .unwrap_or(false)
    }

    #[allow(unused)]
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.sdam_code()
            .map(|code| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    #[allow(unused)]
    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionPoolCleared { .. })
    }

    /// Whether the driver should discard the server's connection pool and mark
    /// the server Unknown in response to this error.
    pub(crate) fn requires_server_reset(&self) -> bool {
        self.is_network_error() || self.is_state_change_error()
    }

    /// Whether a cursor iteration failed because the server no longer knows
    /// the cursor (killed, timed out, or the session expired).
    pub(crate) fn is_cursor_not_found(&self) -> bool {
        matches!(self.sdam_code(), Some(43) | Some(237))
    }

    /// Whether a change stream may resume after this error.
    pub(crate) fn is_resumable(&self) -> bool {
        if !self.is_server_error() {
            return true;
        }
        let code = self.sdam_code();
        if code == Some(43) {
            return true;
        }
        if matches!(self.wire_version, Some(v) if v >= 9) {
            return self.contains_label(RESUMABLE_CHANGE_STREAM_ERROR);
        }
        match code {
            Some(code) => RESUMABLE_CHANGE_STREAM_CODES.contains(&code),
            None => false,
        }
    }

    #[allow(unused)]
    pub(crate) fn message(&self) -> Option<&str> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some(err.message.as_str()),
            ErrorKind::Write(WriteFailure::WriteError(ref err)) => Some(err.message.as_str()),
            ErrorKind::Write(WriteFailure::WriteConcernError(ref err)) => Some(err.message.as_str()),
            ErrorKind::Authentication { ref message }
            | ErrorKind::Internal { ref message }
            | ErrorKind::InvalidArgument { ref message }
            | ErrorKind::InvalidResponse { ref message }
            | ErrorKind::IncompatibleServer { ref message }
            | ErrorKind::ServerSelection { ref message }
            | ErrorKind::ConnectionPoolCleared { ref message } => Some(message.as_str()),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, None::<Option<String>>)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err)).into()
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        ErrorKind::Bson {
            message: err.to_string(),
        }
        .into()
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        ErrorKind::Bson {
            message: err.to_string(),
        }
        .into()
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided, including malformed connection
    /// strings and invalid option values.
    #[error("An invalid argument was provided: {message}")]
    InvalidArgument { message: String },

    /// The handshake with the server failed.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// An error occurred while serializing or deserializing BSON.
    #[error("BSON failure: {message}")]
    Bson { message: String },

    /// The server returned an error in response to a command.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// The connection pool for a server was cleared while this operation was
    /// waiting on it, due to a failure in another operation.
    #[error("{message}")]
    ConnectionPoolCleared { message: String },

    /// No server within the deployment supports the driver's wire version
    /// window.
    #[error("{message}")]
    IncompatibleServer { message: String },

    /// The driver reached an inconsistent internal state.
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// A network I/O failure; always potentially retryable.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server sent a malformed or truncated wire response.
    #[error("Invalid server response: {message}")]
    InvalidResponse { message: String },

    /// No server matching the selection criteria was found within the
    /// selection deadline.
    #[error("Server selection error: {message}")]
    ServerSelection { message: String },

    /// A session was provided for an operation against a deployment that does
    /// not support sessions.
    #[error("Attempted to use a session with a deployment that does not support sessions")]
    SessionsNotSupported,

    /// A single write operation failed.
    #[error("A write failure occurred: {0:?}")]
    Write(WriteFailure),

    /// One or more operations in a batched write failed.
    #[error("A bulk write failure occurred: {0:?}")]
    BulkWrite(BulkWriteFailure),
}

impl ErrorKind {
    pub(crate) fn get_write_concern_error(&self) -> Option<&WriteConcernError> {
        match self {
            ErrorKind::Write(WriteFailure::WriteConcernError(err)) => Some(err),
            ErrorKind::BulkWrite(BulkWriteFailure {
                write_concern_error,
                ..
            }) => write_concern_error.as_ref(),
            _ => None,
        }
    }
}

/// An error reported by the server in response to a command (`ok: 0`).
#[derive(Clone, Debug, Deserialize, Error)]
#[error("Error {code} ({code_name}): {message}")]
#[non_exhaustive]
pub struct CommandError {
    /// The numeric error code.
    pub code: i32,

    /// The symbolic name of the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// An error that occurred while applying a single write.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct WriteError {
    /// The numeric error code.
    pub code: i32,

    /// The symbolic name of the error code.
    #[serde(rename = "codeName")]
    pub code_name: Option<String>,

    /// A description of the error.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// An error that occurred while applying one write within a batch. The index
/// refers to the caller's original request list, not the split sub-batch.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// The index of the failed request.
    pub index: usize,

    /// The numeric error code.
    pub code: i32,

    /// The symbolic name of the error code.
    #[serde(rename = "codeName")]
    pub code_name: Option<String>,

    /// A description of the error.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// The server applied the write but could not satisfy the requested write
/// concern.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// The numeric error code.
    pub code: i32,

    /// The symbolic name of the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// Labels attached by the server.
    #[serde(rename = "errorLabels", default)]
    pub labels: Vec<String>,
}

/// The distinct failure shapes of a single-document write.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteFailure {
    /// The write concern was not satisfied.
    WriteConcernError(WriteConcernError),

    /// The write itself failed.
    WriteError(WriteError),
}

/// The aggregate failure of a batched write. Partial results are preserved so
/// unordered bulk writes can report everything that did succeed.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// The per-request errors, indexed against the caller's request list.
    pub write_errors: Vec<BulkWriteError>,

    /// A write concern error, if one occurred.
    pub write_concern_error: Option<WriteConcernError>,

    /// The ids of successfully inserted documents, keyed by request index.
    pub inserted_ids: HashMap<usize, Bson>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: String::new(),
        })
        .into()
    }

    #[test]
    fn network_errors_are_always_read_retryable() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(err.is_network_error());
        assert!(err.is_read_retryable());
        assert!(!err.is_write_retryable());
    }

    #[test]
    fn retryable_write_label_depends_on_wire_version() {
        // Pre-4.4 servers do not attach the label; the driver must, based on
        // the code table.
        let not_primary = command_error(10107);
        assert!(not_primary.should_add_retryable_write_label(8));
        assert!(!not_primary.should_add_retryable_write_label(9));

        let network: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(network.should_add_retryable_write_label(9));
    }

    #[test]
    fn state_change_classification() {
        assert!(command_error(10107).is_notwritableprimary());
        assert!(command_error(11600).is_recovering());
        assert!(command_error(11600).is_shutting_down());
        assert!(!command_error(8000).is_state_change_error());
        assert!(command_error(189).requires_server_reset());
    }

    #[test]
    fn cursor_not_found_is_resumable() {
        let mut err = command_error(43);
        err.wire_version = Some(9);
        assert!(err.is_cursor_not_found());
        assert!(err.is_resumable());

        // An arbitrary server error on a 4.4+ server without the label is not.
        let mut other = command_error(8000);
        other.wire_version = Some(9);
        assert!(!other.is_resumable());
    }

    #[test]
    fn labels_from_server_are_preserved() {
        let err = Error::new(
            ErrorKind::Command(CommandError {
                code: 112,
                code_name: "WriteConflict".to_string(),
                message: "conflict".to_string(),
            }),
            Some(vec![RETRYABLE_WRITE_ERROR.to_string()]),
        );
        assert!(err.contains_label(RETRYABLE_WRITE_ERROR));
        assert!(err.is_write_retryable());
    }
}
