use std::time::Duration;

use crate::{hello::HelloReply, sdam::ServerType};

/// The default maximum size of a BSON document a server will accept.
pub(crate) const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;

/// The default maximum size of a wire protocol message.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;

/// The default maximum number of writes a server accepts in one batch.
pub(crate) const DEFAULT_MAX_WRITE_BATCH_SIZE: i64 = 100_000;

/// Information about a server negotiated during the handshake on a particular
/// connection. This is a per-link snapshot: it never changes for the lifetime
/// of the connection, even as the server's monitored description evolves.
#[derive(Debug, Clone)]
pub(crate) struct StreamDescription {
    /// The type the server reported in the handshake.
    pub(crate) initial_server_type: ServerType,

    /// The minimum wire version the server supports.
    pub(crate) min_wire_version: i32,

    /// The maximum wire version the server supports.
    pub(crate) max_wire_version: i32,

    /// How long the server keeps an unused session alive.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The largest document body the server accepts.
    pub(crate) max_bson_object_size: i64,

    /// The largest framed message the server accepts.
    pub(crate) max_message_size_bytes: i32,

    /// The largest number of writes the server accepts in a single batch.
    pub(crate) max_write_batch_size: i64,

    /// Whether the server understands the non-legacy hello command.
    pub(crate) hello_ok: bool,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a hello reply.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            initial_server_type: response.server_type(),
            min_wire_version: response.min_wire_version.unwrap_or(0),
            max_wire_version: response.max_wire_version.unwrap_or(0),
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            max_bson_object_size: response
                .max_bson_object_size
                .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE),
            max_message_size_bytes: response
                .max_message_size_bytes
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            max_write_batch_size: response
                .max_write_batch_size
                .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE),
            hello_ok: response.hello_ok.unwrap_or(false),
        }
    }

    /// Whether the server supports the OP_MSG framing used for all
    /// post-handshake commands.
    pub(crate) fn supports_op_msg(&self) -> bool {
        self.max_wire_version >= 6
    }

    /// Whether the server supports logical sessions.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Whether writes through this connection may carry a transaction number.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.supports_sessions()
            && self.max_wire_version >= 6
            && self.initial_server_type != ServerType::Standalone
    }

    /// Gets a description of a stream for a 4.2+ server, for tests that do not
    /// involve a real handshake.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            initial_server_type: ServerType::RsPrimary,
            min_wire_version: 6,
            max_wire_version: 8,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
            hello_ok: false,
        }
    }
}
