pub(crate) mod header;
pub(crate) mod message;
pub(crate) mod query;

use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) use self::{
    header::{Header, OpCode},
    message::{DocumentSequence, Message},
    query::{Query, Reply},
};

/// Closed over to avoid global mutable state: request ids only need to be
/// unique per process, not meaningful.
static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// A hard ceiling on the size of reply this driver will buffer, used before
/// the server's advertised maxMessageSizeBytes is known. Matches the server's
/// own 48MB limit plus framing headroom.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024 + 16 * 1024;
