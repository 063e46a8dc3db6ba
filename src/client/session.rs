mod cluster_time;
pub(crate) mod pool;

use std::time::{Duration, Instant};

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp};
use rand::Rng;

use crate::{client::Client, runtime};

pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

/// Session-level options.
#[derive(Clone, Debug, Default, typed_builder::TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// Whether reads on this session should be causally ordered after earlier
    /// operations on the session. Defaults to true for explicit sessions.
    pub causal_consistency: Option<bool>,
}

/// A logical session, binding a sequence of operations so the server can
/// associate them for retryable writes and causal consistency.
///
/// A `ClientSession` can only be used with the client that created it, and is
/// single-threaded: the `&mut` receivers on every operation enforce that two
/// operations never share it concurrently.
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: Option<ServerSession>,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    pub(crate) operation_time: Option<Timestamp>,
}

impl ClientSession {
    pub(crate) fn new(
        server_session: ServerSession,
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        Self {
            cluster_time: None,
            server_session: Some(server_session),
            client,
            is_implicit,
            options,
            operation_time: None,
        }
    }

    /// The client used to create this session.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The id document of this session.
    pub fn id(&self) -> &Document {
        &self.server_session().id
    }

    /// Whether this session was created implicitly by the driver rather than
    /// explicitly by the user.
    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// The highest cluster time this session has seen so far, if any.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The operation time returned by the last operation executed in this
    /// session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Set the cluster time to the provided one if it is greater than this
    /// session's highest seen cluster time or if this session's cluster time
    /// is `None`.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Advance operation time for this session. If the provided timestamp is
    /// earlier than this session's current operation time, it is ignored.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        self.operation_time = match self.operation_time {
            Some(current) if current >= ts => Some(current),
            _ => Some(ts),
        };
    }

    /// Whether reads on this session are causally consistent. Defaults to true
    /// for explicit sessions and false for implicit ones.
    pub(crate) fn causal_consistency(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|opts| opts.causal_consistency)
            .unwrap_or(!self.is_implicit)
    }

    /// Marks the underlying server session dirty; dirty sessions are discarded
    /// rather than pooled.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session_mut().dirty = true;
    }

    pub(crate) fn update_last_use(&mut self) {
        self.server_session_mut().last_use = Instant::now();
    }

    /// Increments the transaction number and returns the new value. Numbers
    /// are never reused: each retryable logical write gets a fresh one, and
    /// the retry of a write reuses the number allocated for its first attempt.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        let server_session = self.server_session_mut();
        server_session.txn_number += 1;
        server_session.txn_number
    }

    fn server_session(&self) -> &ServerSession {
        // The Option is only vacated during drop.
        self.server_session.as_ref().unwrap()
    }

    fn server_session_mut(&mut self) -> &mut ServerSession {
        self.server_session.as_mut().unwrap()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(server_session) = self.server_session.take() {
            let client = self.client.clone();
            runtime::spawn(async move {
                client.check_in_server_session(server_session).await;
            });
        }
    }
}

/// Client-side abstraction of a server session. These are pooled and may be
/// associated with multiple `ClientSession`s over the course of their
/// lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    pub(crate) last_use: Instant,

    /// Whether a network error was encountered while using this session.
    pub(crate) dirty: bool,

    /// A monotonically increasing transaction number for this session.
    pub(crate) txn_number: i64,
}

impl ServerSession {
    /// Creates a new session with a client-side generated 16-byte random id.
    pub(crate) fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes[..]);
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: bytes.to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Whether this server session will expire within the next minute, given
    /// the deployment's advertised timeout.
    pub(crate) fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(timeout) => timeout,
            None => return false,
        };
        let expiration = self.last_use + timeout;
        expiration < Instant::now() + Duration::from_secs(60)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn session_ids_are_unique_uuids() {
        let a = ServerSession::new();
        let b = ServerSession::new();
        assert_ne!(a.id, b.id);

        let binary = match a.id.get("id") {
            Some(Bson::Binary(b)) => b,
            other => panic!("expected binary session id, got {:?}", other),
        };
        assert_eq!(binary.subtype, BinarySubtype::Uuid);
        assert_eq!(binary.bytes.len(), 16);
    }

    #[test]
    fn txn_numbers_are_strictly_increasing() {
        let mut session = ServerSession::new();
        session.txn_number += 1;
        let first = session.txn_number;
        session.txn_number += 1;
        assert!(session.txn_number > first);
    }

    #[test]
    fn expiration_window() {
        let mut session = ServerSession::new();
        assert!(!session.is_about_to_expire(None));
        assert!(session.is_about_to_expire(Some(Duration::from_secs(30))));

        session.last_use = Instant::now();
        assert!(!session.is_about_to_expire(Some(Duration::from_secs(30 * 60))));
    }
}
