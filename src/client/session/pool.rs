use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;

use super::ServerSession;

/// A FIFO pool of server sessions. Sessions that are within one minute of the
/// deployment's logical session timeout are discarded at both check-out and
/// check-in, so a session handed out always has time left to be used.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Checks out a server session from the pool, skipping past any sessions
    /// that are about to expire. If no pooled session is usable, a new one is
    /// created.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks in a server session. Dirty and about-to-expire sessions are
    /// discarded; expired sessions at the back of the queue are dropped too.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;
        while let Some(pooled_session) = pool.pop_back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            pool.push_back(pooled_session);
            break;
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &bson::Document) -> bool {
        self.pool.lock().await.iter().any(|s| &s.id == id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn sessions_are_reused_fifo() {
        let pool = ServerSessionPool::new();
        let timeout = Some(Duration::from_secs(30 * 60));

        let first = pool.check_out(timeout).await;
        let first_id = first.id.clone();
        pool.check_in(first, timeout).await;

        let second = pool.check_out(timeout).await;
        assert_eq!(second.id, first_id);
    }

    #[tokio::test]
    async fn dirty_sessions_are_not_pooled() {
        let pool = ServerSessionPool::new();
        let timeout = Some(Duration::from_secs(30 * 60));

        let mut session = pool.check_out(timeout).await;
        session.dirty = true;
        let id = session.id.clone();
        pool.check_in(session, timeout).await;

        assert!(!pool.contains(&id).await);
    }

    #[tokio::test]
    async fn expiring_sessions_are_discarded_at_check_in() {
        let pool = ServerSessionPool::new();

        let session = pool.check_out(Some(Duration::from_secs(30 * 60))).await;
        let id = session.id.clone();
        // A 30s timeout means the session is already within the one-minute
        // expiration window.
        pool.check_in(session, Some(Duration::from_secs(30))).await;
        assert!(!pool.contains(&id).await);
    }
}
