use std::{
    collections::VecDeque,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bson::Document;
use futures_core::{future::BoxFuture, Future, Stream};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::{
    client::{session::ClientSession, Client},
    error::Result,
    operation::{CursorInfo, GetMore, KillCursors},
    options::ServerAddress,
    results::GetMoreResult,
    runtime,
    Namespace,
};

/// Specification used to create a new cursor, extracted from a cursor-bearing
/// command reply.
#[derive(Debug)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInformation,
    pub(crate) initial_buffer: VecDeque<Document>,
    pub(crate) post_batch_resume_token: Option<Document>,
}

impl CursorSpecification {
    pub(crate) fn new(
        info: CursorInfo,
        address: ServerAddress,
        batch_size: Option<u32>,
        max_time: Option<Duration>,
    ) -> Result<Self> {
        let ns: Namespace = info.ns.parse()?;
        let initial_buffer = info
            .first_batch
            .or(info.next_batch)
            .unwrap_or_default()
            .into();

        Ok(Self {
            info: CursorInformation {
                ns,
                id: info.id,
                address,
                batch_size,
                max_time,
                limit: None,
            },
            initial_buffer,
            post_batch_resume_token: info.post_batch_resume_token,
        })
    }

    pub(crate) fn with_limit(mut self, limit: Option<i64>) -> Self {
        self.info.limit = limit.filter(|limit| *limit > 0);
        self
    }

    pub(crate) fn id(&self) -> i64 {
        self.info.id
    }
}

/// Static information about a cursor: everything a `getMore` needs.
#[derive(Clone, Debug)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,
    pub(crate) address: ServerAddress,
    pub(crate) id: i64,
    pub(crate) batch_size: Option<u32>,

    /// For awaitData cursors, how long the server may block each getMore.
    pub(crate) max_time: Option<Duration>,

    /// A client-side cap on the total number of documents yielded.
    pub(crate) limit: Option<i64>,
}

/// A cursor over the results of a server-side query, implementing
/// [`futures_core::Stream`].
///
/// When the local batch empties and the server-side cursor is still open, the
/// next poll issues a `getMore` against the server that owns the cursor, on
/// the same session that created it. Dropping a cursor whose server-side half
/// is still alive fires a `killCursors` without waiting for it.
pub struct Cursor<T> {
    client: Client,
    info: CursorInformation,
    buffer: VecDeque<Document>,
    exhausted: bool,
    post_batch_resume_token: Option<Document>,
    yielded: i64,
    session: Option<ClientSession>,
    #[allow(clippy::type_complexity)]
    pending: Option<BoxFuture<'static, (Result<GetMoreResult>, Option<ClientSession>)>>,
    #[cfg(test)]
    kill_watcher: Option<oneshot::Sender<()>>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Cursor<T> {
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        session: Option<ClientSession>,
    ) -> Self {
        let exhausted = spec.id() == 0;
        Self {
            client,
            info: spec.info,
            buffer: spec.initial_buffer,
            exhausted,
            post_batch_resume_token: spec.post_batch_resume_token,
            yielded: 0,
            session,
            pending: None,
            #[cfg(test)]
            kill_watcher: None,
            _phantom: PhantomData,
        }
    }

    /// Whether the server-side cursor has been closed and the local buffer
    /// drained.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn post_batch_resume_token(&self) -> Option<&Document> {
        self.post_batch_resume_token.as_ref()
    }

    /// Whether the most recently yielded document was the last of its batch.
    pub(crate) fn batch_is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Takes the session out of this cursor, e.g. to hand it to the cursor
    /// that replaces this one across a change stream resume.
    pub(crate) fn take_session(&mut self) -> Option<ClientSession> {
        self.session.take()
    }

    /// Registers a channel that is signaled once the `killCursors` triggered
    /// by dropping this cursor has completed.
    #[cfg(test)]
    pub(crate) fn set_kill_watcher(&mut self, tx: oneshot::Sender<()>) {
        self.kill_watcher = Some(tx);
    }

    fn limit_reached(&self) -> bool {
        matches!(self.info.limit, Some(limit) if self.yielded >= limit)
    }

    fn start_get_more(&mut self) {
        let client = self.client.clone();
        let info = self.info.clone();
        let mut session = self.session.take();
        self.pending = Some(Box::pin(async move {
            let result = client
                .execute_operation(GetMore::new(info), session.as_mut())
                .await;
            (result, session)
        }));
    }
}

impl<T> Stream for Cursor<T>
where
    T: DeserializeOwned + Unpin,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(mut pending) = this.pending.take() {
                match pending.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.pending = Some(pending);
                        return Poll::Pending;
                    }
                    Poll::Ready((result, session)) => {
                        this.session = session;
                        match result {
                            Ok(get_more) => {
                                this.exhausted = get_more.exhausted;
                                if get_more.post_batch_resume_token.is_some() {
                                    this.post_batch_resume_token =
                                        get_more.post_batch_resume_token;
                                }
                                this.buffer = get_more.batch.into();
                            }
                            Err(e) => {
                                // A cursor the server no longer knows about
                                // needs no killCursors on drop.
                                if e.is_cursor_not_found() {
                                    this.exhausted = true;
                                }
                                return Poll::Ready(Some(Err(e)));
                            }
                        }
                    }
                }
            }

            if this.limit_reached() {
                return Poll::Ready(None);
            }

            match this.buffer.pop_front() {
                Some(doc) => {
                    this.yielded += 1;
                    return Poll::Ready(Some(
                        bson::from_document::<T>(doc).map_err(Into::into),
                    ));
                }
                None if !this.exhausted => this.start_get_more(),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        if self.exhausted || self.info.id == 0 {
            return;
        }

        #[cfg(test)]
        let kill_watcher = self.kill_watcher.take();
        #[cfg(not(test))]
        let kill_watcher = None;

        kill_cursor(
            self.client.clone(),
            self.info.ns.clone(),
            self.info.id,
            self.info.address.clone(),
            self.session.take(),
            kill_watcher,
        );
    }
}

/// Spawns a fire-and-forget `killCursors` so the server can reclaim the
/// cursor's resources. The caller does not wait; the session handle (if any)
/// is held only until the kill completes.
pub(crate) fn kill_cursor(
    client: Client,
    ns: Namespace,
    cursor_id: i64,
    address: ServerAddress,
    session: Option<ClientSession>,
    kill_watcher: Option<oneshot::Sender<()>>,
) {
    runtime::spawn(async move {
        let op = KillCursors::new(ns, cursor_id, address);
        let _ = client.execute_operation(op, None).await;
        drop(session);
        if let Some(tx) = kill_watcher {
            let _ = tx.send(());
        }
    });
}
