//! Change streams: long-lived cursors over a deployment's change events, with
//! automatic single-shot resume on transient failures.

pub mod event;
pub mod options;

use std::{
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use bson::{Document, Timestamp};
use futures_core::{future::BoxFuture, Future, Stream};
use serde::de::DeserializeOwned;

use crate::{
    client::Client,
    cursor::Cursor,
    error::{ErrorKind, Result},
    operation::{AggregateTarget, ChangeStreamAggregate},
};

use self::{event::ResumeToken, options::ChangeStreamOptions};

/// Everything needed to re-issue the aggregate that created a change stream.
#[derive(Clone, Debug)]
pub(crate) struct WatchArgs {
    /// The pipeline of stages appended after the initial `$changeStream`
    /// stage.
    pub(crate) pipeline: Vec<Document>,

    /// The original target of the change stream.
    pub(crate) target: AggregateTarget,

    /// The options provided to the initial `$changeStream` stage.
    pub(crate) options: Option<ChangeStreamOptions>,
}

/// Dynamic state a change stream needs for resumption.
#[derive(Debug, Default)]
pub(crate) struct ChangeStreamData {
    /// The `operationTime` returned by the initial `aggregate`.
    #[allow(unused)]
    pub(crate) initial_operation_time: Option<Timestamp>,

    /// The cached resume token: the `_id` of the last observed change, or the
    /// post-batch token once a batch has been drained.
    pub(crate) resume_token: Option<ResumeToken>,

    /// Whether a resume is currently being attempted; a second consecutive
    /// failure surfaces to the caller.
    pub(crate) resume_attempted: bool,
}

/// A change stream: an aggregation cursor whose first stage is
/// `$changeStream`, wrapped with resume-token tracking and automatic resume.
///
/// On a resumable error, the driver re-issues the aggregate with
/// `resumeAfter` set to the last observed token (falling back to the caller's
/// original `startAfter`/`startAtOperationTime` when no event has been seen),
/// keeping the same session and options; only the cursor changes.
pub struct ChangeStream<T> {
    cursor: Cursor<Document>,
    args: WatchArgs,
    data: ChangeStreamData,
    pending_resume: Option<BoxFuture<'static, Result<ChangeStream<Document>>>>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> ChangeStream<T>
where
    T: DeserializeOwned + Unpin + Send + Sync,
{
    /// The cached resume token, suitable for resuming the stream later via
    /// the `resume_after` option.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.data.resume_token.clone()
    }

    /// Whether the change stream will continue to receive events.
    pub fn is_alive(&self) -> bool {
        !self.cursor.is_exhausted()
    }

    #[cfg(test)]
    pub(crate) fn set_kill_watcher(&mut self, tx: tokio::sync::oneshot::Sender<()>) {
        self.cursor.set_kill_watcher(tx);
    }
}

/// Opens (or re-opens, during a resume) a change stream. A resume passes the
/// original cursor's session back in, so only the cursor changes.
pub(crate) async fn execute_watch<T>(
    client: Client,
    args: WatchArgs,
    resume_token: Option<ResumeToken>,
    mut session: Option<crate::client::session::ClientSession>,
) -> Result<ChangeStream<T>>
where
    T: DeserializeOwned + Unpin + Send + Sync,
{
    let op = ChangeStreamAggregate::new(&args, resume_token.clone());
    let details = client
        .execute_operation_with_details(op, session.as_mut())
        .await?;
    let (spec, initial_operation_time) = details.output;
    let session = session.or(details.implicit_session);
    let cursor: Cursor<Document> = Cursor::new(client, spec, session);

    Ok(ChangeStream {
        cursor,
        args,
        data: ChangeStreamData {
            initial_operation_time,
            resume_token,
            resume_attempted: false,
        },
        pending_resume: None,
        _phantom: PhantomData,
    })
}

impl<T> Stream for ChangeStream<T>
where
    T: DeserializeOwned + Unpin + Send + Sync,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(mut pending) = this.pending_resume.take() {
                match pending.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.pending_resume = Some(pending);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(new_stream)) => {
                        this.cursor = new_stream.cursor;
                        this.args = new_stream.args;
                        this.data.resume_token = new_stream.data.resume_token;
                        // After a successful resume, another resume must be
                        // allowed.
                        this.data.resume_attempted = false;
                        continue;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                }
            }

            match Pin::new(&mut this.cursor).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(doc))) => {
                    let doc_token = match doc.get("_id") {
                        Some(id) => ResumeToken(id.clone()),
                        None => {
                            return Poll::Ready(Some(Err(ErrorKind::InvalidResponse {
                                message: "change document missing its resume token (_id)"
                                    .to_string(),
                            }
                            .into())))
                        }
                    };

                    // At the end of a batch the server's post-batch token
                    // covers everything seen so far; mid-batch, the
                    // document's own token does.
                    let token = if this.cursor.batch_is_empty() {
                        this.cursor
                            .post_batch_resume_token()
                            .map(|doc| ResumeToken::from_document(doc.clone()))
                            .unwrap_or(doc_token)
                    } else {
                        doc_token
                    };
                    this.data.resume_token = Some(token);

                    return Poll::Ready(Some(
                        bson::from_document::<T>(doc).map_err(Into::into),
                    ));
                }
                Poll::Ready(Some(Err(e)))
                    if e.is_resumable() && !this.data.resume_attempted =>
                {
                    this.data.resume_attempted = true;
                    let client = this.cursor.client().clone();
                    let args = this.args.clone();
                    let token = this.data.resume_token.clone();
                    let session = this.cursor.take_session();
                    this.pending_resume = Some(Box::pin(execute_watch::<Document>(
                        client, args, token, session,
                    )));
                    continue;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
            }
        }
    }
}

impl<T> std::fmt::Debug for ChangeStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("resume_token", &self.data.resume_token)
            .field("resume_attempted", &self.data.resume_attempted)
            .finish()
    }
}
