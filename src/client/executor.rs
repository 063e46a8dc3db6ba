use tracing::debug;

use super::{session::ClientSession, Client};
use crate::{
    conn::pool::PooledConnection,
    cursor::{Cursor, CursorSpecification},
    error::{Error, ErrorKind, Result, RETRYABLE_WRITE_ERROR},
    operation::{Operation, Retryability},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// Bookkeeping for a retry in flight: the transaction number allocated for
/// the first attempt (reused verbatim on the retry) and the error that
/// triggered it.
#[derive(Debug)]
struct ExecutionRetry {
    prior_txn_number: Option<i64>,
    first_error: Error,
}

/// The output of an operation along with the implicit session that was used
/// for it, so cursors can keep the session alive for their `getMore`s.
pub(crate) struct ExecutionDetails<T: Operation> {
    pub(crate) output: T::O,
    pub(crate) implicit_session: Option<ClientSession>,
}

impl Client {
    /// Executes the given operation: selects a server per the operation's
    /// intent, checks out an exclusive connection, injects session and cluster
    /// time state, and retries once on transient failures when the operation's
    /// retry class allows it.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        op: T,
        session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        self.execute_operation_with_details(op, session)
            .await
            .map(|details| details.output)
    }

    /// Executes a cursor-producing operation, wrapping the resulting
    /// specification (and the implicit session, if one was used) in a
    /// [`Cursor`].
    pub(crate) async fn execute_cursor_operation<Op, T>(&self, op: Op) -> Result<Cursor<T>>
    where
        Op: Operation<O = CursorSpecification>,
        T: serde::de::DeserializeOwned + Unpin + Send + Sync,
    {
        let details = self.execute_operation_with_details(op, None).await?;
        Ok(Cursor::new(
            self.clone(),
            details.output,
            details.implicit_session,
        ))
    }

    pub(crate) async fn execute_operation_with_details<T: Operation>(
        &self,
        mut op: T,
        mut explicit_session: Option<&mut ClientSession>,
    ) -> Result<ExecutionDetails<T>> {
        if let Some(write_concern) = op.write_concern() {
            write_concern.validate()?;
        }

        let default_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let mut implicit_session: Option<ClientSession> = None;
        let mut retry: Option<ExecutionRetry> = None;

        loop {
            if retry.is_some() {
                op.update_for_retry();
            }

            let criteria = op.selection_criteria().unwrap_or(&default_criteria);

            let (server, _server_description) =
                match self.inner.topology.select_server(criteria).await {
                    Ok(result) => result,
                    Err(err) => {
                        if let Some(r) = retry {
                            return Err(r.first_error.with_source(err));
                        }
                        return Err(err);
                    }
                };

            let mut conn = match server.pool.check_out().await {
                Ok(conn) => conn,
                Err(mut err) => {
                    self.inner
                        .topology
                        .handle_application_error(&server.address, &err);
                    if let Some(r) = retry {
                        return Err(r.first_error.with_source(err));
                    }
                    let can_retry = match op.retryability() {
                        Retryability::Read if self.retry_reads() => err.is_read_retryable(),
                        Retryability::Write if self.retry_writes() => {
                            if err.is_read_retryable() {
                                err.add_label(RETRYABLE_WRITE_ERROR);
                            }
                            err.is_write_retryable()
                        }
                        _ => false,
                    };
                    if can_retry {
                        debug!(error = %err, "retrying after connection checkout failure");
                        retry = Some(ExecutionRetry {
                            prior_txn_number: None,
                            first_error: err,
                        });
                        continue;
                    }
                    return Err(err);
                }
            };

            if !conn.supports_sessions() {
                if let Some(ref s) = explicit_session {
                    if !s.is_implicit() {
                        return Err(ErrorKind::SessionsNotSupported.into());
                    }
                }
            }

            let sessions_eligible =
                op.supports_sessions() && op.is_acknowledged() && conn.supports_sessions();

            // An acknowledged, session-supporting operation with no explicit
            // session implicitly checks one out for its duration.
            if explicit_session.is_none() && implicit_session.is_none() && sessions_eligible {
                implicit_session = Some(self.start_session_internal(None, true).await);
            }

            let mut session: Option<&mut ClientSession> = if sessions_eligible {
                explicit_session.as_deref_mut().or(implicit_session.as_mut())
            } else {
                if let Some(ref s) = explicit_session {
                    if !s.is_implicit() && (!op.supports_sessions() || !op.is_acknowledged()) {
                        return Err(Error::invalid_argument(format!(
                            "{} cannot be executed with a session",
                            op.name()
                        )));
                    }
                }
                None
            };

            let retryability = self.get_retryability(&conn, &op, session.is_some())?;

            // The same transaction number is reused on the retry of a write.
            let txn_number = retry.as_ref().and_then(|r| r.prior_txn_number).or_else(|| {
                if retryability == Retryability::Write {
                    session.as_mut().map(|s| s.get_and_increment_txn_number())
                } else {
                    None
                }
            });

            match self
                .execute_operation_on_connection(&mut op, &mut conn, &mut session, txn_number)
                .await
            {
                Ok(output) => {
                    drop(session);
                    return Ok(ExecutionDetails {
                        output,
                        implicit_session,
                    });
                }
                Err(mut err) => {
                    let max_wire_version = conn
                        .stream_description()
                        .ok()
                        .map(|sd| sd.max_wire_version);
                    err.wire_version = max_wire_version;

                    if err.is_network_error() {
                        if let Some(ref mut s) = session {
                            s.mark_dirty();
                        }
                    }

                    // Servers too old to label retryable write errors get the
                    // label attached client-side from the code table.
                    if retryability == Retryability::Write
                        && self.retry_writes()
                        && err.should_add_retryable_write_label(max_wire_version.unwrap_or(0))
                    {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    self.inner
                        .topology
                        .handle_application_error(&conn.address, &err);
                    // Return (or discard, if poisoned) the connection before
                    // any retry selects a new server.
                    drop(conn);

                    if let Some(r) = retry {
                        // The retry also failed; surface whichever error says
                        // more.
                        if err.is_server_error()
                            || err.is_read_retryable()
                            || err.is_write_retryable()
                        {
                            return Err(err);
                        }
                        return Err(r.first_error);
                    } else if (retryability == Retryability::Read
                        && self.retry_reads()
                        && err.is_read_retryable())
                        || (retryability == Retryability::Write
                            && self.retry_writes()
                            && err.is_write_retryable())
                    {
                        debug!(error = %err, operation = op.name(), "retrying operation");
                        retry = Some(ExecutionRetry {
                            prior_txn_number: txn_number,
                            first_error: err,
                        });
                        continue;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Executes an operation on a given connection, injecting session,
    /// cluster time, and transaction number state.
    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        conn: &mut PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<T::O> {
        let stream_description = conn.stream_description()?.clone();
        let mut cmd = op.build(&stream_description)?;

        {
            let state = self.inner.topology.watcher().latest();
            state.description.update_command_with_read_pref(
                &conn.address,
                &mut cmd,
                op.selection_criteria(),
            );
        }

        if let Some(ref mut session) = session {
            cmd.set_session(session);
            if let Some(txn_number) = txn_number {
                cmd.set_txn_number(txn_number);
            }
            // A causally consistent read carries the session's high-watermark
            // operation time once any operation has returned one.
            if session.causal_consistency() && op.supports_read_concern() {
                if let Some(operation_time) = session.operation_time() {
                    cmd.set_after_cluster_time(operation_time);
                }
            }
            session.update_last_use();
        }

        let session_cluster_time = session.as_ref().and_then(|s| s.cluster_time().cloned());
        let client_cluster_time = self.inner.topology.cluster_time();
        if let Some(cluster_time) = std::cmp::max(session_cluster_time, client_cluster_time) {
            cmd.set_cluster_time(&cluster_time);
        }

        let response = conn.send_command(cmd, None).await?;

        if let Some(cluster_time) = response.cluster_time() {
            self.inner.topology.advance_cluster_time(&cluster_time);
            if let Some(ref mut session) = session {
                session.advance_cluster_time(&cluster_time);
            }
        }
        if let Some(operation_time) = response.operation_time() {
            if let Some(ref mut session) = session {
                session.advance_operation_time(operation_time);
            }
        }

        op.handle_response(response, &stream_description)
    }

    /// The effective retry class for this attempt: the operation's class,
    /// gated by the client options and by what the connection's server
    /// supports.
    fn get_retryability<T: Operation>(
        &self,
        conn: &PooledConnection,
        op: &T,
        has_session: bool,
    ) -> Result<Retryability> {
        match op.retryability() {
            Retryability::Write => {
                if !self.retry_writes() || !has_session || !op.is_acknowledged() {
                    return Ok(Retryability::None);
                }
                if conn.stream_description()?.supports_retryable_writes() {
                    Ok(Retryability::Write)
                } else {
                    Ok(Retryability::None)
                }
            }
            Retryability::Read if self.retry_reads() => Ok(Retryability::Read),
            _ => Ok(Retryability::None),
        }
    }

    fn retry_reads(&self) -> bool {
        self.inner.options.retry_reads != Some(false)
    }

    fn retry_writes(&self) -> bool {
        self.inner.options.retry_writes != Some(false)
    }
}
