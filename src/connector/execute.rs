//! Command execution: the extended-query exchange and the forward-only
//! result cursor.

use std::time::Duration;

use log::warn;

use crate::cancellation::CancelToken;
use crate::errors::{Error, ServerError, TimeoutKind};
use crate::messages::{
    frontend, BackendMessage, DataRow, ErrorFields, Parameter, RowDescription,
};

use super::statements::StatementPlan;
use super::{Connector, ConnectorState};

/// A fully-buffered command result, used by the multiplexer and by callers
/// that do not want to stream.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub row_description: Option<RowDescription>,
    pub rows: Vec<DataRow>,
    pub command_tag: Option<String>,
}

/// Bookkeeping for a command whose messages are in the write buffer but whose
/// results have not been read yet. The multiplexer writes several of these
/// before a single flush; each one is then resumed in FIFO order.
#[derive(Debug)]
pub struct PendingCommand {
    prepared_fingerprint: Option<(String, Vec<u32>, String)>,
}

impl Connector {
    /// Encode one command into the write buffer without flushing. With
    /// parameters (or auto-prepare on) this is the extended
    /// Parse/Bind/Describe/Execute/Sync exchange; otherwise the simple query
    /// protocol. A `Sync` always terminates the exchange, so result reading
    /// can rely on exactly one ReadyForQuery per command even after a
    /// command-level error.
    pub(crate) fn write_command(&mut self, sql: &str, params: &[Parameter]) -> PendingCommand {
        let param_oids: Vec<u32> = params.iter().map(|p| p.oid).collect();
        let mut prepared_fingerprint = None;

        if params.is_empty() && !self.statements.enabled() {
            frontend::query(&mut self.write_buf, sql);
        } else {
            let statement = match self.statements.plan(sql, &param_oids) {
                StatementPlan::Unprepared => {
                    frontend::parse(&mut self.write_buf, "", sql, &param_oids);
                    String::new()
                }
                StatementPlan::Prepared { name } => {
                    self.stats.command_prepared();
                    name
                }
                StatementPlan::Promote { name, evicted } => {
                    frontend::parse(&mut self.write_buf, &name, sql, &param_oids);
                    // The victim's server-side slot is reclaimed in the same
                    // batch, ahead of the Sync.
                    if let Some(victim) = evicted {
                        frontend::close_statement(&mut self.write_buf, &victim);
                    }
                    prepared_fingerprint = Some((sql.to_string(), param_oids.clone(), name.clone()));
                    name
                }
            };
            frontend::bind(&mut self.write_buf, "", &statement, params);
            frontend::describe_portal(&mut self.write_buf, "");
            frontend::execute(&mut self.write_buf, "", 0);
            frontend::sync(&mut self.write_buf);
        }

        self.stats.command_started();
        self.state = ConnectorState::Executing;
        if self.options.log_parameters {
            log::debug!("Connector {self} executing {sql:?} with {params:?}");
        } else {
            log::debug!("Connector {self} executing {sql:?}");
        }

        PendingCommand {
            prepared_fingerprint,
        }
    }

    /// Resume reading the results of a written command.
    pub(crate) fn resume(
        &mut self,
        pending: PendingCommand,
        cancel: &CancelToken,
    ) -> ResultStream<'_> {
        let deadline = self
            .options
            .command_timeout()
            .map(|t| tokio::time::Instant::now() + t);
        ResultStream {
            conn: self,
            cancel: cancel.clone(),
            deadline,
            prepared_fingerprint: pending.prepared_fingerprint,
            row_description: None,
            command_tag: None,
            pending_error: None,
            draining: false,
            finished: false,
            stats_done: false,
        }
    }

    /// Execute one command and return the forward-only cursor over its
    /// results.
    pub async fn execute<'a>(
        &'a mut self,
        sql: &str,
        params: &[Parameter],
        cancel: &CancelToken,
    ) -> Result<ResultStream<'a>, Error> {
        self.ensure_ready()?;
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }

        let pending = self.write_command(sql, params);
        if let Err(err) = self.flush().await {
            self.stats.command_finished(true);
            return Err(err);
        }
        Ok(self.resume(pending, cancel))
    }

    /// Execute and buffer the whole result.
    pub async fn execute_collect(
        &mut self,
        sql: &str,
        params: &[Parameter],
        cancel: &CancelToken,
    ) -> Result<QueryResult, Error> {
        self.execute(sql, params, cancel).await?.finish().await
    }
}

/// Forward-only cursor over one command's results. Rows surface lazily from
/// the read buffer; the cursor always drains to ReadyForQuery before
/// reporting completion, so the connector is Ready again when it ends.
pub struct ResultStream<'a> {
    conn: &'a mut Connector,
    cancel: CancelToken,
    deadline: Option<tokio::time::Instant>,
    /// Set when this execution promoted a statement, so its row descriptor
    /// can be cached and a failed Parse can be forgotten.
    prepared_fingerprint: Option<(String, Vec<u32>, String)>,
    row_description: Option<RowDescription>,
    command_tag: Option<String>,
    pending_error: Option<ErrorFields>,
    /// Rows of the first statement are done; remaining messages are consumed
    /// without surfacing.
    draining: bool,
    finished: bool,
    stats_done: bool,
}

impl ResultStream<'_> {
    /// The row descriptor, known once the first row (or completion) has been
    /// observed.
    pub fn row_description(&self) -> Option<&RowDescription> {
        self.row_description.as_ref()
    }

    /// CommandComplete tag (`SELECT 1`, `INSERT 0 3`, ...).
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Next data row, or `None` once the command has completed and the
    /// connector is Ready again. Command-level errors surface here after the
    /// drain to ReadyForQuery.
    pub async fn next_row(&mut self) -> Result<Option<DataRow>, Error> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let message = self.read_one().await?;
            match message {
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::CloseComplete
                | BackendMessage::ParameterDescription { .. }
                | BackendMessage::NoData
                | BackendMessage::PortalSuspended => continue,
                BackendMessage::RowDescription(description) => {
                    if !self.draining {
                        if let Some((sql, oids, _)) = &self.prepared_fingerprint {
                            self.conn
                                .statements
                                .set_row_description(sql, oids, description.clone());
                        }
                        self.row_description = Some(description);
                    }
                }
                BackendMessage::DataRow(row) => {
                    if !self.draining {
                        self.conn.state = ConnectorState::Fetching;
                        return Ok(Some(row));
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    // SET/PREPARE/DECLARE/LISTEN alter session state the
                    // checkin reset must discard.
                    if matches!(tag.as_str(), "SET" | "PREPARE" | "DECLARE CURSOR" | "LISTEN") {
                        self.conn.dirty = true;
                    }
                    if self.command_tag.is_none() {
                        self.command_tag = Some(tag);
                    }
                    self.draining = true;
                }
                BackendMessage::EmptyQueryResponse => {
                    self.draining = true;
                }
                BackendMessage::ErrorResponse(fields) => {
                    // The server skips to Sync after an error; keep reading.
                    if self.pending_error.is_none() {
                        if let Some((_, _, name)) = self.prepared_fingerprint.take() {
                            // The Parse failed server-side; the cache entry
                            // never materialized on the wire.
                            self.conn.statements.forget(&name);
                        }
                        self.pending_error = Some(fields);
                    }
                    self.draining = true;
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.conn.transaction_status = status;
                    self.conn.state = ConnectorState::Ready;
                    self.finished = true;
                    let failed = self.pending_error.is_some();
                    self.finish_stats(failed);
                    return match self.pending_error.take() {
                        Some(fields) => Err(Error::Server(ServerError::new(
                            fields,
                            self.conn.options.include_error_detail,
                        ))),
                        None => Ok(None),
                    };
                }
                other => {
                    self.conn
                        .mark_broken(&format!("unexpected {} mid-command", other.name()));
                    self.finish_stats(true);
                    return Err(Error::protocol(format!(
                        "unexpected {} while reading command results",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Drain the remainder and return the buffered result.
    pub async fn finish(mut self) -> Result<QueryResult, Error> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(QueryResult {
            row_description: self.row_description.take(),
            rows,
            command_tag: self.command_tag.take(),
        })
    }

    /// Consume and discard everything up to ReadyForQuery.
    pub async fn drain(&mut self) -> Result<(), Error> {
        self.draining = true;
        while !self.finished {
            self.next_row().await?;
        }
        Ok(())
    }

    fn finish_stats(&mut self, failed: bool) {
        if !self.stats_done {
            self.stats_done = true;
            self.conn.stats.command_finished(failed);
        }
    }

    /// One message, guarded by the command deadline and the cancellation
    /// token. Both aborts follow the same path: fire an out-of-band cancel,
    /// then wait out `CancellationTimeout` for the server to wind the
    /// command down; a connector that cannot be drained is Broken.
    async fn read_one(&mut self) -> Result<BackendMessage, Error> {
        let canceled = tokio::select! {
            biased;
            _ = self.cancel.canceled() => true,
            message = read_with_deadline(self.conn, self.deadline) => {
                match message {
                    Ok(message) => return Ok(message),
                    Err(Error::Timeout(TimeoutKind::Command)) => false,
                    Err(err) => {
                        self.finish_stats(true);
                        return Err(err);
                    }
                }
            }
        };
        let err = self.abort_command(canceled).await;
        self.finish_stats(true);
        Err(err)
    }

    /// Command abort on cancellation (`canceled`) or timeout.
    async fn abort_command(&mut self, canceled: bool) -> Error {
        if let Err(err) = self.conn.cancel_request().await {
            warn!("CancelRequest failed: {err}");
        }

        let outcome = if canceled { Error::Canceled } else { Error::Timeout(TimeoutKind::Command) };
        match self.conn.options.cancellation_timeout {
            // Skip the wait entirely; the connector is sacrificed.
            -1 => {
                self.conn.mark_broken("canceled without awaiting server ack");
                self.finished = true;
            }
            0 => {
                // Wait forever for the server-side termination.
                if self.drain_after_cancel(None).await.is_err() {
                    self.conn.mark_broken("connection failed while awaiting cancel");
                }
                self.finished = true;
            }
            ms => {
                let wait = Duration::from_millis(ms as u64);
                if self.drain_after_cancel(Some(wait)).await.is_err() {
                    self.conn
                        .mark_broken("server did not acknowledge cancellation in time");
                }
                self.finished = true;
            }
        }
        outcome
    }

    async fn drain_after_cancel(&mut self, wait: Option<Duration>) -> Result<(), Error> {
        let drain = async {
            loop {
                if let BackendMessage::ReadyForQuery(status) = self.conn.next_message().await? {
                    self.conn.transaction_status = status;
                    self.conn.state = ConnectorState::Ready;
                    return Ok(());
                }
            }
        };
        match wait {
            Some(wait) => tokio::time::timeout(wait, drain)
                .await
                .map_err(|_| Error::Timeout(TimeoutKind::Cancel))?,
            None => drain.await,
        }
    }
}

async fn read_with_deadline(
    conn: &mut Connector,
    deadline: Option<tokio::time::Instant>,
) -> Result<BackendMessage, Error> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, conn.next_message())
            .await
            .map_err(|_| Error::Timeout(TimeoutKind::Command))?,
        None => conn.next_message().await,
    }
}

impl Drop for ResultStream<'_> {
    fn drop(&mut self) {
        if !self.stats_done {
            self.stats_done = true;
            self.conn.stats.command_finished(false);
        }
        if !self.finished {
            // Unread results stay on the wire; the next reset drains them.
            log::debug!("Result stream dropped before completion on {}", self.conn);
        }
    }
}
