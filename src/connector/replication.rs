//! Streaming replication: START_REPLICATION and the keepalive/standby-status
//! sub-protocol carried inside CopyData.

use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::cancellation::CancelToken;
use crate::errors::{Error, ServerError};
use crate::messages::{frontend, BackendMessage, ErrorFields, ReplicationMessage};
use crate::types::Lsn;

use super::{Connector, ConnectorState};

/// Microseconds between the unix epoch and 2000-01-01, the protocol's
/// timestamp origin.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800 * 1_000_000;

fn pg_timestamp() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_micros() as i64 - PG_EPOCH_OFFSET_MICROS
}

impl Connector {
    /// Begin physical streaming replication from `start`, optionally bound to
    /// a slot. The connection must have been opened with
    /// [`Connector::open_replication`].
    pub async fn start_replication<'a>(
        &'a mut self,
        slot: Option<&str>,
        start: Lsn,
        cancel: &CancelToken,
    ) -> Result<ReplicationStream<'a>, Error> {
        let sql = match slot {
            Some(slot) => format!("START_REPLICATION SLOT {slot} PHYSICAL {start}"),
            None => format!("START_REPLICATION PHYSICAL {start}"),
        };
        self.begin_replication(&sql, start, cancel).await
    }

    /// Begin logical replication from a slot. Plugin options (for example
    /// `proto_version`, `publication_names`) are passed through verbatim;
    /// XLogData payloads then carry the logical sub-stream, decodable with
    /// [`crate::messages::LogicalReplicationMessage`].
    pub async fn start_logical_replication<'a>(
        &'a mut self,
        slot: &str,
        start: Lsn,
        plugin_options: &[(&str, &str)],
        cancel: &CancelToken,
    ) -> Result<ReplicationStream<'a>, Error> {
        let mut sql = format!("START_REPLICATION SLOT {slot} LOGICAL {start}");
        if !plugin_options.is_empty() {
            let rendered: Vec<String> = plugin_options
                .iter()
                .map(|(key, value)| format!("{key} '{value}'"))
                .collect();
            sql.push_str(&format!(" ({})", rendered.join(", ")));
        }
        self.begin_replication(&sql, start, cancel).await
    }

    async fn begin_replication<'a>(
        &'a mut self,
        sql: &str,
        start: Lsn,
        cancel: &CancelToken,
    ) -> Result<ReplicationStream<'a>, Error> {
        self.ensure_ready()?;
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        frontend::query(&mut self.write_buf, &sql);
        self.state = ConnectorState::Executing;
        self.flush().await?;

        let mut pending_error: Option<ErrorFields> = None;
        loop {
            match self.next_message().await? {
                BackendMessage::CopyBothResponse(_) => {
                    self.state = ConnectorState::Replication;
                    return Ok(ReplicationStream {
                        conn: self,
                        cancel: cancel.clone(),
                        last_received: start,
                        last_flushed: start,
                        last_applied: start,
                        pending_error: None,
                        finished: false,
                    });
                }
                BackendMessage::ErrorResponse(fields) => {
                    if pending_error.is_none() {
                        pending_error = Some(fields);
                    }
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.transaction_status = status;
                    self.state = ConnectorState::Ready;
                    return Err(match pending_error {
                        Some(fields) => Error::Server(ServerError::new(
                            fields,
                            self.options.include_error_detail,
                        )),
                        None => Error::protocol("server did not enter replication"),
                    });
                }
                _ => continue,
            }
        }
    }
}

/// The WAL stream. Keepalives demanding a reply are answered automatically
/// with the positions last reported through [`ReplicationStream::status_update`].
pub struct ReplicationStream<'a> {
    conn: &'a mut Connector,
    cancel: CancelToken,
    last_received: Lsn,
    last_flushed: Lsn,
    last_applied: Lsn,
    pending_error: Option<ErrorFields>,
    finished: bool,
}

impl ReplicationStream<'_> {
    /// Next replication message, or `None` when the server ends the stream
    /// (timeline switch) and the connector is Ready again.
    pub async fn next(&mut self) -> Result<Option<ReplicationMessage>, Error> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if self.cancel.is_canceled() {
                return self.shutdown().await.map(|_| None);
            }
            match self.conn.next_message().await? {
                BackendMessage::CopyData(body) => {
                    let message = ReplicationMessage::decode(body)?;
                    match &message {
                        ReplicationMessage::XLogData { wal_end, .. } => {
                            if *wal_end > self.last_received {
                                self.last_received = *wal_end;
                            }
                        }
                        ReplicationMessage::PrimaryKeepalive {
                            wal_end,
                            reply_requested,
                            ..
                        } => {
                            if *wal_end > self.last_received {
                                self.last_received = *wal_end;
                            }
                            if *reply_requested {
                                self.send_status(false).await?;
                            }
                        }
                    }
                    return Ok(Some(message));
                }
                BackendMessage::CopyDone => {
                    // Server is ending the stream; acknowledge.
                    frontend::copy_done(&mut self.conn.write_buf);
                    self.conn.flush().await?;
                }
                BackendMessage::CommandComplete { .. } => continue,
                BackendMessage::ErrorResponse(fields) => {
                    if self.pending_error.is_none() {
                        self.pending_error = Some(fields);
                    }
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.conn.transaction_status = status;
                    self.conn.state = ConnectorState::Ready;
                    self.finished = true;
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
                        .mark_broken(&format!("unexpected {} while replicating", other.name()));
                    return Err(Error::protocol(format!(
                        "unexpected {} while replicating",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Report applied/flushed positions upstream.
    pub async fn status_update(
        &mut self,
        flushed: Lsn,
        applied: Lsn,
        reply_requested: bool,
    ) -> Result<(), Error> {
        self.last_flushed = flushed;
        self.last_applied = applied;
        self.send_status(reply_requested).await
    }

    async fn send_status(&mut self, reply_requested: bool) -> Result<(), Error> {
        frontend::standby_status_update(
            &mut self.conn.write_buf,
            self.last_received,
            self.last_flushed,
            self.last_applied,
            pg_timestamp(),
            reply_requested,
        );
        self.conn.flush().await
    }

    /// Stop replicating: send CopyDone and drain to ReadyForQuery.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }
        frontend::copy_done(&mut self.conn.write_buf);
        self.conn.flush().await?;

        let deadline = self.conn.options.internal_command_timeout();
        let drain = async {
            loop {
                match self.conn.next_message().await? {
                    BackendMessage::ReadyForQuery(status) => {
                        self.conn.transaction_status = status;
                        self.conn.state = ConnectorState::Ready;
                        return Ok(());
                    }
                    _ => continue,
                }
            }
        };
        let result = match tokio::time::timeout(deadline, drain).await {
            Ok(result) => result,
            Err(_) => {
                self.conn.mark_broken("timed out leaving replication");
                Err(Error::Broken("timed out leaving replication".into()))
            }
        };
        self.finished = true;
        if result.is_err() {
            warn!("Replication shutdown on {} was not clean", self.conn);
        }
        result
    }
}
