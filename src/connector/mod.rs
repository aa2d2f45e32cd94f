//! The connector: one physical connection driving the protocol state machine.

// Implementation of the client side of the PostgreSQL/openGauss protocol.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::config::{HostSpec, Options};
use crate::errors::{Error, ServerIdentifier, TimeoutKind};
use crate::messages::{
    frontend, BackendMessage, ErrorFields, ReadBuffer, TransactionStatus, WriteBuffer,
};
use crate::stats::DriverStats;

pub mod cancel;
pub mod copy;
pub mod execute;
pub mod parameters;
pub mod replication;
pub mod startup;
pub mod statements;
pub mod stream;

pub use copy::{CopyInSink, CopyOutStream};
pub use execute::{PendingCommand, QueryResult, ResultStream};
pub use parameters::ServerParameters;
pub use replication::ReplicationStream;
pub use statements::{StatementCache, StatementPlan};
pub use stream::StreamInner;

/// Protocol state. `Broken` is terminal; everything else advances per the
/// message flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Closed,
    Connecting,
    Ready,
    Executing,
    Fetching,
    CopyIn,
    CopyOut,
    Replication,
    Broken,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Fetching => "fetching",
            Self::CopyIn => "copy-in",
            Self::CopyOut => "copy-out",
            Self::Replication => "replication",
            Self::Broken => "broken",
        })
    }
}

/// An asynchronous NotificationResponse (LISTEN/NOTIFY).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

type NoticeHook = Arc<dyn Fn(&ErrorFields) + Send + Sync>;

pub struct Connector {
    pub(crate) state: ConnectorState,
    pub(crate) options: Arc<Options>,
    pub(crate) host: HostSpec,
    pub(crate) identifier: ServerIdentifier,
    pub(crate) stream: StreamInner,
    pub(crate) read_buf: ReadBuffer,
    pub(crate) write_buf: WriteBuffer,

    /// Backend key for out-of-band cancellation.
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,

    pub(crate) parameters: ServerParameters,
    pub(crate) statements: StatementCache,
    pub(crate) transaction_status: TransactionStatus,

    notice_hook: Option<NoticeHook>,
    notifications: VecDeque<Notification>,

    connected_at: quanta::Instant,
    connected_at_wall: chrono::NaiveDateTime,
    pub(crate) last_activity: quanta::Instant,
    /// Session-altering statements ran; a reset is due at checkin.
    pub(crate) dirty: bool,

    pub(crate) stats: Arc<DriverStats>,
    bytes_read_synced: u64,
    bytes_written_synced: u64,
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]-{}@{}:{}/{}",
            self.process_id,
            self.identifier.username,
            self.host.host,
            self.host.port,
            self.identifier.database,
        )
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("state", &self.state)
            .field("host", &self.host)
            .field("identifier", &self.identifier)
            .field("process_id", &self.process_id)
            .field("transaction_status", &self.transaction_status)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Connector {
    #[inline(always)]
    pub fn state(&self) -> ConnectorState {
        self.state
    }

    #[inline(always)]
    pub fn is_broken(&self) -> bool {
        self.state == ConnectorState::Broken
    }

    #[inline(always)]
    pub fn is_ready(&self) -> bool {
        self.state == ConnectorState::Ready
    }

    /// (process id, secret key) reported by BackendKeyData.
    pub fn backend_key(&self) -> (i32, i32) {
        (self.process_id, self.secret_key)
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub fn identifier(&self) -> &ServerIdentifier {
        &self.identifier
    }

    pub fn server_parameters(&self) -> &ServerParameters {
        &self.parameters
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Age since the handshake completed.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Time since the last successful send or receive.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Register a hook for NoticeResponse messages. Notices never fail a
    /// command; without a hook they are logged at debug level.
    pub fn set_notice_hook(&mut self, hook: impl Fn(&ErrorFields) + Send + Sync + 'static) {
        self.notice_hook = Some(Arc::new(hook));
    }

    /// Drain any NotificationResponse messages received so far.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// The connection cannot be reused; the pool drops it on return.
    pub(crate) fn mark_broken(&mut self, reason: &str) {
        if self.state != ConnectorState::Broken {
            error!("Connector {self} marked broken, reason: {reason}");
            self.state = ConnectorState::Broken;
        }
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), Error> {
        match self.state {
            ConnectorState::Ready => Ok(()),
            ConnectorState::Broken => Err(Error::Broken("connector is broken".into())),
            other => Err(Error::OperationInProgress(other.to_string())),
        }
    }

    /// Read one message, transparently handling the asynchronous ones:
    /// ParameterStatus updates the parameter map, NoticeResponse goes to the
    /// subscriber hook, NotificationResponse queues. Everything else is
    /// returned to the caller in arrival order.
    pub(crate) async fn next_message(&mut self) -> Result<BackendMessage, Error> {
        loop {
            let (tag, body) = match self.read_buf.read_message(&mut self.stream).await {
                Ok(frame) => frame,
                Err(err) => {
                    self.mark_broken(&err.to_string());
                    return Err(err);
                }
            };
            self.sync_read_stats();
            self.last_activity = crate::clock::now();

            let message = match BackendMessage::decode(tag, body) {
                Ok(message) => message,
                Err(err) => {
                    self.mark_broken(&err.to_string());
                    return Err(err);
                }
            };

            match message {
                BackendMessage::ParameterStatus { key, value } => {
                    self.parameters.set(key, value, false);
                }
                BackendMessage::NoticeResponse(fields) => {
                    if let Some(hook) = &self.notice_hook {
                        hook(&fields);
                    } else {
                        log::debug!("Connector {self} notice: {} {}", fields.code, fields.message);
                    }
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    self.notifications.push_back(Notification {
                        process_id,
                        channel,
                        payload,
                    });
                }
                other => return Ok(other),
            }
        }
    }

    /// Flush the write buffer, keeping the outbound byte counter current.
    pub(crate) async fn flush(&mut self) -> Result<(), Error> {
        let result = self.write_buf.flush(&mut self.stream).await;
        self.sync_write_stats();
        match result {
            Ok(()) => {
                self.last_activity = crate::clock::now();
                Ok(())
            }
            Err(err) => {
                self.mark_broken(&err.to_string());
                Err(err)
            }
        }
    }

    fn sync_read_stats(&mut self) {
        let total = self.read_buf.bytes_read();
        self.stats.add_bytes_read(total - self.bytes_read_synced);
        self.bytes_read_synced = total;
    }

    fn sync_write_stats(&mut self) {
        let total = self.write_buf.bytes_flushed();
        self.stats.add_bytes_written(total - self.bytes_written_synced);
        self.bytes_written_synced = total;
    }

    /// Consume messages up to ReadyForQuery, dropping row data. Used when a
    /// command is abandoned and before checkin.
    pub(crate) async fn drain_until_ready(&mut self, deadline: Duration) -> Result<(), Error> {
        let drain = async {
            loop {
                match self.next_message().await? {
                    BackendMessage::ReadyForQuery(status) => {
                        self.transaction_status = status;
                        self.state = ConnectorState::Ready;
                        return Ok(());
                    }
                    _ => continue,
                }
            }
        };
        match tokio::time::timeout(deadline, drain).await {
            Ok(result) => result,
            Err(_) => {
                self.mark_broken("timed out draining to ReadyForQuery");
                Err(Error::Timeout(TimeoutKind::Internal))
            }
        }
    }

    /// Run a query over the simple protocol and return the first column of
    /// the first row, dropping everything else. Carries reset, keepalive and
    /// role probes; runs under `InternalCommandTimeout`.
    pub(crate) async fn simple_query_scalar(&mut self, sql: &str) -> Result<Option<String>, Error> {
        self.ensure_ready()?;
        self.state = ConnectorState::Executing;
        frontend::query(&mut self.write_buf, sql);
        self.flush().await?;

        let deadline = self.options.internal_command_timeout();
        let read = async {
            let mut first: Option<String> = None;
            let mut server_error: Option<ErrorFields> = None;
            loop {
                match self.next_message().await? {
                    BackendMessage::DataRow(row) => {
                        if first.is_none() {
                            let columns = row.columns()?;
                            if let Some(Some(value)) = columns.first() {
                                first = Some(String::from_utf8_lossy(value).into_owned());
                            }
                        }
                    }
                    BackendMessage::ErrorResponse(fields) => server_error = Some(fields),
                    BackendMessage::ReadyForQuery(status) => {
                        self.transaction_status = status;
                        self.state = ConnectorState::Ready;
                        return match server_error {
                            Some(fields) => Err(Error::Server(crate::errors::ServerError::new(
                                fields,
                                self.options.include_error_detail,
                            ))),
                            None => Ok(first),
                        };
                    }
                    _ => continue,
                }
            }
        };
        match tokio::time::timeout(deadline, read).await {
            Ok(result) => result,
            Err(_) => {
                self.mark_broken("internal command timed out");
                Err(Error::Timeout(TimeoutKind::Internal))
            }
        }
    }

    /// Application-level ping after `KeepAlive` seconds of idleness: an empty
    /// Sync round-trip. Failure breaks the connector.
    pub async fn keepalive(&mut self) -> Result<(), Error> {
        let Some(after) = self.options.keepalive_after() else {
            return Ok(());
        };
        if self.idle_for() < after {
            return Ok(());
        }
        self.ensure_ready()?;

        frontend::sync(&mut self.write_buf);
        self.flush().await?;
        self.drain_until_ready(self.options.internal_command_timeout())
            .await
            .map_err(|err| {
                self.mark_broken("keepalive failed");
                err
            })
    }

    /// Session cleanup before the connector goes back to the pool. Rolls back
    /// an open transaction and discards session state when it was altered
    /// (skipped entirely with `NoResetOnClose`).
    pub async fn reset(&mut self) -> Result<(), Error> {
        match self.state {
            ConnectorState::Ready => {}
            ConnectorState::Fetching | ConnectorState::Executing => {
                warn!("Connector {self} returned while still streaming a result");
                self.drain_until_ready(self.options.internal_command_timeout())
                    .await?;
            }
            ConnectorState::CopyIn | ConnectorState::CopyOut | ConnectorState::Replication => {
                self.mark_broken("returned mid copy or replication");
                return Err(Error::Broken("returned mid copy or replication".into()));
            }
            ConnectorState::Closed | ConnectorState::Connecting | ConnectorState::Broken => {
                return Err(Error::Broken(format!("returned while {}", self.state)));
            }
        }

        if self.options.no_reset_on_close {
            return Ok(());
        }

        if self.transaction_status != TransactionStatus::Idle {
            warn!("Connector {self} returned inside a transaction, rolling back");
            self.simple_query_scalar("ROLLBACK").await?;
        }
        if self.dirty {
            info!("Connector {self} returned with altered session state, discarding");
            self.simple_query_scalar("DISCARD ALL").await?;
            self.statements.clear();
            self.dirty = false;
        }
        Ok(())
    }

    /// Graceful shutdown: Terminate, then close the socket.
    pub async fn terminate(&mut self) {
        if matches!(self.state, ConnectorState::Closed | ConnectorState::Broken) {
            return;
        }
        frontend::terminate(&mut self.write_buf);
        if self.flush().await.is_ok() {
            self.state = ConnectorState::Closed;
        }
        info!(
            "Connector {} closed, session duration: {}",
            self,
            crate::format_duration(&(chrono::Utc::now().naive_utc() - self.connected_at_wall))
        );
    }

    /// Probe the host role over this connector. `on` means the server is
    /// read-only (a standby or a read replica).
    pub(crate) async fn probe_read_only(&mut self) -> Result<bool, Error> {
        let value = self.simple_query_scalar("SHOW transaction_read_only").await?;
        Ok(matches!(value.as_deref(), Some("on")))
    }
}

impl Drop for Connector {
    /// Best-effort Terminate. The socket is non-blocking, so the write may be
    /// dropped; the server cleans up either way.
    fn drop(&mut self) {
        if !matches!(self.state, ConnectorState::Broken | ConnectorState::Closed) {
            let bytes = frontend::terminate_packet();
            match self.stream.try_write(&bytes) {
                Ok(5) => (),
                Err(err) => warn!("Dirty connector {self} shutdown: {err}"),
                _ => warn!("Dirty connector {self} shutdown"),
            }
        }
        let duration = chrono::Utc::now().naive_utc() - self.connected_at_wall;
        info!(
            "{} {}, session duration: {}",
            if self.state == ConnectorState::Broken {
                "Connection terminated"
            } else {
                "Connection closed"
            },
            self,
            crate::format_duration(&duration)
        );
    }
}
