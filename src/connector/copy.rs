//! COPY sub-protocol: bulk data in and out over the simple-query entry.

use bytes::BytesMut;
use log::warn;

use crate::cancellation::CancelToken;
use crate::errors::{Error, ServerError, TimeoutKind};
use crate::messages::{frontend, BackendMessage, ErrorFields};

use super::{Connector, ConnectorState};

impl Connector {
    /// Run a `COPY ... FROM STDIN` statement and return the sink for the
    /// data stream.
    pub async fn copy_in<'a>(
        &'a mut self,
        sql: &str,
        cancel: &CancelToken,
    ) -> Result<CopyInSink<'a>, Error> {
        self.begin_copy(sql, cancel, true).await?;
        Ok(CopyInSink {
            conn: self,
            cancel: cancel.clone(),
            closed: false,
        })
    }

    /// Run a `COPY ... TO STDOUT` statement and stream the data chunks.
    pub async fn copy_out<'a>(
        &'a mut self,
        sql: &str,
        cancel: &CancelToken,
    ) -> Result<CopyOutStream<'a>, Error> {
        self.begin_copy(sql, cancel, false).await?;
        Ok(CopyOutStream {
            conn: self,
            cancel: cancel.clone(),
            pending_error: None,
            finished: false,
        })
    }

    async fn begin_copy(&mut self, sql: &str, cancel: &CancelToken, into: bool) -> Result<(), Error> {
        self.ensure_ready()?;
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        frontend::query(&mut self.write_buf, sql);
        self.state = ConnectorState::Executing;
        self.flush().await?;

        let mut pending_error: Option<ErrorFields> = None;
        loop {
            match self.next_message().await? {
                BackendMessage::CopyInResponse(_) if into => {
                    self.state = ConnectorState::CopyIn;
                    return Ok(());
                }
                BackendMessage::CopyOutResponse(_) if !into => {
                    self.state = ConnectorState::CopyOut;
                    return Ok(());
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
                        None => Error::protocol("statement did not start a COPY"),
                    });
                }
                // A non-COPY statement: swallow its result, fail at RFQ.
                _ => continue,
            }
        }
    }
}

/// Sink side of `COPY FROM STDIN`. Finish with [`CopyInSink::finish`] or
/// abort with [`CopyInSink::fail`]; either drains back to Ready.
pub struct CopyInSink<'a> {
    conn: &'a mut Connector,
    cancel: CancelToken,
    closed: bool,
}

impl CopyInSink<'_> {
    /// Send one CopyData chunk. Chunks larger than the write buffer go
    /// straight to the socket.
    pub async fn send(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.cancel.is_canceled() {
            return Err(self.abort("canceled by caller").await);
        }
        if chunk.len() > self.conn.options.write_buffer_size {
            return self.send_oversized(chunk).await;
        }
        frontend::copy_data(&mut self.conn.write_buf, chunk);
        if self.conn.write_buf.pending() >= self.conn.options.write_buffer_size {
            self.conn.flush().await?;
        }
        Ok(())
    }

    async fn send_oversized(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let mut header = BytesMut::with_capacity(5);
        use bytes::BufMut;
        header.put_u8(b'd');
        header.put_i32(chunk.len() as i32 + 4);
        self.conn.write_buf.put_encoded(&header);
        let result = self.conn.write_buf.write_direct(&mut self.conn.stream, chunk).await;
        if let Err(err) = result {
            self.conn.mark_broken(&err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// CopyDone, then drain to ReadyForQuery. Returns the CommandComplete
    /// tag (`COPY <n>`).
    pub async fn finish(mut self) -> Result<String, Error> {
        self.closed = true;
        frontend::copy_done(&mut self.conn.write_buf);
        self.conn.flush().await?;
        let tag = self.drain().await?;
        tag.ok_or_else(|| Error::protocol("COPY finished without CommandComplete"))
    }

    /// CopyFail; the resulting server error is expected and swallowed.
    pub async fn fail(mut self, reason: &str) -> Result<(), Error> {
        self.closed = true;
        frontend::copy_fail(&mut self.conn.write_buf, reason);
        self.conn.flush().await?;
        match self.drain().await {
            Ok(_) => Ok(()),
            Err(Error::Server(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn abort(&mut self, reason: &str) -> Error {
        self.closed = true;
        frontend::copy_fail(&mut self.conn.write_buf, reason);
        if self.conn.flush().await.is_ok() {
            let _ = self.drain().await;
        }
        Error::Canceled
    }

    async fn drain(&mut self) -> Result<Option<String>, Error> {
        let deadline = self.conn.options.internal_command_timeout();
        let mut tag = None;
        let mut pending_error: Option<ErrorFields> = None;
        let drain = async {
            loop {
                match self.conn.next_message().await? {
                    BackendMessage::CommandComplete { tag: t } => tag = Some(t),
                    BackendMessage::ErrorResponse(fields) => {
                        if pending_error.is_none() {
                            pending_error = Some(fields);
                        }
                    }
                    BackendMessage::ReadyForQuery(status) => {
                        self.conn.transaction_status = status;
                        self.conn.state = ConnectorState::Ready;
                        return Ok(());
                    }
                    _ => continue,
                }
            }
        };
        match tokio::time::timeout(deadline, drain).await {
            Ok(Ok(())) => match pending_error {
                Some(fields) => Err(Error::Server(ServerError::new(
                    fields,
                    self.conn.options.include_error_detail,
                ))),
                None => Ok(tag),
            },
            Ok(Err(err)) => Err(err),
            Err(_) => {
                self.conn.mark_broken("timed out completing COPY");
                Err(Error::Timeout(TimeoutKind::Internal))
            }
        }
    }
}

impl Drop for CopyInSink<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "Copy sink dropped mid-stream on {}; connection is unusable",
                self.conn
            );
            self.conn.mark_broken("copy sink dropped mid-stream");
        }
    }
}

/// Source side of `COPY TO STDOUT`.
pub struct CopyOutStream<'a> {
    conn: &'a mut Connector,
    cancel: CancelToken,
    pending_error: Option<ErrorFields>,
    finished: bool,
}

impl CopyOutStream<'_> {
    /// Next CopyData chunk, or `None` after CopyDone once the connector is
    /// Ready again.
    pub async fn next_chunk(&mut self) -> Result<Option<BytesMut>, Error> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if self.cancel.is_canceled() && self.pending_error.is_none() {
                if let Err(err) = self.conn.cancel_request().await {
                    warn!("CancelRequest failed: {err}");
                }
            }
            match self.conn.next_message().await? {
                BackendMessage::CopyData(body) => return Ok(Some(body)),
                BackendMessage::CopyDone | BackendMessage::CommandComplete { .. } => continue,
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
                _ => continue,
            }
        }
    }
}
