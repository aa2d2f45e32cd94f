//! Multiplexed command scheduling.
//!
//! With `Multiplexing=true` commands are decoupled from connectors: callers
//! push command handles onto a bounded per-pool queue, a writer task coalesces
//! pending commands into batches of up to
//! `WriteCoalescingBufferThresholdBytes` and writes each batch onto a rented
//! connector with a single flush, and a per-batch reader drains the results,
//! completing handles strictly in write order (every command is its own
//! Sync-terminated exchange, so each gets exactly one ReadyForQuery).

use std::sync::Arc;

use log::warn;
use tokio::sync::{mpsc, oneshot};

use crate::cancellation::CancelToken;
use crate::connector::{PendingCommand, QueryResult};
use crate::errors::Error;
use crate::messages::Parameter;
use crate::pool::{PoolInner, PooledConnector};

/// Submissions the queue will hold before submitters feel backpressure.
const COMMAND_QUEUE_CAPACITY: usize = 4096;

struct Command {
    sql: String,
    params: Vec<Parameter>,
    cancel: CancelToken,
    completion: oneshot::Sender<Result<QueryResult, Error>>,
    /// Rough encoded size, used against the coalescing threshold.
    size_hint: usize,
}

pub(crate) struct Multiplexer {
    queue: mpsc::Sender<Command>,
}

impl Multiplexer {
    pub(crate) fn new(pool: Arc<PoolInner>) -> Multiplexer {
        let (queue, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(writer_task(pool, rx));
        }
        Multiplexer { queue }
    }

    /// Queue a command and await its buffered result. The channel is
    /// bounded; a full queue makes submitters wait for capacity.
    pub(crate) async fn submit(
        &self,
        sql: &str,
        params: &[Parameter],
        cancel: &CancelToken,
    ) -> Result<QueryResult, Error> {
        let (completion, result) = oneshot::channel();
        let size_hint =
            sql.len() + params.iter().map(Parameter::wire_len).sum::<usize>() + 64;
        let command = Command {
            sql: sql.to_string(),
            params: params.to_vec(),
            cancel: cancel.clone(),
            completion,
            size_hint,
        };
        self.queue
            .send(command)
            .await
            .map_err(|_| Error::PoolClosed)?;
        result
            .await
            .map_err(|_| Error::Broken("command was dropped by the scheduler".into()))?
    }
}

/// The single writer: batch pending commands, rent a connector, write the
/// whole batch with one flush, then hand the connector to a reader task so
/// the next batch can target another connector meanwhile.
async fn writer_task(pool: Arc<PoolInner>, mut rx: mpsc::Receiver<Command>) {
    let threshold = pool.options.write_coalescing_buffer_threshold_bytes;

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let mut bytes = batch[0].size_hint;

        // Coalesce whatever else is already queued, up to the threshold.
        while bytes < threshold {
            match rx.try_recv() {
                Ok(command) => {
                    bytes += command.size_hint;
                    batch.push(command);
                }
                Err(_) => break,
            }
        }

        // Cancellation before writing just removes the handle.
        let mut live = Vec::with_capacity(batch.len());
        for command in batch {
            if command.cancel.is_canceled() {
                let _ = command.completion.send(Err(Error::Canceled));
            } else {
                live.push(command);
            }
        }
        if live.is_empty() {
            continue;
        }

        let conn = match pool.rent(None, &CancelToken::new()).await {
            Ok(conn) => conn,
            Err(err) => {
                fail_batch(live, &Error::from(err));
                continue;
            }
        };

        dispatch_batch(conn, live).await;
    }
}

/// Write every command in the batch, flush once, then spawn the reader that
/// completes handles in FIFO order.
async fn dispatch_batch(mut conn: PooledConnector, batch: Vec<Command>) {
    let mut pending: Vec<PendingCommand> = Vec::with_capacity(batch.len());
    for command in &batch {
        pending.push(conn.write_command(&command.sql, &command.params));
    }

    let started = crate::clock::now();
    if let Err(err) = conn.flush().await {
        for _ in &pending {
            conn.stats.command_finished(true);
        }
        fail_batch(batch, &err);
        return;
    }
    conn.stats
        .batch_written(batch.len() as u64, started.elapsed().as_micros() as u64);

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(read_batch(conn, batch, pending));
    } else {
        read_batch(conn, batch, pending).await;
    }
}

/// Per-batch reader: one ReadyForQuery per command, results delivered in the
/// order the commands were written. A broken connector fails everything
/// still attached to it.
async fn read_batch(mut conn: PooledConnector, batch: Vec<Command>, pending: Vec<PendingCommand>) {
    let mut remaining = batch.into_iter().zip(pending);
    while let Some((command, pending)) = remaining.next() {
        let result = conn.resume(pending, &command.cancel).finish().await;
        let broken = conn.is_broken();
        let _ = command.completion.send(result);
        if broken {
            warn!("Multiplexed connector {} broke mid-batch", *conn);
            for (command, _) in remaining {
                conn.stats.command_finished(true);
                let _ = command
                    .completion
                    .send(Err(Error::Broken("connector broke mid-batch".into())));
            }
            break;
        }
    }
    // `conn` drops here and returns to the pool (or is discarded if broken).
}

fn fail_batch(batch: Vec<Command>, err: &Error) {
    for command in batch {
        let _ = command.completion.send(Err(replicate(err)));
    }
}

/// Errors fan out to every handle in a failed batch; reproduce the kind
/// where it matters.
fn replicate(err: &Error) -> Error {
    match err {
        Error::Canceled => Error::Canceled,
        Error::PoolClosed => Error::PoolClosed,
        Error::Timeout(kind) => Error::Timeout(*kind),
        Error::ConnectionFailed { identifier, reason } => Error::ConnectionFailed {
            identifier: identifier.clone(),
            reason: reason.clone(),
        },
        other => Error::Broken(other.to_string()),
    }
}
