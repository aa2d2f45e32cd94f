//! Out-of-band query cancellation.
//!
//! A CancelRequest travels on a transient second socket carrying the
//! (process id, secret key) pair from BackendKeyData. The request itself is
//! best-effort; the server kills the running statement if the key matches.

use log::warn;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};

use crate::config::HostSpec;
use crate::errors::{Error, ServerIdentifier};
use crate::messages::frontend;

use super::Connector;

impl Connector {
    /// Ask the server to cancel whatever this connector is running. Opens a
    /// transient socket, sends CancelRequest and closes it. Callers decide
    /// how long to wait for the running command to actually die.
    pub async fn cancel_request(&self) -> Result<(), Error> {
        warn!(
            "Sending CancelRequest for [{}] to {}:{}",
            self.process_id, self.host.host, self.host.port
        );
        send_cancel_request(
            &self.host,
            &self.identifier,
            self.process_id,
            self.secret_key,
        )
        .await
    }
}

/// Cancellation always goes over a plain socket; the packet carries no
/// credentials and precedes any TLS negotiation.
pub(crate) async fn send_cancel_request(
    host: &HostSpec,
    identifier: &ServerIdentifier,
    process_id: i32,
    secret_key: i32,
) -> Result<(), Error> {
    let packet = frontend::cancel_request(process_id, secret_key);

    if host.is_unix_socket() {
        let path = host.socket_path();
        let mut stream =
            UnixStream::connect(&path)
                .await
                .map_err(|err| Error::ConnectionFailed {
                    identifier: identifier.clone(),
                    reason: format!("cancel socket {path}: {err}"),
                })?;
        stream
            .write_all(&packet)
            .await
            .map_err(|err| Error::broken_io("write CancelRequest", err))?;
        let _ = stream.shutdown().await;
    } else {
        let mut stream = TcpStream::connect((host.host.as_str(), host.port))
            .await
            .map_err(|err| Error::ConnectionFailed {
                identifier: identifier.clone(),
                reason: format!("cancel socket {host}: {err}"),
            })?;
        stream
            .write_all(&packet)
            .await
            .map_err(|err| Error::broken_io("write CancelRequest", err))?;
        let _ = stream.shutdown().await;
    }
    Ok(())
}
