//! Frontend message encoders.
//!
//! Startup-family packets (no tag byte) are built as standalone buffers since
//! they go out before the connector's write buffer exists or on transient
//! sockets. Everything else appends to a [`WriteBuffer`].

use bytes::{BufMut, BytesMut};

use crate::messages::buffer::WriteBuffer;
use crate::messages::{Parameter, WireFormat, CANCEL_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE};
use crate::types::Lsn;

/// StartupMessage carrying the session parameters.
pub fn startup_packet(params: &[(&str, &str)]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(PROTOCOL_VERSION);
    for (key, value) in params {
        body.put_slice(key.as_bytes());
        body.put_u8(0);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);

    let mut packet = BytesMut::with_capacity(body.len() + 4);
    packet.put_i32(body.len() as i32 + 4);
    packet.put(body);
    packet
}

pub fn ssl_request() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(8);
    bytes.put_i32(8);
    bytes.put_i32(SSL_REQUEST_CODE);
    bytes
}

/// Out-of-band cancellation packet for a transient second socket.
pub fn cancel_request(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_i32(CANCEL_REQUEST_CODE);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// PasswordMessage with an opaque payload (cleartext, md5 hex or sha256
/// proof, all already encoded by the authenticator).
pub fn password_message(buf: &mut WriteBuffer, payload: &[u8]) {
    buf.begin_message(b'p');
    buf.put_slice(payload);
    buf.end_message();
}

pub fn sasl_initial_response(buf: &mut WriteBuffer, mechanism: &str, data: &[u8]) {
    buf.begin_message(b'p');
    buf.put_cstr(mechanism);
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
    buf.end_message();
}

pub fn sasl_response(buf: &mut WriteBuffer, data: &[u8]) {
    buf.begin_message(b'p');
    buf.put_slice(data);
    buf.end_message();
}

/// Simple query protocol.
pub fn query(buf: &mut WriteBuffer, sql: &str) {
    buf.begin_message(b'Q');
    buf.put_cstr(sql);
    buf.end_message();
}

pub fn parse(buf: &mut WriteBuffer, statement: &str, sql: &str, param_oids: &[u32]) {
    buf.begin_message(b'P');
    buf.put_cstr(statement);
    buf.put_cstr(sql);
    buf.put_i16(param_oids.len() as i16);
    for oid in param_oids {
        buf.put_u32(*oid);
    }
    buf.end_message();
}

pub fn bind(buf: &mut WriteBuffer, portal: &str, statement: &str, params: &[Parameter]) {
    buf.begin_message(b'B');
    buf.put_cstr(portal);
    buf.put_cstr(statement);
    // Per-parameter format codes.
    buf.put_i16(params.len() as i16);
    for param in params {
        buf.put_i16(param.format.code());
    }
    buf.put_i16(params.len() as i16);
    for param in params {
        match &param.value {
            Some(value) => {
                buf.put_i32(value.len() as i32);
                buf.put_slice(value);
            }
            None => buf.put_i32(-1),
        }
    }
    // All result columns in one format.
    buf.put_i16(1);
    buf.put_i16(WireFormat::Text.code());
    buf.end_message();
}

pub fn describe_statement(buf: &mut WriteBuffer, statement: &str) {
    buf.begin_message(b'D');
    buf.put_u8(b'S');
    buf.put_cstr(statement);
    buf.end_message();
}

pub fn describe_portal(buf: &mut WriteBuffer, portal: &str) {
    buf.begin_message(b'D');
    buf.put_u8(b'P');
    buf.put_cstr(portal);
    buf.end_message();
}

/// `max_rows` of zero fetches until completion.
pub fn execute(buf: &mut WriteBuffer, portal: &str, max_rows: i32) {
    buf.begin_message(b'E');
    buf.put_cstr(portal);
    buf.put_i32(max_rows);
    buf.end_message();
}

pub fn sync(buf: &mut WriteBuffer) {
    buf.begin_message(b'S');
    buf.end_message();
}

pub fn flush_request(buf: &mut WriteBuffer) {
    buf.begin_message(b'H');
    buf.end_message();
}

pub fn close_statement(buf: &mut WriteBuffer, statement: &str) {
    buf.begin_message(b'C');
    buf.put_u8(b'S');
    buf.put_cstr(statement);
    buf.end_message();
}

pub fn close_portal(buf: &mut WriteBuffer, portal: &str) {
    buf.begin_message(b'C');
    buf.put_u8(b'P');
    buf.put_cstr(portal);
    buf.end_message();
}

pub fn copy_data(buf: &mut WriteBuffer, chunk: &[u8]) {
    buf.begin_message(b'd');
    buf.put_slice(chunk);
    buf.end_message();
}

pub fn copy_done(buf: &mut WriteBuffer) {
    buf.begin_message(b'c');
    buf.end_message();
}

pub fn copy_fail(buf: &mut WriteBuffer, reason: &str) {
    buf.begin_message(b'f');
    buf.put_cstr(reason);
    buf.end_message();
}

pub fn terminate(buf: &mut WriteBuffer) {
    buf.begin_message(b'X');
    buf.end_message();
}

/// Standalone Terminate for best-effort shutdown outside the buffer path.
pub fn terminate_packet() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'X');
    bytes.put_i32(4);
    bytes
}

/// Standby status update, sent inside CopyData while replicating.
/// `timestamp` is microseconds since the PostgreSQL epoch (2000-01-01).
pub fn standby_status_update(
    buf: &mut WriteBuffer,
    received: Lsn,
    flushed: Lsn,
    applied: Lsn,
    timestamp: i64,
    reply_requested: bool,
) {
    buf.begin_message(b'd');
    buf.put_u8(b'r');
    buf.put_i64(received.0 as i64);
    buf.put_i64(flushed.0 as i64);
    buf.put_i64(applied.0 as i64);
    buf.put_i64(timestamp);
    buf.put_u8(reply_requested as u8);
    buf.end_message();
}
