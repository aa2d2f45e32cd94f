//! Buffered frame codec over a byte stream.
//!
//! Backend messages are a 1-byte tag followed by a 4-byte big-endian length
//! that includes the length field itself. The codec fills and drains owned
//! buffers; it never interprets message semantics.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::Error;
use crate::messages::MAX_MESSAGE_SIZE;

/// Read side: a fill buffer ahead of the protocol cursor.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: BytesMut,
    capacity: usize,
    bytes_read: u64,
}

impl ReadBuffer {
    pub fn new(capacity: usize) -> ReadBuffer {
        ReadBuffer {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            bytes_read: 0,
        }
    }

    /// Unread bytes currently buffered.
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes pulled off the socket since creation.
    #[inline(always)]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Guarantee at least `n` unread bytes are buffered, reading from the
    /// stream as needed. EOF mid-message breaks the connection.
    pub async fn ensure<S>(&mut self, stream: &mut S, n: usize) -> Result<(), Error>
    where
        S: AsyncRead + Unpin,
    {
        while self.buf.len() < n {
            let wanted = n - self.buf.len();
            if self.buf.capacity() - self.buf.len() < wanted {
                self.buf.reserve(wanted.max(self.capacity));
            }
            let read = stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|err| Error::broken_io("read from server socket", err))?;
            if read == 0 {
                return Err(Error::Broken(
                    "server closed the connection mid-message".into(),
                ));
            }
            self.bytes_read += read as u64;
        }
        Ok(())
    }

    /// Read the tag and inclusive length of the next message.
    pub async fn read_message_header<S>(&mut self, stream: &mut S) -> Result<(u8, i32), Error>
    where
        S: AsyncRead + Unpin,
    {
        self.ensure(stream, 5).await?;
        let tag = self.buf.get_u8();
        let len = self.buf.get_i32();
        if len < 4 {
            return Err(Error::protocol(format!(
                "message {:?} declares length {len}, minimum is 4",
                tag as char
            )));
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::protocol(format!(
                "message {:?} declares length {len}, cap is {MAX_MESSAGE_SIZE}",
                tag as char
            )));
        }
        Ok((tag, len))
    }

    /// Read a whole message; the returned body is exactly `len - 4` bytes.
    pub async fn read_message<S>(&mut self, stream: &mut S) -> Result<(u8, BytesMut), Error>
    where
        S: AsyncRead + Unpin,
    {
        let (tag, len) = self.read_message_header(stream).await?;
        let body_len = (len - 4) as usize;
        self.ensure(stream, body_len).await?;
        Ok((tag, self.buf.split_to(body_len)))
    }

    /// Read exactly `n` raw bytes (used by the TLS `S`/`N` response, which is
    /// the one unframed byte in the protocol).
    pub async fn read_raw<S>(&mut self, stream: &mut S, n: usize) -> Result<BytesMut, Error>
    where
        S: AsyncRead + Unpin,
    {
        self.ensure(stream, n).await?;
        Ok(self.buf.split_to(n))
    }
}

/// Write side: frontend messages accumulate here until flushed. Tagged
/// messages are opened with [`WriteBuffer::begin_message`] and closed with
/// [`WriteBuffer::end_message`], which back-patches the length field.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: BytesMut,
    capacity: usize,
    message_start: Option<usize>,
    bytes_flushed: u64,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> WriteBuffer {
        WriteBuffer {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            message_start: None,
            bytes_flushed: 0,
        }
    }

    #[inline(always)]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes flushed to the socket since creation.
    #[inline(always)]
    pub fn bytes_flushed(&self) -> u64 {
        self.bytes_flushed
    }

    /// Open a tagged message. The length is patched in on `end_message`.
    pub fn begin_message(&mut self, tag: u8) {
        debug_assert!(self.message_start.is_none(), "message already open");
        self.buf.put_u8(tag);
        self.message_start = Some(self.buf.len());
        self.buf.put_i32(0);
    }

    /// Close the open message, back-patching its inclusive length.
    pub fn end_message(&mut self) {
        let start = self.message_start.take().expect("no open message");
        let len = (self.buf.len() - start) as i32;
        self.buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    #[inline(always)]
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    #[inline(always)]
    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    #[inline(always)]
    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    #[inline(always)]
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    #[inline(always)]
    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    #[inline(always)]
    pub fn put_slice(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// NUL-terminated string.
    pub fn put_cstr(&mut self, v: &str) {
        self.buf.put_slice(v.as_bytes());
        self.buf.put_u8(0);
    }

    /// Flush everything buffered to the stream.
    pub async fn flush<S>(&mut self, stream: &mut S) -> Result<(), Error>
    where
        S: AsyncWrite + Unpin,
    {
        debug_assert!(self.message_start.is_none(), "flush with open message");
        if self.buf.is_empty() {
            return Ok(());
        }
        stream
            .write_all(&self.buf)
            .await
            .map_err(|err| Error::broken_io("write to server socket", err))?;
        stream
            .flush()
            .await
            .map_err(|err| Error::broken_io("flush server socket", err))?;
        self.bytes_flushed += self.buf.len() as u64;
        if self.buf.capacity() > self.capacity * 2 {
            self.buf = BytesMut::with_capacity(self.capacity);
        } else {
            self.buf.clear();
        }
        Ok(())
    }

    /// Direct-write path for payloads larger than the buffer: flush what is
    /// pending, then write the payload straight to the socket.
    pub async fn write_direct<S>(&mut self, stream: &mut S, payload: &[u8]) -> Result<(), Error>
    where
        S: AsyncWrite + Unpin,
    {
        self.flush(stream).await?;
        stream
            .write_all(payload)
            .await
            .map_err(|err| Error::broken_io("write payload to server socket", err))?;
        stream
            .flush()
            .await
            .map_err(|err| Error::broken_io("flush server socket", err))?;
        self.bytes_flushed += payload.len() as u64;
        Ok(())
    }

    /// Append an already-encoded message verbatim.
    pub fn put_encoded(&mut self, bytes: &[u8]) {
        debug_assert!(self.message_start.is_none(), "message already open");
        self.buf.put_slice(bytes);
    }
}

/// Cursor helpers over a decoded message body. Decoders consume exactly the
/// declared length; anything short is a protocol violation.
pub trait BodyReader {
    fn read_u8(&mut self) -> Result<u8, Error>;
    fn read_i16(&mut self) -> Result<i16, Error>;
    fn read_i32(&mut self) -> Result<i32, Error>;
    fn read_u32(&mut self) -> Result<u32, Error>;
    fn read_i64(&mut self) -> Result<i64, Error>;
    fn read_cstring(&mut self) -> Result<String, Error>;
    fn read_exact(&mut self, n: usize) -> Result<BytesMut, Error>;
}

impl BodyReader for BytesMut {
    fn read_u8(&mut self) -> Result<u8, Error> {
        if self.remaining() < 1 {
            return Err(Error::protocol("message body truncated reading u8"));
        }
        Ok(self.get_u8())
    }

    fn read_i16(&mut self) -> Result<i16, Error> {
        if self.remaining() < 2 {
            return Err(Error::protocol("message body truncated reading i16"));
        }
        Ok(self.get_i16())
    }

    fn read_i32(&mut self) -> Result<i32, Error> {
        if self.remaining() < 4 {
            return Err(Error::protocol("message body truncated reading i32"));
        }
        Ok(self.get_i32())
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        if self.remaining() < 4 {
            return Err(Error::protocol("message body truncated reading u32"));
        }
        Ok(self.get_u32())
    }

    fn read_i64(&mut self) -> Result<i64, Error> {
        if self.remaining() < 8 {
            return Err(Error::protocol("message body truncated reading i64"));
        }
        Ok(self.get_i64())
    }

    fn read_cstring(&mut self) -> Result<String, Error> {
        let Some(nul) = self.iter().position(|b| *b == 0) else {
            return Err(Error::protocol("string is not nul-terminated"));
        };
        let bytes = self.split_to(nul);
        self.advance(1);
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::protocol("string is not valid utf-8"))
    }

    fn read_exact(&mut self, n: usize) -> Result<BytesMut, Error> {
        if self.remaining() < n {
            return Err(Error::protocol(format!(
                "message body truncated reading {n} bytes"
            )));
        }
        Ok(self.split_to(n))
    }
}
