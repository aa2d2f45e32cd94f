//! Backend message decoders.
//!
//! Every message is one variant of [`BackendMessage`]; dispatch is a match on
//! the tag byte. Decoders consume exactly the declared length. `DataRow` and
//! `CopyData` keep their raw bodies so column payloads are never copied until
//! a caller asks for them.

use bytes::{Buf, BytesMut};

use crate::errors::Error;
use crate::messages::buffer::BodyReader;
use crate::messages::error_fields::ErrorFields;
use crate::messages::{
    AUTHENTICATION_CLEARTEXT_PASSWORD, AUTHENTICATION_GAUSS_PASSWORD, AUTHENTICATION_GSS,
    AUTHENTICATION_GSS_CONTINUE, AUTHENTICATION_MD5_PASSWORD, AUTHENTICATION_OK,
    AUTHENTICATION_SASL, AUTHENTICATION_SASL_CONTINUE, AUTHENTICATION_SASL_FINAL,
    AUTHENTICATION_SSPI,
};
use crate::types::Lsn;

/// Transaction status byte carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`
    Idle,
    /// `T`
    InTransaction,
    /// `E`
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Result<TransactionStatus, Error> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::protocol(format!(
                "unknown transaction status {:?}",
                other as char
            ))),
        }
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    fn parse(body: &mut BytesMut) -> Result<RowDescription, Error> {
        let count = body.read_i16()?;
        let mut fields = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            fields.push(FieldDescription {
                name: body.read_cstring()?,
                table_oid: body.read_u32()?,
                column_attr: body.read_i16()?,
                type_oid: body.read_u32()?,
                type_size: body.read_i16()?,
                type_modifier: body.read_i32()?,
                format: body.read_i16()?,
            });
        }
        Ok(RowDescription { fields })
    }
}

/// A DataRow kept as its raw body; [`DataRow::columns`] walks the length
/// prefixes without copying values.
#[derive(Debug, Clone)]
pub struct DataRow {
    pub column_count: i16,
    body: BytesMut,
}

impl DataRow {
    fn parse(mut body: BytesMut) -> Result<DataRow, Error> {
        let column_count = body.read_i16()?;
        Ok(DataRow { column_count, body })
    }

    /// Column values in order; `None` is SQL NULL.
    pub fn columns(&self) -> Result<Vec<Option<&[u8]>>, Error> {
        let mut columns = Vec::with_capacity(self.column_count.max(0) as usize);
        let mut rest: &[u8] = &self.body;
        for _ in 0..self.column_count {
            if rest.len() < 4 {
                return Err(Error::protocol("data row truncated"));
            }
            let len = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            rest = &rest[4..];
            if len < 0 {
                columns.push(None);
            } else {
                let len = len as usize;
                if rest.len() < len {
                    return Err(Error::protocol("data row value truncated"));
                }
                columns.push(Some(&rest[..len]));
                rest = &rest[len..];
            }
        }
        Ok(columns)
    }
}

/// CopyInResponse / CopyOutResponse / CopyBothResponse payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResponse {
    /// 0 = text, 1 = binary.
    pub overall_format: u8,
    pub column_formats: Vec<i16>,
}

impl CopyResponse {
    fn parse(body: &mut BytesMut) -> Result<CopyResponse, Error> {
        let overall_format = body.read_u8()?;
        let count = body.read_i16()?;
        let mut column_formats = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            column_formats.push(body.read_i16()?);
        }
        Ok(CopyResponse {
            overall_format,
            column_formats,
        })
    }
}

/// Nested password-method code of the openGauss authentication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaussPasswordMethod {
    Md5,
    Sha256,
}

/// Authentication sub-messages, selected by the i32 code at the head of `R`.
#[derive(Debug, Clone)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password {
        salt: [u8; 4],
    },
    Gss,
    GssContinue {
        token: BytesMut,
    },
    Sspi,
    Sasl {
        mechanisms: Vec<String>,
    },
    SaslContinue {
        data: BytesMut,
    },
    SaslFinal {
        data: BytesMut,
    },
    /// openGauss RFC 5802 challenge: hex salt (64 chars), nonce token
    /// (8 chars) and PBKDF2 iteration count.
    GaussSha256 {
        method: GaussPasswordMethod,
        salt: String,
        token: String,
        iteration: i32,
    },
}

impl Authentication {
    fn parse(mut body: BytesMut) -> Result<Authentication, Error> {
        let code = body.read_i32()?;
        Ok(match code {
            AUTHENTICATION_OK => Authentication::Ok,
            AUTHENTICATION_CLEARTEXT_PASSWORD => Authentication::CleartextPassword,
            AUTHENTICATION_MD5_PASSWORD => {
                let salt = body.read_exact(4)?;
                Authentication::Md5Password {
                    salt: [salt[0], salt[1], salt[2], salt[3]],
                }
            }
            AUTHENTICATION_GSS => Authentication::Gss,
            AUTHENTICATION_GSS_CONTINUE => Authentication::GssContinue { token: body },
            AUTHENTICATION_SSPI => Authentication::Sspi,
            AUTHENTICATION_SASL => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 1 {
                    mechanisms.push(body.read_cstring()?);
                }
                Authentication::Sasl { mechanisms }
            }
            AUTHENTICATION_SASL_CONTINUE => Authentication::SaslContinue { data: body },
            AUTHENTICATION_SASL_FINAL => Authentication::SaslFinal { data: body },
            AUTHENTICATION_GAUSS_PASSWORD => {
                let method = match body.read_i32()? {
                    1 => GaussPasswordMethod::Md5,
                    2 => GaussPasswordMethod::Sha256,
                    other => {
                        return Err(Error::protocol(format!(
                            "unknown password method {other} in sha256 authentication request"
                        )))
                    }
                };
                let salt = String::from_utf8(body.read_exact(64)?.to_vec())
                    .map_err(|_| Error::protocol("sha256 salt is not utf-8"))?;
                let token = String::from_utf8(body.read_exact(8)?.to_vec())
                    .map_err(|_| Error::protocol("sha256 token is not utf-8"))?;
                let iteration = body.read_i32()?;
                Authentication::GaussSha256 {
                    method,
                    salt,
                    token,
                    iteration,
                }
            }
            other => {
                return Err(Error::protocol(format!(
                    "unsupported authentication code {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ParameterStatus {
        key: String,
        value: String,
    },
    ReadyForQuery(TransactionStatus),
    RowDescription(RowDescription),
    DataRow(DataRow),
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    CloseComplete,
    ParameterDescription {
        type_oids: Vec<u32>,
    },
    NoData,
    PortalSuspended,
    CopyInResponse(CopyResponse),
    CopyOutResponse(CopyResponse),
    CopyBothResponse(CopyResponse),
    CopyData(BytesMut),
    CopyDone,
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode one message from its tag and body.
    pub fn decode(tag: u8, mut body: BytesMut) -> Result<BackendMessage, Error> {
        Ok(match tag {
            b'R' => BackendMessage::Authentication(Authentication::parse(body)?),
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.read_i32()?,
                secret_key: body.read_i32()?,
            },
            b'S' => BackendMessage::ParameterStatus {
                key: body.read_cstring()?,
                value: body.read_cstring()?,
            },
            b'Z' => BackendMessage::ReadyForQuery(TransactionStatus::from_byte(body.read_u8()?)?),
            b'T' => BackendMessage::RowDescription(RowDescription::parse(&mut body)?),
            b'D' => BackendMessage::DataRow(DataRow::parse(body)?),
            b'C' => BackendMessage::CommandComplete {
                tag: body.read_cstring()?,
            },
            b'I' => BackendMessage::EmptyQueryResponse,
            b'E' => BackendMessage::ErrorResponse(ErrorFields::parse(&mut body)?),
            b'N' => BackendMessage::NoticeResponse(ErrorFields::parse(&mut body)?),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b't' => {
                let count = body.read_i16()?;
                let mut type_oids = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    type_oids.push(body.read_u32()?);
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b'G' => BackendMessage::CopyInResponse(CopyResponse::parse(&mut body)?),
            b'H' => BackendMessage::CopyOutResponse(CopyResponse::parse(&mut body)?),
            b'W' => BackendMessage::CopyBothResponse(CopyResponse::parse(&mut body)?),
            b'd' => BackendMessage::CopyData(body),
            b'c' => BackendMessage::CopyDone,
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.read_i32()?,
                channel: body.read_cstring()?,
                payload: body.read_cstring()?,
            },
            other => {
                return Err(Error::protocol(format!(
                    "unexpected message {:?} (0x{other:02x})",
                    other as char
                )))
            }
        })
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "Authentication",
            Self::BackendKeyData { .. } => "BackendKeyData",
            Self::ParameterStatus { .. } => "ParameterStatus",
            Self::ReadyForQuery(_) => "ReadyForQuery",
            Self::RowDescription(_) => "RowDescription",
            Self::DataRow(_) => "DataRow",
            Self::CommandComplete { .. } => "CommandComplete",
            Self::EmptyQueryResponse => "EmptyQueryResponse",
            Self::ErrorResponse(_) => "ErrorResponse",
            Self::NoticeResponse(_) => "NoticeResponse",
            Self::ParseComplete => "ParseComplete",
            Self::BindComplete => "BindComplete",
            Self::CloseComplete => "CloseComplete",
            Self::ParameterDescription { .. } => "ParameterDescription",
            Self::NoData => "NoData",
            Self::PortalSuspended => "PortalSuspended",
            Self::CopyInResponse(_) => "CopyInResponse",
            Self::CopyOutResponse(_) => "CopyOutResponse",
            Self::CopyBothResponse(_) => "CopyBothResponse",
            Self::CopyData(_) => "CopyData",
            Self::CopyDone => "CopyDone",
            Self::NotificationResponse { .. } => "NotificationResponse",
        }
    }
}

/// Replication sub-stream messages carried inside CopyData after
/// START_REPLICATION.
#[derive(Debug, Clone)]
pub enum ReplicationMessage {
    /// `w`: a WAL segment.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        /// Microseconds since the PostgreSQL epoch.
        timestamp: i64,
        data: BytesMut,
    },
    /// `k`: primary keepalive, possibly demanding an immediate status update.
    PrimaryKeepalive {
        wal_end: Lsn,
        timestamp: i64,
        reply_requested: bool,
    },
}

impl ReplicationMessage {
    pub fn decode(mut body: BytesMut) -> Result<ReplicationMessage, Error> {
        let tag = body.read_u8()?;
        Ok(match tag {
            b'w' => ReplicationMessage::XLogData {
                wal_start: Lsn(body.read_i64()? as u64),
                wal_end: Lsn(body.read_i64()? as u64),
                timestamp: body.read_i64()?,
                data: body,
            },
            b'k' => ReplicationMessage::PrimaryKeepalive {
                wal_end: Lsn(body.read_i64()? as u64),
                timestamp: body.read_i64()?,
                reply_requested: body.read_u8()? != 0,
            },
            other => {
                return Err(Error::protocol(format!(
                    "unexpected replication message {:?}",
                    other as char
                )))
            }
        })
    }
}

/// One column of a logical-replication tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// TOASTed value that did not change.
    Unchanged,
    Text(BytesMut),
    Binary(BytesMut),
}

fn parse_tuple(body: &mut BytesMut) -> Result<Vec<TupleValue>, Error> {
    let count = body.read_i16()?;
    let mut values = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        values.push(match body.read_u8()? {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Unchanged,
            b't' => {
                let len = body.read_i32()?;
                TupleValue::Text(body.read_exact(len.max(0) as usize)?)
            }
            b'b' => {
                let len = body.read_i32()?;
                TupleValue::Binary(body.read_exact(len.max(0) as usize)?)
            }
            other => {
                return Err(Error::protocol(format!(
                    "unknown tuple value kind {:?}",
                    other as char
                )))
            }
        });
    }
    Ok(values)
}

/// A column of a logical-replication Relation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub key_part: bool,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

/// The logical-replication sub-stream, carried inside XLogData payloads of a
/// logical slot.
#[derive(Debug, Clone)]
pub enum LogicalReplicationMessage {
    Begin {
        final_lsn: Lsn,
        timestamp: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        timestamp: i64,
    },
    Origin {
        commit_lsn: Lsn,
        name: String,
    },
    Relation {
        relation_id: u32,
        namespace: String,
        name: String,
        replica_identity: u8,
        columns: Vec<RelationColumn>,
    },
    Type {
        type_oid: u32,
        namespace: String,
        name: String,
    },
    Insert {
        relation_id: u32,
        tuple: Vec<TupleValue>,
    },
    Update {
        relation_id: u32,
        /// Present when the relation's replica identity includes old values;
        /// tagged `K` (key) or `O` (old row) on the wire.
        old_tuple: Option<Vec<TupleValue>>,
        new_tuple: Vec<TupleValue>,
    },
    Delete {
        relation_id: u32,
        old_tuple: Vec<TupleValue>,
    },
    Truncate {
        options: u8,
        relation_ids: Vec<u32>,
    },
}

impl LogicalReplicationMessage {
    pub fn decode(mut body: BytesMut) -> Result<LogicalReplicationMessage, Error> {
        let tag = body.read_u8()?;
        Ok(match tag {
            b'B' => LogicalReplicationMessage::Begin {
                final_lsn: Lsn(body.read_i64()? as u64),
                timestamp: body.read_i64()?,
                xid: body.read_u32()?,
            },
            b'C' => LogicalReplicationMessage::Commit {
                flags: body.read_u8()?,
                commit_lsn: Lsn(body.read_i64()? as u64),
                end_lsn: Lsn(body.read_i64()? as u64),
                timestamp: body.read_i64()?,
            },
            b'O' => LogicalReplicationMessage::Origin {
                commit_lsn: Lsn(body.read_i64()? as u64),
                name: body.read_cstring()?,
            },
            b'R' => {
                let relation_id = body.read_u32()?;
                let namespace = body.read_cstring()?;
                let name = body.read_cstring()?;
                let replica_identity = body.read_u8()?;
                let count = body.read_i16()?;
                let mut columns = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    columns.push(RelationColumn {
                        key_part: body.read_u8()? == 1,
                        name: body.read_cstring()?,
                        type_oid: body.read_u32()?,
                        type_modifier: body.read_i32()?,
                    });
                }
                LogicalReplicationMessage::Relation {
                    relation_id,
                    namespace,
                    name,
                    replica_identity,
                    columns,
                }
            }
            b'Y' => LogicalReplicationMessage::Type {
                type_oid: body.read_u32()?,
                namespace: body.read_cstring()?,
                name: body.read_cstring()?,
            },
            b'I' => {
                let relation_id = body.read_u32()?;
                let kind = body.read_u8()?;
                if kind != b'N' {
                    return Err(Error::protocol("insert without a new tuple"));
                }
                LogicalReplicationMessage::Insert {
                    relation_id,
                    tuple: parse_tuple(&mut body)?,
                }
            }
            b'U' => {
                let relation_id = body.read_u32()?;
                let mut old_tuple = None;
                let mut kind = body.read_u8()?;
                if kind == b'K' || kind == b'O' {
                    old_tuple = Some(parse_tuple(&mut body)?);
                    kind = body.read_u8()?;
                }
                if kind != b'N' {
                    return Err(Error::protocol("update without a new tuple"));
                }
                LogicalReplicationMessage::Update {
                    relation_id,
                    old_tuple,
                    new_tuple: parse_tuple(&mut body)?,
                }
            }
            b'D' => {
                let relation_id = body.read_u32()?;
                let kind = body.read_u8()?;
                if kind != b'K' && kind != b'O' {
                    return Err(Error::protocol("delete without an old tuple"));
                }
                LogicalReplicationMessage::Delete {
                    relation_id,
                    old_tuple: parse_tuple(&mut body)?,
                }
            }
            b'T' => {
                let count = body.read_i32()?;
                let options = body.read_u8()?;
                let mut relation_ids = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    relation_ids.push(body.read_u32()?);
                }
                LogicalReplicationMessage::Truncate {
                    options,
                    relation_ids,
                }
            }
            other => {
                return Err(Error::protocol(format!(
                    "unknown logical replication message {:?}",
                    other as char
                )))
            }
        })
    }
}
