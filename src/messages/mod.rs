//! Wire protocol: frame codec, frontend encoders, backend decoders.

use bytes::Bytes;

pub mod backend;
pub mod buffer;
pub mod error_fields;
pub mod frontend;

pub use backend::{
    Authentication, BackendMessage, CopyResponse, DataRow, FieldDescription, GaussPasswordMethod,
    LogicalReplicationMessage, RelationColumn, ReplicationMessage, RowDescription,
    TransactionStatus, TupleValue,
};
pub use buffer::{ReadBuffer, WriteBuffer};
pub use error_fields::ErrorFields;


/// Hard cap on a single backend message; lengths beyond this are treated as
/// stream corruption rather than allocated.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608;
/// Magic "version" of the SSLRequest packet.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// Magic "version" of the CancelRequest packet.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Authentication-type codes inside the `R` message.
pub const AUTHENTICATION_OK: i32 = 0;
pub const AUTHENTICATION_CLEARTEXT_PASSWORD: i32 = 3;
pub const AUTHENTICATION_MD5_PASSWORD: i32 = 5;
pub const AUTHENTICATION_GSS: i32 = 7;
pub const AUTHENTICATION_GSS_CONTINUE: i32 = 8;
pub const AUTHENTICATION_SSPI: i32 = 9;
pub const AUTHENTICATION_SASL: i32 = 10;
pub const AUTHENTICATION_SASL_CONTINUE: i32 = 11;
pub const AUTHENTICATION_SASL_FINAL: i32 = 12;
/// openGauss extension: RFC 5802 challenge with a nested password-method code.
pub const AUTHENTICATION_GAUSS_PASSWORD: i32 = 13;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Wire format of a parameter or column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Text,
    Binary,
}

impl WireFormat {
    pub fn code(&self) -> i16 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
        }
    }
}

/// One bound parameter: a type OID plus an already-encoded value. Encoding and
/// decoding of concrete types happens outside the core; the wire layer only
/// moves tagged bytes.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub oid: u32,
    pub format: WireFormat,
    /// `None` is SQL NULL.
    pub value: Option<Bytes>,
}

impl Parameter {
    pub fn text(oid: u32, value: impl Into<Bytes>) -> Parameter {
        Parameter {
            oid,
            format: WireFormat::Text,
            value: Some(value.into()),
        }
    }

    pub fn null(oid: u32) -> Parameter {
        Parameter {
            oid,
            format: WireFormat::Text,
            value: None,
        }
    }

    pub fn wire_len(&self) -> usize {
        4 + self.value.as_ref().map_or(0, |v| v.len())
    }
}
