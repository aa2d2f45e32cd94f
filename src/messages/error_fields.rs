//! Field-tagged bag shared by ErrorResponse and NoticeResponse.

use bytes::BytesMut;

use crate::errors::Error;
use crate::messages::buffer::BodyReader;

/// Parsed fields of an `E` or `N` message. `severity` prefers the
/// non-localized `V` field when the server sends one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    /// sqlstate
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub where_context: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

impl ErrorFields {
    /// Parse the field list: repeated (tag byte, nul-terminated value) pairs
    /// closed by a zero byte.
    pub fn parse(body: &mut BytesMut) -> Result<ErrorFields, Error> {
        let mut fields = ErrorFields::default();
        let mut localized_severity = None;

        loop {
            let tag = body.read_u8()?;
            if tag == 0 {
                break;
            }
            let value = body.read_cstring()?;
            match tag {
                b'S' => localized_severity = Some(value),
                b'V' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = value.parse().ok(),
                b'W' => fields.where_context = Some(value),
                b's' => fields.schema = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                b'd' => fields.data_type = Some(value),
                b'n' => fields.constraint = Some(value),
                b'F' => fields.file = Some(value),
                b'L' => fields.line = value.parse().ok(),
                b'R' => fields.routine = Some(value),
                // 'p', 'q' and anything newer: skip, fields are optional
                _ => {}
            }
        }

        if fields.severity.is_empty() {
            fields.severity = localized_severity.unwrap_or_else(|| "ERROR".to_string());
        }
        if fields.message.is_empty() {
            return Err(Error::protocol("error message without an M field"));
        }
        Ok(fields)
    }

    /// Fatal severities break the session.
    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL" || self.severity == "PANIC"
    }
}
