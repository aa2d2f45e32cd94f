//! Authentication flows: cleartext, MD5, SCRAM-SHA-256 and the openGauss
//! SHA-256 exchange. GSS/SSPI rides through as opaque tokens from an injected
//! provider.

use md5::{Digest, Md5};

pub mod scram;
pub mod sha256;

pub use scram::ScramSha256;

#[cfg(test)]
mod tests;

use std::fmt::{self, Display};

/// Authentication method requested by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Cleartext,
    Md5,
    ScramSha256,
    GaussSha256,
    Gss,
    Sspi,
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cleartext => "cleartext password",
            Self::Md5 => "MD5-encrypted password",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::GaussSha256 => "SHA-256",
            Self::Gss => "GSS",
            Self::Sspi => "SSPI",
        })
    }
}

/// A credential-level failure, wrapped into `Error::AuthenticationFailed`
/// with the server identifier by the connector.
#[derive(Debug)]
pub struct AuthFailure(pub String);

impl AuthFailure {
    pub fn new(reason: impl Into<String>) -> AuthFailure {
        AuthFailure(reason.into())
    }
}

impl Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque GSS/SSPI token exchange. The driver never inspects token contents;
/// it forwards blobs between this provider and AuthenticationGSSContinue
/// messages until the provider reports completion.
pub trait GssTokenSource: Send {
    /// Produce the next outgoing token. `server_token` is `None` for the
    /// first step. Returning `None` ends the exchange on the client side.
    fn step(&mut self, server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, AuthFailure>;
}

/// Cleartext password payload: nul-terminated UTF-8.
pub fn cleartext_payload(password: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(password.len() + 1);
    payload.extend_from_slice(password.as_bytes());
    payload.push(0);
    payload
}

/// Look a password up in a pgpass-style file: colon-separated
/// `host:port:database:user:password` lines, `*` matching anything,
/// `#` starting a comment.
pub async fn lookup_passfile(
    path: &str,
    host: &str,
    port: u16,
    database: &str,
    username: &str,
) -> Option<String> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) => {
            log::warn!("could not read Passfile {path}: {err}");
            return None;
        }
    };
    let port = port.to_string();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.splitn(5, ':').collect();
        if fields.len() != 5 {
            continue;
        }
        let matches = |pattern: &str, value: &str| pattern == "*" || pattern == value;
        if matches(fields[0], host)
            && matches(fields[1], &port)
            && matches(fields[2], database)
            && matches(fields[3], username)
        {
            return Some(fields[4].to_string());
        }
    }
    None
}

/// MD5 payload: `md5` followed by the lowercase hex of
/// `md5(md5(password ++ user) ++ salt)`, nul-terminated.
pub fn md5_payload(user: &str, password: &str, salt: &[u8; 4]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let inner = md5.finalize_reset();

    md5.update(format!("{inner:x}"));
    md5.update(salt);
    let outer = md5.finalize();

    let mut payload = Vec::with_capacity(3 + 32 + 1);
    payload.extend_from_slice(b"md5");
    payload.extend_from_slice(format!("{outer:x}").as_bytes());
    payload.push(0);
    payload
}
