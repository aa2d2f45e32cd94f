//! SCRAM-SHA-256 client (RFC 5802/7677, no channel binding).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::auth::AuthFailure;

type HmacSha256 = Hmac<Sha256>;

const NONCE_BYTES: usize = 18;
/// base64 of the `n,,` gs2 header.
const CHANNEL_BINDING: &str = "biws";

enum State {
    Initial,
    SentClientFirst { client_first_bare: String },
    SentClientFinal { server_signature: Vec<u8> },
    Finished,
}

/// Drives the three-message SCRAM exchange. The connector feeds it
/// SASLContinue/SASLFinal payloads and writes whatever it returns.
pub struct ScramSha256 {
    password: String,
    nonce: String,
    state: State,
}

impl ScramSha256 {
    pub fn new(password: &str) -> ScramSha256 {
        // saslprep failure falls back to the raw password, which matches the
        // server's treatment of non-normalizable strings.
        let password = stringprep::saslprep(password)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| password.to_string());
        let nonce = BASE64.encode(rand::random::<[u8; NONCE_BYTES]>());
        ScramSha256 {
            password,
            nonce,
            state: State::Initial,
        }
    }

    #[cfg(test)]
    fn with_nonce(password: &str, nonce: &str) -> ScramSha256 {
        ScramSha256 {
            password: password.to_string(),
            nonce: nonce.to_string(),
            state: State::Initial,
        }
    }

    /// `client-first-message`, the SASLInitialResponse payload.
    pub fn client_first(&mut self) -> Vec<u8> {
        let client_first_bare = format!("n=,r={}", self.nonce);
        let message = format!("n,,{client_first_bare}");
        self.state = State::SentClientFirst { client_first_bare };
        message.into_bytes()
    }

    /// Handle `server-first-message`, producing `client-final-message`.
    pub fn continue_exchange(&mut self, server_first: &[u8]) -> Result<Vec<u8>, AuthFailure> {
        let client_first_bare = match &self.state {
            State::SentClientFirst { client_first_bare } => client_first_bare.clone(),
            _ => return Err(AuthFailure::new("server-first message out of order")),
        };

        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| AuthFailure::new("server-first message is not utf-8"))?;

        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => server_nonce = Some(v.to_string()),
                Some(("s", v)) => {
                    salt = Some(
                        BASE64
                            .decode(v)
                            .map_err(|_| AuthFailure::new("salt is not valid base64"))?,
                    )
                }
                Some(("i", v)) => {
                    iterations = Some(
                        v.parse::<u32>()
                            .map_err(|_| AuthFailure::new("iteration count is not a number"))?,
                    )
                }
                _ => {}
            }
        }
        let server_nonce = server_nonce.ok_or_else(|| AuthFailure::new("missing server nonce"))?;
        let salt = salt.ok_or_else(|| AuthFailure::new("missing salt"))?;
        let iterations = iterations.ok_or_else(|| AuthFailure::new("missing iteration count"))?;

        if !server_nonce.starts_with(&self.nonce) {
            return Err(AuthFailure::new("server nonce does not extend client nonce"));
        }
        if iterations == 0 {
            return Err(AuthFailure::new("iteration count must be positive"));
        }

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let client_final_without_proof = format!("c={CHANNEL_BINDING},r={server_nonce}");
        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");

        let client_signature = hmac(stored_key.as_slice(), auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted_password, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());

        self.state = State::SentClientFinal { server_signature };

        Ok(format!("{client_final_without_proof},p={}", BASE64.encode(proof)).into_bytes())
    }

    /// Verify `server-final-message`.
    pub fn finish(&mut self, server_final: &[u8]) -> Result<(), AuthFailure> {
        let expected = match &self.state {
            State::SentClientFinal { server_signature } => server_signature.clone(),
            _ => return Err(AuthFailure::new("server-final message out of order")),
        };

        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| AuthFailure::new("server-final message is not utf-8"))?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(AuthFailure::new(format!("server rejected proof: {err}")));
        }
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or_else(|| AuthFailure::new("missing server verifier"))?;
        let verifier = BASE64
            .decode(verifier)
            .map_err(|_| AuthFailure::new("server verifier is not valid base64"))?;

        if verifier != expected {
            return Err(AuthFailure::new("server signature mismatch"));
        }
        self.state = State::Finished;
        Ok(())
    }
}

pub(crate) fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// PBKDF2-HMAC-SHA256, the `Hi` function of RFC 5802.
pub(crate) fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &block);
    let mut result = u.clone();
    for _ in 1..iterations {
        u = hmac(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known PBKDF2-HMAC-SHA256 vectors (password "password", salt "salt").
    #[test]
    fn hi_matches_pbkdf2_vectors() {
        let one = hi(b"password", b"salt", 1);
        assert_eq!(
            one,
            [
                0x12, 0x0f, 0xb6, 0xcf, 0xfc, 0xf8, 0xb3, 0x2c, 0x43, 0xe7, 0x22, 0x52, 0x56,
                0xc4, 0xf8, 0x37, 0xa8, 0x65, 0x48, 0xc9, 0x2c, 0xcc, 0x35, 0x48, 0x08, 0x05,
                0x98, 0x7c, 0xb7, 0x0b, 0xe1, 0x7b,
            ]
        );
        let many = hi(b"password", b"salt", 4096);
        assert_eq!(
            many,
            [
                0xc5, 0xe4, 0x78, 0xd5, 0x92, 0x88, 0xc8, 0x41, 0xaa, 0x53, 0x0d, 0xb6, 0x84,
                0x5c, 0x4c, 0x8d, 0x96, 0x28, 0x93, 0xa0, 0x01, 0xce, 0x4e, 0x11, 0xa4, 0x96,
                0x38, 0x73, 0xaa, 0x98, 0x13, 0x4a,
            ]
        );
    }

    /// Run the server side of the exchange against the client and verify the
    /// proof exactly the way a server does: recover ClientKey from the proof
    /// and check its hash against StoredKey.
    #[test]
    fn full_exchange_verifies_like_a_server() {
        let password = "pencil";
        let salt = b"0123456789abcdef";
        let iterations = 4096;

        let mut scram = ScramSha256::with_nonce(password, "rOprNGfwEbeRWgbNEkqO");
        let client_first = String::from_utf8(scram.client_first()).unwrap();
        assert_eq!(client_first, "n,,n=,r=rOprNGfwEbeRWgbNEkqO");
        let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_string();

        let server_nonce = "rOprNGfwEbeRWgbNEkqOserverside";
        let server_first = format!(
            "r={server_nonce},s={},i={iterations}",
            BASE64.encode(salt)
        );
        let client_final =
            String::from_utf8(scram.continue_exchange(server_first.as_bytes()).unwrap()).unwrap();

        let (without_proof, proof) = client_final.rsplit_once(",p=").unwrap();
        assert_eq!(without_proof, format!("c=biws,r={server_nonce}"));
        let proof = BASE64.decode(proof).unwrap();

        let salted_password = hi(password.as_bytes(), salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
        let client_signature = hmac(stored_key.as_slice(), auth_message.as_bytes());

        let recovered_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        assert_eq!(Sha256::digest(&recovered_key).as_slice(), stored_key.as_slice());

        let server_key = hmac(&salted_password, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64.encode(server_signature));
        scram.finish(server_final.as_bytes()).unwrap();
    }

    #[test]
    fn rejects_nonce_truncation() {
        let mut scram = ScramSha256::with_nonce("pencil", "clientnonce");
        scram.client_first();
        let err = scram
            .continue_exchange(b"r=differentnonce,s=c2FsdA==,i=4096")
            .unwrap_err();
        assert!(err.0.contains("nonce"));
    }

    #[test]
    fn rejects_bad_server_signature() {
        let mut scram = ScramSha256::with_nonce("pencil", "abc");
        scram.client_first();
        scram
            .continue_exchange(b"r=abcdef,s=c2FsdA==,i=1")
            .unwrap();
        assert!(scram.finish(b"v=AAAA").is_err());
    }

    #[test]
    fn surfaces_server_error() {
        let mut scram = ScramSha256::with_nonce("pencil", "abc");
        scram.client_first();
        scram
            .continue_exchange(b"r=abcdef,s=c2FsdA==,i=1")
            .unwrap();
        let err = scram.finish(b"e=invalid-proof").unwrap_err();
        assert!(err.0.contains("invalid-proof"));
    }
}
