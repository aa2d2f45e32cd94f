//! openGauss SHA-256 password exchange (RFC 5802 with a single challenge).
//!
//! The server sends one authentication request carrying a 64-character hex
//! salt, an 8-character nonce token and a PBKDF2 iteration count. The client
//! answers with `hex(HMAC(StoredKey, token) XOR ClientKey)` and the server
//! closes with AuthenticationOk or an ErrorResponse.

use sha2::{Digest, Sha256};

use crate::auth::scram::{hi, hmac};
use crate::auth::AuthFailure;

/// Derive the proof for an openGauss SHA-256 challenge.
pub fn sha256_proof(
    password: &str,
    salt_hex: &str,
    token: &str,
    iteration: i32,
) -> Result<Vec<u8>, AuthFailure> {
    if iteration <= 0 {
        return Err(AuthFailure::new("iteration count must be positive"));
    }
    let salt = decode_hex(salt_hex)
        .ok_or_else(|| AuthFailure::new("challenge salt is not valid hex"))?;

    let k = hi(password.as_bytes(), &salt, iteration as u32);
    let client_key = hmac(&k, b"Client Key");
    let stored_key = Sha256::digest(&client_key);
    let signature = hmac(stored_key.as_slice(), token.as_bytes());

    let proof: Vec<u8> = signature
        .iter()
        .zip(client_key.iter())
        .map(|(s, c)| s ^ c)
        .collect();

    Ok(encode_hex(&proof).into_bytes())
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &str = "6bd3e6a5978fe66b4e95ed9cb8c41c636ade87a1e77bb92b56156dba7e4d2b04";

    #[test]
    fn proof_is_deterministic_hex() {
        let proof = sha256_proof("gauss@123", SALT, "12345678", 10000).unwrap();
        let text = String::from_utf8(proof.clone()).unwrap();
        assert_eq!(text.len(), 64);
        assert!(text.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(proof, sha256_proof("gauss@123", SALT, "12345678", 10000).unwrap());
    }

    /// Verify the proof the way the server does: XOR it with
    /// HMAC(StoredKey, token) to recover ClientKey, then hash-compare.
    #[test]
    fn proof_recovers_client_key() {
        let password = "secret";
        let token = "abcdefgh";
        let iteration = 2048;

        let proof = sha256_proof(password, SALT, token, iteration).unwrap();
        let proof = decode_hex(std::str::from_utf8(&proof).unwrap()).unwrap();

        let salt = decode_hex(SALT).unwrap();
        let k = hi(password.as_bytes(), &salt, iteration as u32);
        let client_key = hmac(&k, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let signature = hmac(stored_key.as_slice(), token.as_bytes());

        let recovered: Vec<u8> = proof
            .iter()
            .zip(signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        assert_eq!(recovered, client_key);
    }

    #[test]
    fn rejects_bad_salt_and_iteration() {
        assert!(sha256_proof("p", "zz", "t", 1).is_err());
        assert!(sha256_proof("p", "abc", "t", 1).is_err());
        assert!(sha256_proof("p", SALT, "t", 0).is_err());
        assert!(sha256_proof("p", SALT, "t", -5).is_err());
    }
}
