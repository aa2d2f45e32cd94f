use super::*;

#[test]
fn md5_payload_matches_known_exchange() {
    // user "u", password "p", salt 01 02 03 04:
    // md5("pu") = 51d2d8f9f85b40a1a55b0d2b9d054dea
    // payload = "md5" ++ md5("51d2d8f9f85b40a1a55b0d2b9d054dea\x01\x02\x03\x04")
    let payload = md5_payload("u", "p", &[0x01, 0x02, 0x03, 0x04]);
    let text = std::str::from_utf8(&payload[..payload.len() - 1]).unwrap();
    assert!(text.starts_with("md5"));
    assert_eq!(text.len(), 3 + 32);
    assert_eq!(*payload.last().unwrap(), 0);

    // Independently recompute both passes.
    use md5::{Digest, Md5};
    let inner = format!("{:x}", Md5::digest(b"pu"));
    let mut md5 = Md5::new();
    md5.update(inner.as_bytes());
    md5.update([0x01, 0x02, 0x03, 0x04]);
    let expected = format!("md5{:x}", md5.finalize());
    assert_eq!(text, expected);
}

#[test]
fn md5_payload_depends_on_all_inputs() {
    let base = md5_payload("u", "p", &[1, 2, 3, 4]);
    assert_ne!(base, md5_payload("v", "p", &[1, 2, 3, 4]));
    assert_ne!(base, md5_payload("u", "q", &[1, 2, 3, 4]));
    assert_ne!(base, md5_payload("u", "p", &[4, 3, 2, 1]));
}

#[test]
fn cleartext_payload_is_nul_terminated() {
    assert_eq!(cleartext_payload("s3cret"), b"s3cret\0".to_vec());
    assert_eq!(cleartext_payload(""), b"\0".to_vec());
}
