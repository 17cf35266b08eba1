//! Cross-module end-to-end scenarios, exercising the public API the way
//! a caller outside the crate would: KV encoding exactness, cert
//! sign/verify, CA issuance and revocation, and the sign pipeline's
//! wire shape and tamper rejection.

use flux_security::ca::{Ca, CaConfig};
use flux_security::error::ErrorKind;
use flux_security::kv::Kv;
use flux_security::sigcert::SigCert;
use flux_security::sign::none::NoneMechanism;
use flux_security::sign::{SignConfig, SignContext};

fn ca_config(dir: &std::path::Path, max_cert_ttl: i64, max_sign_ttl: i64) -> CaConfig {
    CaConfig {
        max_cert_ttl,
        max_sign_ttl,
        cert_path: dir.join("ca"),
        revoke_dir: dir.join("revoked"),
        revoke_allow: true,
        domain: "example.test".to_string(),
    }
}

#[test]
fn kv_put_get_delete_has_expected_wire_length() {
    let mut kv = Kv::new();
    kv.put_string("a", "foo").unwrap();
    kv.put_int64("b", 42).unwrap();
    kv.put_bool("c", true).unwrap();

    // name\0 T value\0 per entry: "a\0" + "S" + "foo\0" = 2+1+4 = 7
    // "b\0" + "I" + "42\0" = 2+1+3 = 6
    // "c\0" + "B" + "true\0" = 2+1+5 = 8
    assert_eq!(kv.encode().len(), 7 + 6 + 8);

    assert_eq!(kv.get_int64("b").unwrap(), 42);

    kv.delete("a").unwrap();
    assert!(kv.get_string("a").is_err());
}

#[test]
fn cert_sign_verify_detached_round_trip() {
    let cert = SigCert::create();
    let sig = cert.sign_detached(b"foo-bar-baz").unwrap();
    cert.verify_detached(b"foo-bar-baz", &sig).unwrap();
    let err = cert.verify_detached(b"foo-KITTENS-baz", &sig).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn ca_sign_and_verify_stamps_expected_fields() {
    let dir = tempfile::tempdir().unwrap();
    let ca = Ca::keygen(ca_config(dir.path(), 60, 30), 0, 0).unwrap();
    let ca_uuid = ca.cert().meta().get_string("uuid").unwrap().to_string();

    let mut user = SigCert::create();
    ca.sign(&mut user, 0, 0, 1000).unwrap();

    assert_eq!(user.meta().get_int64("userid").unwrap(), 1000);
    assert_eq!(user.meta().get_string("issuer").unwrap(), ca_uuid);

    let ctime = user.meta().get_timestamp("ctime").unwrap();
    let xtime = user.meta().get_timestamp("xtime").unwrap();
    assert_eq!((xtime - ctime).num_seconds(), 60);

    let (userid, max_sign_ttl) = ca.verify(&user).unwrap();
    assert_eq!(userid, 1000);
    assert_eq!(max_sign_ttl, 30);
}

#[test]
fn ca_revoke_blocks_verification_with_expected_message() {
    let dir = tempfile::tempdir().unwrap();
    let ca = Ca::keygen(ca_config(dir.path(), 60, 30), 0, 0).unwrap();

    let mut user = SigCert::create();
    ca.sign(&mut user, 0, 0, 1000).unwrap();
    let uuid = user.meta().get_string("uuid").unwrap().to_string();

    ca.revoke(&uuid).unwrap();
    let err = ca.verify(&user).unwrap_err();
    assert!(err.message().contains("revoked"));
}

fn none_context() -> SignContext {
    let mut ctx = SignContext::new(SignConfig {
        max_ttl: 30,
        default_type: "none".to_string(),
        allowed_types: vec!["none".to_string()],
    })
    .unwrap();
    ctx.register(Box::new(NoneMechanism));
    ctx
}

#[test]
fn sign_wrap_matches_expected_wire_shape() {
    let ctx = none_context();
    let s = ctx.wrap(b"hello world", None).unwrap();

    let parts: Vec<&str> = s.split('.').collect();
    assert_eq!(parts.len(), 3);
    assert!(parts[0].chars().all(is_base64_char));
    assert!(parts[1].chars().all(is_base64_char));
    assert_eq!(parts[2], "none");

    let (header, payload) = ctx.unwrap(&s, false).unwrap();
    assert_eq!(payload, b"hello world");
    assert_eq!(header.get_int64("userid").unwrap(), nix::unistd::getuid().as_raw() as i64);
}

fn is_base64_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='
}

#[test]
fn sign_wrap_rejects_tampered_header_segment() {
    let ctx = none_context();
    let s = ctx.wrap(b"hello world", None).unwrap();
    let mut parts: Vec<String> = s.split('.').map(String::from).collect();

    let mut bytes = parts[0].into_bytes();
    let idx = bytes.len() / 2;
    bytes[idx] ^= 0x01;
    parts[0] = String::from_utf8_lossy(&bytes).into_owned();
    let tampered = parts.join(".");

    let err = ctx.unwrap(&tampered, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.message().contains("header"));
}
