//! Ed25519-backed signing certificate with typed key-value metadata.
//!
//! A [`SigCert`] pairs an Ed25519 keypair (secret key optional — a cert
//! loaded from a `.pub` file has only the public half) with a free-form
//! [`Kv`] metadata bag and an optional outer signature made by another
//! cert's secret key (used by [`crate::ca::Ca`] to stamp user certs).
//!
//! On disk a cert is a pair of TOML files: `<name>.pub` (mode 0644)
//! holding metadata, public key, and signature, and `<name>` (mode
//! 0600) holding only the secret key. In transit (the `casign` command)
//! a cert is instead flattened into a [`Kv`] under `meta.*` /
//! `curve.public-key` / `curve.signature` keys.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{Error, ErrorKind, Result};
use crate::kv::{Kv, KvValue};

const META_PREFIX: &str = "meta.";
const CURVE_PUBLIC_KEY: &str = "curve.public-key";
const CURVE_SIGNATURE: &str = "curve.signature";
const META_ALGORITHM: &str = "algorithm";
const ALGORITHM_ED25519: &str = "ed25519";

// On-disk secret keys are stored as seed‖public (libsodium's
// crypto_sign_SECRETKEYBYTES), independent of ed25519-dalek's own
// 32-byte SigningKey representation.
static_assertions::const_assert_eq!(ed25519_dalek::SECRET_KEY_LENGTH, 32);
static_assertions::const_assert_eq!(ed25519_dalek::PUBLIC_KEY_LENGTH, 32);
static_assertions::const_assert_eq!(ed25519_dalek::SIGNATURE_LENGTH, 64);

/// An Ed25519 keypair plus typed metadata, optionally signed by a CA.
pub struct SigCert {
    meta: Kv,
    public_key: VerifyingKey,
    secret_key: Option<SigningKey>,
    signature: Option<Vec<u8>>,
}

impl SigCert {
    /// Generate a fresh keypair. Metadata starts with just
    /// `algorithm=ed25519`.
    pub fn create() -> Self {
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let public_key = signing_key.verifying_key();
        let mut meta = Kv::new();
        meta.put_string(META_ALGORITHM, ALGORITHM_ED25519)
            .expect("algorithm is a valid kv key");
        SigCert {
            meta,
            public_key,
            secret_key: Some(signing_key),
            signature: None,
        }
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    pub fn has_secret(&self) -> bool {
        self.secret_key.is_some()
    }

    pub fn meta(&self) -> &Kv {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Kv {
        &mut self.meta
    }

    /// Set a metadata field, rejecting names containing `.` (reserved
    /// for the flattened `meta.`/`curve.` namespacing used by
    /// [`SigCert::to_kv`]).
    pub fn meta_set(&mut self, name: &str, value: KvValue) -> Result<()> {
        if name.contains('.') {
            return Err(Error::invalid_argument("metadata name must not contain '.'"));
        }
        self.meta.put(name, value)
    }

    /// Get a metadata field, rejecting names containing `.` for the
    /// same reason as [`SigCert::meta_set`].
    pub fn meta_get(&self, name: &str) -> Result<&KvValue> {
        if name.contains('.') {
            return Err(Error::invalid_argument("metadata name must not contain '.'"));
        }
        self.meta.get(name)
    }

    /// Deep copy, including the secret key and present/absent flag.
    pub fn copy(&self) -> SigCert {
        SigCert {
            meta: self.meta.clone(),
            public_key: self.public_key,
            secret_key: self.secret_key.clone(),
            signature: self.signature.clone(),
        }
    }

    /// Zero the secret key material and mark it absent.
    pub fn forget_secret(&mut self) {
        if let Some(sk) = self.secret_key.take() {
            let mut bytes = sk.to_bytes();
            bytes.zeroize();
        }
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Bytes covered by the outer signature: metadata then public key.
    fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = self.meta.encode();
        buf.extend_from_slice(self.public_key.as_bytes());
        buf
    }

    /// Sign arbitrary data with this cert's secret key.
    pub fn sign_detached(&self, data: &[u8]) -> Result<Vec<u8>> {
        let sk = self
            .secret_key
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("cert has no secret key"))?;
        Ok(sk.sign(data).to_bytes().to_vec())
    }

    /// Verify a detached signature made with [`SigCert::sign_detached`].
    pub fn verify_detached(&self, data: &[u8], sig: &[u8]) -> Result<()> {
        let sig = Signature::from_slice(sig)
            .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "malformed signature", e))?;
        self.public_key
            .verify(data, &sig)
            .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "signature verification failed", e))
    }

    /// Sign `target`'s metadata+public-key with this cert's secret key,
    /// storing the result as `target`'s outer signature.
    pub fn sign_cert(&self, target: &mut SigCert) -> Result<()> {
        let bytes = target.signable_bytes();
        let sig = self.sign_detached(&bytes)?;
        target.signature = Some(sig);
        Ok(())
    }

    /// Verify that `target`'s outer signature was made by this cert.
    pub fn verify_cert(&self, target: &SigCert) -> Result<()> {
        let sig = target
            .signature
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("cert is not signed"))?;
        self.verify_detached(&target.signable_bytes(), sig)
    }

    /// Sign this cert's own metadata+public-key with its own secret key.
    /// Used to mint a self-signed CA root.
    pub fn self_sign(&mut self) -> Result<()> {
        let bytes = self.signable_bytes();
        let sig = self.sign_detached(&bytes)?;
        self.signature = Some(sig);
        Ok(())
    }

    /// Byte-exact equality: same metadata, key material, and signature.
    pub fn equal(&self, other: &SigCert) -> bool {
        self.meta == other.meta
            && self.public_key.as_bytes() == other.public_key.as_bytes()
            && self.signature == other.signature
            && self.secret_key.as_ref().map(|k| k.to_bytes()) == other.secret_key.as_ref().map(|k| k.to_bytes())
    }

    /// Flatten into a [`Kv`] for in-band transport (no secret key).
    pub fn to_kv(&self) -> Result<Kv> {
        let mut out = Kv::new();
        for (key, value) in self.meta.iter() {
            out.put(&format!("{META_PREFIX}{key}"), value.clone())?;
        }
        out.put_string(CURVE_PUBLIC_KEY, B64.encode(self.public_key.as_bytes()))?;
        if let Some(sig) = &self.signature {
            out.put_string(CURVE_SIGNATURE, B64.encode(sig))?;
        }
        Ok(out)
    }

    /// Reconstruct a public-only cert from the flattened form produced
    /// by [`SigCert::to_kv`].
    pub fn from_kv(kv: &Kv) -> Result<SigCert> {
        let (meta_matched, remainder) = kv.split(META_PREFIX);
        let public_b64 = remainder
            .get_string(CURVE_PUBLIC_KEY)
            .map_err(|_| Error::invalid_argument("kv cert missing public key"))?;
        let public_key = decode_public_key(public_b64)?;
        let signature = match remainder.get_string(CURVE_SIGNATURE) {
            Ok(sig_b64) => Some(
                B64.decode(sig_b64)
                    .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "malformed signature base64", e))?,
            ),
            Err(_) => None,
        };
        Ok(SigCert {
            meta: meta_matched,
            public_key,
            secret_key: None,
            signature,
        })
    }

    /// Write `<path>.pub` (mode 0644), and if a secret key is present,
    /// `<path>` (mode 0600) as well.
    pub fn store(&self, path: &Path) -> Result<()> {
        let pub_path = pub_file_path(path);
        let pub_toml = self.encode_pub_toml()?;
        write_file(&pub_path, &pub_toml, 0o644)?;

        if let Some(sk) = &self.secret_key {
            let sec_toml = encode_secret_toml(sk)?;
            write_file(path, &sec_toml, 0o600)?;
        }
        Ok(())
    }

    /// Load a cert from `<path>.pub`, optionally also the secret key
    /// from `<path>` when `with_secret` is true.
    pub fn load(path: &Path, with_secret: bool) -> Result<SigCert> {
        let pub_path = pub_file_path(path);
        let text = fs::read_to_string(&pub_path)?;
        let mut cert = decode_pub_toml(&text)?;

        if with_secret {
            let sec_text = fs::read_to_string(path)?;
            cert.secret_key = Some(decode_secret_toml(&sec_text)?);
        }
        Ok(cert)
    }

    /// Render the public portion (metadata, public key, signature) as a
    /// TOML document, without touching disk.
    pub fn to_pub_toml(&self) -> Result<String> {
        self.encode_pub_toml()
    }

    /// Parse a public cert TOML document produced by [`SigCert::to_pub_toml`].
    pub fn from_pub_str(text: &str) -> Result<SigCert> {
        decode_pub_toml(text)
    }

    fn encode_pub_toml(&self) -> Result<String> {
        let mut metadata = toml::value::Table::new();
        for (key, value) in self.meta.iter() {
            metadata.insert(key.to_string(), kv_value_to_toml(value)?);
        }
        let file = CertFile {
            metadata,
            curve: CurveTable {
                public_key: B64.encode(self.public_key.as_bytes()),
                signature: self.signature.as_ref().map(|s| B64.encode(s)),
            },
        };
        toml::to_string_pretty(&file)
            .map_err(|e| Error::with_source(ErrorKind::IoError, "failed to render cert toml", e))
    }
}

impl Drop for SigCert {
    fn drop(&mut self) {
        if let Some(sk) = self.secret_key.take() {
            let mut bytes = sk.to_bytes();
            bytes.zeroize();
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CertFile {
    metadata: toml::value::Table,
    curve: CurveTable,
}

#[derive(Serialize, Deserialize)]
struct CurveTable {
    #[serde(rename = "public-key")]
    public_key: String,
    #[serde(rename = "signature", skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SecretFile {
    curve: SecretCurveTable,
}

#[derive(Serialize, Deserialize)]
struct SecretCurveTable {
    #[serde(rename = "secret-key")]
    secret_key: String,
}

fn kv_value_to_toml(value: &KvValue) -> Result<toml::Value> {
    Ok(match value {
        KvValue::String(s) => toml::Value::String(s.clone()),
        KvValue::Int64(i) => toml::Value::Integer(*i),
        KvValue::Double(d) => toml::Value::Float(*d),
        KvValue::Bool(b) => toml::Value::Boolean(*b),
        KvValue::Timestamp(t) => {
            let dt = toml::value::Datetime::from_str(&t.to_rfc3339())
                .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "bad timestamp", e))?;
            toml::Value::Datetime(dt)
        }
    })
}

fn toml_value_to_kv(value: &toml::Value) -> Result<KvValue> {
    Ok(match value {
        toml::Value::String(s) => KvValue::String(s.clone()),
        toml::Value::Integer(i) => KvValue::Int64(*i),
        toml::Value::Float(f) => KvValue::Double(*f),
        toml::Value::Boolean(b) => KvValue::Bool(*b),
        toml::Value::Datetime(dt) => {
            let text = dt.to_string();
            let parsed = DateTime::parse_from_rfc3339(&text)
                .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "bad timestamp", e))?;
            KvValue::Timestamp(parsed.with_timezone(&Utc))
        }
        other => {
            return Err(Error::invalid_argument(format!(
                "unsupported toml value in cert metadata: {other:?}"
            )))
        }
    })
}

fn decode_public_key(b64: &str) -> Result<VerifyingKey> {
    let bytes = B64
        .decode(b64)
        .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "malformed public key base64", e))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::invalid_argument("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "invalid public key", e))
}

fn decode_pub_toml(text: &str) -> Result<SigCert> {
    let file: CertFile = toml::from_str(text)
        .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "failed to parse cert toml", e))?;
    let mut meta = Kv::new();
    for (key, value) in &file.metadata {
        meta.put(key, toml_value_to_kv(value)?)?;
    }
    let public_key = decode_public_key(&file.curve.public_key)?;
    let signature = match file.curve.signature {
        Some(b64) => Some(
            B64.decode(b64)
                .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "malformed signature base64", e))?,
        ),
        None => None,
    };
    Ok(SigCert {
        meta,
        public_key,
        secret_key: None,
        signature,
    })
}

/// The on-disk secret representation is the libsodium convention:
/// 32-byte seed followed by the 32-byte public key, 64 bytes total,
/// even though `ed25519-dalek`'s native `SigningKey` is only a 32-byte
/// seed.
fn encode_secret_toml(sk: &SigningKey) -> Result<String> {
    let mut bytes = sk.to_bytes().to_vec();
    bytes.extend_from_slice(sk.verifying_key().as_bytes());
    let file = SecretFile {
        curve: SecretCurveTable {
            secret_key: B64.encode(&bytes),
        },
    };
    bytes.zeroize();
    toml::to_string_pretty(&file).map_err(|e| Error::with_source(ErrorKind::IoError, "failed to render secret toml", e))
}

fn decode_secret_toml(text: &str) -> Result<SigningKey> {
    let file: SecretFile = toml::from_str(text)
        .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "failed to parse secret toml", e))?;
    let mut bytes = B64
        .decode(&file.curve.secret_key)
        .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "malformed secret key base64", e))?;
    if bytes.len() != 64 {
        bytes.zeroize();
        return Err(Error::invalid_argument("secret key must be 64 bytes"));
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&bytes[..32]);
    bytes.zeroize();
    Ok(SigningKey::from_bytes(&seed))
}

fn pub_file_path(path: &Path) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".pub");
    std::path::PathBuf::from(s)
}

fn write_file(path: &Path, contents: &str, mode: u32) -> Result<()> {
    let mut f = fs::File::create(path)?;
    f.set_permissions(fs::Permissions::from_mode(mode))?;
    f.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sign_and_verify_detached() {
        let cert = SigCert::create();
        let sig = cert.sign_detached(b"hello").unwrap();
        cert.verify_detached(b"hello", &sig).unwrap();
        assert!(cert.verify_detached(b"tampered", &sig).is_err());
    }

    #[test]
    fn create_stamps_algorithm() {
        let cert = SigCert::create();
        assert_eq!(cert.meta().get_string("algorithm").unwrap(), "ed25519");
    }

    #[test]
    fn meta_set_and_get_reject_dotted_names() {
        let mut cert = SigCert::create();
        assert!(cert.meta_set("curve.public-key", KvValue::Bool(true)).is_err());
        assert!(cert.meta_get("curve.public-key").is_err());

        cert.meta_set("role", KvValue::String("ca".to_string())).unwrap();
        assert_eq!(cert.meta_get("role").unwrap(), &KvValue::String("ca".to_string()));
    }

    #[test]
    fn copy_is_independent_and_preserves_secret_presence() {
        let cert = SigCert::create();
        let mut copy = cert.copy();
        assert!(copy.has_secret());
        assert_eq!(copy.public_key().as_bytes(), cert.public_key().as_bytes());

        copy.meta_mut().put_string("only-on-copy", "x").unwrap();
        assert!(cert.meta().get_string("only-on-copy").is_err());
    }

    #[test]
    fn forget_secret_clears_the_flag() {
        let mut cert = SigCert::create();
        assert!(cert.has_secret());
        cert.forget_secret();
        assert!(!cert.has_secret());
        assert!(cert.sign_detached(b"x").is_err());
    }

    #[test]
    fn sign_and_verify_cert() {
        let ca = SigCert::create();
        let mut user = SigCert::create();
        user.meta_mut().put_string("userid", "1000").unwrap();
        ca.sign_cert(&mut user).unwrap();
        ca.verify_cert(&user).unwrap();

        let other = SigCert::create();
        assert!(other.verify_cert(&user).is_err());
    }

    #[test]
    fn verify_cert_rejects_mutated_metadata() {
        let ca = SigCert::create();
        let mut user = SigCert::create();
        user.meta_mut().put_string("userid", "1000").unwrap();
        ca.sign_cert(&mut user).unwrap();
        ca.verify_cert(&user).unwrap();

        user.meta_mut().put_string("userid", "1001").unwrap();
        assert!(ca.verify_cert(&user).is_err());
    }

    #[test]
    fn kv_roundtrip_drops_secret() {
        let mut cert = SigCert::create();
        cert.meta_mut().put_string("name", "test").unwrap();
        let kv = cert.to_kv().unwrap();
        let reloaded = SigCert::from_kv(&kv).unwrap();
        assert!(!reloaded.has_secret());
        assert_eq!(reloaded.meta().get_string("name").unwrap(), "test");
        assert_eq!(reloaded.public_key().as_bytes(), cert.public_key().as_bytes());
    }

    #[test]
    fn store_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sig");
        let mut cert = SigCert::create();
        cert.meta_mut().put_string("role", "ca").unwrap();
        cert.store(&path).unwrap();

        let pub_meta = fs::metadata(pub_file_path(&path)).unwrap();
        assert_eq!(pub_meta.permissions().mode() & 0o777, 0o644);
        let sec_meta = fs::metadata(&path).unwrap();
        assert_eq!(sec_meta.permissions().mode() & 0o777, 0o600);

        let loaded_pub = SigCert::load(&path, false).unwrap();
        assert!(!loaded_pub.has_secret());
        assert_eq!(loaded_pub.meta().get_string("role").unwrap(), "ca");

        let loaded_sec = SigCert::load(&path, true).unwrap();
        assert!(loaded_sec.has_secret());
        assert_eq!(loaded_sec.public_key().as_bytes(), cert.public_key().as_bytes());
    }
}
