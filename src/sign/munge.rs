//! A shared-authenticator mechanism shaped after `munge`: an external
//! service that turns an opaque blob into a self-describing credential
//! carrying the encoding uid and time, which any host with the same
//! shared key can decode.
//!
//! Binding to a real `munged` socket is out of scope here;
//! [`HmacAuthenticator`] is a stand-in authenticator keyed from a local
//! file instead. The mechanism itself still does what `sign_munge.c`
//! does at the core layer: hash `H.P` with SHA-256, prepend a 1-byte
//! hash-type indicator, and hand the resulting 33-byte blob to the
//! authenticator to produce the actual credential bytes.

use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorKind, Result};
use crate::kv::Kv;

use super::Mechanism;

type HmacSha256 = Hmac<Sha256>;

const HASH_TYPE_SHA256: u8 = 1;
const BLOB_LEN: usize = 1 + 32;

/// Outcome of decoding a credential, distinct from the payload/uid it
/// carries. `Replayed`/`Expired` are non-fatal here: this mechanism's
/// own `verify` re-checks `encode_time + max-ttl` itself, matching how
/// `sign_munge.c` tolerates `EMUNGE_CRED_REPLAYED`/`EMUNGE_CRED_EXPIRED`
/// at the authenticator layer. This is a deliberate policy choice, not
/// an oversight: the authenticator's own replay/expiry tracking is
/// considered informational once the ttl window above it is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MungeStatus {
    Success,
    Replayed,
    Expired,
}

pub trait Authenticator: Send + Sync {
    fn encode(&self, payload: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, cred: &[u8]) -> Result<(Vec<u8>, u32, DateTime<Utc>, MungeStatus)>;
}

/// HMAC-SHA256 stand-in authenticator keyed from a local file.
pub struct HmacAuthenticator {
    key: Vec<u8>,
}

impl HmacAuthenticator {
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let key = fs::read(path)?;
        if key.is_empty() {
            return Err(Error::invalid_argument("munge key file is empty"));
        }
        Ok(HmacAuthenticator { key })
    }

    /// Resolve the key file path from `MUNGE_SOCKET` (repurposed as a
    /// path to a local keyfile in this stand-in) or an explicit default.
    pub fn from_env_or(default_path: &Path) -> Result<Self> {
        let path = std::env::var_os("MUNGE_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_path.to_path_buf());
        Self::from_key_file(&path)
    }
}

impl Authenticator for HmacAuthenticator {
    fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let uid = nix::unistd::getuid().as_raw();
        let encode_time = Utc::now().timestamp();

        let mut body = Vec::new();
        body.extend_from_slice(&uid.to_le_bytes());
        body.extend_from_slice(&encode_time.to_le_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(payload);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "invalid munge key", e))?;
        mac.update(&body);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(1 + body.len() + tag.len());
        out.push(HASH_TYPE_SHA256);
        out.extend_from_slice(&body);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn decode(&self, cred: &[u8]) -> Result<(Vec<u8>, u32, DateTime<Utc>, MungeStatus)> {
        if cred.first() != Some(&HASH_TYPE_SHA256) {
            return Err(Error::invalid_argument("unsupported munge credential hash type"));
        }
        let tag_len = 32;
        if cred.len() < 1 + 4 + 8 + 4 + tag_len {
            return Err(Error::invalid_argument("truncated munge credential"));
        }
        let body = &cred[1..cred.len() - tag_len];
        let tag = &cred[cred.len() - tag_len..];

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "invalid munge key", e))?;
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "munge credential signature mismatch", e))?;

        let uid = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let encode_time = i64::from_le_bytes(body[4..12].try_into().unwrap());
        let payload_len = u32::from_le_bytes(body[12..16].try_into().unwrap()) as usize;
        let payload = body
            .get(16..16 + payload_len)
            .ok_or_else(|| Error::invalid_argument("truncated munge credential payload"))?
            .to_vec();

        let encode_time = Utc
            .timestamp_opt(encode_time, 0)
            .single()
            .ok_or_else(|| Error::invalid_argument("invalid munge encode time"))?;

        Ok((payload, uid, encode_time, MungeStatus::Success))
    }
}

pub struct MungeMechanism {
    authenticator: Box<dyn Authenticator>,
    max_ttl: i64,
}

impl MungeMechanism {
    pub fn new(authenticator: Box<dyn Authenticator>, max_ttl: i64) -> Self {
        MungeMechanism { authenticator, max_ttl }
    }
}

impl Mechanism for MungeMechanism {
    fn name(&self) -> &'static str {
        "munge"
    }

    fn sign(&self, header_and_payload: &str) -> Result<String> {
        let digest = Sha256::digest(header_and_payload.as_bytes());
        let mut blob = Vec::with_capacity(BLOB_LEN);
        blob.push(HASH_TYPE_SHA256);
        blob.extend_from_slice(&digest);
        let cred = self.authenticator.encode(&blob)?;
        Ok(B64.encode(cred))
    }

    fn verify(&self, header: &Kv, header_and_payload: &str, signature: &str) -> Result<()> {
        let cred = B64
            .decode(signature)
            .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "malformed munge credential base64", e))?;
        let (blob, uid, encode_time, status) = self.authenticator.decode(&cred)?;
        // Replayed/expired status from the authenticator is informational
        // here; the ttl check below is authoritative (see MungeStatus doc).
        match status {
            MungeStatus::Success | MungeStatus::Replayed | MungeStatus::Expired => {}
        }
        if blob.len() != BLOB_LEN || blob[0] != HASH_TYPE_SHA256 {
            return Err(Error::invalid_argument("malformed munge credential blob"));
        }
        let digest = Sha256::digest(header_and_payload.as_bytes());
        if &blob[1..] != digest.as_slice() {
            return Err(Error::invalid_argument("munge credential hash does not match header.payload"));
        }
        let claimed_uid = header.get_int64("userid")?;
        if claimed_uid != uid as i64 {
            return Err(Error::permission_denied("munge credential uid does not match header"));
        }
        if Utc::now() > encode_time + Duration::seconds(self.max_ttl) {
            return Err(Error::timed_out("munge credential has exceeded the configured max-ttl"));
        }
        Ok(())
    }
}
