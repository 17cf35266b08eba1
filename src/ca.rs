//! Certificate authority: a self-signed root cert that signs, verifies,
//! and revokes user certificates.
//!
//! A CA is a [`SigCert`] whose metadata carries `ca-capability` and
//! `max-sign-ttl`, paired with a [`CaConfig`] loaded from the `[ca]`
//! configuration table. Every cert it signs is stamped with `uuid`,
//! `issuer`, `domain`, `ctime`, `not-valid-before-time`, `xtime`,
//! `userid`, and `max-sign-ttl`. Revocation is a zero-byte marker file
//! named by the cert's `uuid` under `config.revoke_dir` — "revoked" is
//! "a file with this name exists", nothing more.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::sigcert::SigCert;

pub const META_UUID: &str = "uuid";
pub const META_ISSUER: &str = "issuer";
pub const META_DOMAIN: &str = "domain";
pub const META_CTIME: &str = "ctime";
pub const META_NOT_VALID_BEFORE: &str = "not-valid-before-time";
pub const META_XTIME: &str = "xtime";
pub const META_USERID: &str = "userid";
pub const META_MAX_SIGN_TTL: &str = "max-sign-ttl";
pub const META_CA_CAPABILITY: &str = "ca-capability";

/// The `[ca]` configuration table. All six keys are required; a missing
/// or mistyped key fails with [`ErrorKind::InvalidArgument`] naming the
/// offending key, per spec.
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Upper bound, in seconds, on a cert's own lifetime (`xtime - ctime`).
    pub max_cert_ttl: i64,
    /// Upper bound, in seconds, stamped into every cert this CA signs,
    /// bounding how long that cert may be used to sign credentials.
    pub max_sign_ttl: i64,
    /// Where the CA's own cert (`<cert_path>.pub` / `<cert_path>`) lives.
    pub cert_path: PathBuf,
    /// Directory holding empty marker files named by revoked cert uuid.
    pub revoke_dir: PathBuf,
    /// Whether `Ca::revoke` is permitted at all.
    pub revoke_allow: bool,
    /// Stamped into every signed cert's `domain` metadata field.
    pub domain: String,
}

impl CaConfig {
    pub fn from_config(config: &Config) -> Result<CaConfig> {
        let table = config
            .table("ca")
            .ok_or_else(|| Error::invalid_argument("missing [ca] configuration section"))?;

        let max_cert_ttl = table
            .get("max-cert-ttl")
            .ok_or_else(|| Error::invalid_argument("[ca] missing required key 'max-cert-ttl'"))?
            .as_integer()
            .ok_or_else(|| Error::invalid_argument("[ca].max-cert-ttl must be an integer"))?;
        let max_sign_ttl = table
            .get("max-sign-ttl")
            .ok_or_else(|| Error::invalid_argument("[ca] missing required key 'max-sign-ttl'"))?
            .as_integer()
            .ok_or_else(|| Error::invalid_argument("[ca].max-sign-ttl must be an integer"))?;
        let cert_path = table
            .get("cert-path")
            .ok_or_else(|| Error::invalid_argument("[ca] missing required key 'cert-path'"))?
            .as_str()
            .ok_or_else(|| Error::invalid_argument("[ca].cert-path must be a string"))?;
        let revoke_dir = table
            .get("revoke-dir")
            .ok_or_else(|| Error::invalid_argument("[ca] missing required key 'revoke-dir'"))?
            .as_str()
            .ok_or_else(|| Error::invalid_argument("[ca].revoke-dir must be a string"))?;
        let revoke_allow = table
            .get("revoke-allow")
            .ok_or_else(|| Error::invalid_argument("[ca] missing required key 'revoke-allow'"))?
            .as_bool()
            .ok_or_else(|| Error::invalid_argument("[ca].revoke-allow must be a bool"))?;
        let domain = table
            .get("domain")
            .ok_or_else(|| Error::invalid_argument("[ca] missing required key 'domain'"))?
            .as_str()
            .ok_or_else(|| Error::invalid_argument("[ca].domain must be a string"))?;

        if max_cert_ttl <= 0 {
            return Err(Error::invalid_argument("[ca].max-cert-ttl must be positive"));
        }
        if max_sign_ttl <= 0 {
            return Err(Error::invalid_argument("[ca].max-sign-ttl must be positive"));
        }

        Ok(CaConfig {
            max_cert_ttl,
            max_sign_ttl,
            cert_path: PathBuf::from(cert_path),
            revoke_dir: PathBuf::from(revoke_dir),
            revoke_allow,
            domain: domain.to_string(),
        })
    }
}

pub struct Ca {
    config: CaConfig,
    cert: SigCert,
}

fn resolve_not_valid_before(not_valid_before: i64) -> DateTime<Utc> {
    if not_valid_before == 0 {
        Utc::now()
    } else {
        Utc.timestamp_opt(not_valid_before, 0).single().unwrap_or_else(Utc::now)
    }
}

fn clamp_ttl(ttl: i64, max: i64) -> Result<i64> {
    if ttl <= 0 {
        Ok(max)
    } else if ttl > max {
        Err(Error::invalid_argument(format!("requested ttl {ttl} exceeds configured maximum {max}")))
    } else {
        Ok(ttl)
    }
}

impl Ca {
    /// Mint a fresh self-signed root. `ttl <= 0` means
    /// `config.max_cert_ttl`; `not_valid_before == 0` means now.
    pub fn keygen(config: CaConfig, not_valid_before: i64, ttl: i64) -> Result<Ca> {
        let effective_ttl = clamp_ttl(ttl, config.max_cert_ttl)?;
        let nvbt = resolve_not_valid_before(not_valid_before);

        let mut cert = SigCert::create();
        let uuid = Uuid::new_v4().to_string();
        cert.meta_mut().put_string(META_UUID, uuid.clone())?;
        cert.meta_mut().put_string(META_ISSUER, uuid)?;
        cert.meta_mut().put_string(META_DOMAIN, config.domain.clone())?;
        cert.meta_mut().put_timestamp(META_CTIME, Utc::now())?;
        cert.meta_mut().put_timestamp(META_NOT_VALID_BEFORE, nvbt)?;
        cert.meta_mut().put_timestamp(META_XTIME, nvbt + Duration::seconds(effective_ttl))?;
        cert.meta_mut().put_int64(META_MAX_SIGN_TTL, config.max_sign_ttl)?;
        cert.meta_mut().put_bool(META_CA_CAPABILITY, true)?;
        cert.self_sign()?;
        Ok(Ca { config, cert })
    }

    pub fn cert(&self) -> &SigCert {
        &self.cert
    }

    pub fn config(&self) -> &CaConfig {
        &self.config
    }

    /// Sign `target` as a user cert. `ttl <= 0` requests
    /// `config.max_cert_ttl`; a positive `ttl` greater than that maximum
    /// is an error rather than silently clamped. The signed cert's
    /// `max-sign-ttl` is always `config.max_sign_ttl`, independent of
    /// the requested `ttl` (which bounds the cert's own lifetime, not
    /// how long it may be used to sign credentials).
    pub fn sign(&self, target: &mut SigCert, not_valid_before: i64, ttl: i64, userid: u32) -> Result<()> {
        if !self.cert.meta().get_bool(META_CA_CAPABILITY).unwrap_or(false) {
            return Err(Error::permission_denied("ca cert does not have ca-capability"));
        }
        if !self.cert.has_secret() {
            return Err(Error::permission_denied("ca has no secret key loaded; cannot sign"));
        }
        let effective_ttl = clamp_ttl(ttl, self.config.max_cert_ttl)?;
        let nvbt = resolve_not_valid_before(not_valid_before);
        let issuer = self.cert.meta().get_string(META_UUID)?.to_string();

        target.meta_mut().put_string(META_UUID, Uuid::new_v4().to_string())?;
        target.meta_mut().put_string(META_ISSUER, issuer)?;
        target.meta_mut().put_string(META_DOMAIN, self.config.domain.clone())?;
        target.meta_mut().put_timestamp(META_CTIME, Utc::now())?;
        target.meta_mut().put_timestamp(META_NOT_VALID_BEFORE, nvbt)?;
        target
            .meta_mut()
            .put_timestamp(META_XTIME, nvbt + Duration::seconds(effective_ttl))?;
        target.meta_mut().put_int64(META_USERID, userid as i64)?;
        target.meta_mut().put_int64(META_MAX_SIGN_TTL, self.config.max_sign_ttl)?;
        target.meta_mut().put_bool(META_CA_CAPABILITY, false)?;
        self.cert.sign_cert(target)
    }

    /// Verify `cert`'s signature, required metadata, validity window,
    /// and revocation status. Returns `(userid, max_sign_ttl)`.
    pub fn verify(&self, cert: &SigCert) -> Result<(i64, i64)> {
        if !self.cert.meta().get_bool(META_CA_CAPABILITY).unwrap_or(false) {
            return Err(Error::permission_denied("ca cert does not have ca-capability"));
        }
        self.cert.verify_cert(cert)?;

        for required in [META_UUID, META_ISSUER, META_CTIME, META_NOT_VALID_BEFORE, META_XTIME, META_USERID, META_MAX_SIGN_TTL] {
            if !cert.meta().contains(required) {
                return Err(Error::invalid_argument(format!("signed cert is missing required field '{required}'")));
            }
        }

        let now = Utc::now();
        let not_valid_before = cert.meta().get_timestamp(META_NOT_VALID_BEFORE)?;
        if now < not_valid_before {
            return Err(Error::invalid_argument("certificate is not yet valid"));
        }
        let xtime = cert.meta().get_timestamp(META_XTIME)?;
        if now >= xtime {
            return Err(Error::invalid_argument("certificate has expired"));
        }

        let uuid = cert.meta().get_string(META_UUID)?;
        if self.config.revoke_dir.join(uuid).exists() {
            return Err(Error::permission_denied("cert has been revoked"));
        }

        let userid = cert.meta().get_int64(META_USERID)?;
        let max_sign_ttl = cert.meta().get_int64(META_MAX_SIGN_TTL)?;
        Ok((userid, max_sign_ttl))
    }

    /// Mark `uuid` as revoked by creating an empty marker file under
    /// `config.revoke_dir`. Refuses unless `config.revoke_allow`.
    pub fn revoke(&self, uuid: &str) -> Result<()> {
        if !self.config.revoke_allow {
            return Err(Error::permission_denied("ca.revoke-allow is false"));
        }
        fs::create_dir_all(&self.config.revoke_dir)?;
        fs::File::create(self.config.revoke_dir.join(uuid))?;
        Ok(())
    }

    pub fn store(&self) -> Result<()> {
        self.cert.store(&self.config.cert_path)
    }

    pub fn load(config: CaConfig, with_secret: bool) -> Result<Ca> {
        let cert = SigCert::load(&config.cert_path, with_secret)?;
        if !cert.meta().get_bool(META_CA_CAPABILITY).unwrap_or(false) {
            return Err(Error::invalid_argument("cert does not have ca-capability"));
        }
        Ok(Ca { config, cert })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigcert::SigCert;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> CaConfig {
        CaConfig {
            max_cert_ttl: 60,
            max_sign_ttl: 30,
            cert_path: dir.join("ca"),
            revoke_dir: dir.join("revoked"),
            revoke_allow: true,
            domain: "example.test".to_string(),
        }
    }

    #[test]
    fn sign_and_verify_user_cert() {
        let dir = tempdir().unwrap();
        let ca = Ca::keygen(test_config(dir.path()), 0, 0).unwrap();
        let mut user = SigCert::create();
        ca.sign(&mut user, 0, 0, 1000).unwrap();
        let (userid, max_sign_ttl) = ca.verify(&user).unwrap();
        assert_eq!(userid, 1000);
        assert_eq!(max_sign_ttl, 30);
        assert_eq!(user.meta().get_bool(META_CA_CAPABILITY).unwrap(), false);
        assert_eq!(user.meta().get_string(META_DOMAIN).unwrap(), "example.test");
    }

    #[test]
    fn sign_rejects_ttl_above_max_cert_ttl() {
        let dir = tempdir().unwrap();
        let ca = Ca::keygen(test_config(dir.path()), 0, 0).unwrap();
        let mut user = SigCert::create();
        assert!(ca.sign(&mut user, 0, 1000, 1000).is_err());
    }

    #[test]
    fn max_sign_ttl_is_constant_regardless_of_requested_ttl() {
        let dir = tempdir().unwrap();
        let ca = Ca::keygen(test_config(dir.path()), 0, 0).unwrap();
        let mut user = SigCert::create();
        ca.sign(&mut user, 0, 10, 1000).unwrap();
        let (_, max_sign_ttl) = ca.verify(&user).unwrap();
        assert_eq!(max_sign_ttl, 30);
    }

    #[test]
    fn expired_cert_fails_verification_as_invalid_argument() {
        let dir = tempdir().unwrap();
        let ca = Ca::keygen(test_config(dir.path()), 0, 0).unwrap();
        let mut user = SigCert::create();
        let already_past = (Utc::now() - Duration::seconds(100)).timestamp();
        ca.sign(&mut user, already_past, 1, 1000).unwrap();
        let err = ca.verify(&user).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.message().contains("expired"));
    }

    #[test]
    fn revoked_cert_fails_verification() {
        let dir = tempdir().unwrap();
        let ca = Ca::keygen(test_config(dir.path()), 0, 0).unwrap();
        let mut user = SigCert::create();
        ca.sign(&mut user, 0, 0, 1000).unwrap();
        let uuid = user.meta().get_string(META_UUID).unwrap().to_string();
        ca.revoke(&uuid).unwrap();
        let err = ca.verify(&user).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn revoke_refused_when_not_allowed() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.revoke_allow = false;
        let ca = Ca::keygen(cfg, 0, 0).unwrap();
        assert!(ca.revoke("whatever").is_err());
    }

    #[test]
    fn store_and_load_roundtrip_requires_ca_capability() {
        let dir = tempdir().unwrap();
        let ca = Ca::keygen(test_config(dir.path()), 0, 0).unwrap();
        ca.store().unwrap();
        let loaded = Ca::load(test_config(dir.path()), true).unwrap();
        assert_eq!(loaded.config.max_sign_ttl, 30);

        let mut not_ca_cfg = test_config(dir.path());
        not_ca_cfg.cert_path = dir.path().join("plain");
        SigCert::create().store(&not_ca_cfg.cert_path).unwrap();
        assert!(Ca::load(not_ca_cfg, false).is_err());
    }

    #[test]
    fn from_config_identifies_missing_key() {
        let mut table = toml::value::Table::new();
        table.insert("max-cert-ttl".into(), toml::Value::Integer(60));
        let mut root = toml::value::Table::new();
        root.insert("ca".into(), toml::Value::Table(table));
        let cfg = Config::from_table(root);
        let err = CaConfig::from_config(&cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.message().contains("max-sign-ttl"));
    }
}
