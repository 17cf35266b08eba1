//! `casign`: sign a user-supplied public cert with the IMP's CA,
//! stamping uuid/issuer/validity window/userid.

use std::io::Read;

use nix::unistd::{geteuid, getuid};

use crate::ca::{Ca, CaConfig};
use crate::error::Result;
use crate::kv::Kv;
use crate::privsep::Privsep;
use crate::sigcert::SigCert;

use super::ImpState;

const CERT_PREFIX: &str = "cert.";

pub fn child(_state: &ImpState, ps: &Privsep) -> Result<i32> {
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text)?;
    let cert = SigCert::from_pub_str(&text)?;

    let request = Kv::new().join(CERT_PREFIX, &cert.to_kv()?)?;
    ps.write_kv(&request)?;
    let reply = ps.read_kv()?;

    if let Ok(msg) = reply.get_string("error") {
        eprintln!("casign: {msg}");
        return Ok(1);
    }
    let signed = SigCert::from_kv(&reply)?;
    print!("{}", signed.to_pub_toml()?);
    Ok(0)
}

pub fn parent(state: &ImpState, ps: &Privsep) -> Result<Option<i32>> {
    let request = ps.read_kv()?;
    let (cert_kv, _) = request.split(CERT_PREFIX);
    let result = sign_request(state, &cert_kv);

    let reply = match result {
        Ok(signed) => signed.to_kv()?,
        Err(e) => {
            let mut kv = Kv::new();
            kv.put_string("error", e.message())?;
            kv
        }
    };
    ps.write_kv(&reply)?;
    Ok(None)
}

fn sign_request(state: &ImpState, cert_kv: &Kv) -> Result<SigCert> {
    if geteuid().as_raw() != 0 {
        log::warn!("casign: running without an effective uid of 0; this is only safe in test setups");
    }

    let ca_config = CaConfig::from_config(&state.config)?;
    let ca = Ca::load(ca_config, true)?;
    let mut cert = SigCert::from_kv(cert_kv)?;
    ca.sign(&mut cert, 0, 0, getuid().as_raw())?;
    Ok(cert)
}
