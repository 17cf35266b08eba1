//! The trivial `none` mechanism: no cryptography, authenticity rests
//! entirely on the generic header's `userid` field matching the real
//! uid of the process presenting the credential. Intended for
//! development only; a deployment must list it explicitly in
//! `allowed-types` to enable it at all.

use nix::unistd::getuid;

use crate::error::{Error, Result};
use crate::kv::Kv;

use super::Mechanism;

pub struct NoneMechanism;

const SIGNATURE: &str = "none";

impl Mechanism for NoneMechanism {
    fn name(&self) -> &'static str {
        "none"
    }

    fn sign(&self, _header_and_payload: &str) -> Result<String> {
        Ok(SIGNATURE.to_string())
    }

    fn verify(&self, header: &Kv, _header_and_payload: &str, signature: &str) -> Result<()> {
        if signature != SIGNATURE {
            return Err(Error::invalid_argument("none mechanism: signature must be literal 'none'"));
        }
        let claimed_uid = header.get_int64("userid")?;
        if claimed_uid != getuid().as_raw() as i64 {
            return Err(Error::permission_denied(
                "none mechanism: header userid does not match real uid",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_literal_none() {
        let sig = NoneMechanism.sign("h.p").unwrap();
        assert_eq!(sig, "none");
    }

    #[test]
    fn verify_requires_matching_uid() {
        let mut header = Kv::new();
        header.put_int64("userid", getuid().as_raw() as i64).unwrap();
        NoneMechanism.verify(&header, "h.p", "none").unwrap();

        let mut wrong = Kv::new();
        wrong.put_int64("userid", getuid().as_raw() as i64 + 1).unwrap();
        assert!(NoneMechanism.verify(&wrong, "h.p", "none").is_err());
    }

    #[test]
    fn verify_rejects_non_literal_signature() {
        let mut header = Kv::new();
        header.put_int64("userid", getuid().as_raw() as i64).unwrap();
        assert!(NoneMechanism.verify(&header, "h.p", "nope").is_err());
    }
}
