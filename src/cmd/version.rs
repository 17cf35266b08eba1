//! `version`: print the IMP's own version string. No parent half.

use crate::error::Result;
use crate::privsep::Privsep;

use super::ImpState;

pub fn child(_state: &ImpState, _ps: &Privsep) -> Result<i32> {
    println!("flux-imp v{}", env!("CARGO_PKG_VERSION"));
    Ok(0)
}
