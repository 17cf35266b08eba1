//! Trust and access infrastructure for a multi-user workload manager:
//! certificate and credential primitives, a certificate authority, the
//! pluggable sign/verify pipeline, and the privilege-separation harness
//! that the `flux-imp` binary builds on.

pub mod ca;
pub mod cmd;
pub mod config;
pub mod error;
pub mod kv;
pub mod logging;
pub mod passwd;
pub mod path;
pub mod privsep;
pub mod sigcert;
pub mod sign;
pub mod sudosim;

pub use error::{Error, ErrorKind, Result};
