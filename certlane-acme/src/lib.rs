//! ACME issuance for Certlane
//!
//! Three parts: the `Issuer` trait and its `instant-acme` adapter, the
//! DNS-01 provider registry, and the renewal engine that drives both
//! against the store on a timer.

pub mod dns;
pub mod issuer;
pub mod renewal;

pub use dns::{Credentials, DnsError, DnsProvider, provider_by_name};
pub use issuer::{AcmeIssuer, IssuedBundle, Issuer, IssuerError, ObtainRequest};
pub use renewal::{RenewalConfig, RenewalError, RenewalService, need_renewal};
