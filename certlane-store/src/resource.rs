//! Certificate bundle records
//!
//! A bundle is everything one ACME order produced for a site: the leaf
//! chain, its private key, the issuer chain and the order urls. Byte fields
//! serialize as base64 strings so records stay compatible across backends.

use serde::{Deserialize, Serialize};

use crate::{Result, StoreError, b64};

/// One site's certificate material, keyed in the store by site name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificates {
    pub domain: String,

    pub cert_url: String,

    pub cert_stable_url: String,

    #[serde(with = "b64")]
    pub private_key: Vec<u8>,

    #[serde(with = "b64")]
    pub certificate: Vec<u8>,

    #[serde(with = "b64")]
    pub issuer_certificate: Vec<u8>,

    #[serde(with = "b64")]
    pub csr: Vec<u8>,
}

/// Owned summary of one parsed chain entry.
#[derive(Debug, Clone)]
pub struct ChainCertificate {
    pub subject: String,
    /// NotAfter as unix seconds.
    pub not_after: i64,
}

impl Certificates {
    /// Parse the PEM chain in `certificate` into per-entry summaries.
    ///
    /// A blank blob yields an empty chain (callers decide whether that
    /// means "issue" or "refuse to serve"); a blob that is present but not
    /// parseable is a corruption error.
    pub fn extract_certificates(&self) -> Result<Vec<ChainCertificate>> {
        let mut chain = Vec::new();
        let mut remaining: &[u8] = &self.certificate;

        loop {
            remaining = remaining.trim_ascii_start();
            if remaining.is_empty() {
                break;
            }

            match x509_parser::pem::parse_x509_pem(remaining) {
                Ok((rest, block)) => {
                    let cert = block
                        .parse_x509()
                        .map_err(|e| StoreError::Chain(e.to_string()))?;
                    chain.push(ChainCertificate {
                        subject: cert.subject().to_string(),
                        not_after: cert.validity().not_after.timestamp(),
                    });
                    if rest.len() >= remaining.len() {
                        break;
                    }
                    remaining = rest;
                }
                Err(e) if chain.is_empty() => {
                    return Err(StoreError::Chain(e.to_string()));
                }
                // Trailing non-PEM bytes after a valid chain are tolerated.
                Err(_) => break,
            }
        }

        Ok(chain)
    }
}
