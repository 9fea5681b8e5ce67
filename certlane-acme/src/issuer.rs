//! Issuer interface and the instant-acme adapter
//!
//! The renewal engine only ever talks to the `Issuer` trait: register an
//! account, obtain a bundle. `AcmeIssuer` adapts the instant-acme client,
//! running the RFC 8555 order state machine with DNS-01 challenges solved
//! through a `DnsProvider`.

use std::sync::Arc;

use async_trait::async_trait;
use instant_acme::{
    Account as AcmeAccount, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier,
    NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use thiserror::Error;

use certlane_store::Account;

use crate::dns::{DnsError, DnsProvider};

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("acme protocol: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("account has no registration with this ca")]
    NotRegistered,

    #[error("account credentials: {0}")]
    Credentials(#[source] serde_json::Error),

    #[error("challenge: {0}")]
    Challenge(String),

    #[error("order failed: {0}")]
    Order(String),

    #[error("dns provider: {0}")]
    Dns(#[from] DnsError),

    #[error("certificate chain: {0}")]
    Chain(String),
}

#[derive(Debug, Clone)]
pub struct ObtainRequest {
    pub domains: Vec<String>,
    /// Include the issuer chain in the certificate blob.
    pub bundle: bool,
}

/// Everything one successful order produced.
#[derive(Debug, Clone)]
pub struct IssuedBundle {
    pub domain: String,
    pub cert_url: String,
    pub cert_stable_url: String,
    pub private_key: Vec<u8>,
    pub certificate: Vec<u8>,
    pub issuer_certificate: Vec<u8>,
    pub csr: Vec<u8>,
}

#[async_trait]
pub trait Issuer: Send + Sync {
    /// Register `email` with the CA, terms of service agreed. Returns the
    /// opaque credentials blob the store keeps under `registration`.
    async fn register(
        &self,
        ca_dir: &str,
        email: &str,
    ) -> Result<serde_json::Value, IssuerError>;

    /// Run one order for the account and hand back the issued bundle.
    async fn obtain(
        &self,
        ca_dir: &str,
        account: &Account,
        provider: Arc<dyn DnsProvider>,
        request: ObtainRequest,
    ) -> Result<IssuedBundle, IssuerError>;
}

/// The production issuer over instant-acme.
#[derive(Debug, Default)]
pub struct AcmeIssuer;

impl AcmeIssuer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Issuer for AcmeIssuer {
    async fn register(
        &self,
        ca_dir: &str,
        email: &str,
    ) -> Result<serde_json::Value, IssuerError> {
        let contact = format!("mailto:{email}");
        let (_account, credentials) = AcmeAccount::builder()?
            .create(
                &NewAccount {
                    contact: &[&contact],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                ca_dir.to_string(),
                None,
            )
            .await?;
        serde_json::to_value(&credentials).map_err(IssuerError::Credentials)
    }

    async fn obtain(
        &self,
        _ca_dir: &str,
        account: &Account,
        provider: Arc<dyn DnsProvider>,
        request: ObtainRequest,
    ) -> Result<IssuedBundle, IssuerError> {
        let registration = account
            .registration
            .clone()
            .ok_or(IssuerError::NotRegistered)?;
        let credentials: AccountCredentials =
            serde_json::from_value(registration).map_err(IssuerError::Credentials)?;
        let acme_account = AcmeAccount::builder()?.from_credentials(credentials).await?;

        let identifiers: Vec<Identifier> = request
            .domains
            .iter()
            .map(|domain| Identifier::Dns(domain.clone()))
            .collect();
        let mut order = acme_account.new_order(&NewOrder::new(&identifiers)).await?;
        let cert_url = order.url().to_string();

        // Solve every pending authorization over DNS-01. Records stay up
        // until the order has been polled, then all are cleaned.
        let mut presented: Vec<(String, String)> = Vec::new();
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result?;
                let domain = authz.identifier().to_string();
                if authz.status == AuthorizationStatus::Valid {
                    tracing::debug!(domain, "authorization already valid");
                    continue;
                }

                let mut challenge =
                    authz.challenge(ChallengeType::Dns01).ok_or_else(|| {
                        IssuerError::Challenge(format!("no dns-01 challenge offered for {domain}"))
                    })?;
                let record = format!("_acme-challenge.{}", domain.trim_start_matches("*."));
                let value = challenge.key_authorization().dns_value();

                tracing::info!(domain, record, "publishing dns-01 challenge");
                provider.present(&record, &value).await?;
                presented.push((record, value));

                tokio::time::sleep(provider.propagation_wait()).await;
                challenge.set_ready().await?;
            }
        }

        let status = order.poll_ready(&RetryPolicy::default()).await;

        for (record, value) in &presented {
            if let Err(e) = provider.cleanup(record, value).await {
                tracing::warn!(record, error = %e, "failed to clean up challenge record");
            }
        }

        let status = status?;
        if status != OrderStatus::Ready && status != OrderStatus::Valid {
            return Err(IssuerError::Order(format!("order ended in state {status:?}")));
        }

        let key_pem = order.finalize().await?;
        let chain_pem = order.poll_certificate(&RetryPolicy::default()).await?;

        let (certificate, issuer_certificate) = split_chain(&chain_pem, request.bundle)?;
        tracing::info!(domains = ?request.domains, "certificate issued");

        Ok(IssuedBundle {
            domain: request.domains.first().cloned().unwrap_or_default(),
            cert_stable_url: cert_url.clone(),
            cert_url,
            private_key: key_pem.into_bytes(),
            certificate,
            issuer_certificate,
            // instant-acme generates the CSR internally and does not expose
            // it; the field stays empty in stored bundles.
            csr: Vec::new(),
        })
    }
}

/// Split a downloaded chain into the certificate blob and the issuer chain.
///
/// With `bundle` the certificate blob keeps the full chain (leaf first);
/// otherwise it is trimmed to the leaf. The issuer chain is everything
/// after the leaf either way.
fn split_chain(chain_pem: &str, bundle: bool) -> Result<(Vec<u8>, Vec<u8>), IssuerError> {
    let blocks =
        pem::parse_many(chain_pem.as_bytes()).map_err(|e| IssuerError::Chain(e.to_string()))?;
    if blocks.is_empty() {
        return Err(IssuerError::Chain("empty certificate chain".to_string()));
    }

    let issuer = if blocks.len() > 1 {
        pem::encode_many(&blocks[1..]).into_bytes()
    } else {
        Vec::new()
    };
    let certificate = if bundle {
        chain_pem.as_bytes().to_vec()
    } else {
        pem::encode(&blocks[0]).into_bytes()
    };
    Ok((certificate, issuer))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEAF: &str = "-----BEGIN CERTIFICATE-----\nbGVhZg==\n-----END CERTIFICATE-----\n";
    const ISSUER: &str = "-----BEGIN CERTIFICATE-----\naXNzdWVy\n-----END CERTIFICATE-----\n";

    #[test]
    fn bundled_chain_keeps_leaf_and_issuer() {
        let chain = format!("{LEAF}{ISSUER}");
        let (certificate, issuer) = split_chain(&chain, true).unwrap();
        assert_eq!(certificate, chain.as_bytes());

        let issuer_blocks = pem::parse_many(&issuer).unwrap();
        assert_eq!(issuer_blocks.len(), 1);
        assert_eq!(issuer_blocks[0].contents(), b"issuer");
    }

    #[test]
    fn unbundled_chain_is_trimmed_to_the_leaf() {
        let chain = format!("{LEAF}{ISSUER}");
        let (certificate, _) = split_chain(&chain, false).unwrap();
        let blocks = pem::parse_many(&certificate[..]).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].contents(), b"leaf");
    }

    #[test]
    fn single_entry_chain_has_no_issuer() {
        let (certificate, issuer) = split_chain(LEAF, true).unwrap();
        assert_eq!(certificate, LEAF.as_bytes());
        assert!(issuer.is_empty());
    }

    #[test]
    fn empty_chain_is_an_error() {
        assert!(split_chain("", true).is_err());
    }
}
