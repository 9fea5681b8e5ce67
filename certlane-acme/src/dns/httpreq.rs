//! Generic webhook DNS-01 provider
//!
//! Delegates record management to an external HTTP endpoint: the challenge
//! is POSTed to `<endpoint>/present` and `<endpoint>/cleanup` as
//! `{"fqdn": ..., "value": ...}`. Useful for DNS servers with no public
//! API, where a small sidecar performs the actual update.

use async_trait::async_trait;
use serde::Serialize;

use super::{Credentials, DnsError, DnsProvider};

pub struct HttpreqProvider {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct ChallengeBody<'a> {
    fqdn: String,
    value: &'a str,
}

impl HttpreqProvider {
    pub fn new(credentials: &Credentials) -> Result<Self, DnsError> {
        let endpoint = credentials
            .get("HTTPREQ_ENDPOINT")
            .ok_or(DnsError::MissingCredential("HTTPREQ_ENDPOINT"))?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, action: &str, record: &str, value: &str) -> Result<(), DnsError> {
        let body = ChallengeBody {
            fqdn: format!("{}.", record.trim_end_matches('.')),
            value,
        };
        self.http
            .post(format!("{}/{action}", self.endpoint))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for HttpreqProvider {
    fn name(&self) -> &'static str {
        "httpreq"
    }

    async fn present(&self, record: &str, value: &str) -> Result<(), DnsError> {
        self.post("present", record, value).await
    }

    async fn cleanup(&self, record: &str, value: &str) -> Result<(), DnsError> {
        self.post("cleanup", record, value).await
    }
}
