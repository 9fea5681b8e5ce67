//! Cloudflare DNS-01 provider
//!
//! Talks to the v4 API with a scoped token. The zone is discovered by
//! walking the record's labels from the longest suffix down, so delegated
//! sub-zones resolve to the right zone id.

use async_trait::async_trait;
use serde::Deserialize;

use super::{Credentials, DnsError, DnsProvider};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

pub struct CloudflareProvider {
    http: reqwest::Client,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    #[serde(default)]
    content: String,
}

impl CloudflareProvider {
    pub fn new(credentials: &Credentials) -> Result<Self, DnsError> {
        let token = credentials
            .get("CLOUDFLARE_DNS_API_TOKEN")
            .or_else(|| credentials.get("CF_API_TOKEN"))
            .ok_or(DnsError::MissingCredential("CLOUDFLARE_DNS_API_TOKEN"))?;
        Ok(Self {
            http: reqwest::Client::new(),
            token,
        })
    }

    fn check<T>(response: ApiResponse<T>, context: &str) -> Result<T, DnsError> {
        if !response.success {
            let detail = response
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DnsError::Api(format!("{context}: {detail}")));
        }
        response
            .result
            .ok_or_else(|| DnsError::Api(format!("{context}: empty result")))
    }

    async fn zone_id(&self, record: &str) -> Result<String, DnsError> {
        let labels: Vec<&str> = record.trim_end_matches('.').split('.').collect();
        for start in 0..labels.len().saturating_sub(1) {
            let candidate = labels[start..].join(".");
            let response: ApiResponse<Vec<Zone>> = self
                .http
                .get(format!("{API_BASE}/zones"))
                .bearer_auth(&self.token)
                .query(&[("name", candidate.as_str())])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let zones = Self::check(response, "list zones")?;
            if let Some(zone) = zones.into_iter().next() {
                return Ok(zone.id);
            }
        }
        Err(DnsError::Api(format!("no zone found for {record}")))
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    async fn present(&self, record: &str, value: &str) -> Result<(), DnsError> {
        let zone = self.zone_id(record).await?;
        let response: ApiResponse<DnsRecord> = self
            .http
            .post(format!("{API_BASE}/zones/{zone}/dns_records"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "type": "TXT",
                "name": record,
                "content": value,
                "ttl": 120,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Self::check(response, "create txt record")?;
        tracing::debug!(record, "published cloudflare txt record");
        Ok(())
    }

    async fn cleanup(&self, record: &str, value: &str) -> Result<(), DnsError> {
        let zone = self.zone_id(record).await?;
        let response: ApiResponse<Vec<DnsRecord>> = self
            .http
            .get(format!("{API_BASE}/zones/{zone}/dns_records"))
            .bearer_auth(&self.token)
            .query(&[("type", "TXT"), ("name", record)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let records = Self::check(response, "list txt records")?;

        for entry in records.into_iter().filter(|r| r.content == value) {
            let response: ApiResponse<serde_json::Value> = self
                .http
                .delete(format!("{API_BASE}/zones/{zone}/dns_records/{}", entry.id))
                .bearer_auth(&self.token)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Self::check(response, "delete txt record")?;
        }
        Ok(())
    }
}
