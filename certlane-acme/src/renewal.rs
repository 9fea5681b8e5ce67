//! Renewal engine
//!
//! One background task sweeps the configured sites forever: take the store
//! lease, decide whether the site's certificate still has enough runway,
//! drive the issuer if not, write the result back, release the lease. When
//! any site changed during a sweep, a notification with the full current
//! certificate set goes out to the SDS layer.
//!
//! Provider credentials are process-wide environment state, so the engine
//! treats the environment as a per-site scratchpad: every key any site
//! declares is wiped before a site runs, and only the active site's pairs
//! are set while it does.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use certlane_core::config::{Site, SitesConfig, parse_env_pair};
use certlane_core::notification::{self, Notification, NotificationReceiver, NotificationSender};
use certlane_store::{Account, AccountKey, Certificates, Store, StoreError};

use crate::dns::{Credentials, DnsError, provider_by_name};
use crate::issuer::{IssuedBundle, Issuer, IssuerError, ObtainRequest};

const LOCK_ATTEMPTS: u32 = 11;
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Per-step renewal errors; the variant names the step that failed so the
/// operator can see which part of which site's renewal broke.
#[derive(Debug, Error)]
pub enum RenewalError {
    #[error("fetch resource: {0}")]
    FetchResource(#[source] StoreError),

    #[error("extract certificates: {0}")]
    ExtractChain(#[source] StoreError),

    #[error("fetch user: {0}")]
    FetchUser(#[source] StoreError),

    #[error("generate account key: {0}")]
    GenerateKey(#[source] StoreError),

    #[error("register account: {0}")]
    Register(#[source] IssuerError),

    #[error("write user: {0}")]
    WriteUser(#[source] StoreError),

    #[error("resolve dns provider: {0}")]
    Provider(#[source] DnsError),

    #[error("obtain certificate: {0}")]
    Obtain(#[source] IssuerError),

    #[error("write resource: {0}")]
    WriteResource(#[source] StoreError),
}

impl RenewalError {
    /// Store corruption means the operator must intervene; issuing over a
    /// record we cannot read would mask data loss, so the loop stops.
    pub fn is_fatal(&self) -> bool {
        match self {
            RenewalError::ExtractChain(_) => true,
            RenewalError::FetchResource(e)
            | RenewalError::FetchUser(e)
            | RenewalError::GenerateKey(e)
            | RenewalError::WriteUser(e)
            | RenewalError::WriteResource(e) => e.is_corruption(),
            RenewalError::Register(_) | RenewalError::Provider(_) | RenewalError::Obtain(_) => {
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// ACME directory url identifying the CA.
    pub ca_dir: String,
    /// Renew when the certificate has this many whole days (or fewer)
    /// left. Negative forces renewal every sweep.
    pub remain_days: i64,
    /// Pause between sweeps.
    pub interval: Duration,
    /// Advisory lease lifetime.
    pub lock_timeout: Duration,
    /// This replica's lease holder id.
    pub instance_id: String,
}

pub struct RenewalService {
    config: RenewalConfig,
    sites: SitesConfig,
    store: Arc<dyn Store>,
    issuer: Arc<dyn Issuer>,
    notify: NotificationSender,
}

impl RenewalService {
    pub fn new(
        config: RenewalConfig,
        sites: SitesConfig,
        store: Arc<dyn Store>,
        issuer: Arc<dyn Issuer>,
    ) -> Self {
        let (notify, _) = notification::channel();
        Self {
            config,
            sites,
            store,
            issuer,
            notify,
        }
    }

    /// A receiver for the snapshot notifications this engine publishes.
    pub fn subscribe(&self) -> NotificationReceiver {
        self.notify.subscribe()
    }

    /// Run sweeps until shutdown. Returns an error only for fatal store
    /// corruption; everything else is logged and retried next sweep.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RenewalError> {
        loop {
            let mut sites_changed = false;

            for site in &self.sites.sites {
                if *shutdown.borrow() {
                    return Ok(());
                }
                tracing::info!(site = site.name.as_str(), "checking certificate");

                if !self.acquire_lease(site).await {
                    continue;
                }

                let result = {
                    self.wipe_environment();
                    self.renew_one(site).await
                };

                if let Err(e) = self.store.release(&self.config.instance_id).await {
                    tracing::warn!(site = site.name.as_str(), error = %e, "failed to release lease");
                }

                match result {
                    Ok(true) => sites_changed = true,
                    Ok(false) => {}
                    Err(e) if e.is_fatal() => {
                        tracing::error!(site = site.name.as_str(), error = %e, "store corruption, stopping");
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::error!(site = site.name.as_str(), error = %e, "renewal failed, will retry next sweep");
                    }
                }
            }

            if sites_changed {
                self.fire_notification().await;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Try the lease up to 11 times, 5 s apart. Lease trouble is site-local:
    /// a replica that cannot acquire simply skips the site this sweep.
    async fn acquire_lease(&self, site: &Site) -> bool {
        for attempt in 1..=LOCK_ATTEMPTS {
            match self
                .store
                .lock(&self.config.instance_id, self.config.lock_timeout)
                .await
            {
                Ok(true) => return true,
                Ok(false) => {
                    tracing::debug!(
                        site = site.name.as_str(),
                        attempt,
                        "lease held elsewhere, waiting"
                    );
                }
                Err(e) => {
                    tracing::warn!(site = site.name.as_str(), attempt, error = %e, "lease attempt failed");
                }
            }
            if attempt < LOCK_ATTEMPTS {
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
        }
        tracing::warn!(
            site = site.name.as_str(),
            "could not acquire lease, skipping this sweep"
        );
        false
    }

    /// Check one site and renew if needed. `Ok(true)` means the stored
    /// bundle changed.
    pub async fn renew_one(&self, site: &Site) -> Result<bool, RenewalError> {
        match self.store.fetch_resource(&site.name).await {
            Err(StoreError::NotFoundCertificate) => {
                tracing::info!(site = site.name.as_str(), "no certificate yet, issuing");
            }
            Err(e) => return Err(RenewalError::FetchResource(e)),
            Ok(resource) => {
                let chain = resource
                    .extract_certificates()
                    .map_err(RenewalError::ExtractChain)?;
                match chain.first() {
                    Some(leaf) if !need_renewal(leaf.not_after, self.config.remain_days) => {
                        tracing::debug!(site = site.name.as_str(), "certificate still fresh");
                        return Ok(false);
                    }
                    Some(_) => {
                        tracing::info!(site = site.name.as_str(), "certificate needs renewal");
                    }
                    None => {
                        tracing::warn!(
                            site = site.name.as_str(),
                            "stored chain is empty, reissuing"
                        );
                    }
                }
            }
        }

        let account = self.fetch_or_register_account(site).await?;

        let credentials = self.apply_site_env(site);
        let provider =
            provider_by_name(&site.provider, &credentials).map_err(RenewalError::Provider)?;

        tracing::info!(site = site.name.as_str(), domains = ?site.domains, "starting acme order");
        let bundle = self
            .issuer
            .obtain(
                &self.config.ca_dir,
                &account,
                provider,
                ObtainRequest {
                    domains: site.domains.clone(),
                    bundle: true,
                },
            )
            .await
            .map_err(RenewalError::Obtain)?;

        self.store
            .write_resource(&site.name, &bundle_to_resource(bundle))
            .await
            .map_err(RenewalError::WriteResource)?;

        Ok(true)
    }

    async fn fetch_or_register_account(&self, site: &Site) -> Result<Account, RenewalError> {
        match self.store.fetch_user(&self.config.ca_dir, &site.email).await {
            Ok(account) => Ok(account),
            Err(StoreError::NotFoundUser) => {
                tracing::info!(email = site.email.as_str(), "registering new acme account");
                let key = AccountKey::generate_p256().map_err(RenewalError::GenerateKey)?;
                let registration = self
                    .issuer
                    .register(&self.config.ca_dir, &site.email)
                    .await
                    .map_err(RenewalError::Register)?;
                let account = Account {
                    email: site.email.clone(),
                    registration: Some(registration),
                    key,
                };
                self.store
                    .write_user(&self.config.ca_dir, &account)
                    .await
                    .map_err(RenewalError::WriteUser)?;
                Ok(account)
            }
            Err(e) => Err(RenewalError::FetchUser(e)),
        }
    }

    /// Publish the current certificate set for every site, in configured
    /// order, skipping sites whose record is unreadable or absent.
    pub async fn fire_notification(&self) {
        let mut certificates = Vec::with_capacity(self.sites.sites.len());
        for site in &self.sites.sites {
            match self.store.fetch_resource(&site.name).await {
                Ok(resource) => certificates.push(resource),
                Err(e) => {
                    tracing::warn!(site = site.name.as_str(), error = %e, "skipping site in notification");
                }
            }
        }
        tracing::debug!(certificates = certificates.len(), "firing notification");
        self.notify.send_replace(Some(Notification { certificates }));
    }

    /// Unset every environment variable any site's `legoenv` names, so
    /// credentials never bleed from one site into the next.
    fn wipe_environment(&self) {
        for site in &self.sites.sites {
            for key in site.env_keys() {
                // Sole mutator: the renewal loop is the only task touching
                // these variables.
                unsafe { std::env::remove_var(key) };
            }
        }
    }

    /// Export the site's credential pairs into the environment and collect
    /// them into the typed map handed to the provider.
    fn apply_site_env(&self, site: &Site) -> Credentials {
        let mut pairs = Vec::new();
        for entry in &site.lego_env {
            match parse_env_pair(entry) {
                Some((key, value)) => {
                    unsafe { std::env::set_var(key, value) };
                    tracing::debug!(key, "set provider credential");
                    pairs.push((key.to_string(), value.to_string()));
                }
                None => {
                    tracing::warn!(
                        site = site.name.as_str(),
                        entry = entry.as_str(),
                        "ignoring malformed legoenv entry"
                    );
                }
            }
        }
        Credentials::from_pairs(pairs)
    }
}

fn bundle_to_resource(bundle: IssuedBundle) -> Certificates {
    Certificates {
        domain: bundle.domain,
        cert_url: bundle.cert_url,
        cert_stable_url: bundle.cert_stable_url,
        private_key: bundle.private_key,
        certificate: bundle.certificate,
        issuer_certificate: bundle.issuer_certificate,
        csr: bundle.csr,
    }
}

/// Whether a certificate expiring at `not_after` (unix seconds) has
/// `remain_days` or fewer whole days left. Negative `remain_days` always
/// renews.
pub fn need_renewal(not_after: i64, remain_days: i64) -> bool {
    if remain_days < 0 {
        return true;
    }
    let days_left = (not_after - chrono::Utc::now().timestamp()) / 86_400;
    days_left <= remain_days
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use certlane_store::FileStore;

    use crate::dns::DnsProvider;

    fn days_from_now(days: i64) -> i64 {
        chrono::Utc::now().timestamp() + days * 86_400
    }

    #[test]
    fn renewal_threshold_is_a_whole_day_boundary() {
        // 30 full days left, threshold 25: keep.
        assert!(!need_renewal(days_from_now(30), 25));
        // 25 days left, threshold 25: renew.
        assert!(need_renewal(days_from_now(25), 25));
        // 24 days and change truncates to 24: renew.
        assert!(need_renewal(days_from_now(25) - 3600, 25));
        // Already expired: renew.
        assert!(need_renewal(days_from_now(-1), 25));
        // Negative threshold forces renewal of a fresh certificate.
        assert!(need_renewal(days_from_now(300), -1));
    }

    /// Issuer double that returns a canned bundle and records call counts.
    struct FakeIssuer {
        bundle: IssuedBundle,
        obtained: Mutex<u32>,
    }

    impl FakeIssuer {
        fn new(certificate: Vec<u8>) -> Self {
            Self {
                bundle: IssuedBundle {
                    domain: "example.com".into(),
                    cert_url: "https://ca.test/order/1".into(),
                    cert_stable_url: "https://ca.test/order/1".into(),
                    private_key: b"test key".to_vec(),
                    certificate,
                    issuer_certificate: Vec::new(),
                    csr: Vec::new(),
                },
                obtained: Mutex::new(0),
            }
        }

        fn obtain_count(&self) -> u32 {
            *self.obtained.lock().unwrap()
        }
    }

    #[async_trait]
    impl Issuer for FakeIssuer {
        async fn register(
            &self,
            _ca_dir: &str,
            email: &str,
        ) -> Result<serde_json::Value, IssuerError> {
            Ok(serde_json::json!({ "contact": email }))
        }

        async fn obtain(
            &self,
            _ca_dir: &str,
            account: &Account,
            _provider: std::sync::Arc<dyn DnsProvider>,
            _request: ObtainRequest,
        ) -> Result<IssuedBundle, IssuerError> {
            assert!(account.registration.is_some());
            *self.obtained.lock().unwrap() += 1;
            Ok(self.bundle.clone())
        }
    }

    fn test_site(name: &str) -> Site {
        Site {
            name: name.into(),
            provider: "httpreq".into(),
            email: "ops@example.com".into(),
            domains: vec!["example.com".into()],
            lego_env: vec!["HTTPREQ_ENDPOINT=http://127.0.0.1:1/hook".into()],
        }
    }

    fn self_signed_cert_pem(days: u32) -> Vec<u8> {
        use openssl::asn1::Asn1Time;
        use openssl::ec::{EcGroup, EcKey};
        use openssl::hash::MessageDigest;
        use openssl::nid::Nid;
        use openssl::pkey::PKey;
        use openssl::x509::{X509, X509NameBuilder};

        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "example.com").unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(days).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build().to_pem().unwrap()
    }

    async fn service_with(
        sites: Vec<Site>,
        cert_days: u32,
        remain_days: i64,
    ) -> (tempfile::TempDir, Arc<FakeIssuer>, RenewalService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).await.unwrap());
        let issuer = Arc::new(FakeIssuer::new(self_signed_cert_pem(cert_days)));
        let service = RenewalService::new(
            RenewalConfig {
                ca_dir: "https://acme-staging-v02.api.letsencrypt.org/directory".into(),
                remain_days,
                interval: Duration::from_secs(3600),
                lock_timeout: Duration::from_secs(600),
                instance_id: "test-instance".into(),
            },
            SitesConfig { sites },
            store,
            issuer.clone(),
        );
        (dir, issuer, service)
    }

    #[tokio::test]
    async fn first_run_registers_and_issues() {
        let (_dir, issuer, service) = service_with(vec![test_site("s1")], 90, 25).await;
        let site = service.sites.sites[0].clone();

        let changed = service.renew_one(&site).await.unwrap();
        assert!(changed);
        assert_eq!(issuer.obtain_count(), 1);

        // Account and resource both persisted.
        let account = service
            .store
            .fetch_user(&service.config.ca_dir, "ops@example.com")
            .await
            .unwrap();
        assert!(account.registration.is_some());
        let resource = service.store.fetch_resource("s1").await.unwrap();
        assert_eq!(resource.domain, "example.com");
        assert!(!resource.extract_certificates().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fresh_certificate_is_left_alone() {
        let (_dir, issuer, service) = service_with(vec![test_site("s1")], 90, 25).await;
        let site = service.sites.sites[0].clone();

        assert!(service.renew_one(&site).await.unwrap());
        // Second pass sees ~90 days of runway against a 25 day threshold.
        assert!(!service.renew_one(&site).await.unwrap());
        assert_eq!(issuer.obtain_count(), 1);
    }

    #[tokio::test]
    async fn short_runway_triggers_reissue() {
        let (_dir, issuer, service) = service_with(vec![test_site("s1")], 10, 25).await;
        let site = service.sites.sites[0].clone();

        assert!(service.renew_one(&site).await.unwrap());
        // 10 days left <= 25 day threshold: renews again.
        assert!(service.renew_one(&site).await.unwrap());
        assert_eq!(issuer.obtain_count(), 2);
    }

    #[tokio::test]
    async fn unknown_provider_fails_without_touching_the_store() {
        let mut site = test_site("s1");
        site.provider = "route66".into();
        let (_dir, issuer, service) = service_with(vec![site.clone()], 90, 25).await;

        let err = service.renew_one(&site).await.unwrap_err();
        assert!(matches!(err, RenewalError::Provider(_)));
        assert!(!err.is_fatal());
        assert_eq!(issuer.obtain_count(), 0);
        assert!(matches!(
            service.store.fetch_resource("s1").await,
            Err(StoreError::NotFoundCertificate)
        ));
    }

    #[tokio::test]
    async fn corrupt_resource_is_fatal() {
        let (dir, _issuer, service) = service_with(vec![test_site("s1")], 90, 25).await;
        tokio::fs::write(dir.path().join("resource-s1.json"), b"{broken")
            .await
            .unwrap();

        let err = service
            .renew_one(&service.sites.sites[0].clone())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn environment_is_wiped_between_sites() {
        let mut other = test_site("s2");
        other.lego_env = vec!["OTHER_SITE_TOKEN=secret".into(), "not=valid".into()];
        let (_dir, _issuer, service) =
            service_with(vec![test_site("s1"), other.clone()], 90, 25).await;

        // Site s2 ran and left its credentials behind.
        let credentials = service.apply_site_env(&other);
        assert_eq!(std::env::var("OTHER_SITE_TOKEN").unwrap(), "secret");
        assert_eq!(credentials.get("OTHER_SITE_TOKEN").as_deref(), Some("secret"));
        // Malformed entry was skipped, not exported.
        assert!(std::env::var("not").is_err());

        // Next site starts with a clean slate.
        service.wipe_environment();
        assert!(std::env::var("OTHER_SITE_TOKEN").is_err());
    }

    #[tokio::test]
    async fn notification_carries_sites_in_configured_order() {
        let (_dir, _issuer, service) =
            service_with(vec![test_site("s1"), test_site("s2")], 90, 25).await;
        let mut rx = service.subscribe();

        for site in service.sites.sites.clone() {
            service.renew_one(&site).await.unwrap();
        }
        service.fire_notification().await;

        let notification = rx.borrow_and_update().clone().unwrap();
        assert_eq!(notification.certificates.len(), 2);
        assert_eq!(notification.certificates[0].domain, "example.com");
    }
}
