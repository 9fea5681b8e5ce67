//! Shared types for Certlane
//!
//! The site configuration model, the notification message passed from the
//! renewal engine to the SDS layer, and the metrics namespace.

pub mod config;
pub mod notification;

pub use config::{Site, SitesConfig};
pub use notification::{Notification, NotificationReceiver, NotificationSender};

/// Namespace every exported prometheus metric lives under. Kept stable as
/// the published metrics contract.
pub const PROMETHEUS_NAMESPACE: &str = "envoy_acme_sds";
