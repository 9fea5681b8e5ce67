//! Renewal-to-SDS notification channel
//!
//! A notification is a point-in-time snapshot of every site's current
//! certificate bundle, in configured order. It travels on a `watch` channel:
//! the SDS layer only ever needs the latest snapshot, so a fresh send simply
//! overwrites an unconsumed one.

use certlane_store::Certificates;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Notification {
    pub certificates: Vec<Certificates>,
}

pub type NotificationSender = watch::Sender<Option<Notification>>;
pub type NotificationReceiver = watch::Receiver<Option<Notification>>;

/// Fresh channel with no snapshot published yet.
pub fn channel() -> (NotificationSender, NotificationReceiver) {
    watch::channel(None)
}
