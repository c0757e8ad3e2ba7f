//! Notifier port: outbound notifications (webhook, email) for Notify steps.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("notification timed out")]
    Timeout,
}

/// Port implemented by infra (webhook) and by fakes in tests. The engine
/// wraps every call in its notifier deadline (default 10s).
pub trait Notifier: Send + Sync {
    fn notify(
        &self,
        target: &str,
        message: &str,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}
