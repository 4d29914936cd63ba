use async_trait::async_trait;
use tracing::info;

use crate::errors::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound mail transport.
///
/// Sending is fire-and-forget from the caller's point of view: failures are
/// logged by whoever spawned the send and never fail the triggering request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailDispatcher: Send + Sync {
    async fn send(&self, message: MailMessage) -> Result<(), ServiceError>;
}

/// Writes mail to the log instead of delivering it
#[derive(Debug, Clone)]
pub struct LogMailDispatcher {
    from: String,
}

impl LogMailDispatcher {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl MailDispatcher for LogMailDispatcher {
    async fn send(&self, message: MailMessage) -> Result<(), ServiceError> {
        info!(
            from = %self.from,
            to = %message.to,
            subject = %message.subject,
            "mail dispatched"
        );
        Ok(())
    }
}
