use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::error::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ReleaseCompleted,
    ReleaseFailed,
    HoldApplied,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ReleaseCompleted => "release_completed",
            NotificationKind::ReleaseFailed => "release_failed",
            NotificationKind::HoldApplied => "hold_applied",
        }
    }
}

/// Fire-and-forget notification sink. Delivery failures are the caller's
/// problem to log, never to propagate: a failed notification must not roll
/// back a ledger transaction.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        recipient: Uuid,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> AppResult<()>;
}

/// Default sink: structured log lines picked up by the notification service.
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(
        &self,
        recipient: Uuid,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> AppResult<()> {
        info!(
            target: "notifications",
            %recipient,
            kind = kind.as_str(),
            %payload,
            "notification dispatched"
        );
        Ok(())
    }
}
