//! Observable events emitted while supervising replies.

use std::sync::Arc;
use std::time::Duration;

use crate::conversation::SlotId;
use crate::gate::BlockReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyGuardEvent {
    /// An invalid reply was seen and a regeneration is queued.
    RetryScheduled {
        slot: SlotId,
        attempt: u32,
        max_retries: u32,
        delay: Duration,
    },
    /// The cooldown elapsed and the regenerate action is about to run.
    RegenerateRequested { slot: SlotId, attempt: u32 },
    /// The regenerate action returned an error. The attempt stays consumed.
    RegenerateFailed {
        slot: SlotId,
        attempt: u32,
        error: String,
    },
    /// The retry budget for this slot is spent. Emitted once per slot.
    MaxRetriesReached { slot: SlotId, max_retries: u32 },
    /// The reply at this slot passed validation.
    ReplyAccepted { slot: SlotId },
    /// A manual regeneration froze automatic retries until the next user turn.
    RetriesSuppressed,
    /// The cooperating automation was let through for this slot.
    AutoContinueAllowed { slot: SlotId },
    /// The cooperating automation was held back.
    AutoContinueBlocked { reason: BlockReason },
}

impl ReplyGuardEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::RegenerateRequested { .. } => "regenerate_requested",
            Self::RegenerateFailed { .. } => "regenerate_failed",
            Self::MaxRetriesReached { .. } => "max_retries_reached",
            Self::ReplyAccepted { .. } => "reply_accepted",
            Self::RetriesSuppressed => "retries_suppressed",
            Self::AutoContinueAllowed { .. } => "auto_continue_allowed",
            Self::AutoContinueBlocked { .. } => "auto_continue_blocked",
        }
    }
}

#[derive(Clone)]
pub struct ReplyGuardEventSender {
    inner: Arc<dyn Fn(ReplyGuardEvent) + Send + Sync>,
}

impl ReplyGuardEventSender {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(ReplyGuardEvent) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Sender that drops every event.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    #[tracing::instrument(skip(self, event), fields(event = event.kind()))]
    pub fn send(&self, event: ReplyGuardEvent) {
        tracing::debug!(target: "reply_guard::events", event = event.kind(), "dispatch reply guard event");
        (self.inner)(event);
    }
}

impl std::fmt::Debug for ReplyGuardEventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyGuardEventSender")
            .finish_non_exhaustive()
    }
}
