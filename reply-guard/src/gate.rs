//! One-shot gate for the cooperating auto-continue automation.
//!
//! The cooperating automation wants to send a continue-style message once a
//! reply is in place. The gate holds such programmatic sends back while the
//! reply is still generating or invalid, and lets exactly one through per
//! valid slot.

use crate::config::CooperatingSettings;
use crate::conversation::ConversationSnapshot;
use crate::conversation::SlotId;
use crate::session::SlotObservation;
use crate::validity::ValidityPredicate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateState {
    pub observed_slot: Option<SlotId>,
    pub last_known_valid: bool,
    pub consumed_for_slot: Option<SlotId>,
}

impl Default for GateState {
    fn default() -> Self {
        Self {
            observed_slot: None,
            last_known_valid: true,
            consumed_for_slot: None,
        }
    }
}

/// A send the cooperating automation is about to make.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendAttempt {
    /// Typed by the user rather than injected by the automation.
    pub is_trusted: bool,
    pub message_text: String,
    /// Settings to judge the attempt against. When absent the runtime reads
    /// them from the host.
    pub cooperating: Option<CooperatingSettings>,
}

impl SendAttempt {
    pub fn programmatic(message_text: impl Into<String>) -> Self {
        Self {
            is_trusted: false,
            message_text: message_text.into(),
            cooperating: None,
        }
    }

    pub fn trusted(message_text: impl Into<String>) -> Self {
        Self {
            is_trusted: true,
            message_text: message_text.into(),
            cooperating: None,
        }
    }

    pub fn with_cooperating(mut self, settings: CooperatingSettings) -> Self {
        self.cooperating = Some(settings);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    UserInitiated,
    /// Not a continue-style send; outside the gate's concern.
    NotAutoContinue,
    NothingObserved,
    FirstValidSend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    GenerationInFlight,
    AwaitingSettle,
    InvalidReply,
    AlreadyConsumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow(AllowReason),
    Block(BlockReason),
}

impl GateDecision {
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Block(_))
    }
}

/// What the gate needs to know about the rest of the system at send time.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub generation_in_flight: bool,
    pub settle_pending: bool,
    pub conversation: &'a ConversationSnapshot,
    pub predicate: &'a ValidityPredicate,
}

#[derive(Debug, Default)]
pub struct AutoContinueGate {
    state: GateState,
}

impl AutoContinueGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    /// Records the latest reply seen at a slot. Moving to another slot
    /// re-arms the one-shot permission.
    pub fn observe(&mut self, observation: &SlotObservation, predicate: &ValidityPredicate) {
        if self.state.observed_slot.as_ref() != Some(&observation.slot) {
            self.state.observed_slot = Some(observation.slot.clone());
            self.state.consumed_for_slot = None;
        }
        self.state.last_known_valid = predicate.is_valid(&observation.text);
    }

    pub fn decide(
        &mut self,
        is_trusted: bool,
        message_text: &str,
        cooperating: Option<&CooperatingSettings>,
        ctx: GateContext<'_>,
    ) -> GateDecision {
        if is_trusted {
            return GateDecision::Allow(AllowReason::UserInitiated);
        }
        let is_auto_continue = cooperating.is_some_and(|settings| {
            settings.is_auto_continue_armed() && settings.matches_option(message_text)
        });
        if !is_auto_continue {
            return GateDecision::Allow(AllowReason::NotAutoContinue);
        }

        if ctx.generation_in_flight {
            return self.block(BlockReason::GenerationInFlight);
        }
        if ctx.settle_pending {
            return self.block(BlockReason::AwaitingSettle);
        }

        let Some(slot) = self.state.observed_slot.clone() else {
            return GateDecision::Allow(AllowReason::NothingObserved);
        };

        let text = ctx.conversation.reply_text(&slot);
        self.state.last_known_valid = ctx.predicate.is_valid_opt(text);
        if !self.state.last_known_valid {
            return self.block(BlockReason::InvalidReply);
        }

        if self.state.consumed_for_slot.as_ref() == Some(&slot) {
            return self.block(BlockReason::AlreadyConsumed);
        }

        tracing::info!(target: "reply_guard::gate", slot = %slot, "auto-continue allowed");
        self.state.consumed_for_slot = Some(slot);
        GateDecision::Allow(AllowReason::FirstValidSend)
    }

    /// Boolean form of [`Self::decide`]: true means the send must not go out.
    pub fn should_block(
        &mut self,
        is_trusted: bool,
        message_text: &str,
        cooperating: Option<&CooperatingSettings>,
        ctx: GateContext<'_>,
    ) -> bool {
        let decision = self.decide(is_trusted, message_text, cooperating, ctx);
        decision.is_blocked()
    }

    pub fn reset(&mut self) {
        self.state = GateState::default();
    }

    fn block(&self, reason: BlockReason) -> GateDecision {
        tracing::debug!(
            target: "reply_guard::gate",
            ?reason,
            slot = ?self.state.observed_slot,
            "auto-continue blocked"
        );
        GateDecision::Block(reason)
    }
}
