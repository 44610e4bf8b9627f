//! Supervises generated chat replies that must carry a tagged content block.
//!
//! Invalid replies are regenerated automatically after a cooldown, up to a
//! per-slot budget, and a cooperating auto-continue automation is held back
//! until the reply in front of it is valid.

mod conversation;
mod error;
mod events;
mod runtime;
mod service;

pub mod config;
pub mod gate;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod validity;


pub use config::CooperatingSettings;
pub use config::GuardConfig;
pub use config::ReplyTags;
pub use config::RetrySettings;
pub use config::coerce_count;

pub use conversation::ConversationEntry;
pub use conversation::ConversationSnapshot;
pub use conversation::SlotId;

pub use error::ReplyGuardError;
pub use error::Result;

pub use events::ReplyGuardEvent;
pub use events::ReplyGuardEventSender;

pub use gate::AllowReason;
pub use gate::AutoContinueGate;
pub use gate::BlockReason;
pub use gate::GateDecision;
pub use gate::SendAttempt;

pub use retry::RetryController;
pub use retry::RetryDecision;
pub use retry::RetryPhase;

pub use runtime::HostBridge;
pub use runtime::HostNotification;
pub use runtime::ReplyGuardRuntime;
pub use runtime::ReplyGuardStatus;

pub use scheduler::ManualScheduler;
pub use scheduler::Scheduler;
pub use scheduler::TimerFired;
pub use scheduler::TimerHandle;
pub use scheduler::TimerKind;
pub use scheduler::TokioScheduler;

pub use service::ReplyGuardCommand;
pub use service::ReplyGuardHandle;
pub use service::start_reply_guard;

pub use session::GenerationSessionTracker;
pub use session::SlotObservation;
pub use validity::ValidityPredicate;
