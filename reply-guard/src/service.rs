//! Async driver that owns a [`ReplyGuardRuntime`] on a tokio task.
//!
//! Hosts talk to the task through a cloneable [`ReplyGuardHandle`]. Commands
//! and fired timers are processed one at a time on the same task, so the
//! runtime never sees concurrent calls.

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::GuardConfig;
use crate::error::ReplyGuardError;
use crate::error::Result;
use crate::events::ReplyGuardEventSender;
use crate::gate::SendAttempt;
use crate::runtime::HostBridge;
use crate::runtime::HostNotification;
use crate::runtime::ReplyGuardRuntime;
use crate::runtime::ReplyGuardStatus;
use crate::scheduler::TimerFired;
use crate::scheduler::TokioScheduler;

#[derive(Debug)]
pub enum ReplyGuardCommand {
    Notify(HostNotification),
    EvaluateSend {
        attempt: SendAttempt,
        reply: oneshot::Sender<bool>,
    },
    ManualOverride,
    Status {
        reply: oneshot::Sender<ReplyGuardStatus>,
    },
}

impl ReplyGuardCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Notify(notification) => notification.kind(),
            Self::EvaluateSend { .. } => "evaluate_send",
            Self::ManualOverride => "manual_override",
            Self::Status { .. } => "status",
        }
    }
}

#[derive(Clone)]
pub struct ReplyGuardHandle {
    tx: mpsc::UnboundedSender<ReplyGuardCommand>,
    cancel_token: CancellationToken,
}

impl ReplyGuardHandle {
    pub fn send(&self, command: ReplyGuardCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| ReplyGuardError::Stopped)
    }

    pub fn notify(&self, notification: HostNotification) -> Result<()> {
        self.send(ReplyGuardCommand::Notify(notification))
    }

    /// Asks whether a send must be blocked. After dispose every send is
    /// allowed.
    pub async fn evaluate_send(&self, attempt: SendAttempt) -> Result<bool> {
        if self.cancel_token.is_cancelled() {
            return Ok(false);
        }
        let (reply, rx) = oneshot::channel();
        self.send(ReplyGuardCommand::EvaluateSend { attempt, reply })?;
        // A dispose racing this request drops the reply sender.
        Ok(rx.await.unwrap_or(false))
    }

    pub fn notify_manual_override(&self) -> Result<()> {
        self.send(ReplyGuardCommand::ManualOverride)
    }

    pub async fn status(&self) -> Result<ReplyGuardStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(ReplyGuardCommand::Status { reply })?;
        rx.await.map_err(|_| ReplyGuardError::Stopped)
    }

    /// Stops the service task and cancels every timer it armed.
    pub fn dispose(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the service task has shut down.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

impl std::fmt::Debug for ReplyGuardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyGuardHandle")
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Spawns the guard on the current tokio runtime.
pub fn start_reply_guard<H>(
    host: H,
    config: &GuardConfig,
    events: ReplyGuardEventSender,
) -> Result<ReplyGuardHandle>
where
    H: HostBridge + Send + 'static,
{
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let runtime = ReplyGuardRuntime::new(host, TokioScheduler::new(timer_tx), config, events)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel_token = CancellationToken::new();

    let worker = run_reply_guard(runtime, rx, timer_rx, cancel_token.clone());
    tokio::spawn(worker);
    tracing::info!(target: "reply_guard::service", "reply guard started");

    Ok(ReplyGuardHandle { tx, cancel_token })
}

async fn run_reply_guard<H: HostBridge>(
    mut runtime: ReplyGuardRuntime<H, TokioScheduler>,
    mut commands: mpsc::UnboundedReceiver<ReplyGuardCommand>,
    mut timers: mpsc::UnboundedReceiver<TimerFired>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            Some(fired) = timers.recv() => {
                if runtime.scheduler_mut().complete(fired.handle) {
                    runtime.on_timer(fired);
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                handle_command(&mut runtime, command);
            }
        }
    }

    runtime.dispose();
    commands.close();
    tracing::info!(target: "reply_guard::service", "reply guard stopped");
}

fn handle_command<H: HostBridge>(
    runtime: &mut ReplyGuardRuntime<H, TokioScheduler>,
    command: ReplyGuardCommand,
) {
    tracing::trace!(target: "reply_guard::service", command = command.kind(), "handling command");
    match command {
        ReplyGuardCommand::Notify(notification) => runtime.handle_notification(notification),
        ReplyGuardCommand::EvaluateSend { attempt, reply } => {
            let _ = reply.send(runtime.evaluate_send(&attempt));
        }
        ReplyGuardCommand::ManualOverride => runtime.notify_manual_override(),
        ReplyGuardCommand::Status { reply } => {
            let _ = reply.send(runtime.status());
        }
    }
}
