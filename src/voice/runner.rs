//! Event-loop actor that owns a [`VoiceEngine`].
//!
//! One task serializes caller commands, engine inputs (capture frames and
//! link events), link-open completions and warning expiry. After every
//! step it publishes a [`SessionSnapshot`] on a watch channel. Link opens
//! run on their own tasks so `stop` is never stuck behind the network.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;

use super::error::{VoiceError, VoiceResult};
use super::persona::SessionContext;
use super::session::{
    AdvanceAction, AdvancePath, EngineInput, PendingOpen, SessionSnapshot, VoiceEngine,
};
use super::transport::OpenedLink;

enum Command {
    Start {
        context: SessionContext,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    Advance {
        step: String,
        reply: oneshot::Sender<VoiceResult<AdvancePath>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Caller waiting on a link open.
enum PendingReply {
    Start(oneshot::Sender<VoiceResult<()>>),
    Advance(oneshot::Sender<VoiceResult<AdvancePath>>),
}

impl PendingReply {
    fn resolve(self, outcome: VoiceResult<()>) {
        match self {
            Self::Start(reply) => {
                let _ = reply.send(outcome);
            }
            Self::Advance(reply) => {
                let _ = reply.send(outcome.map(|()| AdvancePath::Reconnected));
            }
        }
    }
}

struct OpenCompletion {
    generation: u64,
    result: VoiceResult<OpenedLink>,
}

/// Client side of a running voice session actor.
pub struct VoiceSessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl VoiceSessionHandle {
    /// Spawn the actor on the current runtime.
    pub fn spawn(engine: VoiceEngine, inbox: mpsc::UnboundedReceiver<EngineInput>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot());
        let (opens_tx, opens_rx) = mpsc::unbounded_channel();

        let runner = Runner {
            engine,
            inbox,
            commands: commands_rx,
            opens_tx,
            opens_rx,
            snapshots: snapshot_tx,
            pending: None,
        };
        let task = tokio::spawn(runner.run());

        Self {
            commands: commands_tx,
            snapshots: snapshot_rx,
            task,
        }
    }

    /// Start a session. Resolves once the link is live or has failed.
    pub async fn start(&self, context: SessionContext) -> VoiceResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { context, reply }).await?;
        rx.await.map_err(|_| runner_gone())?
    }

    /// Advance to the next scripted step.
    pub async fn advance(&self, step: impl Into<String>) -> VoiceResult<AdvancePath> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Advance {
            step: step.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| runner_gone())?
    }

    /// Idempotent stop. Succeeds even if the actor has already exited.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Stop the session and wait for the actor to exit.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Voice session runner ended abnormally");
        }
    }

    async fn send(&self, command: Command) -> VoiceResult<()> {
        self.commands.send(command).await.map_err(|_| runner_gone())
    }
}

fn runner_gone() -> VoiceError {
    VoiceError::Connection("voice session runner has stopped".to_string())
}

struct Runner {
    engine: VoiceEngine,
    inbox: mpsc::UnboundedReceiver<EngineInput>,
    commands: mpsc::Receiver<Command>,
    opens_tx: mpsc::UnboundedSender<OpenCompletion>,
    opens_rx: mpsc::UnboundedReceiver<OpenCompletion>,
    snapshots: watch::Sender<SessionSnapshot>,
    pending: Option<(u64, PendingReply)>,
}

impl Runner {
    async fn run(mut self) {
        loop {
            let deadline = self.engine.warning_deadline().map(TokioInstant::from_std);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(input) = self.inbox.recv() => self.engine.handle_input(input),
                Some(done) = self.opens_rx.recv() => self.on_open_complete(done),
                () = expiry(deadline) => self.engine.handle_input(EngineInput::WarningExpired),
            }
            self.publish();
        }

        self.engine.stop();
        self.resolve_pending(Err(VoiceError::Connection(
            "voice session shut down".to_string(),
        )));
        self.publish();
        tracing::debug!("Voice session runner exited");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { context, reply } => {
                let pending = self.engine.begin_start(context);
                self.track(pending, PendingReply::Start(reply));
            }
            Command::Advance { step, reply } => match self.engine.begin_advance(&step) {
                Ok(AdvanceAction::Sent) => {
                    self.publish();
                    let _ = reply.send(Ok(AdvancePath::FastPath));
                }
                Ok(AdvanceAction::Reconnect(pending)) => {
                    self.track(pending, PendingReply::Advance(reply));
                }
                Err(e) => {
                    self.publish();
                    let _ = reply.send(Err(e));
                }
            },
            Command::Stop { reply } => {
                self.engine.stop();
                self.resolve_pending(Err(VoiceError::Connection(
                    "stopped before the session opened".to_string(),
                )));
                self.publish();
                let _ = reply.send(());
            }
        }
    }

    /// Run a link open on its own task and remember who is waiting for it.
    fn track(&mut self, pending: PendingOpen, reply: PendingReply) {
        self.resolve_pending(Err(VoiceError::Connection(
            "superseded by a newer request".to_string(),
        )));

        let PendingOpen { generation, future } = pending;
        let opens = self.opens_tx.clone();
        tokio::spawn(async move {
            let result = future.await;
            let _ = opens.send(OpenCompletion { generation, result });
        });
        self.pending = Some((generation, reply));
    }

    fn on_open_complete(&mut self, done: OpenCompletion) {
        let outcome = self.engine.finish_open(done.generation, done.result);
        if self
            .pending
            .as_ref()
            .is_some_and(|(generation, _)| *generation == done.generation)
        {
            self.resolve_pending(outcome);
        }
    }

    /// Callers observe the published snapshot once their reply arrives.
    fn resolve_pending(&mut self, outcome: VoiceResult<()>) {
        if let Some((_, reply)) = self.pending.take() {
            self.publish();
            reply.resolve(outcome);
        }
    }

    fn publish(&self) {
        let snapshot = self.engine.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn expiry(deadline: Option<TokioInstant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
