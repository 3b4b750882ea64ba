//! Control Loop
//!
//! Owns the store client and every participant. Store notifications are
//! messages on one queue processed sequentially, so participant state (the
//! tracked members, the election role) is only ever touched from this task.
//!
//! After each watch notification the loop re-arms the watch and, in the
//! same store call, fetches the fresh state, then hands that snapshot to
//! every participant interested in the target. On session interruption it
//! suspends, reconnects with backoff, lets participants rejoin if the
//! session was renewed, and re-arms every watch from scratch.

mod event;
mod participant;

pub use event::{ChannelHandler, CoordEvent, Directive, EventHandler};
pub use participant::{Participant, Snapshot};

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::retry::{retry, RetryConfig};
use crate::store::{EventReceiver, SessionEvent, StoreClient, StoreEvent, WatchKind, WatchTarget};

/// Commands sent to a running loop
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Release every participant working under the path
    Release(String),
    Shutdown,
}

/// Cloneable handle for steering a running [`ControlLoop`]
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControlHandle {
    /// Release the participants working under `path` (drops their member
    /// nodes so the next waiter is promoted)
    pub fn release(&self, path: &str) -> Result<()> {
        self.tx
            .send(Command::Release(path.to_string()))
            .map_err(|_| Error::ShuttingDown)
    }

    /// Stop the loop; every participant is released and the session closed
    pub fn shutdown(&self) -> Result<()> {
        self.tx.send(Command::Shutdown).map_err(|_| Error::ShuttingDown)
    }
}

/// Loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Suspended,
    Stopped,
}

/// Next unit of work picked by `process`
enum Step {
    Command(Command),
    Store(StoreEvent),
    Requeued,
    QueueClosed,
}

/// Event loop driving every participant over one store session
pub struct ControlLoop<H: EventHandler> {
    client: Arc<dyn StoreClient>,
    participants: Vec<Box<dyn Participant>>,
    handler: H,
    retry: RetryConfig,
    events: Option<EventReceiver>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
    deferred: Vec<Command>,
    /// Targets to refresh after a requeue, behind pending commands
    requeued: BTreeSet<WatchTarget>,
    state: LoopState,
}

impl<H: EventHandler> ControlLoop<H> {
    pub fn new(client: Arc<dyn StoreClient>, handler: H) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            client,
            participants: Vec::new(),
            handler,
            retry: RetryConfig::default(),
            events: None,
            commands_tx,
            commands_rx: Some(commands_rx),
            deferred: Vec::new(),
            requeued: BTreeSet::new(),
            state: LoopState::Idle,
        }
    }

    /// Reconnection backoff
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Register a participant; must happen before `start`
    pub fn add<P: Participant + 'static>(&mut self, participant: P) {
        self.participants.push(Box::new(participant));
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.commands_tx.clone(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Start every participant (paths, member nodes), arm every watch and
    /// deliver the initial state. Blocks on the store round-trips.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != LoopState::Idle {
            return Err(Error::Internal("control loop already started".into()));
        }
        self.events = Some(
            self.client
                .take_events()
                .ok_or_else(|| Error::Internal("store event queue already taken".into()))?,
        );

        for index in 0..self.participants.len() {
            let mut events = Vec::new();
            let result = self.participants[index].start(&mut events).await;
            self.dispatch(index, events).await?;
            if let Err(e) = result {
                tracing::error!(
                    "Failed to start participant {}: {}",
                    self.participants[index].path(),
                    e
                );
                self.shutdown().await;
                return Err(e);
            }
        }

        self.state = LoopState::Running;
        if let Err(e) = self.arm_all().await {
            self.shutdown().await;
            return Err(e);
        }
        tracing::info!("Control loop started with {} participants", self.participants.len());
        Ok(())
    }

    /// Process notifications until shutdown. Every exit path releases the
    /// participants and closes the session.
    pub async fn run(mut self) -> Result<()> {
        if self.state == LoopState::Idle {
            self.start().await?;
        }
        let result = self.process().await;
        if let Err(e) = &result {
            tracing::error!("Control loop failed: {}", e);
        }
        self.shutdown().await;
        result
    }

    async fn process(&mut self) -> Result<()> {
        let mut events = self
            .events
            .take()
            .ok_or_else(|| Error::Internal("control loop has no event queue".into()))?;
        let mut commands = self
            .commands_rx
            .take()
            .ok_or_else(|| Error::Internal("control loop has no command queue".into()))?;

        loop {
            for command in std::mem::take(&mut self.deferred) {
                if !self.on_command(command).await? {
                    return Ok(());
                }
            }

            let step = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Command(Command::Shutdown),
                },
                event = events.recv() => match event {
                    Some(event) => Step::Store(event),
                    None => Step::QueueClosed,
                },
                _ = std::future::ready(()), if !self.requeued.is_empty() => Step::Requeued,
            };

            match step {
                Step::Command(command) => {
                    if !self.on_command(command).await? {
                        return Ok(());
                    }
                }
                Step::Store(StoreEvent::Watch(target)) => self.on_watch(target).await?,
                Step::Requeued => {
                    if let Some(target) = self.requeued.pop_first() {
                        self.on_watch(target).await?;
                    }
                }
                Step::Store(StoreEvent::Session(event)) => {
                    if !self.on_session(event, &mut commands).await? {
                        return Ok(());
                    }
                }
                Step::QueueClosed => {
                    tracing::warn!("Store event queue closed");
                    return Err(Error::Disconnected);
                }
            }
        }
    }

    /// Returns false when the loop should stop
    async fn on_command(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Shutdown => {
                tracing::info!("Shutdown requested");
                Ok(false)
            }
            Command::Release(path) => {
                for index in 0..self.participants.len() {
                    let participant = &self.participants[index];
                    if participant.path() == path && participant.is_active() {
                        self.release_participant(index).await;
                    }
                }
                Ok(true)
            }
        }
    }

    async fn on_watch(&mut self, target: WatchTarget) -> Result<()> {
        if self.state != LoopState::Running {
            tracing::debug!("Ignoring {} while {:?}", target, self.state);
            return Ok(());
        }
        if !self.wanted().contains(&target) {
            tracing::debug!("Dropping watch {} with no active participant", target);
            return Ok(());
        }
        tracing::debug!("Watch fired: {}", target);
        self.refresh(&target).await
    }

    /// Re-arm `target`, then deliver the fresh snapshot
    async fn refresh(&mut self, target: &WatchTarget) -> Result<()> {
        match Self::arm(self.client.as_ref(), target).await {
            Ok(snapshot) => self.deliver(&snapshot).await,
            Err(e) if e.is_retryable() || e.requires_rejoin() => {
                // A session event is queued; the resync re-arms everything
                tracing::warn!("Could not re-arm {}: {}", target, e);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("Could not re-arm {}: {}", target, e);
                Ok(())
            }
        }
    }

    async fn arm(client: &dyn StoreClient, target: &WatchTarget) -> Result<Snapshot> {
        match target.kind {
            WatchKind::Children => {
                let children = client.watch_children(&target.path).await?;
                Ok(Snapshot::Children {
                    path: target.path.clone(),
                    children,
                })
            }
            WatchKind::Value => {
                let current = client.watch_value(&target.path).await?;
                Ok(Snapshot::Value {
                    path: target.path.clone(),
                    current,
                })
            }
        }
    }

    /// Every target some active participant needs
    fn wanted(&self) -> BTreeSet<WatchTarget> {
        self.participants
            .iter()
            .filter(|p| p.is_active())
            .flat_map(|p| p.watches())
            .collect()
    }

    async fn arm_all(&mut self) -> Result<()> {
        for target in self.wanted() {
            self.refresh(&target).await?;
        }
        Ok(())
    }

    /// Hand a snapshot to every active participant watching its target.
    /// Participant failures are logged; only fatal ones stop the loop.
    async fn deliver(&mut self, snapshot: &Snapshot) -> Result<()> {
        let target = snapshot.target();
        for index in 0..self.participants.len() {
            let participant = &mut self.participants[index];
            if !participant.is_active() || !participant.watches().contains(&target) {
                continue;
            }
            let mut events = Vec::new();
            let result = participant.on_snapshot(snapshot, &mut events).await;
            self.dispatch(index, events).await?;
            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(
                        "Fatal error in participant {}: {}",
                        self.participants[index].path(),
                        e
                    );
                    return Err(e);
                }
                Err(e) => tracing::warn!(
                    "Participant {} failed on {}: {}",
                    self.participants[index].path(),
                    target,
                    e
                ),
            }
        }
        Ok(())
    }

    /// Run the application handler over `events`, applying its directives
    /// to the participant at `index`
    async fn dispatch(&mut self, index: usize, events: Vec<CoordEvent>) -> Result<()> {
        let mut queue: VecDeque<CoordEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            let directive = match self.handler.handle(&event).await {
                Ok(directive) => directive,
                Err(e) => {
                    tracing::warn!("Handler failed on {}: {:#}", event.kind(), e);
                    Directive::Continue
                }
            };

            match directive {
                Directive::Continue => {}
                Directive::Release => self.release_participant(index).await,
                Directive::Requeue => {
                    self.release_participant(index).await;
                    let mut rejoined = Vec::new();
                    let result = self.participants[index].rejoin(&mut rejoined).await;
                    queue.extend(rejoined);
                    match result {
                        // The fresh snapshot goes back through `process`
                        Ok(()) => self.requeued.extend(self.participants[index].watches()),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            let path = self.participants[index].path();
                            tracing::warn!("Rejoin of {} failed: {}", path, e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn release_participant(&mut self, index: usize) {
        let participant = &mut self.participants[index];
        if let Err(e) = participant.release().await {
            tracing::warn!("Release of {} failed: {}", participant.path(), e);
        }
    }

    /// Returns false when the loop should stop
    async fn on_session(
        &mut self,
        event: SessionEvent,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<bool> {
        match event {
            SessionEvent::Connected if self.state != LoopState::Suspended => {
                tracing::debug!("Session connected");
                Ok(true)
            }
            SessionEvent::Connected | SessionEvent::Disconnected | SessionEvent::Expired => {
                let expired = event == SessionEvent::Expired;
                if self.state == LoopState::Running {
                    tracing::warn!("Session {:?}; suspending protocol progress", event);
                    self.state = LoopState::Suspended;
                    for participant in self.participants.iter_mut() {
                        participant.on_suspended();
                    }
                    self.dispatch_global(CoordEvent::SessionSuspended).await?;
                }
                self.restore(expired, commands).await
            }
        }
    }

    /// Reconnect with backoff, rejoin if the session was renewed, and
    /// resynchronise every watch. Returns false if shutdown arrived first.
    async fn restore(
        &mut self,
        expired: bool,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<bool> {
        let client = Arc::clone(&self.client);
        let config = self.retry.clone();
        let reconnect = retry("reconnect", &config, Error::is_retryable, move || {
            let client = Arc::clone(&client);
            async move { client.reconnect().await }
        });
        tokio::pin!(reconnect);

        let reconnected = loop {
            tokio::select! {
                result = &mut reconnect => break result?,
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => return Ok(false),
                    Some(other) => self.deferred.push(other),
                },
            }
        };

        let renewed = expired || reconnected.renewed;
        tracing::info!("Session {} restored (renewed: {})", reconnected.session, renewed);

        for index in 0..self.participants.len() {
            if !self.participants[index].is_active() {
                continue;
            }
            let mut events = Vec::new();
            let result = self.participants[index].on_restored(renewed, &mut events).await;
            self.dispatch(index, events).await?;
            if let Err(e) = result {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!(
                    "Participant {} failed to restore: {}",
                    self.participants[index].path(),
                    e
                );
            }
        }

        self.state = LoopState::Running;
        self.dispatch_global(CoordEvent::SessionRestored { renewed }).await?;
        self.arm_all().await?;
        Ok(true)
    }

    /// Deliver an event not tied to one participant; directives are ignored
    async fn dispatch_global(&mut self, event: CoordEvent) -> Result<()> {
        if let Err(e) = self.handler.handle(&event).await {
            tracing::warn!("Handler failed on {}: {:#}", event.kind(), e);
        }
        Ok(())
    }

    /// Release every participant and close the session
    pub async fn shutdown(&mut self) {
        if self.state == LoopState::Stopped {
            return;
        }
        self.state = LoopState::Stopped;
        for index in 0..self.participants.len() {
            if self.participants[index].is_active() {
                self.release_participant(index).await;
            }
        }
        if let Err(e) = self.client.close().await {
            tracing::warn!("Failed to close session: {}", e);
        }
        tracing::info!("Control loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ElectionProtocol;
    use crate::store::MemoryStore;

    struct FailingHandler;

    #[async_trait::async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&mut self, _event: &CoordEvent) -> anyhow::Result<Directive> {
            anyhow::bail!("handler exploded")
        }
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_loop() {
        let store = MemoryStore::new();
        let client: Arc<dyn StoreClient> = Arc::new(store.connect().await);
        let mut control = ControlLoop::new(Arc::clone(&client), FailingHandler);
        control.add(ElectionProtocol::leader_election(client, "/election", "a").unwrap());

        control.start().await.unwrap();
        assert_eq!(control.state(), LoopState::Running);

        // Watch is still armed: a new member triggers a notification
        let other = store.connect().await;
        let mut other_events = other.take_events().unwrap();
        other
            .create_member(
                "/election",
                "b_",
                crate::store::CreateMode::EPHEMERAL_SEQUENTIAL,
                bytes::Bytes::new(),
            )
            .await
            .unwrap();
        assert!(other_events.try_recv().is_err());

        let mut queue = control.events.take().unwrap();
        assert_eq!(
            queue.recv().await.unwrap(),
            StoreEvent::Watch(WatchTarget::children("/election"))
        );
    }

    #[tokio::test]
    async fn test_shutdown_releases_and_closes() {
        let store = MemoryStore::new();
        let client: Arc<dyn StoreClient> = Arc::new(store.connect().await);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut control = ControlLoop::new(Arc::clone(&client), ChannelHandler::new(tx));
        control.add(ElectionProtocol::lock(client, "/locks", "a").unwrap());

        control.start().await.unwrap();
        assert_eq!(store.peek_children("/locks").await.len(), 1);

        let handle = control.handle();
        let task = tokio::spawn(control.run());
        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();

        assert!(store.peek_children("/locks").await.is_empty());
        assert!(handle.shutdown().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let store = MemoryStore::new();
        let client: Arc<dyn StoreClient> = Arc::new(store.connect().await);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut control = ControlLoop::new(client, ChannelHandler::new(tx));

        control.start().await.unwrap();
        assert!(matches!(control.start().await, Err(Error::Internal(_))));
    }
}
