//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use coordkit::control::{
    ChannelHandler, ControlHandle, ControlLoop, CoordEvent, Directive, Participant,
};
use coordkit::retry::RetryConfig;
use coordkit::store::memory::ClientId;
use coordkit::store::{MemoryStore, StoreClient};
use coordkit::Result;

pub const WAIT: Duration = Duration::from_secs(5);

pub type Events = mpsc::UnboundedReceiver<CoordEvent>;

/// A running control loop with one participant
pub struct Running {
    pub client_id: ClientId,
    pub client: Arc<dyn StoreClient>,
    pub handle: ControlHandle,
    pub task: JoinHandle<Result<()>>,
}

impl Running {
    pub async fn stop(self) -> Result<()> {
        let _ = self.handle.shutdown();
        self.task.await.expect("control loop panicked")
    }
}

pub async fn connect(store: &MemoryStore) -> (ClientId, Arc<dyn StoreClient>) {
    let client = store.connect().await;
    (client.id(), Arc::new(client))
}

/// Start a loop on a fresh session and spawn it
pub async fn spawn<P, F>(
    store: &MemoryStore,
    events: &mpsc::UnboundedSender<CoordEvent>,
    on_acquired: Directive,
    build: F,
) -> Running
where
    P: Participant + 'static,
    F: FnOnce(Arc<dyn StoreClient>) -> P,
{
    let (client_id, client) = connect(store).await;
    let handler = ChannelHandler::new(events.clone()).on_acquired(on_acquired);
    let mut control =
        ControlLoop::new(Arc::clone(&client), handler).with_retry(RetryConfig::fast());
    control.add(build(Arc::clone(&client)));
    control.start().await.expect("control loop start");

    let handle = control.handle();
    let task = tokio::spawn(control.run());
    Running {
        client_id,
        client,
        handle,
        task,
    }
}

/// Next event, failing the test after `WAIT`
pub async fn next(events: &mut Events) -> CoordEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip events until one matches, returning the skipped ones too
pub async fn wait_for<F>(events: &mut Events, mut matches: F) -> (CoordEvent, Vec<CoordEvent>)
where
    F: FnMut(&CoordEvent) -> bool,
{
    let mut skipped = Vec::new();
    loop {
        let event = next(events).await;
        if matches(&event) {
            return (event, skipped);
        }
        skipped.push(event);
    }
}
