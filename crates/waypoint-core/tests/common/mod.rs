#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;
use waypoint_core::repository::MemoryStateRepository;
use waypoint_core::workflow::{Engine, StateHandle, StepContext, StepError};
use waypoint_types::config::EngineConfig;
use waypoint_types::event::WorkflowEvent;

pub type HandlerFuture = BoxFuture<'static, Result<(), StepError>>;

/// Ordered record of handler invocations.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// Handler that appends `entry` to the log and succeeds.
pub fn record(
    log: &Log,
    entry: &str,
) -> impl Fn(StepContext, StateHandle) -> HandlerFuture + Send + Sync + 'static {
    let log = log.clone();
    let entry = entry.to_string();
    move |_, _| {
        let log = log.clone();
        let entry = entry.clone();
        Box::pin(async move {
            log.push(entry);
            Ok(())
        })
    }
}

/// Handler that appends `entry` to the log and fails with `message`.
pub fn fail(
    log: &Log,
    entry: &str,
    message: &str,
) -> impl Fn(StepContext, StateHandle) -> HandlerFuture + Send + Sync + 'static {
    let log = log.clone();
    let entry = entry.to_string();
    let message = message.to_string();
    move |_, _| {
        let log = log.clone();
        let entry = entry.clone();
        let message = message.clone();
        Box::pin(async move {
            log.push(entry);
            Err(StepError::failed(message))
        })
    }
}

pub fn persistent_engine(
    config: EngineConfig,
) -> (Engine<Arc<MemoryStateRepository>>, Arc<MemoryStateRepository>) {
    let repo = Arc::new(MemoryStateRepository::new());
    (Engine::with_persistence(config, Arc::clone(&repo)), repo)
}

/// Wait for the next event that ends an execution of `id`.
pub async fn settled(events: &mut broadcast::Receiver<WorkflowEvent>, id: &str) -> WorkflowEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if event.state_id() == id && event.is_settled() => return event,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("workflow did not settle in time")
}

/// Poll until `check` holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
