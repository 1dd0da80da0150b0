//! Fan-out of `WorkflowEvent` to engine subscribers.
//!
//! Publishing never blocks the run that emits the event. A subscriber that
//! falls more than `capacity` events behind gets `RecvError::Lagged` and then
//! resumes from the oldest retained event.

use tokio::sync::broadcast;
use waypoint_types::event::WorkflowEvent;

/// Shared by the engine and every step runner it spawns.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No subscribers is the common case outside the CLI.
        let _ = self.sender.send(event);
    }
}
