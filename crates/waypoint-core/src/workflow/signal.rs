//! Named external signals.
//!
//! A step waits on a signal name; `send` delivers one value to every waiter
//! registered at that moment and forgets them. Waiters that register after a
//! send never see it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("wait for signal '{0}' was cancelled")]
    Cancelled(String),

    #[error("signal '{0}' channel closed before delivery")]
    Closed(String),
}

/// Registry of signal waiters, shared by clone.
#[derive(Clone)]
pub struct SignalManager {
    waiters: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>,
    buffer: usize,
}

impl SignalManager {
    pub fn new() -> Self {
        Self::with_buffer(1)
    }

    /// Manager whose waiter channels hold `buffer` values.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    /// Register a one-shot waiter and return its receiving end.
    pub fn subscribe(&self, name: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut waiters = self.waiters.lock().expect("signal waiters lock poisoned");
        let list = waiters.entry(name.to_string()).or_default();
        list.retain(|tx| !tx.is_closed());
        list.push(tx);
        rx
    }

    /// Block until `name` is sent or `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken, name: &str) -> Result<Value, SignalError> {
        let mut rx = self.subscribe(name);
        tokio::select! {
            _ = cancel.cancelled() => Err(SignalError::Cancelled(name.to_string())),
            value = rx.recv() => value.ok_or_else(|| SignalError::Closed(name.to_string())),
        }
    }

    /// Deliver `data` to every current waiter of `name`.
    ///
    /// Delivery is non-blocking: a waiter whose buffer is full misses the
    /// value. Returns the number of waiters that received it.
    pub fn send(&self, name: &str, data: Value) -> usize {
        let targets = {
            let mut waiters = self.waiters.lock().expect("signal waiters lock poisoned");
            waiters.remove(name).unwrap_or_default()
        };

        let delivered = targets
            .iter()
            .filter(|tx| tx.try_send(data.clone()).is_ok())
            .count();

        tracing::debug!(signal = name, waiters = targets.len(), delivered, "signal sent");
        delivered
    }

    /// Number of live waiters currently registered for `name`.
    pub fn waiting(&self, name: &str) -> usize {
        let waiters = self.waiters.lock().expect("signal waiters lock poisoned");
        waiters
            .get(name)
            .map_or(0, |list| list.iter().filter(|tx| !tx.is_closed()).count())
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.waiters.lock().map(|w| w.len()).unwrap_or_default();
        f.debug_struct("SignalManager")
            .field("signals", &names)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    async fn until_waiting(signals: &SignalManager, name: &str, n: usize) {
        while signals.waiting(name) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn send_reaches_every_registered_waiter() {
        let signals = SignalManager::new();
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let signals = signals.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { signals.wait(&cancel, "go").await }));
        }
        until_waiting(&signals, "go", 2).await;

        assert_eq!(signals.send("go", json!(42)), 2);
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!(42));
        }
    }

    #[tokio::test]
    async fn late_waiter_misses_earlier_send() {
        let signals = SignalManager::new();
        assert_eq!(signals.send("go", json!(42)), 0);

        let cancel = CancellationToken::new();
        let late = tokio::time::timeout(Duration::from_millis(50), signals.wait(&cancel, "go")).await;
        assert!(late.is_err(), "late waiter must not observe the earlier send");
    }

    #[tokio::test]
    async fn cancellation_ends_wait() {
        let signals = SignalManager::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = signals.wait(&cancel, "go").await.unwrap_err();
        assert_eq!(err, SignalError::Cancelled("go".to_string()));
        assert_eq!(signals.waiting("go"), 0);
    }

    #[test]
    fn send_clears_waiters() {
        let signals = SignalManager::new();
        let mut rx = signals.subscribe("go");
        assert_eq!(signals.waiting("go"), 1);

        assert_eq!(signals.send("go", json!("first")), 1);
        assert_eq!(signals.send("go", json!("second")), 0);
        assert_eq!(rx.try_recv().unwrap(), json!("first"));
        assert!(rx.try_recv().is_err());
    }
}
