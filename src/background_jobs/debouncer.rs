//! Trailing-edge debouncing of run requests.
//!
//! A burst of triggers for the same key collapses into a single fire,
//! `cooldown` after the last trigger of the burst.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// A trigger waiting for its cooldown to elapse.
struct PendingTrigger {
    /// Identifies the timer task owning this entry.
    id: u64,
    last_seen: Instant,
    merged: u32,
}

#[derive(Default)]
struct DebouncerState {
    next_id: u64,
    pending: HashMap<String, PendingTrigger>,
}

/// Cheap to clone, all clones share pending triggers and the output channel.
#[derive(Clone)]
pub struct Debouncer {
    cooldown: Duration,
    state: Arc<Mutex<DebouncerState>>,
    fired_tx: mpsc::Sender<String>,
}

impl Debouncer {
    /// Create a debouncer and the receiver its fired keys are delivered on.
    pub fn new(cooldown: Duration) -> (Self, mpsc::Receiver<String>) {
        let (fired_tx, fired_rx) = mpsc::channel(100);
        let debouncer = Self {
            cooldown,
            state: Arc::new(Mutex::new(DebouncerState::default())),
            fired_tx,
        };
        (debouncer, fired_rx)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Request a run of `key`. Must be called from within a tokio runtime.
    pub fn trigger(&self, key: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        if let Some(pending) = state.pending.get_mut(key) {
            pending.last_seen = now;
            pending.merged += 1;
            debug!("Debounced trigger for {} ({} merged)", key, pending.merged);
            return;
        }

        state.next_id += 1;
        let id = state.next_id;
        state.pending.insert(
            key.to_string(),
            PendingTrigger {
                id,
                last_seen: now,
                merged: 0,
            },
        );
        drop(state);

        let debouncer = self.clone();
        let key = key.to_string();
        tokio::spawn(async move { debouncer.wait_and_fire(key, id).await });
    }

    /// Drop a pending trigger without firing it.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.state.lock().unwrap().pending.remove(key).is_some();
        if removed {
            debug!("Cancelled pending trigger for {}", key);
        }
        removed
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.state.lock().unwrap().pending.contains_key(key)
    }

    async fn wait_and_fire(self, key: String, id: u64) {
        loop {
            let deadline = {
                let mut state = self.state.lock().unwrap();
                match state.pending.get(&key) {
                    Some(pending) if pending.id == id => {
                        let deadline = pending.last_seen + self.cooldown;
                        if deadline <= Instant::now() {
                            state.pending.remove(&key);
                            None
                        } else {
                            Some(deadline)
                        }
                    }
                    // Cancelled, possibly re-triggered under a new timer
                    _ => return,
                }
            };

            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => break,
            }
        }

        debug!("Firing debounced trigger for {}", key);
        if self.fired_tx.send(key).await.is_err() {
            debug!("Debouncer receiver dropped");
        }
    }
}
