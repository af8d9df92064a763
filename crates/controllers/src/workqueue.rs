//! De-duplicating, rate-limited FIFO of namespaced object keys.
//!
//! A key sitting in the queue is never queued twice, and a key being
//! processed is never handed out concurrently with itself; re-adds during
//! processing are deferred until `done`. Failing items come back through
//! `add_rate_limited` with per-item exponential backoff.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::trace;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: FxHashMap<String, u32>,
    shut_down: bool,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        Self { name, state: Mutex::new(State::default()), notify: Notify::new() }
    }

    /// Enqueue a key unless it is already pending. Keys added while being
    /// processed are parked and re-queued on `done`.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("workqueue lock");
        if state.shut_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_string());
            gauge!("workqueue_depth", state.queue.len() as f64, "queue" => self.name);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-enqueue a failing key after its per-item backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().expect("workqueue lock");
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            backoff(*failures)
        };
        trace!(queue = self.name, key, delay_ms = delay.as_millis() as u64, "requeueing");
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Next key to process; `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("workqueue lock");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    gauge!("workqueue_depth", state.queue.len() as f64, "queue" => self.name);
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key as processed, releasing any re-add parked for it.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().expect("workqueue lock");
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clear the failure history of a key, resetting its backoff.
    pub fn forget(&self, key: &str) {
        self.state.lock().expect("workqueue lock").failures.remove(key);
    }

    /// Stop accepting keys; pending keys are still handed out until drained.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().expect("workqueue lock");
            state.shut_down = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("workqueue lock").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(27);
    BASE_DELAY.saturating_mul(1u32 << exp).min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(5));
        assert_eq!(backoff(2), Duration::from_millis(10));
        assert_eq!(backoff(11), Duration::from_millis(5120));
        assert_eq!(backoff(30), MAX_DELAY);
    }
}
