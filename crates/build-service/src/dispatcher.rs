//! Build request dispatching
//!
//! Pending requests wait in one FIFO queue. Each environment key has a slot
//! (an async mutex); a worker takes the first pending request whose slot is
//! free and holds the slot until the build ends. Requests for different keys
//! run in parallel, requests for one key run in submission order.

use fatbuildr_common::EnvKey;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

const FALLBACK_TICK: Duration = Duration::from_secs(5);

/// Per environment key mutual exclusion, shared with the provisioner
#[derive(Default)]
pub struct KeySlots {
    slots: Mutex<HashMap<EnvKey, Arc<Mutex<()>>>>,
}

impl KeySlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &EnvKey) -> Arc<Mutex<()>> {
        self.slots
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }
}

/// Exclusive use of a key slot. Dropping it wakes waiting workers.
pub struct SlotGuard {
    _guard: OwnedMutexGuard<()>,
    wake: Arc<Notify>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.wake.notify_waiters();
    }
}

/// Request handed to a worker together with its key slot
pub struct Assignment {
    pub id: Uuid,
    pub key: EnvKey,
    pub slot: SlotGuard,
}

struct Pending {
    id: Uuid,
    key: EnvKey,
}

pub struct Dispatcher {
    queue: Mutex<VecDeque<Pending>>,
    slots: Arc<KeySlots>,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(slots: Arc<KeySlots>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            slots,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn slots(&self) -> &Arc<KeySlots> {
        &self.slots
    }

    /// Append a request to the queue
    pub async fn push(&self, id: Uuid, key: EnvKey) {
        debug!("Queueing build {} for {}", id, key);
        self.queue.lock().await.push_back(Pending { id, key });
        self.wake.notify_waiters();
    }

    /// Remove a queued request. Returns whether it was still queued.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|pending| pending.id != id);
        queue.len() != before
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn try_take(&self) -> Option<Assignment> {
        let mut queue = self.queue.lock().await;
        let mut busy: Vec<&EnvKey> = Vec::new();
        let mut found = None;

        for (index, pending) in queue.iter().enumerate() {
            if busy.contains(&&pending.key) {
                continue;
            }
            let slot = self.slots.get(&pending.key).await;
            match slot.try_lock_owned() {
                Ok(guard) => {
                    found = Some((index, guard));
                    break;
                }
                Err(_) => busy.push(&pending.key),
            }
        }

        let (index, guard) = found?;
        let pending = queue.remove(index)?;
        Some(Assignment {
            id: pending.id,
            key: pending.key,
            slot: SlotGuard {
                _guard: guard,
                wake: self.wake.clone(),
            },
        })
    }

    /// Wait for the next request whose key slot is free
    pub async fn next(&self) -> Assignment {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(assignment) = self.try_take().await {
                return assignment;
            }

            let _ = tokio::time::timeout(FALLBACK_TICK, notified).await;
        }
    }
}
