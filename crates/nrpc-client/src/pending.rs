// Correlates replies to in-flight calls by request id.
use crate::error::ClientError;
use ahash::RandomState;
use hashbrown::HashMap;
use nrpc_wire::Message;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type Reply = Result<Message, ClientError>;

struct PendingEntry {
    sender: oneshot::Sender<Reply>,
    deadline: Instant,
}

pub(crate) struct PendingRegistry {
    entries: Mutex<HashMap<String, PendingEntry, RandomState>>,
}

impl PendingRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    pub(crate) fn register(
        &self,
        id: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return Err(ClientError::DuplicateRequestId(id.to_string()));
        }
        let (sender, receiver) = oneshot::channel();
        entries.insert(id.to_string(), PendingEntry { sender, deadline });
        Ok(receiver)
    }

    /// Resolve a pending call. False if nobody is waiting on `id`.
    pub(crate) fn complete(&self, id: &str, message: Message) -> bool {
        // Send under the lock so a caller that sees the entry gone also sees
        // the reply in its receiver.
        let mut entries = self.entries.lock();
        let Some(entry) = entries.remove(id) else {
            return false;
        };
        entry.sender.send(Ok(message)).is_ok()
    }

    /// Push the deadline out for a retry. False if the entry is gone.
    pub(crate) fn extend(&self, id: &str, deadline: Instant) -> bool {
        match self.entries.lock().get_mut(id) {
            Some(entry) => {
                entry.deadline = deadline;
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Drop entries past their deadline; their receivers observe a closed
    /// channel. Returns how many were evicted.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.deadline > now);
        before - entries.len()
    }

    /// Fail every waiter with `Closed`.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = self
            .entries
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.sender.send(Err(ClientError::Closed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Removes the entry on every exit path of a call.
pub(crate) struct PendingGuard {
    registry: Arc<PendingRegistry>,
    id: String,
}

impl PendingGuard {
    pub(crate) fn new(registry: &Arc<PendingRegistry>, id: &str) -> Self {
        Self {
            registry: Arc::clone(registry),
            id: id.to_string(),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
