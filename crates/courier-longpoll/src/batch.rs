// Pending messages for a multi-message response. Entries hold a store
// reservation on their shared target until released, in insertion order.
use courier_store::{MessageRef, MessageStore};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, invariant_violation};

const RESERVE_REASON: &str = "longpoll batch";
const MULTIPLEX_RESERVE_REASON: &str = "longpoll batch for multiplexed channel";

pub struct Batch {
    entries: Vec<MessageRef>,
    store: Arc<dyn MessageStore>,
}

impl Batch {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            entries: Vec::new(),
            store,
        }
    }

    pub fn add(&mut self, message: MessageRef) -> Result<()> {
        match &message {
            MessageRef::Shared(shared) => self.store.reserve(shared, RESERVE_REASON),
            MessageRef::Multiplexed(copy) => {
                self.store.reserve(copy.original(), MULTIPLEX_RESERVE_REASON)
            }
            MessageRef::Transient(_) => {
                return Err(invariant_violation!(
                    "batched message is neither store-owned nor a multiplexed copy"
                ));
            }
        }
        self.entries.push(message);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MessageRef] {
        &self.entries
    }

    /// Releases every entry exactly once, oldest first. Entries are drained,
    /// so a second call is a no-op. Every entry is released even if one of
    /// them fails; the first failure is reported.
    pub fn release_all(&mut self) -> Result<usize> {
        let mut released = 0;
        let mut first_err = None;
        for entry in self.entries.drain(..) {
            let (target, reason) = match &entry {
                MessageRef::Shared(shared) => (shared, RESERVE_REASON),
                MessageRef::Multiplexed(copy) => (copy.original(), MULTIPLEX_RESERVE_REASON),
                // Rejected by add().
                MessageRef::Transient(_) => continue,
            };
            match self.store.release(target, reason) {
                Ok(()) => released += 1,
                Err(err) => {
                    tracing::error!(error = %err, "batch release failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(released),
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            tracing::warn!(pending = self.entries.len(), "batch dropped with reservations held");
            let _ = self.release_all();
        }
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_common::ids::MessageId;
    use courier_store::{MemoryStore, Message, MultiplexCopy};

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn add_reserves_and_release_returns_counts() {
        let store = store();
        let a = store.publish("a", Bytes::from_static(b"1"), None).expect("a");
        let b = store.publish("b", Bytes::from_static(b"2"), None).expect("b");
        let mut batch = Batch::new(store.clone());
        batch.add(a.clone().into()).expect("add");
        batch
            .add(MultiplexCopy::new(b.clone(), MessageId::multiplexed([1, 1])).into())
            .expect("add");
        assert_eq!(a.reservations(), 1);
        assert_eq!(b.reservations(), 1);
        assert_eq!(batch.len(), 2);

        assert_eq!(batch.release_all().expect("release"), 2);
        assert_eq!(a.reservations(), 0);
        assert_eq!(b.reservations(), 0);
        assert!(batch.is_empty());
        assert_eq!(batch.release_all().expect("again"), 0);
    }

    #[test]
    fn drop_releases_pending_entries() {
        let store = store();
        let a = store.publish("a", Bytes::from_static(b"1"), None).expect("a");
        {
            let mut batch = Batch::new(store.clone());
            batch.add(a.clone().into()).expect("add");
            assert_eq!(a.reservations(), 1);
        }
        assert_eq!(a.reservations(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "neither store-owned")]
    fn transient_message_is_rejected() {
        let mut batch = Batch::new(store());
        let _ = batch.add(MessageRef::Transient(Arc::new(Message::new(
            MessageId::new(1),
            Bytes::new(),
        ))));
    }
}
