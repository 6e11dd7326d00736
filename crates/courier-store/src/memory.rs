use ahash::RandomState;
use bytes::Bytes;
use courier_common::ids::MessageId;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{Message, MessageStore, Result, SharedMessage, StoreError};

const DEFAULT_LOG_CAPACITY: usize = 1024;
const MAX_CHANNEL_NAME_LEN: usize = 255;
static GLOBAL_RESERVED: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct ChannelLog {
    name: Arc<str>,
    // Bounded log; oldest entries are dropped as new ones arrive.
    log: VecDeque<SharedMessage>,
    // Next sequence number to assign. Sequences start at 1 so that 0 can
    // mean "nothing seen yet" inside multiplexed ids.
    next_seq: u64,
}

impl ChannelLog {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            log: VecDeque::new(),
            next_seq: 1,
        }
    }
}

/// In-memory message store with a bounded per-channel log.
///
/// ```
/// use bytes::Bytes;
/// use courier_store::MemoryStore;
///
/// let store = MemoryStore::new();
/// let msg = store
///     .publish("news", Bytes::from_static(b"hello"), None)
///     .expect("publish");
/// assert_eq!(msg.id().seq(0), Some(1));
/// assert_eq!(store.messages_after("news", Some(0)).len(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    channels: Mutex<HashMap<String, ChannelLog, RandomState>>,
    log_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::with_hasher(RandomState::new())),
            log_capacity: log_capacity.max(1),
        }
    }

    pub fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        content_type: Option<Bytes>,
    ) -> Result<SharedMessage> {
        validate_channel(channel)?;
        let mut channels = self.channels.lock();
        let log = channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelLog::new(channel));

        let seq = log.next_seq;
        log.next_seq += 1;
        let message = Message {
            id: MessageId::new(seq),
            content_type,
            payload,
        };
        let shared = SharedMessage::new(Arc::clone(&log.name), message);
        log.log.push_back(shared.clone());

        let overflow = log.log.len().saturating_sub(self.log_capacity);
        if overflow > 0 {
            log.log.drain(..overflow);
        }
        metrics::counter!("courier_store_published_total").increment(1);
        tracing::trace!(channel, seq, "published message");
        Ok(shared)
    }

    /// Messages with a sequence greater than `after`. `None` means the
    /// caller only wants messages published from now on.
    pub fn messages_after(&self, channel: &str, after: Option<u64>) -> Vec<SharedMessage> {
        let Some(after) = after else {
            return Vec::new();
        };
        let channels = self.channels.lock();
        let Some(log) = channels.get(channel) else {
            return Vec::new();
        };
        log.log
            .iter()
            .filter(|msg| msg.id().seq(0).is_some_and(|seq| seq > after))
            .cloned()
            .collect()
    }

    /// Sequence of the most recent message, 0 when nothing was published.
    pub fn last_seq(&self, channel: &str) -> u64 {
        self.channels
            .lock()
            .get(channel)
            .map(|log| log.next_seq - 1)
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl MessageStore for MemoryStore {
    fn reserve(&self, message: &SharedMessage, reason: &'static str) {
        let count = message.add_reservation();
        let global = GLOBAL_RESERVED.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("courier_store_reserved_messages").set(global as f64);
        tracing::trace!(channel = message.channel(), id = %message.id(), count, reason, "reserve message");
    }

    fn release(&self, message: &SharedMessage, reason: &'static str) -> Result<()> {
        let count = message.remove_reservation()?;
        if let Ok(prev) =
            GLOBAL_RESERVED.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
        {
            metrics::gauge!("courier_store_reserved_messages").set(prev.saturating_sub(1) as f64);
        }
        tracing::trace!(channel = message.channel(), id = %message.id(), count, reason, "release message");
        Ok(())
    }
}

fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty()
        || channel.len() > MAX_CHANNEL_NAME_LEN
        || channel.contains(',')
        || channel.chars().any(char::is_control)
    {
        return Err(StoreError::InvalidChannel(channel.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_assigns_sequences_per_channel() {
        let store = MemoryStore::new();
        let a1 = store.publish("a", Bytes::from_static(b"1"), None).expect("a1");
        let a2 = store.publish("a", Bytes::from_static(b"2"), None).expect("a2");
        let b1 = store.publish("b", Bytes::from_static(b"1"), None).expect("b1");
        assert_eq!(a1.id(), &MessageId::new(1));
        assert_eq!(a2.id(), &MessageId::new(2));
        assert_eq!(b1.id(), &MessageId::new(1));
        assert_eq!(store.last_seq("a"), 2);
        assert_eq!(store.last_seq("missing"), 0);
        assert_eq!(store.channel_count(), 2);
    }

    #[test]
    fn messages_after_filters_and_none_waits() {
        let store = MemoryStore::new();
        for payload in [b"1", b"2", b"3"] {
            store
                .publish("a", Bytes::copy_from_slice(payload), None)
                .expect("publish");
        }
        let ids: Vec<_> = store
            .messages_after("a", Some(1))
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, vec!["2", "3"]);
        assert!(store.messages_after("a", None).is_empty());
        assert!(store.messages_after("nope", Some(0)).is_empty());
    }

    #[test]
    fn log_capacity_drops_oldest() {
        let store = MemoryStore::with_log_capacity(2);
        for payload in [b"1", b"2", b"3"] {
            store
                .publish("a", Bytes::copy_from_slice(payload), None)
                .expect("publish");
        }
        let backlog = store.messages_after("a", Some(0));
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].message().payload, Bytes::from_static(b"2"));
    }

    #[test]
    fn reserve_release_tracks_count() {
        let store = MemoryStore::new();
        let msg = store.publish("a", Bytes::from_static(b"x"), None).expect("publish");
        store.reserve(&msg, "test");
        store.reserve(&msg, "test");
        assert_eq!(msg.reservations(), 2);
        store.release(&msg, "test").expect("release");
        store.release(&msg, "test").expect("release");
        assert_eq!(msg.reservations(), 0);
        assert!(matches!(
            store.release(&msg, "test"),
            Err(StoreError::ReleaseUnderflow { .. })
        ));
    }

    #[test]
    fn invalid_channel_names_rejected() {
        let store = MemoryStore::new();
        for name in ["", "a,b", "bad\nname"] {
            assert!(matches!(
                store.publish(name, Bytes::new(), None),
                Err(StoreError::InvalidChannel(_))
            ));
        }
    }
}
