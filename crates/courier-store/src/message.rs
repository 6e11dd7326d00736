use bytes::Bytes;
use courier_common::ids::MessageId;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{Result, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub content_type: Option<Bytes>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: MessageId, payload: Bytes) -> Self {
        Self {
            id,
            content_type: None,
            payload,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<Bytes>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug)]
struct StoredMessage {
    channel: Arc<str>,
    message: Message,
    // Store-level holds; the Arc keeps memory alive, this tracks who still
    // needs the message past its delivery call.
    reservations: AtomicUsize,
}

/// Handle to a message owned by the store and shared across subscribers.
#[derive(Clone)]
pub struct SharedMessage(Arc<StoredMessage>);

impl SharedMessage {
    pub fn new(channel: impl Into<Arc<str>>, message: Message) -> Self {
        Self(Arc::new(StoredMessage {
            channel: channel.into(),
            message,
            reservations: AtomicUsize::new(0),
        }))
    }

    pub fn message(&self) -> &Message {
        &self.0.message
    }

    pub fn id(&self) -> &MessageId {
        &self.0.message.id
    }

    pub fn channel(&self) -> &str {
        &self.0.channel
    }

    pub fn reservations(&self) -> usize {
        self.0.reservations.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &SharedMessage) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn add_reservation(&self) -> usize {
        self.0.reservations.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn remove_reservation(&self) -> Result<usize> {
        self.0
            .reservations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| StoreError::ReleaseUnderflow {
                channel: self.channel().to_string(),
                id: self.id().clone(),
            })
    }
}

impl fmt::Debug for SharedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMessage")
            .field("channel", &self.channel())
            .field("id", &self.id().to_string())
            .field("reservations", &self.reservations())
            .finish()
    }
}

/// Message delivered through a multiplexed channel. The copy carries the
/// combined id; only `original` is counted by the store.
#[derive(Debug, Clone)]
pub struct MultiplexCopy {
    copy: Message,
    original: SharedMessage,
}

impl MultiplexCopy {
    pub fn new(original: SharedMessage, id: MessageId) -> Self {
        let mut copy = original.message().clone();
        copy.id = id;
        Self { copy, original }
    }

    pub fn message(&self) -> &Message {
        &self.copy
    }

    pub fn original(&self) -> &SharedMessage {
        &self.original
    }
}

/// A message as handed to a subscriber.
#[derive(Debug, Clone)]
pub enum MessageRef {
    Shared(SharedMessage),
    Multiplexed(MultiplexCopy),
    // Not owned by the store; only valid for immediate single responses.
    Transient(Arc<Message>),
}

impl MessageRef {
    pub fn message(&self) -> &Message {
        match self {
            MessageRef::Shared(shared) => shared.message(),
            MessageRef::Multiplexed(copy) => copy.message(),
            MessageRef::Transient(message) => message,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.message().id
    }

    /// The store-owned message backing this reference, if any.
    pub fn shared(&self) -> Option<&SharedMessage> {
        match self {
            MessageRef::Shared(shared) => Some(shared),
            MessageRef::Multiplexed(copy) => Some(copy.original()),
            MessageRef::Transient(_) => None,
        }
    }
}

impl From<SharedMessage> for MessageRef {
    fn from(value: SharedMessage) -> Self {
        MessageRef::Shared(value)
    }
}

impl From<MultiplexCopy> for MessageRef {
    fn from(value: MultiplexCopy) -> Self {
        MessageRef::Multiplexed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplex_copy_keeps_payload_and_original() {
        let original = SharedMessage::new(
            "a",
            Message::new(MessageId::new(4), Bytes::from_static(b"hi")).with_content_type("text/plain"),
        );
        let copy = MultiplexCopy::new(original.clone(), MessageId::multiplexed([4, 2]));
        assert_eq!(copy.message().payload, Bytes::from_static(b"hi"));
        assert_eq!(copy.message().id, MessageId::multiplexed([4, 2]));
        assert!(copy.original().ptr_eq(&original));

        let as_ref = MessageRef::from(copy);
        assert!(as_ref.shared().expect("shared").ptr_eq(&original));
    }

    #[test]
    fn transient_has_no_shared_target() {
        let msg = MessageRef::Transient(Arc::new(Message::new(
            MessageId::new(1),
            Bytes::from_static(b"x"),
        )));
        assert!(msg.shared().is_none());
    }

    #[test]
    fn remove_reservation_underflow_is_an_error() {
        let shared = SharedMessage::new("a", Message::new(MessageId::new(1), Bytes::new()));
        assert_eq!(shared.add_reservation(), 1);
        assert_eq!(shared.remove_reservation().expect("release"), 0);
        assert!(matches!(
            shared.remove_reservation(),
            Err(StoreError::ReleaseUnderflow { .. })
        ));
    }
}
