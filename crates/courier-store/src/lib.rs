// In-memory channel store with reference-counted shared messages.
// Subscribers never free messages; they only reserve and release them here.
use courier_common::ids::MessageId;

pub mod memory;
pub mod message;

pub use memory::MemoryStore;
pub use message::{Message, MessageRef, MultiplexCopy, SharedMessage};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("release without matching reserve: channel={channel} id={id}")]
    ReleaseUnderflow { channel: String, id: MessageId },
    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),
}

/// Reference counting surface the subscriber core consumes.
///
/// Every `reserve` must be paired with exactly one `release`.
pub trait MessageStore: Send + Sync {
    fn reserve(&self, message: &SharedMessage, reason: &'static str);

    fn release(&self, message: &SharedMessage, reason: &'static str) -> Result<()>;
}
