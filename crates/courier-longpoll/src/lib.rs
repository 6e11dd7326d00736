//! Long-poll subscriber core.
//!
//! A [`SubscriberPool`] owns every waiting HTTP request of a shard. Each
//! [`Subscriber`] answers exactly once: with a single message, a batch of
//! messages, a status, or a timeout. Store messages it hands to the
//! transport stay reserved until the transport is done with them.
//!
//! ```
//! use courier_common::LongpollConfig;
//! use courier_longpoll::assembler::{BatchEncoding, Boundary};
//!
//! let config = LongpollConfig {
//!     multimsg: true,
//!     ..LongpollConfig::default()
//! };
//! assert!(matches!(BatchEncoding::from_config(&config), BatchEncoding::Multipart));
//! assert_eq!(Boundary::random().as_str().len(), 32);
//! ```
pub mod assembler;
pub mod batch;
pub mod connection;
pub mod error;
pub mod notifier;
pub mod pool;
pub mod reservation;
pub mod status;
pub mod subscriber;

#[cfg(test)]
mod test_support;

pub use assembler::{Body, Response, Segment, SegmentKind};
pub use connection::{Connection, Finalize, TimerToken};
pub use error::{Result, SubscriberError, TransportError};
pub use notifier::UnsubscribeNotifier;
pub use pool::{SubscriberId, SubscriberPool};
pub use subscriber::{Mode, ReleaseOutcome, Subscriber, SubscriberState, Teardown};
