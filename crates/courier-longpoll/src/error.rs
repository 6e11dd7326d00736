use courier_store::StoreError;

pub type Result<T> = std::result::Result<T, SubscriberError>;

/// Failure reported by the transport while rendering or sending a response.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("response already committed")]
    AlreadyCommitted,
    #[error("transport failure: {0}")]
    Other(String),
}

#[derive(thiserror::Error, Debug)]
pub enum SubscriberError {
    #[error("subscriber not found")]
    NotFound,
    #[error("subscriber already enqueued")]
    AlreadyEnqueued,
    #[error("subscriber is dead")]
    Dead,
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
    #[error("response aborted: {0}")]
    Transport(#[from] TransportError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// Invariant violations indicate a defect: panic in debug builds, log and
// surface as an error otherwise.
macro_rules! invariant_violation {
    ($what:expr) => {{
        tracing::error!(invariant = $what, "subscriber invariant violated");
        debug_assert!(false, "invariant violated: {}", $what);
        $crate::error::SubscriberError::Invariant($what)
    }};
}

pub(crate) use invariant_violation;
