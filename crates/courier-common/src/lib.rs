// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid message id: {0}")]
    InvalidMessageId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Message ids carry one sequence per channel tag so multiplexed
    // subscriptions can resume every underlying channel independently.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use smallvec::SmallVec;
    use std::fmt;
    use std::str::FromStr;

    const UNSET: &str = "-";

    #[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct MessageId {
        seqs: SmallVec<[u64; 1]>,
    }

    impl MessageId {
        // Id of a message published on a single channel.
        pub fn new(seq: u64) -> Self {
            let mut seqs = SmallVec::new();
            seqs.push(seq);
            Self { seqs }
        }

        // Id spanning several channels, one sequence per tag.
        pub fn multiplexed(seqs: impl IntoIterator<Item = u64>) -> Self {
            Self {
                seqs: seqs.into_iter().collect(),
            }
        }

        pub fn unset() -> Self {
            Self::default()
        }

        pub fn is_unset(&self) -> bool {
            self.seqs.is_empty()
        }

        pub fn tag_count(&self) -> usize {
            self.seqs.len()
        }

        pub fn is_multiplexed(&self) -> bool {
            self.seqs.len() > 1
        }

        pub fn seq(&self, tag: usize) -> Option<u64> {
            self.seqs.get(tag).copied()
        }

        pub fn seqs(&self) -> &[u64] {
            &self.seqs
        }

        /// Returns a copy with the sequence for `tag` replaced, growing the id
        /// with zeroes when `tag` is past the current tag count.
        pub fn with_seq(&self, tag: usize, seq: u64) -> Self {
            let mut seqs = self.seqs.clone();
            if seqs.len() <= tag {
                seqs.resize(tag + 1, 0);
            }
            seqs[tag] = seq;
            Self { seqs }
        }
    }

    impl fmt::Display for MessageId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.seqs.is_empty() {
                return f.write_str(UNSET);
            }
            for (idx, seq) in self.seqs.iter().enumerate() {
                if idx > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{seq}")?;
            }
            Ok(())
        }
    }

    impl FromStr for MessageId {
        type Err = Error;

        fn from_str(input: &str) -> Result<Self> {
            let input = input.trim();
            if input == UNSET {
                return Ok(Self::unset());
            }
            let seqs = input
                .split(',')
                .map(|part| part.trim().parse::<u64>())
                .collect::<std::result::Result<SmallVec<[u64; 1]>, _>>()
                .map_err(|_| Error::InvalidMessageId(input.into()))?;
            Ok(Self { seqs })
        }
    }
}

pub const DEFAULT_RAW_STREAM_SEPARATOR: &str = "\n";

/// Per-location long-poll subscriber settings. Read-only once subscribers
/// are created.
///
/// ```
/// use courier_common::LongpollConfig;
///
/// let config = LongpollConfig::default();
/// assert!(!config.multimsg);
/// assert!(config.subscriber_timeout().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongpollConfig {
    // Combine pending messages into one response.
    pub multimsg: bool,
    // Use the raw separator instead of multipart boundaries for batches.
    pub use_raw_stream_separator: bool,
    pub raw_stream_separator: String,
    // Zero disables the timeout.
    pub subscriber_timeout_secs: u64,
    pub act_as_interval_poll: bool,
    // Only presence matters to the subscriber core.
    pub unsubscribe_url: Option<String>,
}

impl LongpollConfig {
    pub fn subscriber_timeout(&self) -> Option<Duration> {
        (self.subscriber_timeout_secs > 0).then(|| Duration::from_secs(self.subscriber_timeout_secs))
    }

    pub fn raw_separator(&self) -> &[u8] {
        self.raw_stream_separator.as_bytes()
    }

    pub fn validate(&self) -> Result<()> {
        if self.multimsg && self.use_raw_stream_separator && self.raw_stream_separator.is_empty() {
            return Err(Error::Config(
                "raw stream separator must not be empty".to_string(),
            ));
        }
        if let Some(url) = &self.unsubscribe_url
            && url.trim().is_empty()
        {
            return Err(Error::Config("unsubscribe url must not be blank".to_string()));
        }
        Ok(())
    }
}

impl Default for LongpollConfig {
    fn default() -> Self {
        Self {
            multimsg: false,
            use_raw_stream_separator: false,
            raw_stream_separator: DEFAULT_RAW_STREAM_SEPARATOR.to_string(),
            subscriber_timeout_secs: 0,
            act_as_interval_poll: false,
            unsubscribe_url: None,
        }
    }
}
