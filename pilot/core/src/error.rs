use crate::ConfigKey;
use std::{fmt, time::Duration};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The origin of a source is unreachable or has not yet been listed.
    #[error("source {name} is unavailable: {reason}")]
    SourceUnavailable { name: String, reason: String },

    /// Two sources claimed the same key. Resolved by source priority.
    #[error("conflicting object: {0}")]
    ConflictDetected(Conflict),

    /// A loop did not complete its first sync within the startup timeout.
    #[error("{name} did not reach running within {timeout:?}")]
    StartupTimeout { name: String, timeout: Duration },

    /// A subscriber fell behind and its buffered events were coalesced.
    #[error("subscriber buffer overflowed at {0}")]
    SubscriberOverflow(ConfigKey),

    #[error("invalid config sources: {0}")]
    InvalidSources(String),

    /// A loop returned before reaching running.
    #[error("{name} exited before reaching running")]
    LoopExited { name: String },

    #[error("loops did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Records that `loser` published an object for `key` that is shadowed by
/// the object from `winner`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub key: ConfigKey,
    pub winner: String,
    pub loser: String,
}

impl Error {
    pub fn unavailable(name: impl ToString, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {} is shadowed by {}",
            self.key, self.loser, self.winner
        )
    }
}
