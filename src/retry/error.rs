//! Aggregate error returned when a retried operation gives up.

use std::fmt;

/// Failure of a retried operation, carrying every collected failure in order
#[derive(Debug)]
pub enum RetryError<E> {
    /// All allowed attempts failed
    Exhausted { attempts: u32, failures: Vec<E> },

    /// `should_retry` rejected the latest failure
    Aborted { attempts: u32, failures: Vec<E> },

    /// Cancellation was requested before the next attempt
    Cancelled { attempts: u32, failures: Vec<E> },
}

impl<E> RetryError<E> {
    /// Number of attempts that actually ran
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Aborted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn failures(&self) -> &[E] {
        match self {
            Self::Exhausted { failures, .. }
            | Self::Aborted { failures, .. }
            | Self::Cancelled { failures, .. } => failures,
        }
    }

    pub fn into_failures(self) -> Vec<E> {
        match self {
            Self::Exhausted { failures, .. }
            | Self::Aborted { failures, .. }
            | Self::Cancelled { failures, .. } => failures,
        }
    }

    /// The most recent underlying failure, if any attempt ran
    pub fn last_failure(&self) -> Option<&E> {
        self.failures().last()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "exhausted",
            Self::Aborted { .. } => "aborted",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, .. } => {
                write!(f, "Retry attempts exhausted after {attempts} attempt(s)")?
            }
            Self::Aborted { attempts, .. } => {
                write!(f, "Retry aborted after {attempts} attempt(s)")?
            }
            Self::Cancelled { attempts, .. } => {
                return write!(f, "Retry cancelled after {attempts} attempt(s)");
            }
        }

        match self.last_failure() {
            Some(last) => write!(f, ": {last}"),
            None => Ok(()),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}
