//! The runtime's error taxonomy.
//!
//! Every fallible operation in this crate returns a [`Code`] instead of
//! panicking or unwinding; panics are reserved for unrecoverable invariant
//! violations (guard-page breach, canary mismatch, a trampoline returning),
//! which abort the process with a diagnostic message instead.

use std::fmt;

/// Outcome of a channel, select, or scope operation.
///
/// `Ok` is success; every other variant is a negative result code in the
/// sense of the external API surface (§6 of the spec): callers that need the
/// stable numeric encoding can use [`Code::as_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Code {
    /// The operation completed and transferred ownership of its element.
    #[error("ok")]
    Ok,
    /// A non-blocking (`timeout == 0`) attempt could not make progress.
    #[error("would block")]
    WouldBlock,
    /// A bounded (`timeout > 0`) wait's deadline elapsed before progress.
    #[error("deadline exceeded")]
    Deadline,
    /// A cancellation token was observed at a suspension point.
    #[error("cancelled")]
    Cancelled,
    /// The channel is closed and has nothing left to deliver.
    #[error("closed")]
    Closed,
    /// The requested feature is not enabled for this channel or backend.
    #[error("not supported")]
    NotSupported,
    /// A caller-supplied argument violates a precondition.
    #[error("invalid argument")]
    InvalidArgument,
    /// Allocation failed (stack, coroutine struct, or unbounded channel
    /// growth).
    #[error("no memory")]
    NoMemory,
}

impl Code {
    /// The stable numeric encoding from the external API surface: `Ok` is
    /// `0`, every failure is negative.
    pub fn as_raw(self) -> i32 {
        match self {
            Code::Ok => 0,
            Code::WouldBlock => -1,
            Code::Deadline => -2,
            Code::Cancelled => -3,
            Code::Closed => -4,
            Code::NotSupported => -5,
            Code::InvalidArgument => -6,
            Code::NoMemory => -7,
        }
    }

    /// True for every variant other than `Ok`.
    pub fn is_err(self) -> bool {
        self != Code::Ok
    }
}

/// Result alias used throughout the channel/select/scope API.
pub type RtResult<T> = Result<T, Code>;

/// Failure category used by a channel's counters (§4.4 "Metrics").
///
/// Distinct from [`Code`] because several codes collapse onto the same
/// counter bucket (e.g. `Deadline` and `WouldBlock` are both "availability"
/// failures and neither moves the success counters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Availability,
    Lifecycle,
    Capability,
    Programmer,
}

impl FailureKind {
    pub fn of(code: Code) -> Option<FailureKind> {
        match code {
            Code::Ok => None,
            Code::WouldBlock | Code::Deadline => Some(FailureKind::Availability),
            Code::Closed | Code::Cancelled => Some(FailureKind::Lifecycle),
            Code::NotSupported => Some(FailureKind::Capability),
            Code::InvalidArgument | Code::NoMemory => Some(FailureKind::Programmer),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Availability => "availability",
            FailureKind::Lifecycle => "lifecycle",
            FailureKind::Capability => "capability",
            FailureKind::Programmer => "programmer",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encoding_matches_surface() {
        assert_eq!(Code::Ok.as_raw(), 0);
        assert!(Code::WouldBlock.as_raw() < 0);
        assert!(!Code::Ok.is_err());
        assert!(Code::Closed.is_err());
    }

    #[test]
    fn failure_kind_buckets() {
        assert_eq!(FailureKind::of(Code::Ok), None);
        assert_eq!(FailureKind::of(Code::Deadline), Some(FailureKind::Availability));
        assert_eq!(FailureKind::of(Code::Cancelled), Some(FailureKind::Lifecycle));
        assert_eq!(FailureKind::of(Code::NotSupported), Some(FailureKind::Capability));
        assert_eq!(FailureKind::of(Code::NoMemory), Some(FailureKind::Programmer));
    }
}
