//! Protocol error taxonomy.
//!
//! Every reply and indication message in the node carries an [`Errno`]
//! value instead of propagating failures across task boundaries. Handlers
//! inspect the code and decide locally: transient connection failures lead
//! to cleanup and a re-driven outbound round, wire-level framing errors
//! close the offending connection only, and invariant violations (bounded
//! indication queues overflowing, malformed internal state) abort the
//! process.

use serde::{Deserialize, Serialize};

/// Result codes embedded in response and close-indication messages.
///
/// `None` means success. The numeric representation is stable and appears
/// on the wire inside response messages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error, Default,
)]
#[repr(u8)]
pub enum Errno {
    #[default]
    #[error("none")]
    None = 0,
    #[error("invalid parameter")]
    Parameter,
    #[error("scheduler failure")]
    Scheduler,
    #[error("bad configuration")]
    Config,
    #[error("out of resources")]
    Resource,
    #[error("os level failure")]
    Os,
    #[error("bad message")]
    Message,
    #[error("duplicated")]
    Duplicated,
    #[error("not found")]
    NotFound,
    #[error("mismatched")]
    Mismatched,
    #[error("internal error")]
    Internal,
    #[error("pingpong threshold reached")]
    PingpongThreshold,
    #[error("timeout")]
    Timeout,
    #[error("routing failure")]
    Route,
    #[error("nat mapping changed")]
    NatMapping,
    #[error("unknown")]
    Unknown,
}

impl Errno {
    /// True when the code signals success.
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Errno::None
    }

    /// True for anything other than success.
    #[inline]
    pub fn is_err(self) -> bool {
        self != Errno::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_ok_everything_else_is_not() {
        assert!(Errno::None.is_ok());
        for e in [
            Errno::Parameter,
            Errno::Resource,
            Errno::Duplicated,
            Errno::NotFound,
            Errno::PingpongThreshold,
            Errno::Timeout,
            Errno::NatMapping,
            Errno::Unknown,
        ] {
            assert!(e.is_err(), "{e:?} must not read as success");
        }
    }

    #[test]
    fn codes_round_trip_through_bincode() {
        for e in [Errno::None, Errno::Message, Errno::Route, Errno::Unknown] {
            let bytes = bincode::serialize(&e).unwrap();
            let back: Errno = bincode::deserialize(&bytes).unwrap();
            assert_eq!(e, back);
        }
    }
}
