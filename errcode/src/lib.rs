// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]

//! Control-plane error taxonomy shared by the FNAT subsystems.
//!
//! Every control-plane operation (local-address management, service lookup,
//! reload) surfaces one of these kinds verbatim to its caller. The numeric
//! codes are stable and travel on the framed socket-option transport, so the
//! mapping in [`CtrlError::code`] must never be reordered.

/// Errors surfaced by control-plane operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum CtrlError {
    /// Null, malformed or unparseable arguments.
    #[error("invalid")]
    Invalid,
    /// Service lookup missed.
    #[error("no-service")]
    NoService,
    /// Operation not defined for this protocol or option id.
    #[error("not-supported")]
    NotSupported,
    /// Idempotent add: the object already exists.
    #[error("exist")]
    Exist,
    /// Idempotent delete: no such object.
    #[error("not-exist")]
    NotExist,
    /// The object is pinned by outstanding references; retry later.
    #[error("busy")]
    Busy,
    /// No free local port or no local address configured.
    #[error("resource-exhausted")]
    ResourceExhausted,
    /// Allocation failed.
    #[error("oom")]
    Oom,
}

impl CtrlError {
    /// Stable numeric code for the wire transport.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            CtrlError::Invalid => 1,
            CtrlError::NoService => 2,
            CtrlError::NotSupported => 3,
            CtrlError::Exist => 4,
            CtrlError::NotExist => 5,
            CtrlError::Busy => 6,
            CtrlError::ResourceExhausted => 7,
            CtrlError::Oom => 8,
        }
    }

    /// Reverse of [`CtrlError::code`]. Zero is success and yields `None`, as
    /// does any code outside the taxonomy.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(CtrlError::Invalid),
            2 => Some(CtrlError::NoService),
            3 => Some(CtrlError::NotSupported),
            4 => Some(CtrlError::Exist),
            5 => Some(CtrlError::NotExist),
            6 => Some(CtrlError::Busy),
            7 => Some(CtrlError::ResourceExhausted),
            8 => Some(CtrlError::Oom),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let all = [
            CtrlError::Invalid,
            CtrlError::NoService,
            CtrlError::NotSupported,
            CtrlError::Exist,
            CtrlError::NotExist,
            CtrlError::Busy,
            CtrlError::ResourceExhausted,
            CtrlError::Oom,
        ];
        for err in all {
            assert_eq!(CtrlError::from_code(err.code()), Some(err));
        }
        assert_eq!(CtrlError::from_code(0), None);
        assert_eq!(CtrlError::from_code(255), None);
    }

    #[test]
    fn display_matches_taxonomy() {
        assert_eq!(CtrlError::Busy.to_string(), "busy");
        assert_eq!(
            CtrlError::ResourceExhausted.to_string(),
            "resource-exhausted"
        );
    }
}
