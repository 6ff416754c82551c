// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Error types for rinode
//!
//! One structured enumeration covers the whole substrate: registry lookups,
//! flow lifecycle, the serialized control protocol and the user-space
//! enrollment machinery all report through it.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy of the substrate.
///
/// Expected failures are always reported through this type; panics are
/// reserved for broken internal invariants.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("out of memory")]
    NoMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("interrupted")]
    Interrupted,

    #[error("peer rejected: {0}")]
    PeerRejected(String),

    #[error("operation would block")]
    WouldBlock,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Serialization(#[from] postcard::Error),
}

impl Error {
    /// Numeric code used when an error has to cross the serialized control
    /// boundary inside a response message.
    pub fn code(&self) -> u8 {
        match self {
            Error::NotFound(_) => 1,
            Error::Exists(_) => 2,
            Error::NoSpace(_) => 3,
            Error::NoMemory => 4,
            Error::InvalidArgument(_) => 5,
            Error::Busy(_) => 6,
            Error::Unreachable(_) => 7,
            Error::Interrupted => 8,
            Error::PeerRejected(_) => 9,
            Error::WouldBlock => 10,
            Error::Io(_) => 11,
            Error::Serialization(_) => 12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound("ipcp 7".to_string());
        assert_eq!(err.to_string(), "not found: ipcp 7");

        let err = Error::PeerRejected("flow allocation denied".to_string());
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_error_codes_distinct() {
        let errs = [
            Error::NotFound(String::new()),
            Error::Exists(String::new()),
            Error::NoSpace(String::new()),
            Error::NoMemory,
            Error::InvalidArgument(String::new()),
            Error::Busy(String::new()),
            Error::Unreachable(String::new()),
            Error::Interrupted,
            Error::PeerRejected(String::new()),
            Error::WouldBlock,
        ];
        let mut codes: Vec<u8> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }
}
