#![forbid(unsafe_code)]
//! Error types for thinpd.
//!
//! # Error Taxonomy
//!
//! thinpd uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `pd-types` | Node bytes that violate the on-disk format |
//! | Runtime | `PdError` | `pd-error` (this crate) | Errors returned by trees, walkers and the transaction manager |
//!
//! ## Mapping Policy: ParseError → PdError
//!
//! `pd-error` does not depend on `pd-types`. The B-tree engine converts a
//! `ParseError` into `PdError::Corruption { block, detail }` as soon as it
//! knows which block the bytes came from, so every structural failure that
//! reaches a caller names the block for repair triage.
//!
//! ## Structural vs. operational errors
//!
//! The damage-tolerant walker converts *structural* errors into damage
//! reports and keeps going (see [`PdError::is_structural`]). Everything else
//! aborts the walk or the mutation that produced it:
//!
//! | Variant | Structural | Typical source |
//! |---------|------------|----------------|
//! | `Io` | yes | device read failed |
//! | `Corruption` | yes | node failed validation |
//! | `Format` | yes | block address out of range, bad block size |
//! | `Parse` | yes | value bytes did not decode |
//! | `NotFound` | no | lookup or remove of an absent key |
//! | `Exists` | no | creating a device id already in use |
//! | `NoSpace` | no | metadata space map exhausted |
//! | `RefCountUnderflow` | no | decrement of a block whose count is already zero |
//! | `ValueOutOfRange` | no | value cannot be packed into its disk encoding |
//!
//! `RefCountUnderflow` is never clamped: it indicates either corruption or a
//! counting bug upstream and aborts the enclosing transaction.

use thiserror::Error;

/// Unified error type for all thinpd operations.
#[derive(Debug, Error)]
pub enum PdError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// Used when a node fails validation (checksum mismatch, bad header,
    /// keys out of order, counts inconsistent with the block size). The
    /// `block` field enables repair triage.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid device geometry or addressing (out-of-range block, bad block size).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    ///
    /// Prefer `Corruption` when the block number is known.
    #[error("parse error: {0}")]
    Parse(String),

    /// Key, device, or mapping not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists (device id in use).
    #[error("already exists: {0}")]
    Exists(String),

    /// No free metadata blocks available.
    #[error("no space left in metadata device")]
    NoSpace,

    /// A decrement would drive a block's reference count below zero.
    #[error("reference count underflow at block {block}")]
    RefCountUnderflow { block: u64 },

    /// A value does not fit its on-disk encoding.
    #[error("value out of range: {0}")]
    ValueOutOfRange(String),
}

impl PdError {
    /// Whether this error describes unreadable or malformed metadata.
    ///
    /// Structural errors are converted into damage reports by the walker;
    /// the rest propagate unchanged.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        match self {
            Self::Io(_) | Self::Corruption { .. } | Self::Format(_) | Self::Parse(_) => true,
            Self::NotFound(_)
            | Self::Exists(_)
            | Self::NoSpace
            | Self::RefCountUnderflow { .. }
            | Self::ValueOutOfRange(_) => false,
        }
    }

    /// Block associated with this error, when one is known.
    #[must_use]
    pub fn block(&self) -> Option<u64> {
        match self {
            Self::Corruption { block, .. } | Self::RefCountUnderflow { block } => Some(*block),
            _ => None,
        }
    }
}

/// Result alias using `PdError`.
pub type Result<T> = std::result::Result<T, PdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_classification_covers_all_variants() {
        let cases: Vec<(PdError, bool)> = vec![
            (PdError::Io(std::io::Error::other("test")), true),
            (
                PdError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                true,
            ),
            (PdError::Format("test".into()), true),
            (PdError::Parse("test".into()), true),
            (PdError::NotFound("test".into()), false),
            (PdError::Exists("test".into()), false),
            (PdError::NoSpace, false),
            (PdError::RefCountUnderflow { block: 9 }, false),
            (PdError::ValueOutOfRange("test".into()), false),
        ];

        for (error, expected) in &cases {
            assert_eq!(
                error.is_structural(),
                *expected,
                "wrong classification for {error:?}",
            );
        }
    }

    #[test]
    fn display_formatting() {
        let err = PdError::Corruption {
            block: 42,
            detail: "bad checksum".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: bad checksum"
        );

        let underflow = PdError::RefCountUnderflow { block: 7 };
        assert_eq!(underflow.to_string(), "reference count underflow at block 7");

        let missing = PdError::NotFound("key [3, 0]".into());
        assert_eq!(missing.to_string(), "not found: key [3, 0]");

        let parse = PdError::Parse("insufficient data: need 8 bytes at offset 0, got 2".into());
        assert!(parse.to_string().contains("parse error:"));
    }

    #[test]
    fn block_is_reported_for_block_scoped_errors() {
        assert_eq!(
            PdError::Corruption {
                block: 12,
                detail: String::new()
            }
            .block(),
            Some(12)
        );
        assert_eq!(PdError::RefCountUnderflow { block: 3 }.block(), Some(3));
        assert_eq!(PdError::NoSpace.block(), None);
    }
}
