//! Storage abstraction consumed by the file tree.
//!
//! The tree only needs three things from its backing store: a capacity,
//! a way to copy bytes into an already-reserved range, and zero-copy access
//! to a physical sub-range. Keeping this behind a trait lets tests and the
//! simulator share one engine with the in-memory reference implementation.
//!
//! Allocation policy is deliberately absent: the caller decides which
//! physical regions are free and hands the tree ready-made target intervals.

use crate::storage::interval::Interval;
use crate::storage::view::StorageView;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A read or write touched bytes outside the storage capacity.
    OutOfBounds {
        offset: u64,
        length: u64,
        capacity: u64,
    },
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds {
                offset,
                length,
                capacity,
            } => write!(
                f,
                "range [{offset}, {}) out of bounds (capacity: {capacity})",
                offset + length
            ),
        }
    }
}

impl std::error::Error for StorageError {}

/// Abstraction over a linear byte container.
///
/// Implementations must ensure:
/// - `bytes` returns the last written content for a range
/// - ranges outside `[0, capacity)` are rejected, never truncated silently
pub trait Storage {
    /// Total capacity in bytes.
    fn capacity(&self) -> u64;

    /// Copy `bytes` into storage starting at `offset`.
    ///
    /// The caller guarantees the target range was already reserved.
    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), StorageError>;

    /// Zero-copy access to a physical sub-range.
    fn bytes(&self, interval: Interval) -> Result<&[u8], StorageError>;

    /// A single-segment view of a physical sub-range.
    fn view(&self, interval: Interval) -> Result<StorageView<'_>, StorageError> {
        Ok(StorageView::from_slice(self.bytes(interval)?))
    }
}
