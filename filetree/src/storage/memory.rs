//! In-memory reference storage.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::interval::Interval;
use crate::storage::io::{Storage, StorageError};

/// A fixed-capacity in-memory linear byte store.
///
/// This is the reference `Storage` implementation used by the tests, the
/// simulator, and the demo driver. All bytes start zeroed; the store never
/// grows, so a caller that runs out of room sees an explicit error instead
/// of silent reallocation.
#[derive(Debug)]
pub struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {
    /// Create a zeroed store with the given capacity in bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            data: vec![0; capacity as usize],
        }
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<(), StorageError> {
        let capacity = self.capacity();
        if offset.checked_add(length).is_none_or(|end| end > capacity) {
            return Err(StorageError::OutOfBounds {
                offset,
                length,
                capacity,
            });
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_range(offset, bytes.len() as u64)?;
        let offset = offset as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn bytes(&self, interval: Interval) -> Result<&[u8], StorageError> {
        self.check_range(interval.start(), interval.length())?;
        let start = interval.start() as usize;
        let end = interval.end() as usize;
        Ok(&self.data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let mut storage = MemoryStorage::new(64);
        storage.write(10, b"hello").unwrap();

        let bytes = storage.bytes(Interval::new(10, 5)).unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_unwritten_bytes_are_zero() {
        let storage = MemoryStorage::new(16);
        assert_eq!(storage.bytes(Interval::new(0, 16)).unwrap(), &[0u8; 16]);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mut storage = MemoryStorage::new(8);
        let result = storage.write(6, b"abc");
        assert_eq!(
            result,
            Err(StorageError::OutOfBounds {
                offset: 6,
                length: 3,
                capacity: 8,
            })
        );
    }

    #[test]
    fn test_read_out_of_bounds() {
        let storage = MemoryStorage::new(8);
        assert!(storage.bytes(Interval::new(8, 1)).is_err());
        assert!(storage.bytes(Interval::new(u64::MAX, 2)).is_err());
    }

    #[test]
    fn test_view_single_segment() {
        let mut storage = MemoryStorage::new(32);
        storage.write(0, b"abcdef").unwrap();

        let view = storage.view(Interval::new(2, 3)).unwrap();
        assert_eq!(view.to_vec(), b"cde");
    }
}
