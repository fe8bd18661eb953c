//! Extent-mapping B-tree.
//!
//! This module provides the file tree: a logical byte stream represented as
//! an ordered sequence of physical extents, indexed by a B-tree keyed by
//! cumulative logical offset rather than by key value.
//!
//! # Structure
//!
//! - Nodes hold extents directly at every level (not just in leaves); key
//!   `i` covers the bytes right after everything under `children[0..=i]`.
//! - Each node caches the total logical length of every child subtree,
//!   which lets descent locate an offset without scanning subtrees.
//! - Rebalancing is top-down: inserts split full nodes on the way down,
//!   removals repair potential underflow before any key is taken out.
//!
//! # Usage
//!
//! ```
//! use filetree::{FileTree, Interval, MemoryStorage};
//!
//! let mut file = FileTree::new("example", MemoryStorage::new(1024), 2).unwrap();
//! file.insert(0, vec![Interval::new(0, 5)], b"hello").unwrap();
//!
//! assert_eq!(file.len(), 5);
//! assert_eq!(file.read(1, 3).unwrap().to_vec(), b"ell");
//! ```

mod file;
pub(crate) mod node;
pub(crate) mod path;

pub use file::{FileTree, FileTreeError};
