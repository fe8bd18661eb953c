// Life of an operation:
// 1. Caller reserves physical extents (allocation policy is the caller's)
// 2. For inserts:
//     - Bytes land in storage at the reserved extents
//     - The tree maps the logical range onto new keys, splitting full
//       nodes on the way down
//    For reads:
//     - Offset-based descent over cached subtree lengths
//     - Result is a lazy concatenation of storage sub-ranges
//    For removals:
//     - Top-down sweep in offset order, rotate/merge repair before any
//       key comes out
//
// System components:
//  - Linear storage + zero-copy views
//  - Extent-mapping B-tree (the file tree)
//  - Deterministic simulation harness

pub mod config;
pub mod simulation;
pub mod storage;
pub mod tree;

pub use config::{ConfigError, EngineConfig};
pub use storage::{Interval, MemoryStorage, Storage, StorageError, StorageView};
pub use tree::{FileTree, FileTreeError};
