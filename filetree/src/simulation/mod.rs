//! Deterministic simulation of the file tree.
//!
//! This module tests the engine the same way the rest of it is built:
//! single-threaded and fully reproducible.
//!
//! 1. All randomness comes from one seeded generator; the same seed yields
//!    the identical workload and result.
//! 2. Every operation is applied to the tree and to a flat byte-vector
//!    model in lockstep.
//! 3. After every operation the contents must match and every structural
//!    invariant must hold.
//!
//! # Usage
//!
//! ```
//! use filetree::simulation::{Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345).with_operations(50);
//! let result = Simulator::new(config).run().unwrap();
//!
//! assert!(result.inserts > 0);
//! ```

mod alloc;
pub mod invariants;
mod model;
mod simulator;

pub use alloc::ExtentAllocator;
pub use invariants::InvariantViolation;
pub use model::ModelFile;
pub use simulator::{SimulationError, SimulationResult, Simulator, SimulatorConfig};
