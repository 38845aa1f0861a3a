//! Decomposer: turns a phase set into an ordered sequence of waves.
//!
//! ## Architecture
//!
//! 1. **Builder** - Constructs the dependency graph, rejecting duplicate ids
//!    and unknown dependencies
//! 2. **Plan** - Extracts waves by repeated frontier extraction, detects
//!    cycles and same-wave artifact conflicts, renders the roadmap
//!
//! Decomposition is a pure function of the phase set.
//!
//! ## Example
//!
//! ```no_run
//! use wavefront::dag::decompose;
//! use wavefront::phase::Phase;
//!
//! # fn example() -> Result<(), wavefront::errors::PlanError> {
//! let phases = vec![
//!     Phase::new("A", "Schema", vec![]),
//!     Phase::new("B", "Config", vec![]),
//!     Phase::new("C", "Service", vec!["A".to_string(), "B".to_string()]),
//! ];
//!
//! let plan = decompose(&phases)?;
//! // Wave 0: [A, B]
//! // Wave 1: [C]
//! assert_eq!(plan.len(), 2);
//! # Ok(())
//! # }
//! ```

mod builder;
mod plan;

pub use builder::{DagBuilder, PhaseGraph, PhaseIndex};
pub use plan::{Wave, WavePlan};

use crate::errors::PlanError;
use crate::phase::Phase;

/// Decompose phases into an ordered wave plan.
pub fn decompose(phases: &[Phase]) -> Result<WavePlan, PlanError> {
    WavePlan::from_phases(phases)
}
