//! Dependency resolution for the Gantry plugin host.
//!
//! Orders plugins so that every plugin appears after all of its transitive
//! dependencies, with deterministic tie-breaking and cycle detection.

mod graph;
mod resolver;

pub use graph::{DependencyGraph, analyze};
pub use resolver::resolve;
