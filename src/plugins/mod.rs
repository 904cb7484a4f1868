//! Subsystems built on the core primitives.

pub mod blackboard;
pub mod dual_write;
