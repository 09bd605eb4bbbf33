//! Feature graph: units, dependency edges, and the ready-set query

mod core;

pub use core::{FeatureGraph, GraphError};
