//! Strongly-typed identifiers for Cascade entities.

mod ids;

pub use ids::{LevelId, LevelIdPtr, QualifiedName};
