//! Convenience re-exports for common Cascade usage.

pub use crate::declare::{Concurrency, NodeDeclaration, NodeKind, OutputSpec};
pub use crate::error::{CascadeError, Result};
pub use crate::module::Module;
pub use crate::persistence::{MemoryPersistence, OutputItem, Persistence, TechSettings};
pub use crate::product::{Product, Products};
pub use crate::source::{RecordSource, ReplaySource};
pub use crate::spec::{ProductQuery, ProductSpecification};
pub use crate::store::{more_derived, ProductStore, Stage, StorePtr};
pub use crate::types::{LevelId, LevelIdPtr, QualifiedName};
