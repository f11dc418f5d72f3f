//! Cascade Core Library
//!
//! This crate provides the foundational types and declarations for the
//! Cascade dataflow engine: hierarchical record identifiers, typed data
//! products, the product-store record tree, producer specifications and
//! consumer queries, node declarations with their typed callable adapters,
//! the module registration DSL, and the persistence interface.
//!
//! # Overview
//!
//! Cascade executes a population of typed algorithms as a directed graph of
//! compute nodes connected by typed message channels. Algorithms are
//! registered through a [`module::Module`]; the companion `cascade-executor`
//! crate wires the declarations into a graph and drives records through it
//! in parallel while preserving hierarchical context.
//!
//! # Example
//!
//! ```
//! use cascade_core::prelude::*;
//!
//! let mut m = Module::new("demo");
//! m.transform("plus_one", |a: i32| a + 1, Concurrency::Unlimited)
//!     .input_family(["a"])
//!     .output_products("b");
//! let declarations = m.into_declarations().unwrap();
//! assert_eq!(declarations.len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod declare;
pub mod error;
pub mod module;
pub mod persistence;
pub mod prelude;
pub mod product;
pub mod source;
pub mod spec;
pub mod store;
pub mod types;

pub use declare::{Concurrency, NodeDeclaration, NodeKind};
pub use error::{CascadeError, Result};
pub use module::Module;
pub use persistence::{MemoryPersistence, Persistence};
pub use product::{Product, Products};
pub use source::RecordSource;
pub use spec::{ProductQuery, ProductSpecification};
pub use store::{ProductStore, Stage, StorePtr};
pub use types::{LevelId, LevelIdPtr, QualifiedName};
