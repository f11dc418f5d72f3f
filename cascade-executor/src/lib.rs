//! Cascade Executor Library
//!
//! This crate wires [`cascade_core`] declarations into an executable flow
//! graph and drives records through it concurrently:
//!
//! - **Builder**: resolves producer/consumer wiring by specification,
//!   rejects duplicate specifications, unresolved and ambiguous inputs, and
//!   cycles, then computes a deterministic topological order.
//! - **Scheduler**: a message-passing execution loop with per-node
//!   concurrency policies, record-identity joins, flush propagation for
//!   reductions, record poisoning, and cooperative cancellation.
//!
//! # Example
//!
//! ```no_run
//! use cascade_core::prelude::*;
//! use cascade_executor::builder::GraphBuilder;
//! use cascade_executor::scheduler::{ExecutorConfig, PipelineExecutor};
//! use cascade_executor::testing::SequenceSource;
//!
//! # async fn run() -> Result<()> {
//! let mut records = Vec::new();
//! let base = ProductStore::base();
//! for i in 0..10 {
//!     let mut bag = Products::new();
//!     bag.add("a", i as i32)?;
//!     records.push(base.make_child(i, "cell", "gen", bag)?);
//! }
//! let source = SequenceSource::new("gen")
//!     .providing::<i32>("a")
//!     .with_records(records);
//!
//! let mut m = Module::new("demo");
//! m.transform("plus_one", |a: i32| a + 1, Concurrency::Unlimited)
//!     .input_family(["a"])
//!     .output_products("b");
//!
//! let mut builder = GraphBuilder::new(&source);
//! builder.add_module(m)?;
//! let graph = builder.build()?;
//!
//! let executor = PipelineExecutor::new(graph, ExecutorConfig::default());
//! let summary = executor.execute(Box::new(source)).await?;
//! assert_eq!(summary.records, 10);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod builder;
pub mod graph;
pub mod scheduler;
pub mod testing;

pub use builder::{ExecNode, ExecutorGraph, GraphBuilder};
pub use graph::{Edge, FlowGraph, GraphNode, NodeIndex};
pub use scheduler::{ExecutionSummary, ExecutorConfig, PipelineExecutor};
