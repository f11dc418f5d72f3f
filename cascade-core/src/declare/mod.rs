//! Node declarations.
//!
//! A declaration is the engine-facing record of one registered algorithm:
//! its kind, qualified name, concurrency policy, input queries, output
//! specifications, filter predicates, and the type-erased callable. The
//! module DSL (see [`crate::module`]) produces declarations; the builder
//! wires them into the executor graph.

mod callable;

pub use callable::{FoldFn, SplitFn, SplitProducts, TransformFn};

use crate::error::Result;
use crate::product::Products;
use crate::spec::{ProductQuery, ProductSpecification};
use crate::store::StorePtr;
use crate::types::QualifiedName;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Per-node bound on parallel invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concurrency {
    /// At most one invocation in flight; invocations serialize in arrival
    /// order.
    Serial,
    /// At most `n` concurrent invocations; excess requests wait in FIFO order.
    Bounded(usize),
    /// No bound.
    Unlimited,
}

impl Concurrency {
    /// The concurrency limit, or `None` for unlimited.
    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Serial => Some(1),
            Self::Bounded(n) => Some((*n).max(1)),
            Self::Unlimited => None,
        }
    }
}

/// The kind of a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Emits the root stream of records; no inputs.
    Source,
    /// Consumes inputs, emits outputs at the same level.
    Transform,
    /// Consumes inputs, pure side effect.
    Observer,
    /// Observer that records non-flush records to the persistence interface.
    Output,
    /// Folds descendant records into one output at an ancestor level.
    Reduction,
    /// Injects a new child level below the inbound record.
    Splitter,
}

/// A declared output stream: specification plus the producer's type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    /// The stream specification.
    pub spec: ProductSpecification,
    /// Type tag of the produced values.
    pub type_tag: String,
}

/// Type-erased reduction accumulator state.
pub type Accumulator = Box<dyn Any + Send>;

/// Erased transform body: joined stores in, output products out.
pub type TransformInvoker =
    Arc<dyn Fn(&[StorePtr], &[ProductQuery]) -> Result<Products> + Send + Sync>;

/// Erased observer body.
pub type ObserverInvoker = Arc<dyn Fn(&[StorePtr], &[ProductQuery]) -> Result<()> + Send + Sync>;

/// Erased reduction seed constructor, invoked once per aggregation ancestor.
pub type ReductionInit = Arc<dyn Fn() -> Accumulator + Send + Sync>;

/// Erased reduction fold step, invoked once per descendant record.
pub type ReductionFold =
    Arc<dyn Fn(&mut Accumulator, &[StorePtr], &[ProductQuery]) -> Result<()> + Send + Sync>;

/// Erased reduction finalizer, invoked once per ancestor on its flush.
pub type ReductionFinalize = Arc<dyn Fn(Accumulator) -> Result<Products> + Send + Sync>;

/// Erased splitter body: one products bag per injected child.
pub type SplitInvoker =
    Arc<dyn Fn(&[StorePtr], &[ProductQuery]) -> Result<Vec<Products>> + Send + Sync>;

/// The kind-specific execution behavior of a node.
pub enum NodeBehavior {
    /// Transform body.
    Transform {
        /// The erased callable.
        invoke: TransformInvoker,
    },
    /// Observer body.
    Observer {
        /// The erased callable.
        invoke: ObserverInvoker,
    },
    /// Engine-managed persistence write; no user callable.
    Output,
    /// Reduction state machine.
    Reduction {
        /// Seed constructor.
        init: ReductionInit,
        /// Per-descendant fold.
        fold: ReductionFold,
        /// Per-ancestor finalizer.
        finalize: ReductionFinalize,
    },
    /// Splitter body.
    Splitter {
        /// The erased callable.
        invoke: SplitInvoker,
    },
}

impl NodeBehavior {
    /// The node kind this behavior belongs to.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Transform { .. } => NodeKind::Transform,
            Self::Observer { .. } => NodeKind::Observer,
            Self::Output => NodeKind::Output,
            Self::Reduction { .. } => NodeKind::Reduction,
            Self::Splitter { .. } => NodeKind::Splitter,
        }
    }
}

impl fmt::Debug for NodeBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeBehavior::{:?}", self.kind())
    }
}

/// One registered algorithm, ready for wiring.
#[derive(Debug)]
pub struct NodeDeclaration {
    /// Qualified algorithm name, unique within the module.
    pub name: QualifiedName,
    /// Concurrency policy.
    pub concurrency: Concurrency,
    /// Input queries, in callable argument order.
    pub inputs: Vec<ProductQuery>,
    /// Declared output streams.
    pub outputs: Vec<OutputSpec>,
    /// Boolean product names this node gates on.
    pub predicates: Vec<ProductQuery>,
    /// Aggregation level (reductions) or injected child level (splitters).
    pub level: Option<String>,
    /// Kind-specific behavior.
    pub behavior: NodeBehavior,
}

impl NodeDeclaration {
    /// The node kind.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.behavior.kind()
    }

    /// The qualified algorithm name.
    #[must_use]
    pub fn name(&self) -> &QualifiedName {
        &self.name
    }

    /// The concurrency policy.
    #[must_use]
    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// The input queries.
    #[must_use]
    pub fn inputs(&self) -> &[ProductQuery] {
        &self.inputs
    }

    /// The declared output streams.
    #[must_use]
    pub fn outputs(&self) -> &[OutputSpec] {
        &self.outputs
    }

    /// The predicate queries.
    #[must_use]
    pub fn predicates(&self) -> &[ProductQuery] {
        &self.predicates
    }
}
