//! The module registrar and declaration DSL.
//!
//! A [`Module`] collects algorithm registrations. Each registration binds a
//! callable to a name and a concurrency policy, then fluently declares input
//! families, output specifications, predicates, and (for reductions) the
//! aggregation level with its initializer. Construction is deferred: pending
//! registrations only become [`NodeDeclaration`]s when the module is handed to
//! the graph builder via [`Module::into_declarations`], which is where missing
//! required fields and duplicate names are reported.
//!
//! ```
//! use cascade_core::module::Module;
//! use cascade_core::declare::Concurrency;
//!
//! let mut m = Module::new("demo");
//! m.transform("plus_one", |a: i32| a + 1, Concurrency::Unlimited)
//!     .input_family(["a"])
//!     .output_products("b");
//! m.observe("verify", |b: i32| assert!(b > 0), Concurrency::Unlimited)
//!     .input_family(["b"]);
//! let declarations = m.into_declarations().unwrap();
//! assert_eq!(declarations.len(), 2);
//! ```

use crate::declare::{
    Accumulator, Concurrency, FoldFn, NodeBehavior, NodeDeclaration, NodeKind, ObserverInvoker,
    OutputSpec, ReductionFinalize, ReductionFold, ReductionInit, SplitFn, SplitInvoker,
    SplitProducts, TransformFn, TransformInvoker,
};
use crate::error::{CascadeError, Result};
use crate::product::Products;
use crate::spec::{ProductQuery, ProductSpecification};
use crate::types::QualifiedName;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

/// Collects algorithm registrations for one module.
#[derive(Debug, Default)]
pub struct Module {
    name: String,
    pending: Vec<PendingNode>,
}

#[derive(Debug)]
struct PendingNode {
    name: String,
    kind: NodeKind,
    concurrency: Concurrency,
    inputs: Vec<ProductQuery>,
    outputs: Vec<OutputSpec>,
    predicates: Vec<ProductQuery>,
    arity: usize,
    level: Option<String>,
    behavior: Option<NodeBehavior>,
    defect: Option<String>,
}

impl Module {
    /// Create an empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: Vec::new(),
        }
    }

    /// The module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, name: &str, kind: NodeKind, concurrency: Concurrency, arity: usize) -> usize {
        self.pending.push(PendingNode {
            name: name.to_string(),
            kind,
            concurrency,
            inputs: Vec::new(),
            outputs: Vec::new(),
            predicates: Vec::new(),
            arity,
            level: None,
            behavior: None,
            defect: None,
        });
        self.pending.len() - 1
    }

    /// Register a transform: consumes inputs, emits outputs at the same level.
    pub fn transform<F, Args, R>(
        &mut self,
        name: &str,
        algorithm: F,
        concurrency: Concurrency,
    ) -> TransformBuilder<'_, F, Args, R>
    where
        F: TransformFn<Args, R>,
    {
        let index = self.push(name, NodeKind::Transform, concurrency, algorithm.arity());
        TransformBuilder {
            module: self,
            index,
            algorithm: Some(algorithm),
            _marker: PhantomData,
        }
    }

    /// Register an observer: consumes inputs, pure side effect.
    pub fn observe<F, Args>(
        &mut self,
        name: &str,
        algorithm: F,
        concurrency: Concurrency,
    ) -> ObserverBuilder<'_>
    where
        F: TransformFn<Args, ()>,
        Args: 'static,
    {
        let index = self.push(name, NodeKind::Observer, concurrency, algorithm.arity());
        let invoke: ObserverInvoker =
            Arc::new(move |stores, inputs| algorithm.extract_and_call(stores, inputs));
        self.pending[index].behavior = Some(NodeBehavior::Observer { invoke });
        ObserverBuilder {
            module: self,
            index,
        }
    }

    /// Register an output: records each non-flush record it consumes to the
    /// persistence interface.
    pub fn output(&mut self, name: &str, concurrency: Concurrency) -> ObserverBuilder<'_> {
        let index = self.push(name, NodeKind::Output, concurrency, 0);
        self.pending[index].behavior = Some(NodeBehavior::Output);
        ObserverBuilder {
            module: self,
            index,
        }
    }

    /// Register a reduction: folds descendant records into one output at the
    /// aggregation level declared with [`ReduceBuilder::over`].
    ///
    /// Folds observe descendants in arrival order. Under a non-serial policy
    /// that order is not deterministic, so folds should be
    /// associative-commutative.
    pub fn reduce<F, Acc, Args>(
        &mut self,
        name: &str,
        fold: F,
        concurrency: Concurrency,
    ) -> ReduceBuilder<'_, F, Acc, Args>
    where
        F: FoldFn<Acc, Args>,
        Acc: Clone + Send + Sync + 'static,
    {
        let index = self.push(name, NodeKind::Reduction, concurrency, fold.arity());
        ReduceBuilder {
            module: self,
            index,
            fold: Some(fold),
            seed: None,
            _marker: PhantomData,
        }
    }

    /// Register a splitter: injects a new child level below the inbound
    /// record, emitting one child per returned element plus the terminating
    /// flush for each child subtree.
    pub fn split<F, Args, T>(
        &mut self,
        name: &str,
        algorithm: F,
        concurrency: Concurrency,
    ) -> SplitBuilder<'_, F, Args, T>
    where
        F: SplitFn<Args, T>,
        T: Send + Sync + 'static,
    {
        let index = self.push(name, NodeKind::Splitter, concurrency, algorithm.arity());
        SplitBuilder {
            module: self,
            index,
            algorithm: Some(algorithm),
            _marker: PhantomData,
        }
    }

    /// Emit the collected declarations, enforcing required fields and name
    /// uniqueness.
    ///
    /// # Errors
    /// Returns [`CascadeError::DuplicateName`] or
    /// [`CascadeError::IncompleteDeclaration`].
    pub fn into_declarations(self) -> Result<Vec<NodeDeclaration>> {
        let module = self.name;
        let mut seen: HashSet<String> = HashSet::new();
        let mut declarations = Vec::with_capacity(self.pending.len());

        for pending in self.pending {
            if !seen.insert(pending.name.clone()) {
                return Err(CascadeError::DuplicateName {
                    module: module.clone(),
                    name: pending.name,
                });
            }
            if let Some(defect) = pending.defect {
                return Err(CascadeError::IncompleteDeclaration {
                    node: pending.name,
                    missing: defect,
                });
            }
            let behavior = pending.behavior.ok_or_else(|| {
                CascadeError::IncompleteDeclaration {
                    node: pending.name.clone(),
                    missing: "output declaration".to_string(),
                }
            })?;
            match pending.kind {
                NodeKind::Output => {
                    if pending.inputs.is_empty() {
                        return Err(CascadeError::IncompleteDeclaration {
                            node: pending.name,
                            missing: "input families".to_string(),
                        });
                    }
                }
                _ => {
                    if pending.inputs.len() != pending.arity {
                        return Err(CascadeError::IncompleteDeclaration {
                            node: pending.name,
                            missing: format!(
                                "callable takes {} arguments but {} input families were declared",
                                pending.arity,
                                pending.inputs.len()
                            ),
                        });
                    }
                }
            }
            match pending.kind {
                NodeKind::Reduction if pending.level.is_none() => {
                    return Err(CascadeError::IncompleteDeclaration {
                        node: pending.name,
                        missing: "aggregation level (.over)".to_string(),
                    });
                }
                NodeKind::Splitter if pending.level.is_none() => {
                    return Err(CascadeError::IncompleteDeclaration {
                        node: pending.name,
                        missing: "child level (.into_level)".to_string(),
                    });
                }
                _ => {}
            }
            declarations.push(NodeDeclaration {
                name: QualifiedName::new(module.clone(), pending.name),
                concurrency: pending.concurrency,
                inputs: pending.inputs,
                outputs: pending.outputs,
                predicates: pending.predicates,
                level: pending.level,
                behavior,
            });
        }
        tracing::debug!(
            module = %module,
            count = declarations.len(),
            "module declarations emitted"
        );
        Ok(declarations)
    }
}

fn extend_queries<I, Q>(target: &mut Vec<ProductQuery>, queries: I)
where
    I: IntoIterator<Item = Q>,
    Q: Into<ProductQuery>,
{
    target.extend(queries.into_iter().map(Into::into));
}

/// Builder for transforms; finished by [`TransformBuilder::output_products`]
/// or [`TransformBuilder::output_each`].
pub struct TransformBuilder<'m, F, Args, R> {
    module: &'m mut Module,
    index: usize,
    algorithm: Option<F>,
    _marker: PhantomData<fn() -> (Args, R)>,
}

impl<F, Args, R> TransformBuilder<'_, F, Args, R>
where
    F: TransformFn<Args, R>,
    Args: 'static,
    R: 'static,
{
    /// Declare the input families, one per callable argument.
    #[must_use]
    pub fn input_family<I, Q>(self, queries: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<ProductQuery>,
    {
        extend_queries(&mut self.module.pending[self.index].inputs, queries);
        self
    }

    /// Gate this node on boolean products.
    #[must_use]
    pub fn when<I, Q>(self, predicates: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<ProductQuery>,
    {
        extend_queries(&mut self.module.pending[self.index].predicates, predicates);
        self
    }

    /// Declare a single output product and finish the registration.
    pub fn output_products(mut self, label: &str)
    where
        R: Send + Sync,
    {
        let Some(algorithm) = self.algorithm.take() else {
            return;
        };
        let label_owned = label.to_string();
        let invoke: TransformInvoker = Arc::new(move |stores, inputs| {
            let value = algorithm.extract_and_call(stores, inputs)?;
            let mut out = Products::new();
            out.add(label_owned.clone(), value)?;
            Ok(out)
        });
        let pending = &mut self.module.pending[self.index];
        pending.outputs.push(OutputSpec {
            spec: ProductSpecification::create(label),
            type_tag: std::any::type_name::<R>().to_string(),
        });
        pending.behavior = Some(NodeBehavior::Transform { invoke });
    }

    /// Declare one output product per tuple element and finish the
    /// registration. The callable must return a tuple of matching arity.
    pub fn output_each<const N: usize>(mut self, labels: [&str; N])
    where
        R: SplitProducts,
    {
        let Some(algorithm) = self.algorithm.take() else {
            return;
        };
        let labels: Vec<String> = labels.iter().map(|l| (*l).to_string()).collect();
        let pending_index = self.index;
        if labels.len() != R::arity() {
            self.module.pending[pending_index].defect = Some(format!(
                "callable returns {} products but {} output labels were declared",
                R::arity(),
                labels.len()
            ));
            return;
        }
        let tags = R::type_tags();
        let labels_for_invoke = labels.clone();
        let invoke: TransformInvoker = Arc::new(move |stores, inputs| {
            let value = algorithm.extract_and_call(stores, inputs)?;
            let mut out = Products::new();
            value.split_into(&labels_for_invoke, &mut out)?;
            Ok(out)
        });
        let pending = &mut self.module.pending[pending_index];
        for (label, tag) in labels.iter().zip(tags) {
            pending.outputs.push(OutputSpec {
                spec: ProductSpecification::create(label.clone()),
                type_tag: tag.to_string(),
            });
        }
        pending.behavior = Some(NodeBehavior::Transform { invoke });
    }
}

/// Builder for observers and outputs (no output declarations).
pub struct ObserverBuilder<'m> {
    module: &'m mut Module,
    index: usize,
}

impl ObserverBuilder<'_> {
    /// Declare the input families.
    #[must_use]
    pub fn input_family<I, Q>(self, queries: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<ProductQuery>,
    {
        extend_queries(&mut self.module.pending[self.index].inputs, queries);
        self
    }

    /// Gate this node on boolean products.
    #[must_use]
    pub fn when<I, Q>(self, predicates: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<ProductQuery>,
    {
        extend_queries(&mut self.module.pending[self.index].predicates, predicates);
        self
    }
}

/// Builder for reductions; finished by [`ReduceBuilder::output_products`]
/// (identity finalizer) or [`ReduceBuilder::finalized_with`] followed by
/// [`ReduceFinalBuilder::output_products`].
pub struct ReduceBuilder<'m, F, Acc, Args> {
    module: &'m mut Module,
    index: usize,
    fold: Option<F>,
    seed: Option<Acc>,
    _marker: PhantomData<fn() -> Args>,
}

impl<'m, F, Acc, Args> ReduceBuilder<'m, F, Acc, Args>
where
    F: FoldFn<Acc, Args>,
    Acc: Clone + Send + Sync + 'static,
    Args: 'static,
{
    /// Declare the input families, one per fold argument.
    #[must_use]
    pub fn input_family<I, Q>(self, queries: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<ProductQuery>,
    {
        extend_queries(&mut self.module.pending[self.index].inputs, queries);
        self
    }

    /// Gate this node on boolean products.
    #[must_use]
    pub fn when<I, Q>(self, predicates: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<ProductQuery>,
    {
        extend_queries(&mut self.module.pending[self.index].predicates, predicates);
        self
    }

    /// Declare the aggregation level by its level name.
    #[must_use]
    pub fn over(self, level_name: &str) -> Self {
        self.module.pending[self.index].level = Some(level_name.to_string());
        self
    }

    /// Declare the accumulator seed, cloned once per aggregation ancestor.
    #[must_use]
    pub fn initialized_with(mut self, seed: Acc) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Declare the output product with an identity finalizer and finish.
    pub fn output_products(mut self, label: &str) {
        let fold = self.fold.take();
        let seed = self.seed.take();
        finish_reduction(self.module, self.index, fold, seed, label, |acc: Acc| acc);
    }

    /// Declare an explicit finalizer mapping the accumulator to the output.
    #[must_use]
    pub fn finalized_with<G, R>(mut self, finalize: G) -> ReduceFinalBuilder<'m, F, Acc, Args, G, R>
    where
        G: Fn(Acc) -> R + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        ReduceFinalBuilder {
            module: self.module,
            index: self.index,
            fold: self.fold.take(),
            seed: self.seed.take(),
            finalize: Some(finalize),
            _marker: PhantomData,
        }
    }
}

/// Final stage of a reduction registration with an explicit finalizer.
pub struct ReduceFinalBuilder<'m, F, Acc, Args, G, R> {
    module: &'m mut Module,
    index: usize,
    fold: Option<F>,
    seed: Option<Acc>,
    finalize: Option<G>,
    _marker: PhantomData<fn() -> (Args, R)>,
}

impl<F, Acc, Args, G, R> ReduceFinalBuilder<'_, F, Acc, Args, G, R>
where
    F: FoldFn<Acc, Args>,
    Acc: Clone + Send + Sync + 'static,
    Args: 'static,
    G: Fn(Acc) -> R + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Declare the output product and finish the registration.
    pub fn output_products(mut self, label: &str) {
        let fold = self.fold.take();
        let seed = self.seed.take();
        let Some(finalize) = self.finalize.take() else {
            return;
        };
        finish_reduction(self.module, self.index, fold, seed, label, finalize);
    }
}

fn finish_reduction<F, Acc, Args, G, R>(
    module: &mut Module,
    index: usize,
    fold: Option<F>,
    seed: Option<Acc>,
    label: &str,
    finalize: G,
) where
    F: FoldFn<Acc, Args>,
    Acc: Clone + Send + Sync + 'static,
    Args: 'static,
    G: Fn(Acc) -> R + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    let pending = &mut module.pending[index];
    let Some(fold) = fold else {
        return;
    };
    let Some(seed) = seed else {
        pending.defect = Some("accumulator seed (.initialized_with)".to_string());
        return;
    };

    let init: ReductionInit = Arc::new(move || Box::new(seed.clone()) as Accumulator);
    let fold_erased: ReductionFold = Arc::new(move |acc, stores, inputs| {
        let acc = acc
            .downcast_mut::<Acc>()
            .ok_or_else(|| CascadeError::InternalInvariant {
                cause: "reduction accumulator type drift".to_string(),
            })?;
        fold.extract_and_fold(acc, stores, inputs)
    });
    let label_owned = label.to_string();
    let finalize_erased: ReductionFinalize = Arc::new(move |acc| {
        let acc = acc
            .downcast::<Acc>()
            .map_err(|_| CascadeError::InternalInvariant {
                cause: "reduction accumulator type drift".to_string(),
            })?;
        let mut out = Products::new();
        out.add(label_owned.clone(), finalize(*acc))?;
        Ok(out)
    });

    pending.outputs.push(OutputSpec {
        spec: ProductSpecification::create(label),
        type_tag: std::any::type_name::<R>().to_string(),
    });
    pending.behavior = Some(NodeBehavior::Reduction {
        init,
        fold: fold_erased,
        finalize: finalize_erased,
    });
}

/// Builder for splitters; finished by [`SplitBuilder::output_products`].
pub struct SplitBuilder<'m, F, Args, T> {
    module: &'m mut Module,
    index: usize,
    algorithm: Option<F>,
    _marker: PhantomData<fn() -> (Args, T)>,
}

impl<F, Args, T> SplitBuilder<'_, F, Args, T>
where
    F: SplitFn<Args, T>,
    Args: 'static,
    T: Send + Sync + 'static,
{
    /// Declare the input families, one per callable argument.
    #[must_use]
    pub fn input_family<I, Q>(self, queries: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<ProductQuery>,
    {
        extend_queries(&mut self.module.pending[self.index].inputs, queries);
        self
    }

    /// Gate this node on boolean products.
    #[must_use]
    pub fn when<I, Q>(self, predicates: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<ProductQuery>,
    {
        extend_queries(&mut self.module.pending[self.index].predicates, predicates);
        self
    }

    /// Declare the name of the injected child level.
    #[must_use]
    pub fn into_level(self, level_name: &str) -> Self {
        self.module.pending[self.index].level = Some(level_name.to_string());
        self
    }

    /// Declare the product each child record carries and finish.
    pub fn output_products(mut self, label: &str) {
        let Some(algorithm) = self.algorithm.take() else {
            return;
        };
        let label_owned = label.to_string();
        let invoke: SplitInvoker = Arc::new(move |stores, inputs| {
            let children = algorithm.extract_and_split(stores, inputs)?;
            children
                .into_iter()
                .map(|value| {
                    let mut bag = Products::new();
                    bag.add(label_owned.clone(), value)?;
                    Ok(bag)
                })
                .collect()
        });
        let pending = &mut self.module.pending[self.index];
        pending.outputs.push(OutputSpec {
            spec: ProductSpecification::create(label),
            type_tag: std::any::type_name::<T>().to_string(),
        });
        pending.behavior = Some(NodeBehavior::Splitter { invoke });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declare::NodeKind;

    #[test]
    fn transform_declaration_round_trip() {
        let mut m = Module::new("demo");
        m.transform("plus_one", |a: i32| a + 1, Concurrency::Unlimited)
            .input_family(["a"])
            .output_products("b");

        let decls = m.into_declarations().unwrap();
        assert_eq!(decls.len(), 1);
        let decl = &decls[0];
        assert_eq!(decl.kind(), NodeKind::Transform);
        assert_eq!(format!("{}", decl.name()), "demo:plus_one");
        assert_eq!(decl.inputs().len(), 1);
        assert_eq!(decl.outputs()[0].spec.label(), "b");
        assert_eq!(decl.outputs()[0].type_tag, "i32");
    }

    #[test]
    fn tuple_outputs_declare_each_label() {
        let mut m = Module::new("demo");
        m.transform(
            "fan",
            |a: i32| (a + 1, f64::from(a)),
            Concurrency::Unlimited,
        )
        .input_family(["a"])
        .output_each(["b", "c"]);

        let decls = m.into_declarations().unwrap();
        let outputs = decls[0].outputs();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].spec.label(), "b");
        assert_eq!(outputs[0].type_tag, "i32");
        assert_eq!(outputs[1].spec.label(), "c");
        assert_eq!(outputs[1].type_tag, "f64");
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut m = Module::new("demo");
        m.observe("check", |_a: i32| {}, Concurrency::Serial)
            .input_family(["a"]);
        m.observe("check", |_a: i32| {}, Concurrency::Serial)
            .input_family(["a"]);

        let err = m.into_declarations().unwrap_err();
        assert_eq!(err.code(), "E101");
    }

    #[test]
    fn unfinished_transform_is_incomplete() {
        let mut m = Module::new("demo");
        let _ = m
            .transform("halfway", |a: i32| a, Concurrency::Serial)
            .input_family(["a"]);

        let err = m.into_declarations().unwrap_err();
        assert_eq!(err.code(), "E106");
    }

    #[test]
    fn input_arity_must_match_callable() {
        let mut m = Module::new("demo");
        m.transform("add", |i: i32, j: i32| i + j, Concurrency::Serial)
            .input_family(["i"])
            .output_products("sum");

        let err = m.into_declarations().unwrap_err();
        assert!(matches!(err, CascadeError::IncompleteDeclaration { .. }));
    }

    #[test]
    fn reduction_requires_level_and_seed() {
        let mut m = Module::new("demo");
        m.reduce("sum_n", |acc: &mut i64, n: i32| *acc += i64::from(n), Concurrency::Serial)
            .input_family(["n"])
            .initialized_with(0_i64)
            .output_products("total");
        let err = m.into_declarations().unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("aggregation level"));

        let mut m = Module::new("demo");
        m.reduce("sum_n", |acc: &mut i64, n: i32| *acc += i64::from(n), Concurrency::Serial)
            .input_family(["n"])
            .over("run")
            .output_products("total");
        let err = m.into_declarations().unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("initialized_with"));
    }

    #[test]
    fn reduction_with_finalizer_declares_output_type() {
        let mut m = Module::new("demo");
        m.reduce("count", |acc: &mut u32, _n: i32| *acc += 1, Concurrency::Serial)
            .input_family(["n"])
            .over("run")
            .initialized_with(0_u32)
            .finalized_with(|acc: u32| f64::from(acc))
            .output_products("rate");

        let decls = m.into_declarations().unwrap();
        assert_eq!(decls[0].kind(), NodeKind::Reduction);
        assert_eq!(decls[0].outputs()[0].type_tag, "f64");
        assert_eq!(decls[0].level.as_deref(), Some("run"));
    }

    #[test]
    fn splitter_requires_child_level() {
        let mut m = Module::new("demo");
        m.split("burst", |n: u32| (0..n).collect::<Vec<u32>>(), Concurrency::Serial)
            .input_family(["n"])
            .output_products("piece");

        let err = m.into_declarations().unwrap_err();
        assert!(format!("{}", err).contains("into_level"));
    }

    #[test]
    fn output_requires_inputs() {
        let mut m = Module::new("demo");
        let _ = m.output("writer", Concurrency::Serial);
        let err = m.into_declarations().unwrap_err();
        assert_eq!(err.code(), "E106");
    }

    #[test]
    fn predicates_are_recorded() {
        let mut m = Module::new("demo");
        m.observe("audit", |_a: i32| {}, Concurrency::Serial)
            .input_family(["a"])
            .when(["accepted"]);

        let decls = m.into_declarations().unwrap();
        assert_eq!(decls[0].predicates().len(), 1);
        assert_eq!(decls[0].predicates()[0].label(), "accepted");
    }
}
