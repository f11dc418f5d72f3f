//! Arity-specialized adapters between user callables and the engine.
//!
//! A user algorithm is an ordinary function whose arguments correspond 1:1 to
//! its declared input queries. The adapters below are the only generic piece
//! of the engine: they extract each argument by label from the joined input
//! stores (walking the record's ancestor chain), call the function, and hand
//! the result back for type erasure. Arguments are delivered by value, so
//! argument types must be `Clone`.

use crate::error::Result;
use crate::product::Products;
use crate::spec::ProductQuery;
use crate::store::StorePtr;

/// A pure algorithm producing a value from its extracted arguments.
///
/// Implemented for `Fn(A1, ..) -> R` up to arity 4. Observers use the same
/// adapter with `R = ()`.
pub trait TransformFn<Args, R>: Send + Sync + 'static {
    /// Number of arguments the callable takes.
    fn arity(&self) -> usize;

    /// Extract one argument per input query from the joined stores and call.
    ///
    /// `stores[i]` is the store delivered on the port feeding input `i`.
    fn extract_and_call(&self, stores: &[StorePtr], inputs: &[ProductQuery]) -> Result<R>;
}

/// A fold step of a reduction: mutates the accumulator from extracted
/// arguments. Implemented for `Fn(&mut Acc, A1, ..)` up to arity 4.
pub trait FoldFn<Acc, Args>: Send + Sync + 'static {
    /// Number of product arguments (the accumulator excluded).
    fn arity(&self) -> usize;

    /// Extract the arguments and fold them into the accumulator.
    fn extract_and_fold(
        &self,
        acc: &mut Acc,
        stores: &[StorePtr],
        inputs: &[ProductQuery],
    ) -> Result<()>;
}

/// A splitter body: maps extracted arguments to the contents of the child
/// records it injects. Implemented for `Fn(A1, ..) -> Vec<T>` up to arity 4.
pub trait SplitFn<Args, T>: Send + Sync + 'static {
    /// Number of arguments the callable takes.
    fn arity(&self) -> usize;

    /// Extract the arguments and produce one value per child record.
    fn extract_and_split(&self, stores: &[StorePtr], inputs: &[ProductQuery]) -> Result<Vec<T>>;
}

/// Splitting a tuple return value into individually labelled products.
///
/// Implemented for tuples of arity 2..=4; single-output transforms go through
/// [`crate::module::TransformBuilder::output_products`] instead and need no
/// splitting.
pub trait SplitProducts: Send + Sync + 'static {
    /// Number of products the value splits into.
    fn arity() -> usize;

    /// Type tags of the split products, in order.
    fn type_tags() -> Vec<&'static str>;

    /// Move the elements into `out` under the given labels.
    fn split_into(self, labels: &[String], out: &mut Products) -> Result<()>;
}

macro_rules! impl_transform_fn {
    ($count:expr => $($idx:tt $arg:ident),+) => {
        impl<Func, $($arg,)+ R> TransformFn<($($arg,)+), R> for Func
        where
            Func: Fn($($arg),+) -> R + Send + Sync + 'static,
            $($arg: Clone + Send + Sync + 'static,)+
        {
            fn arity(&self) -> usize {
                $count
            }

            fn extract_and_call(
                &self,
                stores: &[StorePtr],
                inputs: &[ProductQuery],
            ) -> Result<R> {
                Ok((self)($(stores[$idx].product::<$arg>(inputs[$idx].label())?),+))
            }
        }
    };
}

impl_transform_fn!(1 => 0 A1);
impl_transform_fn!(2 => 0 A1, 1 A2);
impl_transform_fn!(3 => 0 A1, 1 A2, 2 A3);
impl_transform_fn!(4 => 0 A1, 1 A2, 2 A3, 3 A4);

macro_rules! impl_fold_fn {
    ($count:expr => $($idx:tt $arg:ident),+) => {
        impl<Func, Acc, $($arg,)+> FoldFn<Acc, ($($arg,)+)> for Func
        where
            Func: Fn(&mut Acc, $($arg),+) + Send + Sync + 'static,
            Acc: 'static,
            $($arg: Clone + Send + Sync + 'static,)+
        {
            fn arity(&self) -> usize {
                $count
            }

            fn extract_and_fold(
                &self,
                acc: &mut Acc,
                stores: &[StorePtr],
                inputs: &[ProductQuery],
            ) -> Result<()> {
                (self)(acc, $(stores[$idx].product::<$arg>(inputs[$idx].label())?),+);
                Ok(())
            }
        }
    };
}

impl_fold_fn!(1 => 0 A1);
impl_fold_fn!(2 => 0 A1, 1 A2);
impl_fold_fn!(3 => 0 A1, 1 A2, 2 A3);
impl_fold_fn!(4 => 0 A1, 1 A2, 2 A3, 3 A4);

macro_rules! impl_split_fn {
    ($count:expr => $($idx:tt $arg:ident),+) => {
        impl<Func, $($arg,)+ T> SplitFn<($($arg,)+), T> for Func
        where
            Func: Fn($($arg),+) -> Vec<T> + Send + Sync + 'static,
            T: Send + Sync + 'static,
            $($arg: Clone + Send + Sync + 'static,)+
        {
            fn arity(&self) -> usize {
                $count
            }

            fn extract_and_split(
                &self,
                stores: &[StorePtr],
                inputs: &[ProductQuery],
            ) -> Result<Vec<T>> {
                Ok((self)($(stores[$idx].product::<$arg>(inputs[$idx].label())?),+))
            }
        }
    };
}

impl_split_fn!(1 => 0 A1);
impl_split_fn!(2 => 0 A1, 1 A2);
impl_split_fn!(3 => 0 A1, 1 A2, 2 A3);
impl_split_fn!(4 => 0 A1, 1 A2, 2 A3, 3 A4);

macro_rules! impl_split_products {
    ($count:expr => $($idx:tt $elem:ident),+) => {
        impl<$($elem,)+> SplitProducts for ($($elem,)+)
        where
            $($elem: Send + Sync + 'static,)+
        {
            fn arity() -> usize {
                $count
            }

            fn type_tags() -> Vec<&'static str> {
                vec![$(std::any::type_name::<$elem>()),+]
            }

            fn split_into(self, labels: &[String], out: &mut Products) -> Result<()> {
                $(out.add(labels[$idx].clone(), self.$idx)?;)+
                Ok(())
            }
        }
    };
}

impl_split_products!(2 => 0 T1, 1 T2);
impl_split_products!(3 => 0 T1, 1 T2, 2 T3);
impl_split_products!(4 => 0 T1, 1 T2, 2 T3, 3 T4);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::Products;
    use crate::store::ProductStore;

    fn store_with(products: &[(&str, i32)]) -> StorePtr {
        let mut bag = Products::new();
        for (name, value) in products {
            bag.add(*name, *value).unwrap();
        }
        ProductStore::base()
            .make_child(0, "cell", "test", bag)
            .unwrap()
    }

    #[test]
    fn unary_extraction() {
        let f = |a: i32| a + 1;
        let store = store_with(&[("a", 41)]);
        let inputs = vec![ProductQuery::new("a")];
        let result = f.extract_and_call(&[store], &inputs).unwrap();
        assert_eq!(result, 42);
        assert_eq!(<_ as TransformFn<(i32,), i32>>::arity(&f), 1);
    }

    #[test]
    fn binary_extraction_uses_per_port_stores() {
        let f = |i: i32, j: i32| i + j;
        let left = store_with(&[("i", 1)]);
        let right = store_with(&[("j", 2)]);
        let inputs = vec![ProductQuery::new("i"), ProductQuery::new("j")];
        let sum = f.extract_and_call(&[left, right], &inputs).unwrap();
        assert_eq!(sum, 3);
    }

    #[test]
    fn extraction_type_mismatch_propagates() {
        let f = |a: i64| a;
        let store = store_with(&[("a", 1)]);
        let inputs = vec![ProductQuery::new("a")];
        let err = f.extract_and_call(&[store], &inputs).unwrap_err();
        assert_eq!(err.code(), "E201");
    }

    #[test]
    fn fold_mutates_accumulator() {
        let f = |acc: &mut i64, n: i32| *acc += i64::from(n);
        let store = store_with(&[("n", 5)]);
        let inputs = vec![ProductQuery::new("n")];
        let mut acc = 10_i64;
        f.extract_and_fold(&mut acc, &[store], &inputs).unwrap();
        assert_eq!(acc, 15);
    }

    #[test]
    fn tuple_outputs_split_with_tags() {
        let labels = vec!["b".to_string(), "c".to_string()];
        let mut out = Products::new();
        (1_i32, 2.0_f64).split_into(&labels, &mut out).unwrap();
        assert_eq!(*out.get::<i32>("b").unwrap(), 1);
        assert_eq!(*out.get::<f64>("c").unwrap(), 2.0);
        assert_eq!(<(i32, f64)>::type_tags(), vec!["i32", "f64"]);
    }
}
