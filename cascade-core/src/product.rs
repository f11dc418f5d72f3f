//! Typed, name-keyed data products.
//!
//! A product is an opaque value paired with its runtime type tag. The engine
//! erases product types in the message channels and re-types them at
//! extraction, so a container can hold heterogeneous values while typed reads
//! stay checked.

use crate::error::{CascadeError, Result};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A single data product: an opaque payload plus its declared type tag.
#[derive(Clone)]
pub struct Product {
    tag: String,
    value: Arc<dyn Any + Send + Sync>,
}

impl Product {
    /// Wrap a value, recording its type tag.
    #[must_use]
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            tag: std::any::type_name::<T>().to_string(),
            value: Arc::new(value),
        }
    }

    /// The recorded type tag.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.tag
    }

    /// Attempt a typed view of the payload.
    #[must_use]
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Product").field("type", &self.tag).finish()
    }
}

/// A name-keyed bag of products. Names are unique within one container.
#[derive(Debug, Clone, Default)]
pub struct Products {
    entries: BTreeMap<String, Product>,
}

impl Products {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pre-wrapped product.
    ///
    /// # Errors
    /// Returns [`CascadeError::DuplicateProduct`] if `name` is already present.
    pub fn insert(&mut self, name: impl Into<String>, product: Product) -> Result<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(CascadeError::DuplicateProduct { product: name });
        }
        self.entries.insert(name, product);
        Ok(())
    }

    /// Wrap and insert a value.
    ///
    /// # Errors
    /// Returns [`CascadeError::DuplicateProduct`] if `name` is already present.
    pub fn add<T: Send + Sync + 'static>(
        &mut self,
        name: impl Into<String>,
        value: T,
    ) -> Result<()> {
        self.insert(name, Product::new(value))
    }

    /// Check whether `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Untyped lookup.
    #[must_use]
    pub fn raw(&self, name: &str) -> Option<&Product> {
        self.entries.get(name)
    }

    /// Typed lookup.
    ///
    /// # Errors
    /// Returns [`CascadeError::TypeMismatch`] if the stored type differs from
    /// `T`, and [`CascadeError::InternalInvariant`] if `name` is absent (absent
    /// products are a wiring-phase concern; they cannot occur in a resolved
    /// graph).
    pub fn get<T: 'static>(&self, name: &str) -> Result<&T> {
        let product = self
            .entries
            .get(name)
            .ok_or_else(|| CascadeError::InternalInvariant {
                cause: format!("product '{name}' not present in container"),
            })?;
        product
            .downcast::<T>()
            .ok_or_else(|| CascadeError::TypeMismatch {
                product: name.to_string(),
                requested: std::any::type_name::<T>().to_string(),
                available: product.type_tag().to_string(),
            })
    }

    /// Number of products in the container.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the container is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, product)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Product)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trip() {
        let mut bag = Products::new();
        bag.add("a", 42_i32).unwrap();
        bag.add("label", "cell".to_string()).unwrap();

        assert_eq!(*bag.get::<i32>("a").unwrap(), 42);
        assert_eq!(bag.get::<String>("label").unwrap(), "cell");
        assert!(bag.contains("a"));
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn type_mismatch_names_both_types() {
        let mut bag = Products::new();
        bag.add("a", 42_i32).unwrap();

        let err = bag.get::<i64>("a").unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("'a'"));
        assert!(msg.contains("i64"));
        assert!(msg.contains("i32"));
        assert_eq!(err.code(), "E201");
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut bag = Products::new();
        bag.add("a", 1_i32).unwrap();
        let err = bag.add("a", 2_i32).unwrap_err();
        assert_eq!(err.code(), "E202");
    }

    #[test]
    fn missing_product_is_an_invariant_error() {
        let bag = Products::new();
        assert_eq!(bag.get::<i32>("ghost").unwrap_err().code(), "E303");
    }

    #[test]
    fn product_tag_matches_value_type() {
        let product = Product::new(1.5_f64);
        assert_eq!(product.type_tag(), "f64");
        assert_eq!(*product.downcast::<f64>().unwrap(), 1.5);
        assert!(product.downcast::<f32>().is_none());
    }
}
