//! Hierarchical product stores.
//!
//! A product store is one node of the record tree: it carries a level
//! identifier, a short label of the producer that minted it, a processing
//! stage, and a bag of products. Stores are immutable after publication and
//! share ownership of their ancestors, so children never mutate parents and
//! concurrent readers need no locks.

use crate::error::Result;
use crate::product::{Product, Products};
use crate::types::{LevelId, LevelIdPtr};
use std::sync::Arc;

/// Source label stamped on flush markers inserted by the engine.
pub const INSERTED: &str = "[inserted]";

/// Processing stage of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// A regular record carrying products.
    Process,
    /// A marker signalling closure of the subtree rooted at this level.
    Flush,
}

/// Shared handle to a product store.
pub type StorePtr = Arc<ProductStore>;

/// A node of the hierarchical record tree.
#[derive(Debug)]
pub struct ProductStore {
    parent: Option<StorePtr>,
    id: LevelIdPtr,
    source: String,
    stage: Stage,
    products: Products,
}

impl ProductStore {
    /// Create the root store of a new hierarchy.
    #[must_use]
    pub fn base() -> StorePtr {
        Arc::new(Self {
            parent: None,
            id: LevelId::base(),
            source: String::new(),
            stage: Stage::Process,
            products: Products::new(),
        })
    }

    /// Create a child store one level below this one.
    ///
    /// # Errors
    /// Returns an error if `level_name` is not a valid level name.
    pub fn make_child(
        self: &StorePtr,
        number: usize,
        level_name: &str,
        source: &str,
        products: Products,
    ) -> Result<StorePtr> {
        Ok(Arc::new(Self {
            parent: Some(Arc::clone(self)),
            id: self.id.make_child(number, level_name)?,
            source: source.to_string(),
            stage: Stage::Process,
            products,
        }))
    }

    /// Create a store at the same level and identity but with new content.
    ///
    /// Used when an algorithm emits output products for an inbound record: the
    /// continuation shares the record identity without mutating the original.
    #[must_use]
    pub fn make_continuation(self: &StorePtr, source: &str, products: Products) -> StorePtr {
        Arc::new(Self {
            parent: self.parent.clone(),
            id: Arc::clone(&self.id),
            source: source.to_string(),
            stage: Stage::Process,
            products,
        })
    }

    /// Create the flush marker for this store's subtree: same identity and
    /// parent, no products.
    #[must_use]
    pub fn make_flush(self: &StorePtr) -> StorePtr {
        Arc::new(Self {
            parent: self.parent.clone(),
            id: Arc::clone(&self.id),
            source: INSERTED.to_string(),
            stage: Stage::Flush,
            products: Products::new(),
        })
    }

    /// The parent store, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&StorePtr> {
        self.parent.as_ref()
    }

    /// Search the ancestors for the nearest store at level `level_name`.
    ///
    /// The search starts at the parent, so a store never resolves to itself.
    #[must_use]
    pub fn parent_at(&self, level_name: &str) -> Option<&StorePtr> {
        let mut cur = self.parent.as_ref();
        while let Some(store) = cur {
            if store.level_name() == level_name {
                return Some(store);
            }
            cur = store.parent.as_ref();
        }
        None
    }

    /// Walk self toward the root and return the nearest store containing
    /// `product_name`.
    #[must_use]
    pub fn store_for_product(self: &StorePtr, product_name: &str) -> Option<StorePtr> {
        let mut cur = self;
        loop {
            if cur.contains_product(product_name) {
                return Some(Arc::clone(cur));
            }
            cur = cur.parent.as_ref()?;
        }
    }

    /// Untyped product lookup along the ancestor chain.
    #[must_use]
    pub fn lookup(&self, product_name: &str) -> Option<&Product> {
        let mut cur = self;
        loop {
            if let Some(product) = cur.products.raw(product_name) {
                return Some(product);
            }
            cur = cur.parent.as_deref()?;
        }
    }

    /// Typed product extraction along the ancestor chain, delivered by value.
    ///
    /// # Errors
    /// Returns [`crate::error::CascadeError::TypeMismatch`] if the stored type
    /// differs from `T`, and an internal-invariant error if no store in the
    /// chain carries the product.
    pub fn product<T: Clone + 'static>(&self, product_name: &str) -> Result<T> {
        let mut cur = self;
        loop {
            if cur.products.contains(product_name) {
                return cur.products.get::<T>(product_name).cloned();
            }
            match cur.parent.as_deref() {
                Some(p) => cur = p,
                None => break,
            }
        }
        Err(crate::error::CascadeError::InternalInvariant {
            cause: format!(
                "product '{product_name}' not found in store {} or its ancestors",
                self.id.encode()
            ),
        })
    }

    /// Check whether this store itself carries `product_name`.
    #[must_use]
    pub fn contains_product(&self, product_name: &str) -> bool {
        self.products.contains(product_name)
    }

    /// Check whether this is a flush marker.
    #[must_use]
    pub fn is_flush(&self) -> bool {
        self.stage == Stage::Flush
    }

    /// The record identity.
    #[must_use]
    pub fn id(&self) -> &LevelIdPtr {
        &self.id
    }

    /// The level name of this store's identity.
    #[must_use]
    pub fn level_name(&self) -> &str {
        self.id.level_name()
    }

    /// Short label of the producer that minted this store.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The processing stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The products carried by this store alone (not its ancestors).
    #[must_use]
    pub fn products(&self) -> &Products {
        &self.products
    }
}

/// Return the deeper of two stores.
#[must_use]
pub fn more_derived(a: &StorePtr, b: &StorePtr) -> StorePtr {
    if a.id().depth() > b.id().depth() {
        Arc::clone(a)
    } else {
        Arc::clone(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products(name: &str, value: i32) -> Products {
        let mut bag = Products::new();
        bag.add(name, value).unwrap();
        bag
    }

    #[test]
    fn children_extend_the_identity() {
        let base = ProductStore::base();
        let run = base.make_child(0, "run", "gen", Products::new()).unwrap();
        let event = run.make_child(3, "event", "gen", products("n", 7)).unwrap();

        assert_eq!(event.id().encode(), "/run:0/event:3");
        assert_eq!(event.level_name(), "event");
        assert_eq!(event.source(), "gen");
        assert!(event.contains_product("n"));
    }

    #[test]
    fn continuation_keeps_identity_and_parent() {
        let base = ProductStore::base();
        let cell = base.make_child(5, "cell", "gen", products("a", 5)).unwrap();
        let cont = cell.make_continuation("plus_one", products("b", 6));

        assert_eq!(*cont.id(), *cell.id());
        assert!(cont.contains_product("b"));
        assert!(!cont.contains_product("a"));
        assert_eq!(cont.parent().unwrap().id().encode(), "/");
    }

    #[test]
    fn flush_markers_carry_no_products() {
        let base = ProductStore::base();
        let cell = base.make_child(0, "cell", "gen", products("a", 1)).unwrap();
        let flush = cell.make_flush();

        assert!(flush.is_flush());
        assert!(flush.products().is_empty());
        assert_eq!(*flush.id(), *cell.id());
        assert_eq!(flush.source(), INSERTED);
    }

    #[test]
    fn parent_search_by_level_name() {
        let base = ProductStore::base();
        let run = base.make_child(1, "run", "gen", Products::new()).unwrap();
        let event = run.make_child(0, "event", "gen", Products::new()).unwrap();

        assert_eq!(event.parent_at("run").unwrap().id().encode(), "/run:1");
        assert_eq!(event.parent_at("job").unwrap().id().encode(), "/");
        assert!(event.parent_at("cell").is_none());
        // The search starts at the parent, never at the store itself.
        assert!(run.parent_at("run").is_none());
    }

    #[test]
    fn product_extraction_walks_ancestors() {
        let base = ProductStore::base();
        let run = base.make_child(0, "run", "gen", products("beam", 400)).unwrap();
        let event = run.make_child(2, "event", "gen", products("n", 9)).unwrap();

        assert_eq!(event.product::<i32>("n").unwrap(), 9);
        assert_eq!(event.product::<i32>("beam").unwrap(), 400);
        assert!(event.product::<i32>("ghost").is_err());

        let holder = event.store_for_product("beam").unwrap();
        assert_eq!(holder.id().encode(), "/run:0");
    }

    #[test]
    fn more_derived_prefers_depth() {
        let base = ProductStore::base();
        let run = base.make_child(0, "run", "gen", Products::new()).unwrap();
        let event = run.make_child(0, "event", "gen", Products::new()).unwrap();

        assert_eq!(more_derived(&run, &event).id().encode(), "/run:0/event:0");
        assert_eq!(more_derived(&event, &run).id().encode(), "/run:0/event:0");
    }
}
