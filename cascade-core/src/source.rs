//! Record sources.
//!
//! A source emits the root stream of records: at each pull it produces either
//! a new child store (descent) or a continuation at the current level. Flush
//! markers are not emitted by sources; the executor's driver derives them
//! from the identity sequence and inserts them when a subtree closes.

use crate::declare::OutputSpec;
use crate::error::Result;
use crate::persistence::Persistence;
use crate::product::Products;
use crate::spec::ProductSpecification;
use crate::store::{ProductStore, StorePtr};
use crate::types::LevelId;
use std::collections::VecDeque;
use std::sync::Arc;

/// A producer of the root record stream.
pub trait RecordSource: Send {
    /// The source name, used as the producer label and in diagnostics.
    fn name(&self) -> &str;

    /// The specifications this source provides, with their type tags.
    fn provides(&self) -> Vec<OutputSpec>;

    /// Produce the next record, or `None` when the stream is exhausted.
    ///
    /// # Errors
    /// An error here is surfaced by the executor as
    /// [`crate::error::CascadeError::SourceExhaustedPrematurely`].
    fn next(&mut self) -> Result<Option<StorePtr>>;
}

/// A source that replays records previously committed by an output node.
///
/// The replay is driven by an explicit list of encoded record identities (a
/// catalog); each identity is parsed back into a level path and re-minted as
/// a store carrying the products read from the back-end.
pub struct ReplaySource {
    name: String,
    creator: String,
    backend: Arc<dyn Persistence>,
    labels: Vec<(String, String)>,
    ids: VecDeque<String>,
    open: Vec<StorePtr>,
}

impl ReplaySource {
    /// Create a replay source reading `creator`'s committed records.
    ///
    /// `labels` lists the `(label, type_tag)` pairs to read per record; `ids`
    /// is the catalog of encoded record identities, in replay order.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        creator: impl Into<String>,
        backend: Arc<dyn Persistence>,
        labels: Vec<(String, String)>,
        ids: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            creator: creator.into(),
            backend,
            labels,
            ids: ids.into(),
            open: vec![ProductStore::base()],
        }
    }

    /// Re-mint the ancestor chain for `id`, reusing open ancestors.
    fn chain_to(&mut self, id: &Arc<LevelId>) -> Result<StorePtr> {
        let mut path = Vec::with_capacity(id.depth());
        let mut cur = Some(id);
        while let Some(level) = cur {
            path.push(Arc::clone(level));
            cur = level.parent();
        }
        path.reverse();

        let last = path.len() - 1;
        let mut keep = 1;
        while keep < self.open.len() && keep < last && *self.open[keep].id() == path[keep] {
            keep += 1;
        }
        self.open.truncate(keep);

        // Open intermediate ancestors without products; the record itself is
        // minted by the caller.
        if keep < last {
            for level in &path[keep..last] {
                let parent = Arc::clone(&self.open[self.open.len() - 1]);
                let child = parent.make_child(
                    level.number(),
                    level.level_name(),
                    &self.name,
                    Products::new(),
                )?;
                self.open.push(child);
            }
        }
        Ok(Arc::clone(&self.open[self.open.len() - 1]))
    }
}

impl RecordSource for ReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> Vec<OutputSpec> {
        self.labels
            .iter()
            .map(|(label, tag)| OutputSpec {
                spec: ProductSpecification::create(label.clone()),
                type_tag: tag.clone(),
            })
            .collect()
    }

    fn next(&mut self) -> Result<Option<StorePtr>> {
        let Some(encoded) = self.ids.pop_front() else {
            return Ok(None);
        };
        let id = LevelId::parse(&encoded)?;
        if id.depth() == 0 {
            return Err(crate::error::CascadeError::Configuration {
                cause: format!("replay catalog entry '{encoded}' is the root identity"),
            });
        }

        let mut products = Products::new();
        for (label, _tag) in &self.labels {
            let product = self.backend.read(&self.creator, label, &encoded)?;
            products.insert(label.clone(), product)?;
        }

        let parent = self.chain_to(&id)?;
        let store = parent.make_child(id.number(), id.level_name(), &self.name, products)?;
        self.open.push(Arc::clone(&store));
        Ok(Some(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::product::Product;

    #[test]
    fn replay_reconstructs_hierarchy_and_products() {
        let backend = MemoryPersistence::new();
        for (id, value) in [("/run:0/event:0", 10_i32), ("/run:0/event:1", 11_i32)] {
            backend
                .register_write("writer", "n", &Product::new(value))
                .unwrap();
            backend.commit_output("writer", id).unwrap();
        }

        let mut source = ReplaySource::new(
            "replay",
            "writer",
            backend,
            vec![("n".to_string(), "i32".to_string())],
            vec!["/run:0/event:0".to_string(), "/run:0/event:1".to_string()],
        );

        let first = source.next().unwrap().unwrap();
        assert_eq!(first.id().encode(), "/run:0/event:0");
        assert_eq!(first.product::<i32>("n").unwrap(), 10);
        assert_eq!(first.parent().unwrap().id().encode(), "/run:0");

        let second = source.next().unwrap().unwrap();
        assert_eq!(second.id().encode(), "/run:0/event:1");
        assert_eq!(second.product::<i32>("n").unwrap(), 11);

        assert!(source.next().unwrap().is_none());
    }

    #[test]
    fn replay_surfaces_missing_records_as_errors() {
        let backend = MemoryPersistence::new();
        let mut source = ReplaySource::new(
            "replay",
            "writer",
            backend,
            vec![("n".to_string(), "i32".to_string())],
            vec!["/run:0/event:0".to_string()],
        );
        assert!(source.next().is_err());
    }

    #[test]
    fn replay_declares_its_specifications() {
        let backend = MemoryPersistence::new();
        let source = ReplaySource::new(
            "replay",
            "writer",
            backend,
            vec![("n".to_string(), "i32".to_string())],
            vec![],
        );
        let provides = source.provides();
        assert_eq!(provides.len(), 1);
        assert_eq!(provides[0].spec.label(), "n");
        assert_eq!(provides[0].type_tag, "i32");
    }
}
