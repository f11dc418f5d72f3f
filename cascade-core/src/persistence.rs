//! The persistence interface.
//!
//! Persistence back-ends are opaque to the engine: they store products keyed
//! by record identity and product label. Output nodes write through this
//! interface; replay sources read previously committed records back.

use crate::error::{CascadeError, Result};
use crate::product::Product;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Back-end technology settings, applied once before execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TechSettings {
    /// The back-end identifier (e.g. "memory").
    pub backend: String,
    /// Free-form back-end options.
    pub options: BTreeMap<String, String>,
}

/// One product stream selected for output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputItem {
    /// The product label.
    pub label: String,
    /// The layer the product is published under.
    pub layer: String,
}

/// An opaque key/value persistence back-end.
///
/// `creator` is the name of the output node (or replay source) driving the
/// calls; `record_id` is the encoded record identity.
pub trait Persistence: Send + Sync {
    /// Apply back-end technology settings. Called once, before execution.
    fn configure_tech(&self, settings: &TechSettings) -> Result<()>;

    /// Declare which product streams will be written. Called once, before
    /// execution.
    fn configure_output_items(&self, items: &[OutputItem]) -> Result<()>;

    /// Create the containers for a creator's products (`label` -> type tag).
    /// Called once per output node.
    fn create_containers(&self, creator: &str, products: &BTreeMap<String, String>) -> Result<()>;

    /// Stage one product write for the current record.
    fn register_write(&self, creator: &str, label: &str, product: &Product) -> Result<()>;

    /// Commit all staged writes of `creator` under `record_id`.
    fn commit_output(&self, creator: &str, record_id: &str) -> Result<()>;

    /// Read a committed product back.
    fn read(&self, creator: &str, label: &str, record_id: &str) -> Result<Product>;
}

#[derive(Default)]
struct MemoryState {
    containers: BTreeMap<String, BTreeMap<String, String>>,
    staged: BTreeMap<String, Vec<(String, Product)>>,
    committed: BTreeMap<(String, String, String), Product>,
    commit_order: Vec<(String, String)>,
}

/// In-memory persistence back-end, used by tests and replay round trips.
#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    /// Create an empty back-end.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record identities committed by `creator`, in commit order.
    #[must_use]
    pub fn committed_records(&self, creator: &str) -> Vec<String> {
        self.state
            .lock()
            .commit_order
            .iter()
            .filter(|(c, _)| c == creator)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// The container layout created for `creator`, if any.
    #[must_use]
    pub fn containers(&self, creator: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().containers.get(creator).cloned()
    }
}

impl Persistence for MemoryPersistence {
    fn configure_tech(&self, _settings: &TechSettings) -> Result<()> {
        Ok(())
    }

    fn configure_output_items(&self, _items: &[OutputItem]) -> Result<()> {
        Ok(())
    }

    fn create_containers(&self, creator: &str, products: &BTreeMap<String, String>) -> Result<()> {
        self.state
            .lock()
            .containers
            .insert(creator.to_string(), products.clone());
        Ok(())
    }

    fn register_write(&self, creator: &str, label: &str, product: &Product) -> Result<()> {
        self.state
            .lock()
            .staged
            .entry(creator.to_string())
            .or_default()
            .push((label.to_string(), product.clone()));
        Ok(())
    }

    fn commit_output(&self, creator: &str, record_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let staged = state.staged.remove(creator).unwrap_or_default();
        for (label, product) in staged {
            state.committed.insert(
                (creator.to_string(), label, record_id.to_string()),
                product,
            );
        }
        state
            .commit_order
            .push((creator.to_string(), record_id.to_string()));
        Ok(())
    }

    fn read(&self, creator: &str, label: &str, record_id: &str) -> Result<Product> {
        self.state
            .lock()
            .committed
            .get(&(
                creator.to_string(),
                label.to_string(),
                record_id.to_string(),
            ))
            .cloned()
            .ok_or_else(|| CascadeError::Configuration {
                cause: format!("no committed record '{record_id}' for '{creator}'/'{label}'"),
            })
    }
}
