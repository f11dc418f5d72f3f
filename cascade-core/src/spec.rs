//! Product specifications and consumer queries.
//!
//! A producer declares the exact specification of every stream it emits: a
//! product label qualified by a layer name. A consumer declares a query per
//! input; the builder matches each query to exactly one producer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The default layer products are published under.
pub const DEFAULT_LAYER: &str = "job";

/// A `(label, layer)` pair uniquely identifying a produced stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductSpecification {
    label: String,
    layer: String,
}

impl ProductSpecification {
    /// Create a specification in the default layer.
    #[must_use]
    pub fn create(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            layer: DEFAULT_LAYER.to_string(),
        }
    }

    /// Create a specification in an explicit layer.
    #[must_use]
    pub fn in_layer(label: impl Into<String>, layer: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            layer: layer.into(),
        }
    }

    /// The product label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The layer name.
    #[must_use]
    pub fn layer(&self) -> &str {
        &self.layer
    }
}

impl fmt::Display for ProductSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.label, self.layer)
    }
}

/// A consumer-side product query.
///
/// A query names a product label and optionally pins the layer. A query with a
/// pinned layer matches a specification by full equality; a query without one
/// matches any layer, which is how ambiguity between same-labelled streams in
/// different layers can arise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductQuery {
    label: String,
    layer: Option<String>,
}

impl ProductQuery {
    /// Create a query matching `label` in any layer.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            layer: None,
        }
    }

    /// Create a query matching `label` in exactly `layer`.
    #[must_use]
    pub fn in_layer(label: impl Into<String>, layer: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            layer: Some(layer.into()),
        }
    }

    /// The queried product label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The pinned layer, if any.
    #[must_use]
    pub fn layer(&self) -> Option<&str> {
        self.layer.as_deref()
    }

    /// Check whether this query matches a producer's specification.
    #[must_use]
    pub fn matches(&self, spec: &ProductSpecification) -> bool {
        if self.label != spec.label {
            return false;
        }
        match &self.layer {
            Some(layer) => layer == spec.layer(),
            None => true,
        }
    }
}

impl fmt::Display for ProductQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.layer {
            Some(layer) => write!(f, "{}@{}", self.label, layer),
            None => write!(f, "{}", self.label),
        }
    }
}

impl From<&str> for ProductQuery {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_uses_default_layer() {
        let spec = ProductSpecification::create("hits");
        assert_eq!(spec.label(), "hits");
        assert_eq!(spec.layer(), DEFAULT_LAYER);
        assert_eq!(format!("{}", spec), "hits@job");
    }

    #[test]
    fn pinned_query_matches_by_equality() {
        let spec = ProductSpecification::in_layer("hits", "calib");
        assert!(ProductQuery::in_layer("hits", "calib").matches(&spec));
        assert!(!ProductQuery::in_layer("hits", "job").matches(&spec));
        assert!(!ProductQuery::in_layer("tracks", "calib").matches(&spec));
    }

    #[test]
    fn unpinned_query_matches_any_layer() {
        let query = ProductQuery::new("hits");
        assert!(query.matches(&ProductSpecification::create("hits")));
        assert!(query.matches(&ProductSpecification::in_layer("hits", "calib")));
        assert!(!query.matches(&ProductSpecification::create("tracks")));
    }

    #[test]
    fn specifications_serialize_for_diagnostics() {
        let spec = ProductSpecification::in_layer("hits", "calib");
        let json = serde_json::to_string(&spec).unwrap();
        let back: ProductSpecification = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
