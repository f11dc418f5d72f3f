//! Hierarchical record identifiers and qualified algorithm names.

use crate::error::{CascadeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Shared handle to a level identifier.
pub type LevelIdPtr = Arc<LevelId>;

/// The level name of the implicit root of every record hierarchy.
pub const BASE_LEVEL: &str = "job";

/// Identifier of a record's position in the hierarchy.
///
/// A level ID is an ordered path of `(number, name)` components rooted at the
/// empty path. IDs are immutable after construction and share their ancestor
/// chain, so cloning a handle is cheap and concurrent readers are safe.
///
/// The wire encoding is `"/name0:n0/name1:n1/..."`; the root encodes as `"/"`.
/// Component names must not contain `'/'` or `':'`.
#[derive(Debug)]
pub struct LevelId {
    parent: Option<LevelIdPtr>,
    number: usize,
    name: String,
    depth: usize,
}

impl LevelId {
    /// The root identifier (empty path, depth 0).
    #[must_use]
    pub fn base() -> LevelIdPtr {
        Arc::new(Self {
            parent: None,
            number: 0,
            name: BASE_LEVEL.to_string(),
            depth: 0,
        })
    }

    /// Create the child identifier `(number, name)` below this one.
    ///
    /// # Errors
    /// Returns [`CascadeError::Configuration`] if `name` contains `'/'` or
    /// `':'`, which would make the identifier unencodable.
    pub fn make_child(self: &LevelIdPtr, number: usize, name: &str) -> Result<LevelIdPtr> {
        if name.is_empty() || name.contains('/') || name.contains(':') {
            return Err(CascadeError::Configuration {
                cause: format!("invalid level name '{name}': must be non-empty without '/' or ':'"),
            });
        }
        Ok(Arc::new(Self {
            parent: Some(Arc::clone(self)),
            number,
            name: name.to_string(),
            depth: self.depth + 1,
        }))
    }

    /// Number of components in the path.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Index of the last component. The root reports 0.
    #[must_use]
    pub fn number(&self) -> usize {
        self.number
    }

    /// Name of the last component. The root reports [`BASE_LEVEL`].
    #[must_use]
    pub fn level_name(&self) -> &str {
        &self.name
    }

    /// The parent identifier, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&LevelIdPtr> {
        self.parent.as_ref()
    }

    /// Walk up to the ancestor at `depth`. Returns `None` if `depth` exceeds
    /// this identifier's own depth.
    #[must_use]
    pub fn ancestor_at(&self, depth: usize) -> Option<&LevelId> {
        if depth > self.depth {
            return None;
        }
        let mut cur = self;
        while cur.depth > depth {
            cur = cur.parent.as_deref()?;
        }
        Some(cur)
    }

    /// Check whether this identifier is `other` or one of its ancestors.
    #[must_use]
    pub fn encloses(&self, other: &LevelId) -> bool {
        match other.ancestor_at(self.depth) {
            Some(anc) => anc == self,
            None => false,
        }
    }

    /// Check whether two identifiers lie on one root-to-leaf path.
    #[must_use]
    pub fn related(&self, other: &LevelId) -> bool {
        self.encloses(other) || other.encloses(self)
    }

    /// Encode as `"/name0:n0/name1:n1"`; the root encodes as `"/"`.
    #[must_use]
    pub fn encode(&self) -> String {
        if self.depth == 0 {
            return "/".to_string();
        }
        let mut components = Vec::with_capacity(self.depth);
        let mut cur = self;
        while cur.depth > 0 {
            components.push(format!("{}:{}", cur.name, cur.number));
            match cur.parent.as_deref() {
                Some(p) => cur = p,
                None => break,
            }
        }
        components.reverse();
        format!("/{}", components.join("/"))
    }

    /// Parse the wire encoding produced by [`LevelId::encode`].
    ///
    /// # Errors
    /// Returns [`CascadeError::Configuration`] on malformed input.
    pub fn parse(text: &str) -> Result<LevelIdPtr> {
        let malformed = |cause: String| CascadeError::Configuration { cause };
        let rest = text
            .strip_prefix('/')
            .ok_or_else(|| malformed(format!("level id '{text}' must start with '/'")))?;
        let mut id = Self::base();
        if rest.is_empty() {
            return Ok(id);
        }
        for component in rest.split('/') {
            let (name, number) = component.split_once(':').ok_or_else(|| {
                malformed(format!("level id component '{component}' is missing ':'"))
            })?;
            let number: usize = number.parse().map_err(|_| {
                malformed(format!("level id component '{component}' has a non-numeric index"))
            })?;
            id = id.make_child(number, name)?;
        }
        Ok(id)
    }
}

impl PartialEq for LevelId {
    fn eq(&self, other: &Self) -> bool {
        if self.depth != other.depth {
            return false;
        }
        let mut a = self;
        let mut b = other;
        loop {
            if std::ptr::eq(a, b) {
                return true;
            }
            if a.number != b.number || a.name != b.name {
                return false;
            }
            match (a.parent.as_deref(), b.parent.as_deref()) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl Eq for LevelId {}

impl Hash for LevelId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.depth.hash(state);
        let mut cur = self;
        loop {
            cur.number.hash(state);
            cur.name.hash(state);
            match cur.parent.as_deref() {
                Some(p) => cur = p,
                None => break,
            }
        }
    }
}

impl fmt::Display for LevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl Serialize for LevelId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

/// Qualified name of an algorithm: the owning module plus the algorithm name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    /// The module the algorithm was registered in.
    pub module: String,
    /// The algorithm name, unique within its module.
    pub name: String,
}

impl QualifiedName {
    /// Create a new qualified name.
    #[must_use]
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.name)
    }
}
