//! Error types for Cascade.
//!
//! This module provides strongly-typed errors with actionable context.
//! Errors fall into two phases: wiring errors (E1xx) are reported before any
//! user code runs; run errors (E2xx/E3xx) are reported from inside
//! `execute()`.

use thiserror::Error;

/// The main error type for Cascade operations.
#[derive(Error, Debug)]
pub enum CascadeError {
    // =========================================================================
    // Wiring Errors (E100-E199)
    // =========================================================================
    /// Two algorithms were registered under the same name within one module.
    #[error("E101: duplicate algorithm name '{name}' in module '{module}'")]
    DuplicateName {
        /// The module the name was registered in.
        module: String,
        /// The duplicated algorithm name.
        name: String,
    },

    /// Two nodes declared the same output specification.
    #[error("E102: specification '{spec}' declared by both '{first}' and '{second}'")]
    DuplicateSpecification {
        /// The duplicated specification.
        spec: String,
        /// The node that declared it first.
        first: String,
        /// The node that declared it again.
        second: String,
    },

    /// A consumed input matched no declared producer.
    #[error("E103: no producer found for input '{query}' consumed by '{node}'")]
    UnresolvedInput {
        /// The consuming node.
        node: String,
        /// The query that failed to resolve.
        query: String,
    },

    /// A consumed input matched more than one declared producer.
    #[error(
        "E104: input '{query}' consumed by '{node}' is ambiguous: \
         candidates '{first}' and '{second}'"
    )]
    AmbiguousInput {
        /// The consuming node.
        node: String,
        /// The query that matched multiple producers.
        query: String,
        /// The first candidate producer.
        first: String,
        /// The second candidate producer.
        second: String,
    },

    /// The producer/consumer graph contains a cycle.
    #[error("E105: cycle detected involving nodes: {nodes:?}")]
    CycleDetected {
        /// The algorithm names participating in the cycle.
        nodes: Vec<String>,
    },

    /// A declaration was handed to the builder without its required fields.
    #[error("E106: declaration '{node}' is incomplete: {missing}")]
    IncompleteDeclaration {
        /// The offending algorithm name.
        node: String,
        /// What is missing or inconsistent.
        missing: String,
    },

    /// Invalid engine or persistence configuration.
    #[error("E107: invalid configuration: {cause}")]
    Configuration {
        /// Description of the problem.
        cause: String,
    },

    // =========================================================================
    // Product Errors (E200-E299)
    // =========================================================================
    /// A typed read requested a different type than the one stored.
    #[error(
        "E201: cannot get product '{product}' with type '{requested}' -- \
         must specify type '{available}'"
    )]
    TypeMismatch {
        /// The product name.
        product: String,
        /// The requested type tag.
        requested: String,
        /// The stored type tag.
        available: String,
    },

    /// A product name was inserted twice into one container.
    #[error("E202: product '{product}' already present in container")]
    DuplicateProduct {
        /// The duplicated product name.
        product: String,
    },

    // =========================================================================
    // Run Errors (E300-E399)
    // =========================================================================
    /// A user callable returned an error or panicked.
    #[error("E301: user callable failed in '{node}' for record {record}: {cause}")]
    UserCallableFailed {
        /// The node whose callable failed.
        node: String,
        /// The encoded record identity.
        record: String,
        /// The failure description.
        cause: String,
    },

    /// A source stopped producing records before closing its hierarchy.
    #[error("E302: source '{source_name}' exhausted prematurely after record {last}: {cause}")]
    SourceExhaustedPrematurely {
        /// The source name.
        source_name: String,
        /// The last record identity seen.
        last: String,
        /// The underlying failure.
        cause: String,
    },

    /// An invariant the scheduler relies on was violated.
    #[error("E303: internal invariant violated: {cause}")]
    InternalInvariant {
        /// Description of the violation.
        cause: String,
    },

    /// Execution was cancelled via the cancellation token.
    #[error("E304: execution cancelled")]
    Cancelled,
}

impl CascadeError {
    /// Get the error code (e.g., "E101").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateName { .. } => "E101",
            Self::DuplicateSpecification { .. } => "E102",
            Self::UnresolvedInput { .. } => "E103",
            Self::AmbiguousInput { .. } => "E104",
            Self::CycleDetected { .. } => "E105",
            Self::IncompleteDeclaration { .. } => "E106",
            Self::Configuration { .. } => "E107",
            Self::TypeMismatch { .. } => "E201",
            Self::DuplicateProduct { .. } => "E202",
            Self::UserCallableFailed { .. } => "E301",
            Self::SourceExhaustedPrematurely { .. } => "E302",
            Self::InternalInvariant { .. } => "E303",
            Self::Cancelled => "E304",
        }
    }

    /// Check if this error belongs to the wiring phase (fatal before any user
    /// code runs).
    #[must_use]
    pub fn is_wiring_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName { .. }
                | Self::DuplicateSpecification { .. }
                | Self::UnresolvedInput { .. }
                | Self::AmbiguousInput { .. }
                | Self::CycleDetected { .. }
                | Self::IncompleteDeclaration { .. }
                | Self::Configuration { .. }
        )
    }

    /// Check if this error is recoverable at the record level during a run.
    #[must_use]
    pub fn is_record_scoped(&self) -> bool {
        matches!(self, Self::UserCallableFailed { .. })
    }
}

/// Result type alias using [`CascadeError`].
pub type Result<T> = std::result::Result<T, CascadeError>;
