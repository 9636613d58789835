//! Error taxonomy and non-fatal diagnostics for the Flexilite schema engine.
//!
//! Every public operation in the engine returns exactly one [`FlexiError`] on
//! failure, never a partial success (spec §7). [`Diagnostics`] is a separate,
//! much smaller channel for notices that do not abort an operation, such as
//! the lenient-mode type fallback in the definition parser.

use std::fmt;

/// Identifying triple attached to an error when it is known: the class, the
/// property within it, and (for data-validation failures) the offending
/// object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub class_name: Option<String>,
    pub prop_name: Option<String>,
    pub object_id: Option<i64>,
}

impl ErrorContext {
    pub fn class(name: impl Into<String>) -> Self {
        Self { class_name: Some(name.into()), ..Default::default() }
    }

    pub fn with_prop(mut self, name: impl Into<String>) -> Self {
        self.prop_name = Some(name.into());
        self
    }

    pub fn with_object(mut self, object_id: i64) -> Self {
        self.object_id = Some(object_id);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(c) = &self.class_name {
            parts.push(format!("class={c}"));
        }
        if let Some(p) = &self.prop_name {
            parts.push(format!("prop={p}"));
        }
        if let Some(o) = self.object_id {
            parts.push(format!("object_id={o}"));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// The coarse bucket the callable surface (§6, §7) maps every [`FlexiError`]
/// into when reporting back through the substrate's error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Constraint,
    Misuse,
    Cancelled,
    Generic,
}

/// One error kind per row of the taxonomy in spec §7.
#[derive(Debug, thiserror::Error)]
pub enum FlexiError {
    #[error("failed to parse class definition JSON: {message}")]
    ParseError { message: String, context: ErrorContext },

    #[error("invalid identifier {name:?}: must match [_A-Za-z][-_A-Za-z0-9]{{1,128}}")]
    InvalidName { name: String, context: ErrorContext },

    #[error("unknown type {type_token:?}")]
    UnknownType { type_token: String, context: ErrorContext },

    #[error("invalid property definition: {message}")]
    InvalidProp { message: String, context: ErrorContext },

    #[error("cannot drop non-existent property {prop_name:?}")]
    DropMissing { prop_name: String, context: ErrorContext },

    #[error("cannot rename non-existent property {prop_name:?}")]
    RenameMissing { prop_name: String, context: ErrorContext },

    #[error("transition from type {from} to type {to} is not supported")]
    IncompatibleTypeChange { from: String, to: String, context: ErrorContext },

    #[error("mixin conflict on property {prop_name:?}: {message}")]
    MixinConflict { prop_name: String, message: String, context: ErrorContext },

    #[error("constraint violation: {reason}")]
    ConstraintViolation { reason: String, context: ErrorContext },

    #[error("not found: {message}")]
    NotFound { message: String, context: ErrorContext },

    #[error("already exists: {message}")]
    AlreadyExists { message: String, context: ErrorContext },

    #[error("operation cancelled")]
    Cancelled { context: ErrorContext },

    #[error("substrate error: {message}")]
    SubstrateError { message: String, context: ErrorContext },

    #[error("out of memory")]
    OutOfMemory { context: ErrorContext },
}

impl FlexiError {
    pub fn context(&self) -> &ErrorContext {
        match self {
            FlexiError::ParseError { context, .. }
            | FlexiError::InvalidName { context, .. }
            | FlexiError::UnknownType { context, .. }
            | FlexiError::InvalidProp { context, .. }
            | FlexiError::DropMissing { context, .. }
            | FlexiError::RenameMissing { context, .. }
            | FlexiError::IncompatibleTypeChange { context, .. }
            | FlexiError::MixinConflict { context, .. }
            | FlexiError::ConstraintViolation { context, .. }
            | FlexiError::NotFound { context, .. }
            | FlexiError::AlreadyExists { context, .. }
            | FlexiError::Cancelled { context }
            | FlexiError::SubstrateError { context, .. }
            | FlexiError::OutOfMemory { context } => context,
        }
    }

    /// Coarse mapping used by the callable surface (spec §7):
    /// `ConstraintViolation -> constraint`, `NotFound | AlreadyExists ->
    /// misuse`, `Cancelled` is distinguishable, everything else is generic.
    pub fn class(&self) -> ErrorClass {
        match self {
            FlexiError::ConstraintViolation { .. } => ErrorClass::Constraint,
            FlexiError::NotFound { .. } | FlexiError::AlreadyExists { .. } => ErrorClass::Misuse,
            FlexiError::Cancelled { .. } => ErrorClass::Cancelled,
            _ => ErrorClass::Generic,
        }
    }
}

/// A non-fatal notice recorded during an operation that otherwise succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// The definition parser (§4.2) fell back to `text` for an unresolved
    /// type token because strict mode was off.
    UnresolvedTypeFallback { prop_name: String, type_token: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnresolvedTypeFallback { prop_name, type_token } => write!(
                f,
                "property {prop_name:?}: unknown type {type_token:?}, falling back to text"
            ),
        }
    }
}

/// Collects warnings over the course of one operation. Never aborts
/// anything by itself; a caller decides what to do with accumulated
/// warnings once the operation returns.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}
