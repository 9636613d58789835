//! Name dictionary (spec §4.1) and identifier validator (spec §2.2).
//!
//! The dictionary interns class and property names into stable integer ids.
//! Insertion is idempotent and, per spec §4.1, observable across the
//! connection before commit — callers that share one substrate connection
//! see each other's inserts immediately. This crate defines the storage
//! contract as a trait ([`NameStore`]) so the merger/applier/validator never
//! need to know whether names live in a real `[.names]` table or an
//! in-memory map; `flexi-engine` supplies the `rusqlite`-backed
//! implementation, this crate supplies an in-memory one for tests and for
//! embedding in larger in-memory fixtures.

use flexi_diagnostics::{ErrorContext, FlexiError};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// A stable, never-reused identifier for an interned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameId(pub u64);

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[_A-Za-z][-_A-Za-z0-9]{1,128}$").expect("static regex is valid"))
}

/// Accepts a name iff it matches `[_A-Za-z][-_A-Za-z0-9]{1,128}` (spec §2.2).
pub fn validate_identifier(text: &str) -> Result<(), FlexiError> {
    if identifier_regex().is_match(text) {
        Ok(())
    } else {
        Err(FlexiError::InvalidName { name: text.to_string(), context: ErrorContext::default() })
    }
}

/// Storage contract for the name dictionary. Implementors must make
/// `insert_name` idempotent: inserting the same text twice returns the same
/// id both times.
pub trait NameStore {
    fn insert_name(&mut self, text: &str) -> Result<NameId, FlexiError>;
    fn get_name_id(&self, text: &str) -> Result<NameId, FlexiError>;
    fn get_name_text(&self, id: NameId) -> Result<String, FlexiError>;
}

/// A simple in-memory name dictionary. Used directly by tests and by any
/// embedder that does not need the dictionary to survive past the process.
#[derive(Debug, Default)]
pub struct InMemoryNameDictionary {
    by_text: HashMap<String, NameId>,
    by_id: HashMap<NameId, String>,
    next_id: u64,
}

impl InMemoryNameDictionary {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameStore for InMemoryNameDictionary {
    fn insert_name(&mut self, text: &str) -> Result<NameId, FlexiError> {
        validate_identifier(text)?;
        if let Some(id) = self.by_text.get(text) {
            return Ok(*id);
        }
        let id = NameId(self.next_id);
        self.next_id += 1;
        self.by_text.insert(text.to_string(), id);
        self.by_id.insert(id, text.to_string());
        Ok(id)
    }

    fn get_name_id(&self, text: &str) -> Result<NameId, FlexiError> {
        self.by_text.get(text).copied().ok_or_else(|| FlexiError::NotFound {
            message: format!("name {text:?} not found"),
            context: ErrorContext::default(),
        })
    }

    fn get_name_text(&self, id: NameId) -> Result<String, FlexiError> {
        self.by_id.get(&id).cloned().ok_or_else(|| FlexiError::NotFound {
            message: format!("name id {id:?} not found"),
            context: ErrorContext::default(),
        })
    }
}
