//! `rusqlite`-backed assembly of the Flexilite schema engine: wires
//! `flexi-schema-parser`, `flexi-merger`, `flexi-validator`, and
//! `flexi-applier` together against a concrete SQLite substrate (spec §6).

mod config;
mod context;
mod db;
mod register;
mod substrate;
mod validation_io;

pub use config::Config;
pub use context::Context;
pub use register::register;
pub use substrate::SqliteSubstrate;
pub use validation_io::{SqliteInvalidObjectSink, SqliteObjectReader};

pub use flexi_applier::IndexThreshold;
pub use flexi_diagnostics::{Diagnostics, ErrorClass, ErrorContext, FlexiError, Warning};
pub use flexi_schema::{ClassDef, ClassFlag, MetadataRef, PropertyDef, PropRole, ValidationMode};
