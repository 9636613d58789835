//! The callable surface (spec §4.7, §6): `create_class`/`alter_class`/
//! `drop_class`/`rename_class`, each running under a per-class exclusive
//! logical lock and bracketed by a `user_version`-keyed definition cache.

use crate::config::Config;
use crate::db::Db;
use crate::substrate::SqliteSubstrate;
use crate::validation_io::{SqliteInvalidObjectSink, SqliteObjectReader};
use flexi_applier::Substrate;
use flexi_diagnostics::{ErrorContext, FlexiError};
use flexi_names::NameStore;
use flexi_schema::{ClassDef, ClassFlag, ValidationMode};
use flexi_schema_parser::StrictMode;
use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

/// Reserved holding-pen class objects are repointed to on a hard `drop_class`
/// (`SPEC_FULL.md` §D(c), grounded in the legacy extension's orphan table).
const RESERVED_OBJECT_CLASS: &str = "Object";

/// One connection's handle onto the schema engine. Cheap to clone: the
/// underlying connection is shared via [`Db`], and the definition cache is
/// interior-mutable so `&self` methods suffice for the whole callable
/// surface (spec §7: no operation needs `&mut self` to be externally
/// observable as atomic — the per-class lock below is what actually
/// serialises concurrent callers).
pub struct Context {
    db: Db,
    substrate: SqliteSubstrate,
    config: Config,
    #[allow(dead_code)]
    principal: String,
    schema_version: Cell<u64>,
    cache: RefCell<HashMap<u64, ClassDef>>,
    locked: RefCell<HashSet<u64>>,
}

struct ClassLock<'a> {
    locked: &'a RefCell<HashSet<u64>>,
    class_id: u64,
}

impl<'a> Drop for ClassLock<'a> {
    fn drop(&mut self) {
        self.locked.borrow_mut().remove(&self.class_id);
    }
}

impl Context {
    /// Opens a schema engine backed by an on-disk SQLite file.
    pub fn open(path: &str, principal: impl Into<String>, config: Config) -> Result<Self, FlexiError> {
        let conn = Connection::open(path).map_err(crate::db::substrate_err)?;
        Self::from_connection(conn, principal, config)
    }

    /// Opens a schema engine backed by a private in-memory database.
    pub fn open_in_memory(principal: impl Into<String>, config: Config) -> Result<Self, FlexiError> {
        let conn = Connection::open_in_memory().map_err(crate::db::substrate_err)?;
        Self::from_connection(conn, principal, config)
    }

    fn from_connection(conn: Connection, principal: impl Into<String>, config: Config) -> Result<Self, FlexiError> {
        let db = Db::open(conn)?;
        let substrate = SqliteSubstrate::new(db.clone());
        let schema_version = db.user_version()?;
        Ok(Context {
            db,
            substrate,
            config,
            principal: principal.into(),
            schema_version: Cell::new(schema_version),
            cache: RefCell::new(HashMap::new()),
            locked: RefCell::new(HashSet::new()),
        })
    }

    fn refresh_cache(&self) -> Result<(), FlexiError> {
        let current = self.db.user_version()?;
        if current != self.schema_version.get() {
            self.cache.borrow_mut().clear();
            self.schema_version.set(current);
        }
        Ok(())
    }

    fn acquire_lock(&self, class_id: u64) -> Result<ClassLock<'_>, FlexiError> {
        let mut locked = self.locked.borrow_mut();
        if !locked.insert(class_id) {
            return Err(FlexiError::SubstrateError {
                message: format!("class {class_id} is locked by a concurrent operation"),
                context: ErrorContext::default(),
            });
        }
        drop(locked);
        Ok(ClassLock { locked: &self.locked, class_id })
    }

    /// Looks up a class definition by name, consulting (and refreshing) the
    /// `user_version`-keyed cache first (spec §4.7).
    pub fn get_class_def(&self, name: &str) -> Result<ClassDef, FlexiError> {
        self.refresh_cache()?;
        let class_id = self.require_class_id(name)?;
        if let Some(cached) = self.cache.borrow().get(&class_id) {
            return Ok(cached.clone());
        }
        let class = self.load_class_def(class_id)?;
        self.cache.borrow_mut().insert(class_id, class.clone());
        Ok(class)
    }

    fn require_class_id(&self, name: &str) -> Result<u64, FlexiError> {
        self.substrate.find_class_id(name)?.ok_or_else(|| FlexiError::NotFound {
            message: format!("class {name:?} not found"),
            context: ErrorContext::class(name),
        })
    }

    fn load_class_def(&self, class_id: u64) -> Result<ClassDef, FlexiError> {
        let (data_json, ctlo_mask) = self.substrate.load_class_json(class_id)?;
        let name_text = self.db.with(|conn| {
            conn.query_row(
                r#"SELECT n.Value FROM "[.classes]" c JOIN "[.names]" n ON n.NameID = c.NameID WHERE c.ClassID = ?1"#,
                rusqlite::params![class_id as i64],
                |row| row.get::<_, String>(0),
            )
        })?;
        let mut names = self.substrate.clone();
        let (mut class, _diagnostics) = flexi_schema_parser::parse_class_def(
            &name_text,
            Some(class_id),
            &data_json,
            StrictMode::Lenient,
            &mut names,
        )?;
        class.ctlo_mask = flexi_schema::ClassFlagSet::from_bits_truncate(ctlo_mask);
        Ok(class)
    }

    /// Creates a new class (spec §4.3, §6). `def_json` is parsed as the
    /// "new" side of a merge against an empty definition, so every declared
    /// property goes through the same classification/validation path an
    /// `alter` would.
    pub fn create_class(&self, name: &str, def_json: &str, as_table: bool) -> Result<u64, FlexiError> {
        self.refresh_cache()?;
        if self.substrate.find_class_id(name)?.is_some() {
            return Err(FlexiError::AlreadyExists {
                message: format!("class {name:?} already exists"),
                context: ErrorContext::class(name),
            });
        }

        let mut substrate = self.substrate.clone();
        let name_id = NameStore::insert_name(&mut substrate, name)?;
        let class_id = substrate.insert_class_row(name_id)?;

        let _lock = self.acquire_lock(class_id)?;
        let result = self.create_class_locked(class_id, name, name_id, def_json, as_table);
        if result.is_err() {
            // No partial mutation escapes a failed call (spec §7): undo the
            // placeholder row allocated above.
            let _ = substrate.delete_class_row(class_id);
        }
        result
    }

    fn create_class_locked(
        &self,
        class_id: u64,
        name: &str,
        name_id: flexi_names::NameId,
        def_json: &str,
        as_table: bool,
    ) -> Result<u64, FlexiError> {
        let mut substrate = self.substrate.clone();
        let (mut new_def, _diagnostics) =
            flexi_schema_parser::parse_class_def(name, Some(class_id), def_json, StrictMode::Lenient, &mut substrate)?;
        new_def.as_table = as_table;
        let old_def = ClassDef::new(Some(class_id), name_id, name);

        let outcome = flexi_merger::merge_class_defs(&old_def, new_def, ValidationMode::Abort, &substrate)?;
        self.commit(class_id, &outcome)?;
        Ok(class_id)
    }

    /// Alters an existing class (spec §4.4–§4.6). Returns the engine's new
    /// `user_version` on success.
    pub fn alter_class(&self, name: &str, def_json: &str, mode: ValidationMode) -> Result<u64, FlexiError> {
        self.refresh_cache()?;
        let class_id = self.require_class_id(name)?;
        let _lock = self.acquire_lock(class_id)?;

        let old_def = self.load_class_def(class_id)?;
        let mut substrate = self.substrate.clone();
        let (new_def, _diagnostics) =
            flexi_schema_parser::parse_class_def(name, Some(class_id), def_json, StrictMode::Lenient, &mut substrate)?;

        let outcome = flexi_merger::merge_class_defs(&old_def, new_def, mode, &substrate)?;
        self.commit(class_id, &outcome)
    }

    fn commit(&self, class_id: u64, outcome: &flexi_merger::MergeOutcome) -> Result<u64, FlexiError> {
        let mut substrate = self.substrate.clone();
        let mut reader = SqliteObjectReader::new(self.db.clone(), class_id);
        let mut sink = SqliteInvalidObjectSink::new(self.db.clone(), class_id);
        let apply_outcome = flexi_applier::apply_merge(
            outcome,
            self.config.index_apply_threshold,
            &mut substrate,
            &mut reader,
            &mut sink,
            &(),
            self.config.cancellation_poll_interval,
        )?;
        self.cache.borrow_mut().remove(&class_id);
        self.schema_version.set(apply_outcome.new_user_version);
        Ok(apply_outcome.new_user_version)
    }

    /// Renames a class (spec §4.3): the class id is unchanged, only the
    /// `[.classes].NameID` foreign key moves.
    pub fn rename_class(&self, old_name: &str, new_name: &str) -> Result<(), FlexiError> {
        self.refresh_cache()?;
        let class_id = self.require_class_id(old_name)?;
        if self.substrate.find_class_id(new_name)?.is_some() {
            return Err(FlexiError::AlreadyExists {
                message: format!("class {new_name:?} already exists"),
                context: ErrorContext::class(new_name),
            });
        }
        let _lock = self.acquire_lock(class_id)?;
        let mut substrate = self.substrate.clone();
        let new_name_id = NameStore::insert_name(&mut substrate, new_name)?;
        substrate.rename_class_row(class_id, new_name_id)?;
        self.cache.borrow_mut().remove(&class_id);
        self.schema_version.set(self.db.bump_user_version()?);
        Ok(())
    }

    fn ensure_reserved_object_class(&self) -> Result<u64, FlexiError> {
        if let Some(id) = self.substrate.find_class_id(RESERVED_OBJECT_CLASS)? {
            return Ok(id);
        }
        self.create_class(RESERVED_OBJECT_CLASS, r#"{"allowAnyProps":true}"#, false)
    }

    /// Drops a class (spec §6, `SPEC_FULL.md` §D(c)). `soft` preserves the
    /// class's objects by repointing them at the reserved `Object`
    /// holding-pen class and flagging the now-structureless class row
    /// `SoftDeleted` (ctloMask bit 5, kept around so the flag stays
    /// observable); a hard drop deletes the objects and all of their
    /// auxiliary data outright and frees the name. Either way the class's
    /// own indexes, FTS, range, and reference data are torn down — neither
    /// variant leaves a usable structured class behind.
    pub fn drop_class(&self, name: &str, soft: bool) -> Result<(), FlexiError> {
        self.refresh_cache()?;
        let class_id = self.require_class_id(name)?;
        let _lock = self.acquire_lock(class_id)?;

        self.db.with_mut(|conn| {
            conn.execute(
                r#"DELETE FROM "[.ref-values]" WHERE PropertyID IN (SELECT PropertyID FROM "[.class_properties]" WHERE ClassID = ?1)"#,
                rusqlite::params![class_id as i64],
            )?;
            conn.execute(
                r#"DELETE FROM "[.range_data]" WHERE ObjectID IN (SELECT ObjectID FROM "[.objects]" WHERE ClassID = ?1)"#,
                rusqlite::params![class_id as i64],
            )?;
            conn.execute(
                r#"DELETE FROM "[.full_text_data]" WHERE ObjectID IN (SELECT ObjectID FROM "[.objects]" WHERE ClassID = ?1)"#,
                rusqlite::params![class_id as i64],
            )?;
            Ok(())
        })?;

        if soft {
            let holding_pen = self.ensure_reserved_object_class()?;
            self.db.with_mut(|conn| {
                conn.execute(
                    r#"UPDATE "[.objects]" SET ClassID = ?1 WHERE ClassID = ?2"#,
                    rusqlite::params![holding_pen as i64, class_id as i64],
                )
            })?;
            let (data_json, ctlo_mask) = self.substrate.load_class_json(class_id)?;
            let mut mask = flexi_schema::ClassFlagSet::from_bits_truncate(ctlo_mask);
            mask.insert(ClassFlag::SoftDeleted);
            let mut substrate = self.substrate.clone();
            Substrate::write_class_definition(&mut substrate, class_id, &data_json, mask.bits())?;
        } else {
            self.db.with_mut(|conn| {
                conn.execute(
                    r#"DELETE FROM "[.object_values]" WHERE ClassID = ?1"#,
                    rusqlite::params![class_id as i64],
                )?;
                conn.execute(r#"DELETE FROM "[.objects]" WHERE ClassID = ?1"#, rusqlite::params![class_id as i64])?;
                Ok(())
            })?;
            let mut substrate = self.substrate.clone();
            substrate.delete_class_row(class_id)?;
        }

        self.cache.borrow_mut().remove(&class_id);
        self.schema_version.set(self.db.bump_user_version()?);
        Ok(())
    }
}
