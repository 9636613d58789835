//! Connection handle and the on-disk table shapes of spec §6. Every module
//! in this crate that touches the substrate holds a clone of [`Db`] — a
//! cheap `Rc<RefCell<..>>` handle, not a pool — matching the single-writer
//! connection model of spec §5.

use flexi_diagnostics::{ErrorContext, FlexiError};
use rusqlite::Connection;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Clone)]
pub struct Db(Rc<RefCell<Connection>>);

pub fn substrate_err(e: rusqlite::Error) -> FlexiError {
    FlexiError::SubstrateError { message: e.to_string(), context: ErrorContext::default() }
}

impl Db {
    pub fn open(conn: Connection) -> Result<Self, FlexiError> {
        let db = Db(Rc::new(RefCell::new(conn)));
        db.init_schema()?;
        Ok(db)
    }

    pub fn with<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> Result<R, FlexiError> {
        f(&self.0.borrow()).map_err(substrate_err)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<R>) -> Result<R, FlexiError> {
        f(&mut self.0.borrow_mut()).map_err(substrate_err)
    }

    fn init_schema(&self) -> Result<(), FlexiError> {
        self.with_mut(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS "[.names]" (
                    NameID INTEGER PRIMARY KEY,
                    Value TEXT UNIQUE NOT NULL
                );
                CREATE TABLE IF NOT EXISTS "[.classes]" (
                    ClassID INTEGER PRIMARY KEY,
                    NameID INTEGER NOT NULL,
                    Data TEXT NOT NULL DEFAULT '{}',
                    ctloMask INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS "[.class_properties]" (
                    PropertyID INTEGER PRIMARY KEY,
                    NameID INTEGER NOT NULL,
                    ClassID INTEGER NOT NULL,
                    ctlv INTEGER NOT NULL DEFAULT 0,
                    ctlvPlan INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(ClassID, NameID)
                );
                CREATE TABLE IF NOT EXISTS "[.objects]" (
                    ObjectID INTEGER PRIMARY KEY,
                    ClassID INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS "[.ref-values]" (
                    ObjectID INTEGER NOT NULL,
                    PropertyID INTEGER NOT NULL,
                    PropIndex INTEGER NOT NULL DEFAULT 0,
                    Value TEXT
                );
                CREATE TABLE IF NOT EXISTS "[.range_data]" (
                    ObjectID INTEGER PRIMARY KEY,
                    A0 REAL, A1 REAL, B0 REAL, B1 REAL, C0 REAL, C1 REAL,
                    D0 REAL, D1 REAL, E0 REAL, E1 REAL
                );
                CREATE TABLE IF NOT EXISTS "[.full_text_data]" (
                    ObjectID INTEGER PRIMARY KEY,
                    X1 TEXT, X2 TEXT, X3 TEXT, X4 TEXT, X5 TEXT
                );
                CREATE TABLE IF NOT EXISTS "[.invalid_objects]" (
                    ClassID INTEGER NOT NULL,
                    ObjectID INTEGER NOT NULL,
                    Reason TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS "[.object_values]" (
                    ObjectID INTEGER NOT NULL,
                    ClassID INTEGER NOT NULL,
                    PropName TEXT NOT NULL,
                    ValueJson TEXT,
                    PRIMARY KEY (ObjectID, PropName)
                );
                "#,
            )
        })
    }

    pub fn user_version(&self) -> Result<u64, FlexiError> {
        self.with(|conn| conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0)))
            .map(|v| v as u64)
    }

    pub fn bump_user_version(&self) -> Result<u64, FlexiError> {
        let next = self.user_version()? + 1;
        self.with_mut(|conn| conn.execute(&format!("PRAGMA user_version = {next}"), []))?;
        Ok(next)
    }
}
