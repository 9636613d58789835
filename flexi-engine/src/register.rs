//! Installs the callable surface (`create_class`/`alter_class`/
//! `drop_class`/`rename_class`) as `rusqlite` scalar functions, the way the
//! legacy C extension registered `flexi_class_create_func` and friends via
//! `sqlite3_create_function` (`SPEC_FULL.md` §C.2).

use crate::context::Context;
use flexi_diagnostics::{ErrorClass, FlexiError};
use flexi_schema::ValidationMode;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, Error as SqlError};
use std::fmt;
use std::rc::Rc;

/// Carries both the spec §7 error string and its coarse `ErrorClass` code
/// into `rusqlite::Error::UserFunctionError`.
#[derive(Debug)]
struct SqlFlexiError {
    class: ErrorClass,
    message: String,
}

impl fmt::Display for SqlFlexiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.class, self.message)
    }
}

impl std::error::Error for SqlFlexiError {}

fn sql_err(e: FlexiError) -> SqlError {
    SqlError::UserFunctionError(Box::new(SqlFlexiError { class: e.class(), message: e.to_string() }))
}

fn parse_mode(text: &str) -> Result<ValidationMode, FlexiError> {
    match text.to_ascii_lowercase().as_str() {
        "abort" => Ok(ValidationMode::Abort),
        "ignore" => Ok(ValidationMode::Ignore),
        "mark" => Ok(ValidationMode::Mark),
        other => Err(FlexiError::InvalidProp {
            message: format!("unknown validation mode {other:?}"),
            context: Default::default(),
        }),
    }
}

/// A `Context` never leaves the thread that owns its connection (spec §5's
/// single-writer model); the closures below run only as callbacks on that
/// same thread, so wrapping the `Rc` to satisfy `rusqlite`'s `Send` bound is
/// sound.
struct ThreadConfined<T>(T);
unsafe impl<T> Send for ThreadConfined<T> {}

/// Registers `flexi_class_create(name, def_json, as_table)`,
/// `flexi_class_alter(name, def_json, mode)`, `flexi_class_drop(name,
/// soft)`, and `flexi_class_rename(old_name, new_name)` on `conn`, each
/// delegating to `ctx` and reporting failure as
/// `rusqlite::Error::UserFunctionError` (`SPEC_FULL.md` §C.2).
pub fn register(conn: &Connection, ctx: Rc<Context>) -> Result<(), FlexiError> {
    let flags = FunctionFlags::SQLITE_UTF8;

    let create_ctx = ThreadConfined(ctx.clone());
    conn.create_scalar_function("flexi_class_create", 3, flags, move |sql_ctx| {
        let create_ctx = &create_ctx;
        let ctx = &create_ctx.0;
        let name: String = sql_ctx.get(0)?;
        let def_json: String = sql_ctx.get(1)?;
        let as_table: bool = sql_ctx.get(2)?;
        ctx.create_class(&name, &def_json, as_table).map(|id| id as i64).map_err(sql_err)
    })
    .map_err(crate::db::substrate_err)?;

    let alter_ctx = ThreadConfined(ctx.clone());
    conn.create_scalar_function("flexi_class_alter", 3, flags, move |sql_ctx| {
        let alter_ctx = &alter_ctx;
        let ctx = &alter_ctx.0;
        let name: String = sql_ctx.get(0)?;
        let def_json: String = sql_ctx.get(1)?;
        let mode_text: String = sql_ctx.get(2)?;
        let mode = parse_mode(&mode_text).map_err(sql_err)?;
        ctx.alter_class(&name, &def_json, mode).map(|v| v as i64).map_err(sql_err)
    })
    .map_err(crate::db::substrate_err)?;

    let drop_ctx = ThreadConfined(ctx.clone());
    conn.create_scalar_function("flexi_class_drop", 2, flags, move |sql_ctx| {
        let drop_ctx = &drop_ctx;
        let ctx = &drop_ctx.0;
        let name: String = sql_ctx.get(0)?;
        let soft: bool = sql_ctx.get(1)?;
        ctx.drop_class(&name, soft).map(|_| 0i64).map_err(sql_err)
    })
    .map_err(crate::db::substrate_err)?;

    let rename_ctx = ThreadConfined(ctx);
    conn.create_scalar_function("flexi_class_rename", 2, flags, move |sql_ctx| {
        let rename_ctx = &rename_ctx;
        let ctx = &rename_ctx.0;
        let old_name: String = sql_ctx.get(0)?;
        let new_name: String = sql_ctx.get(1)?;
        ctx.rename_class(&old_name, &new_name).map(|_| 0i64).map_err(sql_err)
    })
    .map_err(crate::db::substrate_err)?;

    Ok(())
}
