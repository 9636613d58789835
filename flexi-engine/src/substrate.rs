//! `rusqlite`-backed implementations of the storage contracts defined by
//! `flexi-names`, `flexi-merger`, and `flexi-applier`.

use crate::db::Db;
use flexi_applier::{PropertyPersist, Substrate, TableStats};
use flexi_diagnostics::{ErrorContext, FlexiError};
use flexi_merger::{MixinResolver, PostAction, PreAction};
use flexi_names::{validate_identifier, NameId, NameStore};
use flexi_schema::{ClassDef, MetadataRef, PropFlagSet, PropertyDef};
use rusqlite::{params, OptionalExtension};

#[derive(Clone)]
pub struct SqliteSubstrate {
    pub(crate) db: Db,
}

impl SqliteSubstrate {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn find_class_id(&self, name: &str) -> Result<Option<u64>, FlexiError> {
        self.db
            .with(|conn| {
                conn.query_row(
                    r#"SELECT c.ClassID FROM "[.classes]" c JOIN "[.names]" n ON n.NameID = c.NameID WHERE n.Value = ?1"#,
                    params![name],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
            })
            .map(|opt| opt.map(|v| v as u64))
    }

    pub fn load_class_json(&self, class_id: u64) -> Result<(String, u8), FlexiError> {
        self.db.with(|conn| {
            conn.query_row(
                r#"SELECT Data, ctloMask FROM "[.classes]" WHERE ClassID = ?1"#,
                params![class_id as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u8)),
            )
        })
    }

    pub fn insert_class_row(&self, name_id: NameId) -> Result<u64, FlexiError> {
        self.db.with_mut(|conn| {
            conn.execute(r#"INSERT INTO "[.classes]" (NameID, Data, ctloMask) VALUES (?1, '{}', 0)"#, params![name_id.0 as i64])?;
            Ok(conn.last_insert_rowid() as u64)
        })
    }

    pub fn rename_class_row(&self, class_id: u64, new_name_id: NameId) -> Result<(), FlexiError> {
        self.db.with_mut(|conn| {
            conn.execute(r#"UPDATE "[.classes]" SET NameID = ?1 WHERE ClassID = ?2"#, params![new_name_id.0 as i64, class_id as i64])?;
            Ok(())
        })
    }

    pub fn delete_class_row(&self, class_id: u64) -> Result<(), FlexiError> {
        self.db.with_mut(|conn| {
            conn.execute(r#"DELETE FROM "[.class_properties]" WHERE ClassID = ?1"#, params![class_id as i64])?;
            conn.execute(r#"DELETE FROM "[.classes]" WHERE ClassID = ?1"#, params![class_id as i64])?;
            Ok(())
        })
    }
}

impl NameStore for SqliteSubstrate {
    fn insert_name(&mut self, text: &str) -> Result<NameId, FlexiError> {
        validate_identifier(text)?;
        self.db.with_mut(|conn| {
            conn.execute(r#"INSERT INTO "[.names]" (Value) VALUES (?1) ON CONFLICT(Value) DO NOTHING"#, params![text])?;
            conn.query_row(r#"SELECT NameID FROM "[.names]" WHERE Value = ?1"#, params![text], |row| row.get::<_, i64>(0))
        })
        .map(|id| NameId(id as u64))
    }

    fn get_name_id(&self, text: &str) -> Result<NameId, FlexiError> {
        self.db
            .with(|conn| {
                conn.query_row(r#"SELECT NameID FROM "[.names]" WHERE Value = ?1"#, params![text], |row| row.get::<_, i64>(0)).optional()
            })?
            .map(|id| NameId(id as u64))
            .ok_or_else(|| FlexiError::NotFound { message: format!("name {text:?} not found"), context: ErrorContext::default() })
    }

    fn get_name_text(&self, id: NameId) -> Result<String, FlexiError> {
        self.db
            .with(|conn| conn.query_row(r#"SELECT Value FROM "[.names]" WHERE NameID = ?1"#, params![id.0 as i64], |row| row.get(0)).optional())?
            .ok_or_else(|| FlexiError::NotFound { message: format!("name id {id:?} not found"), context: ErrorContext::default() })
    }
}

impl MixinResolver for SqliteSubstrate {
    fn resolve(&self, mixin_ref: &MetadataRef) -> Result<ClassDef, FlexiError> {
        let class_id = if let Some(id) = mixin_ref.id {
            id
        } else if let Some(name) = &mixin_ref.name {
            self.find_class_id(name)?.ok_or_else(|| FlexiError::NotFound {
                message: format!("mixin class {name:?} not found"),
                context: ErrorContext::default(),
            })?
        } else {
            return Err(FlexiError::InvalidProp {
                message: "mixin reference has neither id nor name".to_string(),
                context: ErrorContext::default(),
            });
        };
        let (data_json, _) = self.load_class_json(class_id)?;
        let name_text = self.db.with(|conn| {
            conn.query_row(
                r#"SELECT n.Value FROM "[.classes]" c JOIN "[.names]" n ON n.NameID = c.NameID WHERE c.ClassID = ?1"#,
                params![class_id as i64],
                |row| row.get::<_, String>(0),
            )
        })?;
        let mut names = self.clone();
        let (class, _diagnostics) =
            flexi_schema_parser::parse_class_def(&name_text, Some(class_id), &data_json, flexi_schema_parser::StrictMode::Lenient, &mut names)?;
        Ok(class)
    }
}

fn ctlv_i64(flags: PropFlagSet) -> i64 {
    flags.bits() as i64
}

impl Substrate for SqliteSubstrate {
    fn run_pre_action(&mut self, class_id: u64, action: &PreAction) -> Result<(), FlexiError> {
        tracing::debug!(class_id, ?action, "running pre-action");
        match action {
            PreAction::DropIndex { prop_name } => {
                self.db.with_mut(|conn| {
                    conn.execute(
                        r#"DELETE FROM "[.ref-values]" WHERE PropertyID IN (
                            SELECT PropertyID FROM "[.class_properties]" cp
                            JOIN "[.names]" n ON n.NameID = cp.NameID
                            WHERE cp.ClassID = ?1 AND n.Value = ?2
                        )"#,
                        params![class_id as i64, prop_name],
                    )
                })?;
            }
            PreAction::DropRangeIndex => {
                self.db.with_mut(|conn| {
                    conn.execute(
                        r#"DELETE FROM "[.range_data]" WHERE ObjectID IN (SELECT ObjectID FROM "[.objects]" WHERE ClassID = ?1)"#,
                        params![class_id as i64],
                    )
                })?;
            }
            PreAction::DropFtsIndex => {
                self.db.with_mut(|conn| {
                    conn.execute(
                        r#"DELETE FROM "[.full_text_data]" WHERE ObjectID IN (SELECT ObjectID FROM "[.objects]" WHERE ClassID = ?1)"#,
                        params![class_id as i64],
                    )
                })?;
            }
        }
        Ok(())
    }

    fn persist_property(
        &mut self,
        class_id: u64,
        prop: &PropertyDef,
        persist: PropertyPersist,
        ctlv: PropFlagSet,
        ctlv_plan: PropFlagSet,
    ) -> Result<u64, FlexiError> {
        match persist {
            PropertyPersist::Insert => {
                let name_id = NameStore::insert_name(self, &prop.name_text)?;
                self.db.with_mut(|conn| {
                    conn.execute(
                        r#"INSERT INTO "[.class_properties]" (NameID, ClassID, ctlv, ctlvPlan) VALUES (?1, ?2, ?3, ?4)
                           ON CONFLICT(ClassID, NameID) DO UPDATE SET ctlv = excluded.ctlv, ctlvPlan = excluded.ctlvPlan"#,
                        params![name_id.0 as i64, class_id as i64, ctlv_i64(ctlv), ctlv_i64(ctlv_plan)],
                    )?;
                    Ok(conn.last_insert_rowid() as u64)
                })
            }
            PropertyPersist::Update => {
                let name_id = NameStore::insert_name(self, &prop.name_text)?;
                self.db.with_mut(|conn| {
                    conn.execute(
                        r#"UPDATE "[.class_properties]" SET ctlv = ?1, ctlvPlan = ?2 WHERE ClassID = ?3 AND NameID = ?4"#,
                        params![ctlv_i64(ctlv), ctlv_i64(ctlv_plan), class_id as i64, name_id.0 as i64],
                    )?;
                    Ok(0u64)
                })
            }
            PropertyPersist::Delete => {
                let name_id = self.get_name_id(&prop.name_text)?;
                self.db.with_mut(|conn| {
                    conn.execute(r#"DELETE FROM "[.class_properties]" WHERE ClassID = ?1 AND NameID = ?2"#, params![class_id as i64, name_id.0 as i64])?;
                    Ok(0u64)
                })
            }
            PropertyPersist::Rename { old_name } => {
                let old_id = self.get_name_id(&old_name)?;
                let new_id = NameStore::insert_name(self, &prop.name_text)?;
                self.db.with_mut(|conn| {
                    conn.execute(
                        r#"UPDATE "[.class_properties]" SET NameID = ?1, ctlv = ?2, ctlvPlan = ?3 WHERE ClassID = ?4 AND NameID = ?5"#,
                        params![new_id.0 as i64, ctlv_i64(ctlv), ctlv_i64(ctlv_plan), class_id as i64, old_id.0 as i64],
                    )?;
                    Ok(0u64)
                })
            }
        }
    }

    fn run_post_action(&mut self, class_id: u64, action: &PostAction) -> Result<(), FlexiError> {
        tracing::debug!(class_id, ?action, "running post-action");
        // Range/FTS/reference materialisation consumes the row layer that
        // spec §1 explicitly places out of scope; these are no-ops beyond
        // the teardown already performed in the matching pre-action.
        Ok(())
    }

    fn table_stats(&self, class_id: u64) -> Result<TableStats, FlexiError> {
        let row_count: i64 = self.db.with(|conn| {
            conn.query_row(r#"SELECT COUNT(*) FROM "[.objects]" WHERE ClassID = ?1"#, params![class_id as i64], |row| row.get(0))
        })?;
        Ok(TableStats { row_count: row_count as u64, byte_size: 0 })
    }

    fn write_class_definition(&mut self, class_id: u64, data_json: &str, ctlo_mask: u8) -> Result<(), FlexiError> {
        self.db.with_mut(|conn| {
            conn.execute(r#"UPDATE "[.classes]" SET Data = ?1, ctloMask = ?2 WHERE ClassID = ?3"#, params![data_json, ctlo_mask as i64, class_id as i64])
        })?;
        Ok(())
    }

    fn bump_user_version(&mut self) -> Result<u64, FlexiError> {
        self.db.bump_user_version()
    }
}
