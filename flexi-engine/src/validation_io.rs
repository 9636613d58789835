//! Row source and failure sink the data validator runs against during
//! `alter` (spec §4.5). Backed by the minimal `[.object_values]` table —
//! spec §1 places the real query/row layer out of scope, so this is just
//! enough storage to drive the validator's contract end-to-end.

use crate::db::Db;
use flexi_diagnostics::FlexiError;
use flexi_validator::{InvalidObjectSink, ObjectReader, ObjectRow, ScalarValue};
use rusqlite::params;
use std::collections::BTreeMap;

fn scalar_from_json(text: Option<String>) -> ScalarValue {
    let Some(text) = text else { return ScalarValue::Null };
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(serde_json::Value::Null) => ScalarValue::Null,
        Ok(serde_json::Value::Bool(b)) => ScalarValue::Bool(b),
        Ok(serde_json::Value::String(s)) => ScalarValue::Text(s),
        Ok(serde_json::Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Integer(i)
            } else {
                ScalarValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        _ => ScalarValue::Null,
    }
}

fn scalar_to_json(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Null => "null".to_string(),
        ScalarValue::Text(s) => serde_json::Value::String(s.clone()).to_string(),
        ScalarValue::Integer(i) => i.to_string(),
        ScalarValue::Float(f) => f.to_string(),
        ScalarValue::Bool(b) => b.to_string(),
    }
}

pub struct SqliteObjectReader {
    db: Db,
    class_id: u64,
}

impl SqliteObjectReader {
    pub fn new(db: Db, class_id: u64) -> Self {
        Self { db, class_id }
    }

    pub fn put(&self, object_id: i64, prop_name: &str, value: &ScalarValue) -> Result<(), FlexiError> {
        self.db.with_mut(|conn| {
            conn.execute(
                r#"INSERT INTO "[.object_values]" (ObjectID, ClassID, PropName, ValueJson) VALUES (?1, ?2, ?3, ?4)
                   ON CONFLICT(ObjectID, PropName) DO UPDATE SET ValueJson = excluded.ValueJson"#,
                params![object_id, self.class_id as i64, prop_name, scalar_to_json(value)],
            )?;
            conn.execute(
                r#"INSERT OR IGNORE INTO "[.objects]" (ObjectID, ClassID) VALUES (?1, ?2)"#,
                params![object_id, self.class_id as i64],
            )?;
            Ok(())
        })?;
        Ok(())
    }
}

impl ObjectReader for SqliteObjectReader {
    fn rows(&mut self) -> Result<Box<dyn Iterator<Item = ObjectRow> + '_>, FlexiError> {
        let rows: Vec<(i64, String, Option<String>)> = self.db.with(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"SELECT ObjectID, PropName, ValueJson FROM "[.object_values]" WHERE ClassID = ?1 ORDER BY ObjectID"#,
            )?;
            let mapped = stmt.query_map(params![self.class_id as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?))
            })?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut by_object: BTreeMap<i64, BTreeMap<String, ScalarValue>> = BTreeMap::new();
        for (object_id, prop_name, value_json) in rows {
            by_object.entry(object_id).or_default().insert(prop_name, scalar_from_json(value_json));
        }
        let objects: Vec<ObjectRow> = by_object.into_iter().map(|(object_id, values)| ObjectRow { object_id, values }).collect();
        Ok(Box::new(objects.into_iter()))
    }
}

pub struct SqliteInvalidObjectSink {
    db: Db,
    class_id: u64,
}

impl SqliteInvalidObjectSink {
    pub fn new(db: Db, class_id: u64) -> Self {
        Self { db, class_id }
    }
}

impl InvalidObjectSink for SqliteInvalidObjectSink {
    fn record(&mut self, object_id: i64, prop_name: &str, reason: &str) -> Result<(), FlexiError> {
        self.db.with_mut(|conn| {
            conn.execute(
                r#"INSERT INTO "[.invalid_objects]" (ClassID, ObjectID, Reason) VALUES (?1, ?2, ?3)"#,
                params![self.class_id as i64, object_id, format!("{prop_name}: {reason}")],
            )
        })?;
        Ok(())
    }
}
