//! Data validator (spec §4.5): runs a merger-produced row action list
//! against every existing object under a class, enforcing one of three
//! failure policies.

use flexi_diagnostics::{ErrorContext, FlexiError};
use flexi_merger::{RowAction, RowActionKind, RowActionParams};
use flexi_schema::ValidationMode;
use flexi_type_system::TypeCode;
use std::collections::BTreeMap;

/// Default poll interval for the cancellation token (spec §5: "default N =
/// 1024").
pub const DEFAULT_CANCEL_POLL_INTERVAL: u32 = 1024;

/// A single stored attribute value, typed loosely enough to run the row
/// actions against without the validator needing to know the substrate's
/// concrete encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

/// One stored object's values for the properties under validation, keyed by
/// property name.
#[derive(Debug, Clone, Default)]
pub struct ObjectRow {
    pub object_id: i64,
    pub values: BTreeMap<String, ScalarValue>,
}

/// Read-only access to the rows of one class, in ascending `object_id`
/// order (spec §4.5). `flexi-engine` supplies the substrate-backed
/// implementation.
pub trait ObjectReader {
    fn rows(&mut self) -> Result<Box<dyn Iterator<Item = ObjectRow> + '_>, FlexiError>;
}

/// Sink for rows that fail validation under [`ValidationMode::Mark`]
/// (`[.invalid_objects]`, spec §6).
pub trait InvalidObjectSink {
    fn record(&mut self, object_id: i64, prop_name: &str, reason: &str) -> Result<(), FlexiError>;
}

/// Polled once per `N` rows and between actions (spec §5); returning `true`
/// aborts the scan with [`FlexiError::Cancelled`].
pub trait CancellationToken {
    fn is_cancelled(&self) -> bool;
}

impl CancellationToken for () {
    fn is_cancelled(&self) -> bool {
        false
    }
}

fn check_one(action: &RowAction, value: &ScalarValue) -> Result<(), String> {
    match (&action.kind, &action.params) {
        (RowActionKind::CheckType, RowActionParams::TargetType(target)) => check_type(*target, value),
        (RowActionKind::CheckType, RowActionParams::RoleRequired(role)) => {
            if matches!(value, ScalarValue::Null) {
                Err(format!("role {role:?} requires a non-null value"))
            } else {
                Ok(())
            }
        }
        (RowActionKind::CheckRange, RowActionParams::Range { min, max }) => check_range(*min, *max, value),
        (RowActionKind::CheckLength, RowActionParams::Length(max_length)) => check_length(*max_length, value),
        (RowActionKind::CheckRegex, RowActionParams::Regex(pattern)) => check_regex(pattern, value),
        (RowActionKind::CheckEnum, RowActionParams::EnumValues(values)) => check_enum(values, value),
        (RowActionKind::CheckRef, _) | (RowActionKind::NormalizeRef, _) | (RowActionKind::NormalizeEnum, _) => Ok(()),
        _ => Ok(()),
    }
}

fn check_type(target: TypeCode, value: &ScalarValue) -> Result<(), String> {
    if matches!(value, ScalarValue::Null) {
        return Ok(());
    }
    let compatible = match (target, value) {
        (TypeCode::Integer, ScalarValue::Integer(_)) => true,
        (TypeCode::Integer, ScalarValue::Float(f)) => f.fract() == 0.0,
        (TypeCode::Number | TypeCode::Decimal, ScalarValue::Integer(_) | ScalarValue::Float(_)) => true,
        (TypeCode::Text | TypeCode::Name | TypeCode::Enum, ScalarValue::Text(_)) => true,
        (TypeCode::Boolean, ScalarValue::Bool(_)) => true,
        (TypeCode::Any, _) => true,
        _ => false,
    };
    if compatible {
        Ok(())
    } else {
        Err(format!("value is not compatible with target type {target:?}"))
    }
}

fn as_f64(value: &ScalarValue) -> Option<f64> {
    match value {
        ScalarValue::Integer(i) => Some(*i as f64),
        ScalarValue::Float(f) => Some(*f),
        _ => None,
    }
}

fn check_range(min: Option<f64>, max: Option<f64>, value: &ScalarValue) -> Result<(), String> {
    let Some(n) = as_f64(value) else { return Ok(()) };
    if let Some(min) = min {
        if n < min {
            return Err(format!("{n} is below minimum {min}"));
        }
    }
    if let Some(max) = max {
        if n > max {
            return Err(format!("{n} is above maximum {max}"));
        }
    }
    Ok(())
}

fn check_length(max_length: u32, value: &ScalarValue) -> Result<(), String> {
    if max_length == 0 {
        return Ok(());
    }
    if let ScalarValue::Text(s) = value {
        if s.chars().count() as u32 > max_length {
            return Err(format!("text exceeds max_length {max_length}"));
        }
    }
    Ok(())
}

/// Compiles `pattern` fresh on every call; `validate` runs this once per row
/// per `CheckRegex` action, so a pattern is recompiled for every row that
/// carries a value for the property it guards.
fn check_regex(pattern: &str, value: &ScalarValue) -> Result<(), String> {
    let ScalarValue::Text(s) = value else { return Ok(()) };
    let re = regex::Regex::new(pattern).map_err(|e| format!("invalid regex {pattern:?}: {e}"))?;
    if re.is_match(s) {
        Ok(())
    } else {
        Err(format!("value does not match regex {pattern:?}"))
    }
}

fn check_enum(values: &[String], value: &ScalarValue) -> Result<(), String> {
    let ScalarValue::Text(s) = value else { return Ok(()) };
    if values.iter().any(|v| v == s) {
        Ok(())
    } else {
        Err(format!("{s:?} is not one of the declared enum values"))
    }
}

/// Runs `actions` against every row `reader` yields, per spec §4.5. Returns
/// `Ok(())` when the mode allows the operation to proceed (`Mark` still
/// surfaces `ConstraintViolation` if anything failed).
pub fn validate(
    class_name: &str,
    actions: &[RowAction],
    mode: ValidationMode,
    reader: &mut dyn ObjectReader,
    sink: &mut dyn InvalidObjectSink,
    cancel: &dyn CancellationToken,
    poll_interval: u32,
) -> Result<(), FlexiError> {
    if actions.is_empty() {
        return Ok(());
    }
    tracing::debug!(class_name, action_count = actions.len(), ?mode, "starting data validation scan");
    let poll_interval = poll_interval.max(1);
    let mut scanned: u32 = 0;
    let mut any_failure = false;

    for object_row in reader.rows()? {
        scanned += 1;
        if scanned % poll_interval == 0 && cancel.is_cancelled() {
            return Err(FlexiError::Cancelled {
                context: ErrorContext::class(class_name).with_object(object_row.object_id),
            });
        }

        for action in actions {
            let Some(value) = object_row.values.get(&action.prop_name) else { continue };
            if let Err(reason) = check_one(action, value) {
                match mode {
                    ValidationMode::Abort => {
                        return Err(FlexiError::ConstraintViolation {
                            reason,
                            context: ErrorContext::class(class_name)
                                .with_prop(&action.prop_name)
                                .with_object(object_row.object_id),
                        });
                    }
                    ValidationMode::Ignore => {
                        return Err(FlexiError::ConstraintViolation {
                            reason,
                            context: ErrorContext::class(class_name)
                                .with_prop(&action.prop_name)
                                .with_object(object_row.object_id),
                        });
                    }
                    ValidationMode::Mark => {
                        any_failure = true;
                        sink.record(object_row.object_id, &action.prop_name, &reason)?;
                    }
                }
            }
        }
    }

    if mode == ValidationMode::Mark && any_failure {
        return Err(FlexiError::ConstraintViolation {
            reason: "one or more rows failed validation; see [.invalid_objects]".to_string(),
            context: ErrorContext::class(class_name),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FixedReader {
        rows: Vec<ObjectRow>,
    }
    impl ObjectReader for FixedReader {
        fn rows(&mut self) -> Result<Box<dyn Iterator<Item = ObjectRow> + '_>, FlexiError> {
            Ok(Box::new(self.rows.clone().into_iter()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        recorded: Vec<(i64, String, String)>,
    }
    impl InvalidObjectSink for RecordingSink {
        fn record(&mut self, object_id: i64, prop_name: &str, reason: &str) -> Result<(), FlexiError> {
            self.recorded.push((object_id, prop_name.to_string(), reason.to_string()));
            Ok(())
        }
    }

    fn row(id: i64, prop: &str, value: ScalarValue) -> ObjectRow {
        let mut values = BTreeMap::new();
        values.insert(prop.to_string(), value);
        ObjectRow { object_id: id, values }
    }

    fn check_type_action(prop: &str, target: TypeCode) -> RowAction {
        RowAction { prop_name: prop.to_string(), kind: RowActionKind::CheckType, params: RowActionParams::TargetType(target) }
    }

    #[test]
    fn abort_mode_stops_at_first_failure() {
        let mut reader = FixedReader {
            rows: vec![
                row(1, "age", ScalarValue::Float(1.0)),
                row(2, "age", ScalarValue::Float(2.5)),
                row(3, "age", ScalarValue::Float(3.0)),
            ],
        };
        let mut sink = RecordingSink::default();
        let actions = vec![check_type_action("age", TypeCode::Integer)];
        let err = validate("Person", &actions, ValidationMode::Abort, &mut reader, &mut sink, &(), 1024).unwrap_err();
        match err {
            FlexiError::ConstraintViolation { context, .. } => assert_eq!(context.object_id, Some(2)),
            other => panic!("expected ConstraintViolation, got {other:?}"),
        }
        assert!(sink.recorded.is_empty());
    }

    #[test]
    fn mark_mode_scans_every_row_and_records_failures() {
        let mut reader = FixedReader {
            rows: vec![
                row(1, "age", ScalarValue::Float(1.0)),
                row(2, "age", ScalarValue::Float(2.5)),
                row(3, "age", ScalarValue::Float(3.5)),
            ],
        };
        let mut sink = RecordingSink::default();
        let actions = vec![check_type_action("age", TypeCode::Integer)];
        let err = validate("Person", &actions, ValidationMode::Mark, &mut reader, &mut sink, &(), 1024).unwrap_err();
        assert!(matches!(err, FlexiError::ConstraintViolation { .. }));
        assert_eq!(sink.recorded.len(), 2);
    }

    #[test]
    fn all_rows_passing_is_ok() {
        let mut reader = FixedReader { rows: vec![row(1, "age", ScalarValue::Integer(1))] };
        let mut sink = RecordingSink::default();
        let actions = vec![check_type_action("age", TypeCode::Integer)];
        assert!(validate("Person", &actions, ValidationMode::Abort, &mut reader, &mut sink, &(), 1024).is_ok());
    }

    #[test]
    fn no_actions_short_circuits_without_touching_the_reader() {
        let mut reader = FixedReader { rows: vec![row(1, "age", ScalarValue::Float(99.9))] };
        let mut sink = RecordingSink::default();
        assert!(validate("Person", &[], ValidationMode::Abort, &mut reader, &mut sink, &(), 1024).is_ok());
    }

    struct AlwaysCancelled;
    impl CancellationToken for AlwaysCancelled {
        fn is_cancelled(&self) -> bool {
            true
        }
    }

    #[test]
    fn cancellation_is_polled_at_the_configured_interval() {
        let mut reader = FixedReader { rows: vec![row(1, "age", ScalarValue::Integer(1)); 3] };
        let mut sink = RecordingSink::default();
        let actions = vec![check_type_action("age", TypeCode::Integer)];
        let err = validate("Person", &actions, ValidationMode::Abort, &mut reader, &mut sink, &AlwaysCancelled, 1).unwrap_err();
        assert!(matches!(err, FlexiError::Cancelled { .. }));
    }

    #[test]
    fn range_check_flags_out_of_bounds_values() {
        let action = RowAction {
            prop_name: "score".to_string(),
            kind: RowActionKind::CheckRange,
            params: RowActionParams::Range { min: Some(0.0), max: Some(10.0) },
        };
        assert!(check_one(&action, &ScalarValue::Float(5.0)).is_ok());
        assert!(check_one(&action, &ScalarValue::Float(15.0)).is_err());
    }

    #[test]
    fn regex_check_supports_anchored_patterns() {
        let action = RowAction {
            prop_name: "code".to_string(),
            kind: RowActionKind::CheckRegex,
            params: RowActionParams::Regex("^AB".to_string()),
        };
        assert!(check_one(&action, &ScalarValue::Text("ABC".to_string())).is_ok());
        assert!(check_one(&action, &ScalarValue::Text("XAB".to_string())).is_err());
    }
}
