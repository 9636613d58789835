//! Schema merger (spec §4.4): diffs an old class definition against a new
//! one, classifies every property, and emits a typed action plan for the
//! applier and data validator to execute.

use flexi_diagnostics::{ErrorContext, FlexiError};
use flexi_schema::{ChangeStatus, ClassDef, MetadataRef, PropRole, ValidationMode};
use flexi_type_system::{oracle, Transition, TypeCode};
use std::collections::HashSet;

/// Index teardown scheduled to run before the data scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreAction {
    /// Tear down whichever index entries currently exist for this property
    /// (unique, ordered, and/or full-text — whatever its old flags say).
    DropIndex { prop_name: String },
    DropRangeIndex,
    DropFtsIndex,
}

/// Work scheduled to run after property rows are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostAction {
    DropProp { prop_name: String },
    BuildRangeIndex,
    BuildFtsIndex,
    NormalizeRef { prop_name: String },
    NormalizeEnum { prop_name: String },
}

/// The eight row-level check/normalize kinds spec §4.5 defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowActionKind {
    CheckType,
    CheckRange,
    CheckLength,
    CheckRegex,
    CheckEnum,
    CheckRef,
    NormalizeRef,
    NormalizeEnum,
}

/// Parameters for a [`RowAction`]; shape depends on `kind`.
#[derive(Debug, Clone, PartialEq)]
pub enum RowActionParams {
    None,
    TargetType(TypeCode),
    Range { min: Option<f64>, max: Option<f64> },
    Length(u32),
    Regex(String),
    EnumValues(Vec<String>),
    RefTarget(MetadataRef),
    /// Role-slot validation is layered on `CheckType` (spec §4.4.3 does not
    /// define a dedicated role-check kind; the eight kinds in §4.5 are
    /// exhaustive).
    RoleRequired(PropRole),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowAction {
    pub prop_name: String,
    pub kind: RowActionKind,
    pub params: RowActionParams,
}

/// A property that moved to a new name in this merge. `new.prop_map` is
/// already keyed by `new_name`; this is how the applier finds the
/// `[.class_properties]` row that still sits under `old_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameProp {
    pub old_name: String,
    pub new_name: String,
}

/// The three action lists produced by one merge (spec §4.4), plus any
/// property renames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionPlan {
    pub pre: Vec<PreAction>,
    pub row: Vec<RowAction>,
    pub post: Vec<PostAction>,
    pub renames: Vec<RenameProp>,
}

/// Result of `merge_class_defs`: the merged definition (which replaces
/// `new`), the action plan, and whether a data scan is required.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: ClassDef,
    pub plan: ActionPlan,
    pub needs_data_scan: bool,
    pub validation_mode: ValidationMode,
}

/// Resolves a mixin's metadata reference to its full class definition.
/// `flexi-engine` supplies the substrate-backed implementation; tests use an
/// in-memory map.
pub trait MixinResolver {
    fn resolve(&self, mixin_ref: &MetadataRef) -> Result<ClassDef, FlexiError>;
}

const SPECIAL_SLOT_ROLES: [Option<PropRole>; 9] = [
    Some(PropRole::Uid),
    Some(PropRole::Name),
    None, // "description" has no corresponding role bit.
    Some(PropRole::Code),
    Some(PropRole::NonUniqId),
    Some(PropRole::CreateTime),
    Some(PropRole::UpdateTime),
    Some(PropRole::AutoUuid),
    Some(PropRole::AutoShortId),
];

fn is_numeric_or_date(t: TypeCode) -> bool {
    matches!(
        t,
        TypeCode::Integer
            | TypeCode::Number
            | TypeCode::Decimal
            | TypeCode::Date
            | TypeCode::DateTime
            | TypeCode::Timespan
            | TypeCode::Any
    )
}

fn is_textual(t: TypeCode) -> bool {
    matches!(t, TypeCode::Text | TypeCode::Name | TypeCode::Any)
}

/// Runs the merge algorithm of spec §4.4 over `old` and `new`, returning the
/// merged definition (which replaces `new`) plus the action plan the
/// applier and data validator must run. Fails fast on the first violated
/// rule; no partial mutation escapes a failed call.
pub fn merge_class_defs(
    old: &ClassDef,
    mut new: ClassDef,
    mode: ValidationMode,
    mixin_resolver: &dyn MixinResolver,
) -> Result<MergeOutcome, FlexiError> {
    let originally_declared: HashSet<String> = new.prop_map.keys().cloned().collect();
    let mut pre = Vec::new();
    let mut post = Vec::new();
    let mut row = Vec::new();
    let mut renames = Vec::new();
    let mut needs_data_scan = false;

    // 1. Copy-forward: properties present in the old definition but absent
    // from the new one survive unchanged.
    for (name, old_prop) in old.prop_map.iter() {
        if !new.prop_map.contains_key(name) {
            let mut carried = old_prop.clone();
            carried.change_status = ChangeStatus::NotModified;
            carried.ref_count += 1;
            new.prop_map.insert(name.clone(), carried);
        }
    }

    // 2. Per-property classification.
    let names: Vec<String> = new.prop_map.keys().cloned().collect();
    for name in names {
        let mut prop = new.prop_map.get(&name).unwrap().clone();
        if matches!(prop.change_status, ChangeStatus::NotModified) {
            continue;
        }
        let ctx = || ErrorContext::class(&new.name_text).with_prop(&name);
        let old_prop = old.prop_map.get(&name).cloned();

        match old_prop {
            None => {
                if matches!(prop.change_status, ChangeStatus::Deleted) {
                    return Err(FlexiError::DropMissing { prop_name: name.clone(), context: ctx() });
                }
                if prop.rename_to.is_some() {
                    return Err(FlexiError::RenameMissing { prop_name: name.clone(), context: ctx() });
                }
                prop.change_status = ChangeStatus::Added;
                prop.check_invariants()
                    .map_err(|message| FlexiError::InvalidProp { message, context: ctx() })?;
            }
            Some(old) => {
                if let Some(rename_to) = prop.rename_to.clone() {
                    flexi_names::validate_identifier(&rename_to)?;
                    if new.prop_map.contains_key(&rename_to) {
                        return Err(FlexiError::AlreadyExists {
                            message: format!("property {rename_to:?} already exists"),
                            context: ctx(),
                        });
                    }
                    prop.change_status = ChangeStatus::Modified;
                    renames.push(RenameProp { old_name: name.clone(), new_name: rename_to.clone() });
                    prop.name_text = rename_to;
                    prop.rename_to = None;
                } else if matches!(prop.change_status, ChangeStatus::Deleted) {
                    post.push(PostAction::DropProp { prop_name: name.clone() });
                    if old.unique || old.indexed || old.full_text {
                        pre.push(PreAction::DropIndex { prop_name: name.clone() });
                    }
                } else if old.prop_type != prop.prop_type {
                    match oracle(old.prop_type, prop.prop_type) {
                        Transition::Yes => prop.change_status = ChangeStatus::Modified,
                        Transition::Maybe => {
                            prop.change_status = ChangeStatus::Modified;
                            prop.needs_validation = true;
                            needs_data_scan = true;
                            row.push(RowAction {
                                prop_name: name.clone(),
                                kind: RowActionKind::CheckType,
                                params: RowActionParams::TargetType(prop.prop_type),
                            });
                        }
                        Transition::Forbidden => {
                            return Err(FlexiError::IncompatibleTypeChange {
                                from: format!("{:?}", old.prop_type),
                                to: format!("{:?}", prop.prop_type),
                                context: ctx(),
                            });
                        }
                    }
                } else {
                    let changed = old.indexed != prop.indexed
                        || old.unique != prop.unique
                        || old.full_text != prop.full_text
                        || old.min_value != prop.min_value
                        || old.max_value != prop.max_value
                        || old.min_occurs != prop.min_occurs
                        || old.max_occurs != prop.max_occurs
                        || old.max_length != prop.max_length
                        || old.regex != prop.regex;
                    prop.change_status = if changed { ChangeStatus::Modified } else { ChangeStatus::NotModified };

                    let min_tightened = prop.min_value > old.min_value;
                    let max_tightened = match (old.max_value, prop.max_value) {
                        (None, Some(_)) => true,
                        (Some(old_max), Some(new_max)) => new_max < old_max,
                        _ => false,
                    };
                    if min_tightened || max_tightened {
                        prop.needs_validation = true;
                        needs_data_scan = true;
                        row.push(RowAction {
                            prop_name: name.clone(),
                            kind: RowActionKind::CheckRange,
                            params: RowActionParams::Range { min: prop.min_value, max: prop.max_value },
                        });
                    }

                    let length_tightened = match (old.max_length, prop.max_length) {
                        (0, new_len) => new_len != 0,
                        (old_len, new_len) => new_len != 0 && new_len < old_len,
                    };
                    if length_tightened {
                        prop.needs_validation = true;
                        needs_data_scan = true;
                        row.push(RowAction {
                            prop_name: name.clone(),
                            kind: RowActionKind::CheckLength,
                            params: RowActionParams::Length(prop.max_length),
                        });
                    }

                    if old.regex != prop.regex {
                        if let Some(pattern) = prop.regex.clone() {
                            prop.needs_validation = true;
                            needs_data_scan = true;
                            row.push(RowAction {
                                prop_name: name.clone(),
                                kind: RowActionKind::CheckRegex,
                                params: RowActionParams::Regex(pattern),
                            });
                        }
                    }
                }

                if !matches!(prop.change_status, ChangeStatus::Deleted) {
                    if prop.prop_type == TypeCode::Reference && old.ref_def != prop.ref_def {
                        prop.needs_validation = true;
                        needs_data_scan = true;
                        row.push(RowAction {
                            prop_name: name.clone(),
                            kind: RowActionKind::NormalizeRef,
                            params: RowActionParams::None,
                        });
                        post.push(PostAction::NormalizeRef { prop_name: name.clone() });
                        if matches!(prop.change_status, ChangeStatus::NotModified) {
                            prop.change_status = ChangeStatus::Modified;
                        }
                    }
                    if prop.prop_type == TypeCode::Enum && old.enum_def != prop.enum_def {
                        prop.needs_validation = true;
                        needs_data_scan = true;
                        row.push(RowAction {
                            prop_name: name.clone(),
                            kind: RowActionKind::NormalizeEnum,
                            params: RowActionParams::None,
                        });
                        if let Some(enum_def) = prop.enum_def.clone() {
                            row.push(RowAction {
                                prop_name: name.clone(),
                                kind: RowActionKind::CheckEnum,
                                params: RowActionParams::EnumValues(enum_def.items.into_iter().map(|i| i.value).collect()),
                            });
                        }
                        post.push(PostAction::NormalizeEnum { prop_name: name.clone() });
                        if matches!(prop.change_status, ChangeStatus::NotModified) {
                            prop.change_status = ChangeStatus::Modified;
                        }
                    }
                }
            }
        }

        if prop.name_text != name {
            new.prop_map.shift_remove(&name);
            new.prop_map.insert(prop.name_text.clone(), prop);
        } else {
            new.prop_map.insert(name, prop);
        }
    }

    // 3. Role slots.
    for i in 0..9 {
        if new.special_props[i] == old.special_props[i] {
            continue;
        }
        if let Some(role) = SPECIAL_SLOT_ROLES[i] {
            if let Some(old_ref) = old.special_props[i].clone() {
                if let Some(old_name) = old_ref.name.as_ref() {
                    if let Some(p) = new.prop_map.get_mut(old_name) {
                        p.role.remove(role);
                    }
                }
            }
            if let Some(new_ref) = new.special_props[i].clone() {
                let prop_name = new_ref.name.clone().ok_or_else(|| FlexiError::InvalidProp {
                    message: format!("special property slot {i} must reference a property by name"),
                    context: ErrorContext::class(&new.name_text),
                })?;
                let p = new
                    .prop_map
                    .get_mut(&prop_name)
                    .ok_or_else(|| FlexiError::NotFound {
                        message: format!("special property {prop_name:?} not found"),
                        context: ErrorContext::class(&new.name_text),
                    })?;
                p.role.insert(role);
                if flexi_schema::role_implies_unique(p.role) {
                    p.unique = true;
                }
                if p.prop_type != TypeCode::Any {
                    needs_data_scan = true;
                    row.push(RowAction {
                        prop_name: prop_name.clone(),
                        kind: RowActionKind::CheckType,
                        params: RowActionParams::RoleRequired(role),
                    });
                }
            }
        }
    }

    // 4. Range slots: a single R-tree-shaped auxiliary index over up to 5
    // coordinate pairs, rebuilt as a unit whenever any slot changes.
    if new.range_props != old.range_props {
        pre.push(PreAction::DropRangeIndex);
        post.push(PostAction::BuildRangeIndex);
        for slot in new.range_props.iter().flatten() {
            if let Some(prop_name) = &slot.name {
                if let Some(p) = new.prop_map.get(prop_name) {
                    if !is_numeric_or_date(p.prop_type) {
                        return Err(FlexiError::InvalidProp {
                            message: format!("range-indexed property {prop_name:?} must be numeric, date, or any"),
                            context: ErrorContext::class(&new.name_text).with_prop(prop_name),
                        });
                    }
                }
            }
        }
    }

    // 5. FTS slots.
    if new.fts_props != old.fts_props {
        pre.push(PreAction::DropFtsIndex);
        post.push(PostAction::BuildFtsIndex);
        for slot in new.fts_props.iter().flatten() {
            if let Some(prop_name) = &slot.name {
                if let Some(p) = new.prop_map.get(prop_name) {
                    if !is_textual(p.prop_type) {
                        return Err(FlexiError::InvalidProp {
                            message: format!("full-text-indexed property {prop_name:?} must be textual or any"),
                            context: ErrorContext::class(&new.name_text).with_prop(prop_name),
                        });
                    }
                }
            }
        }
    }

    // 6. Mixins.
    if !new.mixins_specified {
        new.mixins = old.mixins.clone();
        new.mixins_specified = old.mixins_specified;
    } else {
        for mixin_ref in new.mixins.clone() {
            let mixin_class = mixin_resolver.resolve(&mixin_ref)?;
            for (prop_name, mixin_prop) in mixin_class.prop_map.iter() {
                if new.prop_map.contains_key(prop_name) {
                    if originally_declared.contains(prop_name) {
                        return Err(FlexiError::MixinConflict {
                            prop_name: prop_name.clone(),
                            message: format!(
                                "property {prop_name:?} is both declared directly and inherited from mixin {:?}",
                                mixin_class.name_text
                            ),
                            context: ErrorContext::class(&new.name_text),
                        });
                    }
                    continue;
                }
                let mut cloned = mixin_prop.clone();
                cloned.change_status = ChangeStatus::Added;
                cloned.ref_count += 1;
                new.prop_map.insert(prop_name.clone(), cloned);
            }
        }
    }

    Ok(MergeOutcome { merged: new, plan: ActionPlan { pre, row, post, renames }, needs_data_scan, validation_mode: mode })
}
