//! Schema applier (spec §4.6): commits a merge outcome under an exclusive
//! logical lock on `class_id` — pre-actions, optional data validation,
//! property persistence, `ctlv`/`ctlvPlan` recomputation, post-actions,
//! then the version-bump commit point.

use flexi_diagnostics::FlexiError;
use flexi_merger::{MergeOutcome, PostAction, PreAction};
use flexi_schema::{ChangeStatus, ClassDef, ClassFlag, ClassFlagSet, PropFlag, PropFlagSet, PropertyDef};
use flexi_validator::{CancellationToken, InvalidObjectSink, ObjectReader};

/// Row-count / on-disk-size heuristic gating deferred index materialisation
/// (spec §4.6.4). Defaults per `SPEC_FULL.md` §B: 5000 rows or 4 MiB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexThreshold {
    pub rows: u64,
    pub bytes: u64,
}

impl Default for IndexThreshold {
    fn default() -> Self {
        IndexThreshold { rows: 5_000, bytes: 4 * 1024 * 1024 }
    }
}

/// Current size of the class's object table, as reported by the substrate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    pub row_count: u64,
    pub byte_size: u64,
}

/// What to do with one property row in `[.class_properties]`.
#[derive(Debug, Clone)]
pub enum PropertyPersist {
    Insert,
    Update,
    Delete,
    Rename { old_name: String },
}

/// The durable state the applier mutates. `flexi-engine` supplies the
/// `rusqlite`-backed implementation; this crate only depends on the
/// contract.
pub trait Substrate {
    fn run_pre_action(&mut self, class_id: u64, action: &PreAction) -> Result<(), FlexiError>;
    fn persist_property(
        &mut self,
        class_id: u64,
        prop: &PropertyDef,
        persist: PropertyPersist,
        ctlv: PropFlagSet,
        ctlv_plan: PropFlagSet,
    ) -> Result<u64, FlexiError>;
    fn run_post_action(&mut self, class_id: u64, action: &PostAction) -> Result<(), FlexiError>;
    fn table_stats(&self, class_id: u64) -> Result<TableStats, FlexiError>;
    fn write_class_definition(&mut self, class_id: u64, data_json: &str, ctlo_mask: u8) -> Result<(), FlexiError>;
    fn bump_user_version(&mut self) -> Result<u64, FlexiError>;
}

/// Result of a successful `apply_merge`.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOutcome {
    pub class_id: u64,
    pub new_user_version: u64,
}

/// Computes `(ctlv, ctlvPlan)` for one property (spec §4.6.4). `ctlvPlan`
/// always records full intent; `ctlv` defers ordered/full-text indexing
/// until the table crosses `threshold`, and additionally withholds the
/// ordered index when `max_length` is declared above 30 (`SPEC_FULL.md`
/// §C.1, grounded in the legacy extension's indexing heuristic).
pub fn compute_ctlv(prop: &PropertyDef, stats: TableStats, threshold: IndexThreshold) -> (PropFlagSet, PropFlagSet) {
    let mut plan = PropFlagSet::empty();
    if prop.unique {
        plan.insert(PropFlag::UniqueIndex);
    }
    if prop.indexed {
        plan.insert(PropFlag::Index);
    }
    if prop.full_text {
        plan.insert(PropFlag::FullTextIndex);
    }

    let mut effective = PropFlagSet::empty();
    if prop.unique {
        effective.insert(PropFlag::UniqueIndex);
    }
    let crossed = stats.row_count >= threshold.rows || stats.byte_size >= threshold.bytes;
    if crossed {
        let short_enough = prop.max_length == 0 || prop.max_length <= 30;
        if prop.indexed && short_enough {
            effective.insert(PropFlag::Index);
        }
        if prop.full_text {
            effective.insert(PropFlag::FullTextIndex);
        }
    }
    (effective, plan)
}

fn compute_ctlo_mask(class: &ClassDef) -> ClassFlagSet {
    let mut mask = ClassFlagSet::empty();
    if class.prop_map.values().any(|p| p.unique) {
        mask.insert(ClassFlag::HasUniqueIndex);
    }
    if class.prop_map.values().any(|p| p.indexed) {
        mask.insert(ClassFlag::HasOrderedIndex);
    }
    if class.fts_props.iter().any(Option::is_some) || class.prop_map.values().any(|p| p.full_text) {
        mask.insert(ClassFlag::HasFts);
    }
    if class.range_props.iter().any(Option::is_some) {
        mask.insert(ClassFlag::HasRange);
    }
    if class.prop_map.values().any(|p| p.ref_def.is_some()) {
        mask.insert(ClassFlag::HasRef);
    }
    if class.ctlo_mask.contains(ClassFlag::SoftDeleted) {
        mask.insert(ClassFlag::SoftDeleted);
    }
    mask
}

/// Commits one merge outcome (spec §4.6). Callers are expected to run this
/// inside a substrate-level savepoint (spec §7): any `Err` means nothing
/// should be committed, including the `Ok` results of earlier steps in this
/// same call, since the applier itself performs no rollback.
#[allow(clippy::too_many_arguments)]
pub fn apply_merge(
    outcome: &MergeOutcome,
    threshold: IndexThreshold,
    substrate: &mut dyn Substrate,
    reader: &mut dyn ObjectReader,
    sink: &mut dyn InvalidObjectSink,
    cancel: &dyn CancellationToken,
    poll_interval: u32,
) -> Result<ApplyOutcome, FlexiError> {
    let class_id = outcome.merged.class_id.ok_or_else(|| FlexiError::SubstrateError {
        message: "apply_merge requires a class_id assigned before apply".to_string(),
        context: Default::default(),
    })?;

    tracing::debug!(class_id, needs_data_scan = outcome.needs_data_scan, "applying merge outcome");

    for action in &outcome.plan.pre {
        substrate.run_pre_action(class_id, action)?;
    }

    if outcome.needs_data_scan {
        flexi_validator::validate(
            &outcome.merged.name_text,
            &outcome.plan.row,
            outcome.validation_mode,
            reader,
            sink,
            cancel,
            poll_interval,
        )?;
    }

    let renamed_from: std::collections::HashMap<&str, &str> =
        outcome.plan.renames.iter().map(|r| (r.new_name.as_str(), r.old_name.as_str())).collect();

    let stats = substrate.table_stats(class_id)?;
    for (name, prop) in outcome.merged.prop_map.iter() {
        let (ctlv, ctlv_plan) = compute_ctlv(prop, stats, threshold);
        let persist = match prop.change_status {
            ChangeStatus::NotModified => continue,
            ChangeStatus::Added => PropertyPersist::Insert,
            ChangeStatus::Modified => match renamed_from.get(name.as_str()) {
                Some(old_name) => PropertyPersist::Rename { old_name: old_name.to_string() },
                None => PropertyPersist::Update,
            },
            ChangeStatus::Deleted => PropertyPersist::Delete,
        };
        substrate.persist_property(class_id, prop, persist, ctlv, ctlv_plan)?;
    }

    for action in &outcome.plan.post {
        substrate.run_post_action(class_id, action)?;
    }

    let ctlo_mask = compute_ctlo_mask(&outcome.merged);
    let data_json = flexi_schema_parser::serialize_class_def(&outcome.merged)?;
    substrate.write_class_definition(class_id, &data_json, ctlo_mask.bits())?;

    let new_user_version = substrate.bump_user_version()?;

    Ok(ApplyOutcome { class_id, new_user_version })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexi_merger::ActionPlan;
    use flexi_names::{InMemoryNameDictionary, NameStore};
    use flexi_schema::ValidationMode;
    use flexi_type_system::TypeCode;
    use flexi_validator::ObjectRow;

    #[derive(Default)]
    struct FakeSubstrate {
        pre_actions: Vec<PreAction>,
        post_actions: Vec<PostAction>,
        persisted: Vec<(String, PropertyPersist)>,
        stats: TableStats,
        written_json: Option<String>,
        written_ctlo: Option<u8>,
        version: u64,
    }

    impl Substrate for FakeSubstrate {
        fn run_pre_action(&mut self, _class_id: u64, action: &PreAction) -> Result<(), FlexiError> {
            self.pre_actions.push(action.clone());
            Ok(())
        }
        fn persist_property(
            &mut self,
            _class_id: u64,
            prop: &PropertyDef,
            persist: PropertyPersist,
            _ctlv: PropFlagSet,
            _ctlv_plan: PropFlagSet,
        ) -> Result<u64, FlexiError> {
            self.persisted.push((prop.name_text.clone(), persist));
            Ok(1)
        }
        fn run_post_action(&mut self, _class_id: u64, action: &PostAction) -> Result<(), FlexiError> {
            self.post_actions.push(action.clone());
            Ok(())
        }
        fn table_stats(&self, _class_id: u64) -> Result<TableStats, FlexiError> {
            Ok(self.stats)
        }
        fn write_class_definition(&mut self, _class_id: u64, data_json: &str, ctlo_mask: u8) -> Result<(), FlexiError> {
            self.written_json = Some(data_json.to_string());
            self.written_ctlo = Some(ctlo_mask);
            Ok(())
        }
        fn bump_user_version(&mut self) -> Result<u64, FlexiError> {
            self.version += 1;
            Ok(self.version)
        }
    }

    struct EmptyReader;
    impl ObjectReader for EmptyReader {
        fn rows(&mut self) -> Result<Box<dyn Iterator<Item = ObjectRow> + '_>, FlexiError> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    #[derive(Default)]
    struct NoopSink;
    impl InvalidObjectSink for NoopSink {
        fn record(&mut self, _object_id: i64, _prop_name: &str, _reason: &str) -> Result<(), FlexiError> {
            Ok(())
        }
    }

    fn prop(names: &mut impl NameStore, name: &str, status: ChangeStatus) -> PropertyDef {
        PropertyDef {
            name: names.insert_name(name).unwrap(),
            name_text: name.to_string(),
            prop_type: TypeCode::Text,
            rename_to: None,
            change_status: status,
            indexed: false,
            unique: false,
            full_text: false,
            role: Default::default(),
            min_value: None,
            max_value: None,
            min_occurs: 0,
            max_occurs: 1,
            max_length: 0,
            regex: None,
            ref_def: None,
            enum_def: None,
            needs_validation: false,
            ref_count: 0,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn ctlv_materialises_unique_immediately_but_defers_ordered_index() {
        let mut names = InMemoryNameDictionary::new();
        let mut p = prop(&mut names, "title", ChangeStatus::Added);
        p.unique = true;
        p.indexed = true;
        let (ctlv, ctlv_plan) = compute_ctlv(&p, TableStats::default(), IndexThreshold::default());
        assert!(ctlv.contains(PropFlag::UniqueIndex));
        assert!(!ctlv.contains(PropFlag::Index));
        assert!(ctlv_plan.contains(PropFlag::Index));
    }

    #[test]
    fn ctlv_materialises_ordered_index_once_threshold_crossed() {
        let mut names = InMemoryNameDictionary::new();
        let mut p = prop(&mut names, "title", ChangeStatus::Added);
        p.indexed = true;
        let stats = TableStats { row_count: 6_000, byte_size: 0 };
        let (ctlv, _) = compute_ctlv(&p, stats, IndexThreshold::default());
        assert!(ctlv.contains(PropFlag::Index));
    }

    #[test]
    fn ctlv_withholds_ordered_index_for_long_declared_max_length() {
        let mut names = InMemoryNameDictionary::new();
        let mut p = prop(&mut names, "title", ChangeStatus::Added);
        p.indexed = true;
        p.max_length = 200;
        let stats = TableStats { row_count: 6_000, byte_size: 0 };
        let (ctlv, _) = compute_ctlv(&p, stats, IndexThreshold::default());
        assert!(!ctlv.contains(PropFlag::Index));
    }

    #[test]
    fn apply_merge_runs_steps_in_spec_order_and_bumps_version() {
        let mut names = InMemoryNameDictionary::new();
        let mut class = ClassDef::new(Some(7), names.insert_name("Book").unwrap(), "Book");
        class.prop_map.insert("title".to_string(), prop(&mut names, "title", ChangeStatus::Added));
        class.prop_map.insert("ghost".to_string(), prop(&mut names, "ghost", ChangeStatus::Deleted));

        let outcome = MergeOutcome {
            merged: class,
            plan: ActionPlan {
                pre: vec![PreAction::DropIndex { prop_name: "ghost".to_string() }],
                row: vec![],
                post: vec![PostAction::DropProp { prop_name: "ghost".to_string() }],
                renames: vec![],
            },
            needs_data_scan: false,
            validation_mode: ValidationMode::Abort,
        };

        let mut substrate = FakeSubstrate::default();
        let mut reader = EmptyReader;
        let mut sink = NoopSink;
        let result = apply_merge(&outcome, IndexThreshold::default(), &mut substrate, &mut reader, &mut sink, &(), 1024).unwrap();

        assert_eq!(result.class_id, 7);
        assert_eq!(result.new_user_version, 1);
        assert_eq!(substrate.pre_actions.len(), 1);
        assert_eq!(substrate.post_actions.len(), 1);
        assert_eq!(substrate.persisted.len(), 2);
        assert!(substrate.written_json.is_some());
    }

    #[test]
    fn a_renamed_property_is_persisted_under_its_old_name() {
        let mut names = InMemoryNameDictionary::new();
        let mut class = ClassDef::new(Some(3), names.insert_name("Book").unwrap(), "Book");
        class.prop_map.insert("name".to_string(), prop(&mut names, "name", ChangeStatus::Modified));

        let outcome = MergeOutcome {
            merged: class,
            plan: ActionPlan {
                renames: vec![flexi_merger::RenameProp { old_name: "title".to_string(), new_name: "name".to_string() }],
                ..Default::default()
            },
            needs_data_scan: false,
            validation_mode: ValidationMode::Abort,
        };
        let mut substrate = FakeSubstrate::default();
        let mut reader = EmptyReader;
        let mut sink = NoopSink;
        apply_merge(&outcome, IndexThreshold::default(), &mut substrate, &mut reader, &mut sink, &(), 1024).unwrap();

        assert_eq!(substrate.persisted.len(), 1);
        match &substrate.persisted[0] {
            (name, PropertyPersist::Rename { old_name }) => {
                assert_eq!(name, "name");
                assert_eq!(old_name, "title");
            }
            other => panic!("expected a rename, got {other:?}"),
        }
    }

    #[test]
    fn not_modified_properties_are_never_persisted() {
        let mut names = InMemoryNameDictionary::new();
        let mut class = ClassDef::new(Some(1), names.insert_name("Book").unwrap(), "Book");
        class.prop_map.insert("title".to_string(), prop(&mut names, "title", ChangeStatus::NotModified));

        let outcome = MergeOutcome {
            merged: class,
            plan: ActionPlan::default(),
            needs_data_scan: false,
            validation_mode: ValidationMode::Abort,
        };
        let mut substrate = FakeSubstrate::default();
        let mut reader = EmptyReader;
        let mut sink = NoopSink;
        apply_merge(&outcome, IndexThreshold::default(), &mut substrate, &mut reader, &mut sink, &(), 1024).unwrap();
        assert!(substrate.persisted.is_empty());
    }
}
