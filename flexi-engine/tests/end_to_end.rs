//! End-to-end scenarios against the assembled engine, driven entirely
//! through the public `Context` surface (spec §8).

use flexi_engine::{ClassFlag, Config, Context, FlexiError, ValidationMode};
use flexi_schema_parser::serialize_class_def;
use flexi_type_system::TypeCode;

fn ctx() -> Context {
    let _ = tracing_subscriber::fmt::try_init();
    Context::open_in_memory("tester", Config::default()).unwrap()
}

#[test]
fn create_book_with_fulltext_title() {
    let ctx = ctx();
    assert!(matches!(ctx.get_class_def("Book"), Err(FlexiError::NotFound { .. })));

    ctx.create_class(
        "Book",
        r#"{"properties":{"title":{"rules":{"type":"text","maxLength":200},"index":"fulltext"}}}"#,
        false,
    )
    .unwrap();

    let class = ctx.get_class_def("Book").unwrap();
    let title = class.prop_map.get("title").unwrap();
    assert!(title.full_text);
    assert_eq!(title.prop_type, TypeCode::Text);
}

#[test]
fn compatible_alter_keeps_the_property_id_and_widens_the_type() {
    let ctx = ctx();
    ctx.create_class("Book", r#"{"properties":{"title":{"rules":{"type":"text"}}}}"#, false).unwrap();
    let before_id = ctx.get_class_def("Book").unwrap().prop_map.get("title").unwrap().name;

    ctx.alter_class("Book", r#"{"properties":{"title":{"rules":{"type":"name"}}}}"#, ValidationMode::Abort).unwrap();

    let after = ctx.get_class_def("Book").unwrap();
    let title = after.prop_map.get("title").unwrap();
    assert_eq!(title.name, before_id);
    assert_eq!(title.prop_type, TypeCode::Name);
}

#[test]
fn alter_adds_a_property_and_survives_unmentioned_ones() {
    let ctx = ctx();
    ctx.create_class("Book", r#"{"properties":{"title":{"rules":{"type":"text"}}}}"#, false).unwrap();
    ctx.alter_class("Book", r#"{"properties":{"year":{"rules":{"type":"integer"}}}}"#, ValidationMode::Abort).unwrap();

    let class = ctx.get_class_def("Book").unwrap();
    assert!(class.prop_map.contains_key("title"));
    assert!(class.prop_map.contains_key("year"));
}

#[test]
fn forbidden_alter_reports_both_type_codes_and_leaves_the_property_untouched() {
    let ctx = ctx();
    ctx.create_class("Thing", r#"{"properties":{"x":{"rules":{"type":"binary"}}}}"#, false).unwrap();

    let err = ctx.alter_class("Thing", r#"{"properties":{"x":{"rules":{"type":"integer"}}}}"#, ValidationMode::Abort).unwrap_err();
    match err {
        FlexiError::IncompatibleTypeChange { from, to, .. } => {
            assert_eq!(from, "Binary");
            assert_eq!(to, "Integer");
        }
        other => panic!("expected IncompatibleTypeChange, got {other:?}"),
    }
    assert_eq!(ctx.get_class_def("Thing").unwrap().prop_map.get("x").unwrap().prop_type, TypeCode::Binary);
}

#[test]
fn rename_alter_changes_the_property_name_but_not_its_id() {
    let ctx = ctx();
    ctx.create_class("Book", r#"{"properties":{"title":{"rules":{"type":"text"}}}}"#, false).unwrap();
    let before_id = ctx.get_class_def("Book").unwrap().prop_map.get("title").unwrap().name;

    ctx.alter_class("Book", r#"{"properties":{"title":{"rules":{"type":"text"},"$renameTo":"name"}}}"#, ValidationMode::Abort).unwrap();

    let after = ctx.get_class_def("Book").unwrap();
    assert!(!after.prop_map.contains_key("title"));
    assert_eq!(after.prop_map.get("name").unwrap().name, before_id);
}

#[test]
fn drop_missing_property_fails_and_leaves_the_class_untouched() {
    let ctx = ctx();
    ctx.create_class("Book", r#"{"properties":{"title":{"rules":{"type":"text"}}}}"#, false).unwrap();
    let err = ctx.alter_class("Book", r#"{"properties":{"ghost":{"rules":{"type":"text"},"$drop":true}}}"#, ValidationMode::Abort).unwrap_err();
    assert!(matches!(err, FlexiError::DropMissing { .. }));
    assert!(ctx.get_class_def("Book").unwrap().prop_map.contains_key("title"));
}

#[test]
fn mixin_properties_are_inherited_into_the_host_class() {
    let ctx = ctx();
    ctx.create_class("Audit", r#"{"properties":{"createdAt":{"rules":{"type":"datetime"}}}}"#, false).unwrap();
    ctx.create_class("Doc", r#"{"mixins":[{"name":"Audit"}],"properties":{"title":{"rules":{"type":"text"}}}}"#, false).unwrap();

    let doc = ctx.get_class_def("Doc").unwrap();
    assert!(doc.prop_map.contains_key("createdAt"));
    assert!(doc.prop_map.contains_key("title"));
}

#[test]
fn mixin_conflict_with_a_directly_declared_property_fails() {
    let ctx = ctx();
    ctx.create_class("Audit", r#"{"properties":{"marker":{"rules":{"type":"text"}}}}"#, false).unwrap();

    let err = ctx
        .create_class(
            "Doc",
            r#"{"mixins":[{"name":"Audit"}],"properties":{"marker":{"rules":{"type":"binary"}}}}"#,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, FlexiError::MixinConflict { .. }));
    assert!(ctx.get_class_def("Doc").is_err());
}

#[test]
fn rename_class_keeps_the_same_class_id_and_round_trips() {
    let ctx = ctx();
    let class_id = ctx.create_class("Book", r#"{"properties":{}}"#, false).unwrap();

    ctx.rename_class("Book", "Novel").unwrap();
    assert!(ctx.get_class_def("Book").is_err());
    assert_eq!(ctx.get_class_def("Novel").unwrap().class_id, Some(class_id));

    ctx.rename_class("Novel", "Book").unwrap();
    assert!(ctx.get_class_def("Novel").is_err());
    assert_eq!(ctx.get_class_def("Book").unwrap().class_id, Some(class_id));
}

#[test]
fn renaming_onto_an_existing_class_fails() {
    let ctx = ctx();
    ctx.create_class("Book", r#"{"properties":{}}"#, false).unwrap();
    ctx.create_class("Novel", r#"{"properties":{}}"#, false).unwrap();
    let err = ctx.rename_class("Book", "Novel").unwrap_err();
    assert!(matches!(err, FlexiError::AlreadyExists { .. }));
}

#[test]
fn drop_missing_class_fails() {
    let ctx = ctx();
    let err = ctx.drop_class("Ghost", true).unwrap_err();
    assert!(matches!(err, FlexiError::NotFound { .. }));
}

#[test]
fn soft_drop_flags_the_class_row_and_hard_drop_frees_the_name() {
    let ctx = ctx();
    ctx.create_class("Book", r#"{"properties":{}}"#, false).unwrap();

    ctx.drop_class("Book", true).unwrap();
    let class = ctx.get_class_def("Book").unwrap();
    assert!(class.ctlo_mask.contains(ClassFlag::SoftDeleted));

    ctx.drop_class("Book", false).unwrap();
    assert!(ctx.get_class_def("Book").is_err());

    // The name is free again after a hard drop.
    ctx.create_class("Book", r#"{"properties":{"title":{"rules":{"type":"text"}}}}"#, false).unwrap();
    assert!(ctx.get_class_def("Book").unwrap().prop_map.contains_key("title"));
}

#[test]
fn re_altering_with_the_current_definition_is_a_no_op() {
    let ctx = ctx();
    ctx.create_class("Book", r#"{"properties":{"title":{"rules":{"type":"text"},"index":"unique"}}}"#, false).unwrap();
    let before = ctx.get_class_def("Book").unwrap();
    let current_json = serialize_class_def(&before).unwrap();

    ctx.alter_class("Book", &current_json, ValidationMode::Abort).unwrap();

    let after = ctx.get_class_def("Book").unwrap();
    assert_eq!(after.prop_map.keys().collect::<Vec<_>>(), before.prop_map.keys().collect::<Vec<_>>());
    for (name, prop) in &before.prop_map {
        let again = after.prop_map.get(name).unwrap();
        assert_eq!(again.prop_type, prop.prop_type);
        assert_eq!(again.unique, prop.unique);
        assert_eq!(again.name, prop.name);
    }
}

#[test]
fn a_class_recreated_after_a_hard_drop_starts_with_a_clean_slate() {
    let ctx = ctx();
    ctx.create_class("Widget", r#"{"properties":{"weight":{"rules":{"type":"number"}}}}"#, false).unwrap();
    ctx.drop_class("Widget", false).unwrap();

    ctx.create_class("Widget", r#"{"properties":{"color":{"rules":{"type":"text"}}}}"#, false).unwrap();
    let reborn = ctx.get_class_def("Widget").unwrap();
    assert!(reborn.prop_map.contains_key("color"));
    assert!(!reborn.prop_map.contains_key("weight"));
}
