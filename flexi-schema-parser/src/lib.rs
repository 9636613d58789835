//! Definition parser (spec §4.2): JSON class-definition wire format ⇄
//! [`flexi_schema::ClassDef`].

use flexi_diagnostics::{Diagnostics, ErrorContext, FlexiError, Warning};
use flexi_names::NameStore;
use flexi_schema::{
    ChangeStatus, ClassDef, EnumDef, EnumItem, MetadataRef, PropertyDef, RefDef,
    FTS_PROP_SLOTS, RANGE_PROP_SLOTS, SPECIAL_PROP_SLOTS,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A metadata reference as it appears on the wire: either a bare name
/// string or an explicit `{"id": ..}` / `{"name": ..}` object.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum MetaRefJson {
    Name(String),
    Object {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl From<&MetaRefJson> for MetadataRef {
    fn from(v: &MetaRefJson) -> Self {
        match v {
            MetaRefJson::Name(name) => MetadataRef::by_name(name.clone()),
            MetaRefJson::Object { id, name } => MetadataRef { id: *id, name: name.clone() },
        }
    }
}

fn meta_ref_to_json(r: &MetadataRef) -> MetaRefJson {
    match (&r.id, &r.name) {
        (None, Some(name)) => MetaRefJson::Name(name.clone()),
        (id, name) => MetaRefJson::Object { id: *id, name: name.clone() },
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RulesJson {
    #[serde(rename = "type")]
    type_token: String,
    #[serde(rename = "maxLength", default, skip_serializing_if = "Option::is_none")]
    max_length: Option<u32>,
    #[serde(rename = "minValue", default, skip_serializing_if = "Option::is_none")]
    min_value: Option<f64>,
    #[serde(rename = "maxValue", default, skip_serializing_if = "Option::is_none")]
    max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regex: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum IndexKind {
    None,
    Index,
    Unique,
    Fulltext,
    Range,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct EnumItemJson {
    value: String,
    label: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RefDefJson {
    #[serde(rename = "classRef")]
    class_ref: MetaRefJson,
    #[serde(rename = "reverseProperty", default, skip_serializing_if = "Option::is_none")]
    reverse_property: Option<MetaRefJson>,
    #[serde(rename = "minOccurences", default)]
    min_occurs: u32,
    #[serde(rename = "maxOccurences", default = "default_max_occurs")]
    max_occurs: u32,
}

fn default_max_occurs() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct PropDefJson {
    rules: RulesJson,
    #[serde(default = "default_index_kind")]
    index: IndexKind,
    #[serde(rename = "noTrackChanges", default)]
    #[allow(dead_code)]
    no_track_changes: bool,
    #[serde(rename = "minOccurences", default)]
    min_occurs: u32,
    #[serde(rename = "maxOccurences", default = "default_max_occurs")]
    max_occurs: u32,
    #[serde(rename = "enumDef", default, skip_serializing_if = "Option::is_none")]
    enum_def: Option<Vec<EnumItemJson>>,
    #[serde(rename = "refDef", default, skip_serializing_if = "Option::is_none")]
    ref_def: Option<RefDefJson>,
    #[serde(rename = "$renameTo", default, skip_serializing_if = "Option::is_none")]
    rename_to: Option<String>,
    #[serde(rename = "$drop", default, skip_serializing_if = "std::ops::Not::not")]
    drop: bool,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn default_index_kind() -> IndexKind {
    IndexKind::None
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct ClassDefJson {
    #[serde(rename = "allowAnyProps", default)]
    allow_any_props: bool,
    #[serde(default)]
    properties: BTreeMap<String, PropDefJson>,
    #[serde(rename = "specialProperties", default, skip_serializing_if = "Option::is_none")]
    special_properties: Option<BTreeMap<String, MetaRefJson>>,
    #[serde(rename = "rangeIndexing", default, skip_serializing_if = "Option::is_none")]
    range_indexing: Option<BTreeMap<String, MetaRefJson>>,
    #[serde(rename = "fullTextIndexing", default, skip_serializing_if = "Option::is_none")]
    full_text_indexing: Option<BTreeMap<String, MetaRefJson>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mixins: Option<Vec<MetaRefJson>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Whether an unresolved `rules.type` token is a hard error (`UnknownType`)
/// or a lenient fallback to `text` with a [`Warning`] (spec §4.2 default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrictMode {
    Strict,
    Lenient,
}

impl Default for StrictMode {
    fn default() -> Self {
        StrictMode::Lenient
    }
}

fn parse_property(
    prop_name: &str,
    json: PropDefJson,
    names: &mut impl NameStore,
    strict: StrictMode,
    diagnostics: &mut Diagnostics,
) -> Result<PropertyDef, FlexiError> {
    flexi_names::validate_identifier(prop_name)
        .map_err(|_| FlexiError::InvalidName { name: prop_name.to_string(), context: ErrorContext::default() })?;

    let (prop_type, _storage) = match flexi_type_system::resolve_type_token(&json.rules.type_token) {
        Some(resolved) => resolved,
        None => {
            if strict == StrictMode::Strict {
                return Err(FlexiError::UnknownType {
                    type_token: json.rules.type_token.clone(),
                    context: ErrorContext::default().with_prop(prop_name),
                });
            }
            diagnostics.push(Warning::UnresolvedTypeFallback {
                prop_name: prop_name.to_string(),
                type_token: json.rules.type_token.clone(),
            });
            flexi_type_system::resolve_type_token("text").expect("text is always a valid token")
        }
    };

    let indexed = matches!(json.index, IndexKind::Index | IndexKind::Range);
    let unique = matches!(json.index, IndexKind::Unique);
    let full_text = matches!(json.index, IndexKind::Fulltext);

    let name_id = names.insert_name(prop_name)?;

    let ref_def = match json.ref_def {
        Some(r) => Some(RefDef {
            target_class: MetadataRef::from(&r.class_ref),
            reverse_prop: r.reverse_property.as_ref().map(MetadataRef::from),
            min_occurs: r.min_occurs,
            max_occurs: r.max_occurs,
        }),
        None => None,
    };

    let enum_def = json.enum_def.map(|items| EnumDef {
        items: items.into_iter().map(|i| EnumItem { value: i.value, label: i.label }).collect(),
    });

    let change_status = if json.drop { ChangeStatus::Deleted } else { ChangeStatus::Added };

    if json.drop && json.rename_to.is_some() {
        return Err(FlexiError::InvalidProp {
            message: "a property cannot be both $drop and $renameTo in the same definition".to_string(),
            context: ErrorContext::default().with_prop(prop_name),
        });
    }

    let prop = PropertyDef {
        name: name_id,
        name_text: prop_name.to_string(),
        prop_type,
        rename_to: json.rename_to,
        change_status,
        indexed,
        unique,
        full_text,
        role: Default::default(),
        min_value: json.rules.min_value,
        max_value: json.rules.max_value,
        min_occurs: json.min_occurs,
        max_occurs: json.max_occurs,
        max_length: json.rules.max_length.unwrap_or(0),
        regex: json.rules.regex,
        ref_def,
        enum_def,
        needs_validation: false,
        ref_count: 0,
        extra: json.extra,
    };

    if !matches!(prop.change_status, ChangeStatus::Deleted) {
        prop.check_invariants().map_err(|message| FlexiError::InvalidProp {
            message,
            context: ErrorContext::default().with_prop(prop_name),
        })?;
    }

    Ok(prop)
}

fn parse_slots<const N: usize>(
    names: &[&str; N],
    wire: Option<BTreeMap<String, MetaRefJson>>,
) -> [Option<MetadataRef>; N] {
    let wire = wire.unwrap_or_default();
    std::array::from_fn(|i| wire.get(names[i]).map(MetadataRef::from))
}

/// Parses a class-definition JSON document (spec §4.2) into a
/// [`ClassDef`]. `class_id` is `None` for a brand-new class; callers doing
/// `alter` pass the existing id through separately once the merge completes.
///
/// Fails with [`FlexiError::ParseError`] on malformed JSON,
/// [`FlexiError::InvalidName`] on a bad identifier, and
/// [`FlexiError::UnknownType`] on an unresolved type string when `strict`
/// is [`StrictMode::Strict`] (default is lenient: falls back to `text` and
/// records a [`Warning`]).
pub fn parse_class_def(
    class_name: &str,
    class_id: Option<u64>,
    json_text: &str,
    strict: StrictMode,
    names: &mut impl NameStore,
) -> Result<(ClassDef, Diagnostics), FlexiError> {
    flexi_names::validate_identifier(class_name)
        .map_err(|_| FlexiError::InvalidName { name: class_name.to_string(), context: ErrorContext::default() })?;

    let wire: ClassDefJson = serde_json::from_str(json_text).map_err(|e| FlexiError::ParseError {
        message: e.to_string(),
        context: ErrorContext::class(class_name),
    })?;

    let mut diagnostics = Diagnostics::new();
    let class_name_id = names.insert_name(class_name)?;
    let mut class = ClassDef::new(class_id, class_name_id, class_name);
    class.allow_any_props = wire.allow_any_props;
    class.extra = wire.extra;

    for (prop_name, prop_json) in wire.properties {
        let prop = parse_property(&prop_name, prop_json, names, strict, &mut diagnostics)?;
        class.prop_map.insert(prop_name, prop);
    }

    class.special_props = parse_slots(&SPECIAL_PROP_SLOTS, wire.special_properties);
    class.range_props = parse_slots(&RANGE_PROP_SLOTS, wire.range_indexing);
    class.fts_props = parse_slots(&FTS_PROP_SLOTS, wire.full_text_indexing);
    class.mixins_specified = wire.mixins.is_some();
    class.mixins = wire.mixins.unwrap_or_default().iter().map(MetadataRef::from).collect();

    Ok((class, diagnostics))
}

fn prop_def_to_json(prop: &PropertyDef) -> PropDefJson {
    let index = if prop.unique {
        IndexKind::Unique
    } else if prop.full_text {
        IndexKind::Fulltext
    } else if prop.indexed {
        IndexKind::Index
    } else {
        IndexKind::None
    };

    let type_token = type_code_to_token(prop.prop_type);

    PropDefJson {
        rules: RulesJson {
            type_token,
            max_length: if prop.max_length == 0 { None } else { Some(prop.max_length) },
            min_value: prop.min_value,
            max_value: prop.max_value,
            regex: prop.regex.clone(),
        },
        index,
        no_track_changes: false,
        min_occurs: prop.min_occurs,
        max_occurs: prop.max_occurs,
        enum_def: prop.enum_def.as_ref().map(|e| {
            e.items.iter().map(|i| EnumItemJson { value: i.value.clone(), label: i.label.clone() }).collect()
        }),
        ref_def: prop.ref_def.as_ref().map(|r| RefDefJson {
            class_ref: meta_ref_to_json(&r.target_class),
            reverse_property: r.reverse_prop.as_ref().map(meta_ref_to_json),
            min_occurs: r.min_occurs,
            max_occurs: r.max_occurs,
        }),
        rename_to: prop.rename_to.clone(),
        drop: matches!(prop.change_status, ChangeStatus::Deleted),
        extra: prop.extra.clone(),
    }
}

fn type_code_to_token(t: flexi_type_system::TypeCode) -> String {
    use flexi_type_system::TypeCode::*;
    match t {
        Text => "text",
        Integer => "integer",
        Boolean => "boolean",
        Enum => "enum",
        Number => "number",
        DateTime => "datetime",
        Uuid => "uuid",
        Binary => "binary",
        Name => "name",
        Decimal => "decimal",
        Json => "json",
        Date => "date",
        Timespan => "time",
        Any => "any",
        Reference => "reference",
    }
    .to_string()
}

fn slots_to_json<const N: usize>(names: &[&str; N], slots: &[Option<MetadataRef>; N]) -> BTreeMap<String, MetaRefJson> {
    let mut map = BTreeMap::new();
    for (i, slot) in slots.iter().enumerate() {
        if let Some(r) = slot {
            map.insert(names[i].to_string(), meta_ref_to_json(r));
        }
    }
    map
}

/// Serializes a [`ClassDef`] back to the wire JSON format. Round-trips
/// `parse_class_def` up to key order and defaulted/omitted optional fields
/// (spec §8's round-trip invariant).
pub fn serialize_class_def(class: &ClassDef) -> Result<String, FlexiError> {
    let properties = class
        .prop_map
        .iter()
        .map(|(name, prop)| (name.clone(), prop_def_to_json(prop)))
        .collect::<BTreeMap<_, _>>();

    let special = slots_to_json(&SPECIAL_PROP_SLOTS, &class.special_props);
    let range = slots_to_json(&RANGE_PROP_SLOTS, &class.range_props);
    let fts = slots_to_json(&FTS_PROP_SLOTS, &class.fts_props);

    let wire = ClassDefJson {
        allow_any_props: class.allow_any_props,
        properties,
        special_properties: if special.is_empty() { None } else { Some(special) },
        range_indexing: if range.is_empty() { None } else { Some(range) },
        full_text_indexing: if fts.is_empty() { None } else { Some(fts) },
        mixins: if class.mixins_specified {
            Some(class.mixins.iter().map(meta_ref_to_json).collect())
        } else {
            None
        },
        extra: class.extra.clone(),
    };

    serde_json::to_string(&wire)
        .map_err(|e| FlexiError::ParseError { message: e.to_string(), context: ErrorContext::class(&class.name_text) })
}
