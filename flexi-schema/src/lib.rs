//! The data model (spec §3): property and class definitions, role slots,
//! range/FTS slots, mixins, and the per-property/per-class flag words.

use enumflags2::{bitflags, BitFlags};
use flexi_names::NameId;
use flexi_type_system::TypeCode;
use indexmap::IndexMap;

/// A reference to another piece of metadata (a class or a property) that
/// may be resolved by id, by name, or both. Spec §3: "at least one present;
/// resolution means populating the missing side."
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataRef {
    pub id: Option<u64>,
    pub name: Option<String>,
}

impl MetadataRef {
    pub fn by_id(id: u64) -> Self {
        Self { id: Some(id), name: None }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self { id: None, name: Some(name.into()) }
    }

    pub fn is_resolved(&self) -> bool {
        self.id.is_some()
    }
}

/// Bitset over the nine named role slots a property can fill (spec §3).
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropRole {
    Id = 1 << 0,
    Name = 1 << 1,
    Code = 1 << 2,
    Uid = 1 << 3,
    NonUniqId = 1 << 4,
    CreateTime = 1 << 5,
    UpdateTime = 1 << 6,
    AutoUuid = 1 << 7,
    AutoShortId = 1 << 8,
}

pub type PropRoleSet = BitFlags<PropRole>;

/// Roles that imply `unique = true` per the §3 invariant:
/// "role uniqueness roles (`id`, `uid`, `code`, `name`) imply `unique = true`."
pub fn role_implies_unique(roles: PropRoleSet) -> bool {
    roles.intersects(PropRole::Id | PropRole::Uid | PropRole::Code | PropRole::Name)
}

/// Per-property control flags (`ctlv`/`ctlvPlan`, spec §4.6, bit assignment
/// per `SPEC_FULL.md` §D(b)).
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropFlag {
    UniqueIndex = 1 << 0,
    Index = 1 << 1,
    FullTextIndex = 1 << 2,
}

pub type PropFlagSet = BitFlags<PropFlag>;

/// Per-class summary flags (`ctloMask`, spec §6).
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassFlag {
    HasUniqueIndex = 1 << 0,
    HasOrderedIndex = 1 << 1,
    HasFts = 1 << 2,
    HasRange = 1 << 3,
    HasRef = 1 << 4,
    SoftDeleted = 1 << 5,
}

pub type ClassFlagSet = BitFlags<ClassFlag>;

/// Data-validation failure policy for an `alter` (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Abort,
    Ignore,
    Mark,
}

impl Default for ValidationMode {
    fn default() -> Self {
        ValidationMode::Abort
    }
}

/// Classification assigned to a property during `alter` (spec §3, §4.4,
/// §4.8). Exactly these four variants per the §3 invariant; a rename is
/// represented as `Modified` with `rename_to` set (see `SPEC_FULL.md` §D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    NotModified,
    Modified,
    Deleted,
}

/// Present iff `type = reference` (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct RefDef {
    pub target_class: MetadataRef,
    pub reverse_prop: Option<MetadataRef>,
    pub min_occurs: u32,
    pub max_occurs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumItem {
    pub value: String,
    pub label: String,
}

/// Present iff `type = enum` (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub items: Vec<EnumItem>,
}

/// A parsed, validated property record (spec §3).
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: NameId,
    pub name_text: String,
    pub prop_type: TypeCode,
    pub rename_to: Option<String>,
    pub change_status: ChangeStatus,
    pub indexed: bool,
    pub unique: bool,
    pub full_text: bool,
    pub role: PropRoleSet,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub min_occurs: u32,
    pub max_occurs: u32,
    pub max_length: u32,
    pub regex: Option<String>,
    pub ref_def: Option<RefDef>,
    pub enum_def: Option<EnumDef>,
    pub needs_validation: bool,
    pub ref_count: u32,
    /// Non-goal-adjacent wire-format fields (e.g. unrecognized keys) this
    /// engine does not interpret but must preserve for round-trip fidelity
    /// (spec §8). Parsed and serialized in `flexi-schema-parser`; carried
    /// here opaquely.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PropertyDef {
    /// Checks the structural invariants of spec §3 that apply regardless of
    /// where the definition came from. Returns the first violated invariant
    /// as a human-readable message; callers attach their own `FlexiError`
    /// context.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.prop_type == TypeCode::Reference && self.ref_def.is_none() {
            return Err("type = reference requires ref_def".to_string());
        }
        if self.prop_type == TypeCode::Enum && self.enum_def.is_none() {
            return Err("type = enum requires enum_def".to_string());
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Err("min_value must be <= max_value".to_string());
            }
        }
        if self.min_occurs > self.max_occurs {
            return Err("min_occurs must be <= max_occurs".to_string());
        }
        if role_implies_unique(self.role) && !self.unique {
            return Err("role implies unique but unique is false".to_string());
        }
        Ok(())
    }
}

/// The nine special-property role slots, in the fixed order spec §3
/// prescribes.
pub const SPECIAL_PROP_SLOTS: [&str; 9] = [
    "uid",
    "name",
    "description",
    "code",
    "nonUniqueId",
    "createTime",
    "updateTime",
    "autoUuid",
    "autoShortId",
];

/// The ten range-indexing slots (five `(low, high)` pairs `A..E`).
pub const RANGE_PROP_SLOTS: [&str; 10] =
    ["A0", "A1", "B0", "B1", "C0", "C1", "D0", "D1", "E0", "E1"];

/// The five full-text-indexing slots.
pub const FTS_PROP_SLOTS: [&str; 5] = ["X1", "X2", "X3", "X4", "X5"];

/// A named collection of properties plus role slots (spec §3).
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub class_id: Option<u64>,
    pub name: NameId,
    pub name_text: String,
    /// Lookup by name expected O(1); insertion order is not meaningful, but
    /// `IndexMap` gives us deterministic iteration for stable JSON
    /// serialization without sacrificing O(1) lookup.
    pub prop_map: IndexMap<String, PropertyDef>,
    pub special_props: [Option<MetadataRef>; 9],
    pub range_props: [Option<MetadataRef>; 10],
    pub fts_props: [Option<MetadataRef>; 5],
    pub mixins: Vec<MetadataRef>,
    /// Whether the wire document carried a `mixins` key at all. An absent
    /// key means "inherit the previous definition's mixins" during alter;
    /// an explicit `[]` means "drop all mixins" (spec §4.4.6).
    pub mixins_specified: bool,
    pub as_table: bool,
    pub ctlo_mask: ClassFlagSet,
    pub allow_any_props: bool,
    pub ref_count: u32,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClassDef {
    pub fn new(class_id: Option<u64>, name: NameId, name_text: impl Into<String>) -> Self {
        Self {
            class_id,
            name,
            name_text: name_text.into(),
            prop_map: IndexMap::new(),
            special_props: Default::default(),
            range_props: Default::default(),
            fts_props: Default::default(),
            mixins: Vec::new(),
            mixins_specified: false,
            as_table: false,
            ctlo_mask: ClassFlagSet::empty(),
            allow_any_props: false,
            ref_count: 0,
            extra: serde_json::Map::new(),
        }
    }
}
