//! Type catalog (spec §2.3) and type-transition oracle (spec §4.3).

use enumflags2::{bitflags, BitFlags};

/// Internal type code. One flag bit per declared type token (after folding
/// legacy aliases and the `date`/`time` tokens into their internal codes —
/// see `SPEC_FULL.md` §D for why `Date` and `DateTime` are kept distinct and
/// why `"time"` maps to `Timespan`).
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Text = 1 << 0,
    Integer = 1 << 1,
    Boolean = 1 << 2,
    Enum = 1 << 3,
    Number = 1 << 4,
    DateTime = 1 << 5,
    Uuid = 1 << 6,
    Binary = 1 << 7,
    Name = 1 << 8,
    Decimal = 1 << 9,
    Json = 1 << 10,
    Date = 1 << 11,
    Timespan = 1 << 12,
    Any = 1 << 13,
    Reference = 1 << 14,
}

pub type TypeSet = BitFlags<TypeCode>;

/// The substrate storage kind a type is rendered as, for the virtual-table
/// facade (`as_table`, spec §3). `None` is used for `any` and `reference`,
/// which the original extension also leaves without a fixed SQLite storage
/// class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Text,
    Integer,
    Float,
    Blob,
    Json1,
    None,
}

/// Resolves a wire-format type token (spec §2.3) to its internal type code
/// and substrate storage kind. Includes the legacy aliases `NVARCHAR`,
/// `NCHAR`, `MONEY`, `IMAGE`, `VARCHAR`. Returns `None` for anything else —
/// callers decide (per §4.2) whether that is a hard `UnknownType` error
/// (strict mode) or a fallback to `text` with a warning (lenient, default).
pub fn resolve_type_token(token: &str) -> Option<(TypeCode, StorageKind)> {
    use StorageKind::*;
    use TypeCode::*;
    Some(match token {
        "text" => (TypeCode::Text, StorageKind::Text),
        "integer" => (TypeCode::Integer, StorageKind::Integer),
        "boolean" => (Boolean, StorageKind::Integer),
        "enum" => (Enum, StorageKind::Text),
        "number" => (Number, Float),
        "datetime" => (DateTime, Float),
        "uuid" => (Uuid, Blob),
        "binary" => (Binary, Blob),
        "name" => (Name, StorageKind::Text),
        "decimal" => (Decimal, Float),
        "json" => (Json, Json1),
        "date" => (Date, Float),
        "time" => (Timespan, Float),
        "any" => (Any, StorageKind::None),
        "reference" => (Reference, StorageKind::None),
        // Legacy aliases.
        "NVARCHAR" | "NCHAR" | "VARCHAR" => (TypeCode::Text, StorageKind::Text),
        "MONEY" => (Decimal, Float),
        "IMAGE" => (Binary, Blob),
        _ => return Option::None,
    })
}

/// Outcome of consulting the transition oracle for a `(from, to)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Reachable without inspecting existing data.
    Yes,
    /// Reachable, but only after a per-row validation pass.
    Maybe,
    /// Not a legal transition.
    Forbidden,
}

/// `(yes, maybe)` edge sets for one source type, per spec §4.3.
fn edges(from: TypeCode) -> (TypeSet, TypeSet) {
    use TypeCode::*;
    match from {
        Text => (Name | Reference | Binary | Json, TypeSet::empty()),
        Boolean => (Integer | Decimal | Number | Text | Enum, TypeSet::empty()),
        Integer => (Decimal | Number | Text | Reference, TypeSet::empty()),
        Number => (TypeSet::from(Text), Decimal | Integer),
        // `enum`'s yes/maybe sets per the authoritative (later) row of the
        // original transition table duplicate — see SPEC_FULL.md §D(a).
        Enum => (Text | Integer | Decimal, TypeSet::empty()),
        Name => (Text | Reference, Integer | Enum | Number),
        Decimal => (Number | Text, TypeSet::from(Integer)),
        Date => (DateTime | Text, TypeSet::empty()),
        DateTime => (Text | Number | Decimal, TypeSet::empty()),
        Binary => (TypeSet::from(Text), TypeSet::from(Uuid)),
        Timespan => (Text | Number, TypeSet::from(Decimal)),
        Json => (Text | Reference, TypeSet::from(Number)),
        Uuid => (Text | Binary, TypeSet::empty()),
        Reference => (Text | Integer | Decimal, TypeSet::empty()),
        Any => (TypeSet::all(), TypeSet::empty()),
    }
}

/// Consults the type-transition oracle (spec §4.3). Deterministic for every
/// `(from, to)` pair; `oracle(t, t) == Yes` and `oracle(any, t) == oracle(t,
/// any) == Yes` for every `t`.
pub fn oracle(from: TypeCode, to: TypeCode) -> Transition {
    if from == to || from == TypeCode::Any || to == TypeCode::Any {
        return Transition::Yes;
    }
    let (yes, maybe) = edges(from);
    if yes.contains(to) {
        Transition::Yes
    } else if maybe.contains(to) {
        Transition::Maybe
    } else {
        Transition::Forbidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TypeCode::*;

    #[test]
    fn resolves_primary_tokens() {
        assert_eq!(resolve_type_token("text"), Some((Text, StorageKind::Text)));
        assert_eq!(resolve_type_token("reference"), Some((Reference, StorageKind::None)));
        assert_eq!(resolve_type_token("time"), Some((Timespan, StorageKind::Float)));
        assert_eq!(resolve_type_token("date"), Some((Date, StorageKind::Float)));
    }

    #[test]
    fn resolves_legacy_aliases() {
        assert_eq!(resolve_type_token("NVARCHAR"), Some((Text, StorageKind::Text)));
        assert_eq!(resolve_type_token("MONEY"), Some((Decimal, StorageKind::Float)));
        assert_eq!(resolve_type_token("IMAGE"), Some((Binary, StorageKind::Blob)));
    }

    #[test]
    fn unknown_token_resolves_to_none() {
        assert_eq!(resolve_type_token("frobnicate"), None);
    }

    #[test]
    fn identity_transition_is_always_yes() {
        for t in TypeSet::all().iter() {
            assert_eq!(oracle(t, t), Transition::Yes);
        }
    }

    #[test]
    fn any_is_universal_source_and_destination() {
        for t in TypeSet::all().iter() {
            assert_eq!(oracle(Any, t), Transition::Yes);
            assert_eq!(oracle(t, Any), Transition::Yes);
        }
    }

    #[test]
    fn number_to_decimal_requires_validation() {
        assert_eq!(oracle(Number, Decimal), Transition::Maybe);
    }

    #[test]
    fn binary_to_integer_is_forbidden() {
        assert_eq!(oracle(Binary, Integer), Transition::Forbidden);
    }

    #[test]
    fn enum_transition_uses_the_authoritative_duplicate_row() {
        // Per SPEC_FULL.md §D(a): the later row wins, so `name`/`reference`
        // are no longer reachable and `integer` is `Yes`, not `Maybe`.
        assert_eq!(oracle(Enum, Integer), Transition::Yes);
        assert_eq!(oracle(Enum, Decimal), Transition::Yes);
        assert_eq!(oracle(Enum, Name), Transition::Forbidden);
        assert_eq!(oracle(Enum, Reference), Transition::Forbidden);
    }

    #[test]
    fn date_and_datetime_are_distinct_nodes() {
        assert_eq!(oracle(Date, DateTime), Transition::Yes);
        assert_eq!(oracle(DateTime, Date), Transition::Forbidden);
    }
}
