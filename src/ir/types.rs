//! Runtime type tags.
//!
//! Every runtime value is a `(value, type-id)` pair and every compiled
//! function returns exactly two Wasm results carrying that pair. `TypeId`
//! enumerates the tag values; its `u32` encoding is this crate's own
//! choice and is fixed for the lifetime of one compiled module, never
//! exposed as a stable cross-version ABI.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    Number,
    Boolean,
    String,
    Null,
    Undefined,
    Object,
    Array,
    Function,
}

impl TypeId {
    pub const ALL: [TypeId; 8] = [
        TypeId::Number,
        TypeId::Boolean,
        TypeId::String,
        TypeId::Null,
        TypeId::Undefined,
        TypeId::Object,
        TypeId::Array,
        TypeId::Function,
    ];

    /// The integer tag emitted into the generated module's `i32` companion
    /// result. Stable only within a single compile.
    pub fn tag(self) -> i32 {
        match self {
            TypeId::Number => 0,
            TypeId::Boolean => 1,
            TypeId::String => 2,
            TypeId::Null => 3,
            TypeId::Undefined => 4,
            TypeId::Object => 5,
            TypeId::Array => 6,
            TypeId::Function => 7,
        }
    }

    pub fn from_tag(tag: i32) -> Option<TypeId> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// Whether this type's runtime representation is carried in the `f64`
    /// value slot (vs. packed into the companion `i32` slot, e.g. booleans
    /// and small tagged references).
    pub fn uses_f64_slot(self) -> bool {
        matches!(self, TypeId::Number)
    }
}
