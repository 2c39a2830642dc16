use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Declared semantic type of a step's input or output.
///
/// Tags are compared structurally at compile time; no runtime introspection
/// of step bodies takes place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum TypeTag {
    /// Accepts everything.
    Any,
    /// Produces nothing a downstream step could use.
    Never,
    /// The empty value (`null`).
    Unit,
    Bool,
    Int,
    Float,
    Str,
    /// An opaque user type, compared by name.
    Named(String),
    List(Box<TypeTag>),
    Optional(Box<TypeTag>),
    Union(Vec<TypeTag>),
}

impl TypeTag {
    pub fn list(inner: TypeTag) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn optional(inner: TypeTag) -> Self {
        Self::Optional(Box::new(inner))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Whether a value of type `self` may flow into a slot declared as `other`.
    pub fn is_subtype_of(&self, other: &TypeTag) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (_, TypeTag::Any) => true,
            (TypeTag::Never, TypeTag::Unit) => true,
            (TypeTag::Never, _) => false,
            (TypeTag::Union(members), _) => members.iter().all(|m| m.is_subtype_of(other)),
            (TypeTag::Optional(inner), _) => {
                TypeTag::Unit.is_subtype_of(other) && inner.is_subtype_of(other)
            }
            (_, TypeTag::Optional(inner)) => *self == TypeTag::Unit || self.is_subtype_of(inner),
            (_, TypeTag::Union(members)) => members.iter().any(|m| self.is_subtype_of(m)),
            (TypeTag::Int, TypeTag::Float) => true,
            (TypeTag::List(a), TypeTag::List(b)) => a.is_subtype_of(b),
            _ => false,
        }
    }

    /// Element type of a container tag. `Any` is treated as a list of `Any`.
    pub fn element_type(&self) -> Option<TypeTag> {
        match self {
            TypeTag::List(inner) => Some((**inner).clone()),
            TypeTag::Any => Some(TypeTag::Any),
            _ => None,
        }
    }

    /// Structural check of a concrete value against this tag.
    pub fn admits(&self, value: &Value) -> bool {
        match self {
            TypeTag::Any => true,
            TypeTag::Never => false,
            TypeTag::Unit => value.is_null(),
            TypeTag::Bool => value.is_boolean(),
            TypeTag::Int => value.is_i64() || value.is_u64(),
            TypeTag::Float => value.is_number(),
            TypeTag::Str => value.is_string(),
            TypeTag::Named(_) => !value.is_null(),
            TypeTag::List(inner) => value
                .as_array()
                .map(|items| items.iter().all(|v| inner.admits(v)))
                .unwrap_or(false),
            TypeTag::Optional(inner) => value.is_null() || inner.admits(value),
            TypeTag::Union(members) => members.iter().any(|m| m.admits(value)),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Any => write!(f, "any"),
            TypeTag::Never => write!(f, "never"),
            TypeTag::Unit => write!(f, "unit"),
            TypeTag::Bool => write!(f, "bool"),
            TypeTag::Int => write!(f, "int"),
            TypeTag::Float => write!(f, "float"),
            TypeTag::Str => write!(f, "str"),
            TypeTag::Named(name) => write!(f, "{}", name),
            TypeTag::List(inner) => write!(f, "list<{}>", inner),
            TypeTag::Optional(inner) => write!(f, "optional<{}>", inner),
            TypeTag::Union(members) => {
                let parts: Vec<String> = members.iter().map(|m| m.to_string()).collect();
                write!(f, "{}", parts.join(" | "))
            }
        }
    }
}
