//! Stable entity identities, including keys that are not yet assigned.
//!
//! An [`Ident`] names exactly one row-to-be: the entity name plus a
//! [`KeyRef`]. Keys generated at or after insert start out as
//! [`KeyRef::Pending`] with a per-context serial; once the real key value is
//! known the owning entry table re-keys the entry to
//! [`KeyRef::Assigned`].
//!
//! Identities have a total order so the entry table can iterate
//! deterministically. Pending keys sort before assigned keys; this is an
//! arbitrary but stable choice.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// The declared name of an entity type (e.g. `"Author"`).
///
/// A lightweight newtype so entity names cannot be confused with column or
/// table names at call sites.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityName(String);

impl EntityName {
    /// Create an entity name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// View the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for EntityName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for EntityName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A primary-key reference: either a known value or a pending placeholder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyRef {
    /// The key has not been produced yet; the serial is unique within one
    /// persistence context and never reused.
    Pending(u64),
    /// The key value is known.
    Assigned(Value),
}

impl KeyRef {
    /// Return the assigned key value, if any.
    pub const fn assigned(&self) -> Option<&Value> {
        match self {
            Self::Assigned(v) => Some(v),
            Self::Pending(_) => None,
        }
    }

    /// Return whether the key is still pending.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl core::fmt::Display for KeyRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Pending(serial) => write!(f, "pending:{serial}"),
            Self::Assigned(v) => write!(f, "{v}"),
        }
    }
}

/// A stable identity for one managed row: entity name plus key reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ident {
    entity: EntityName,
    key: KeyRef,
}

impl Ident {
    /// Build an identity with an assigned key value.
    pub fn assigned(entity: impl Into<EntityName>, key: Value) -> Self {
        Self {
            entity: entity.into(),
            key: KeyRef::Assigned(key),
        }
    }

    /// Build an identity with a pending key serial.
    pub fn pending(entity: impl Into<EntityName>, serial: u64) -> Self {
        Self {
            entity: entity.into(),
            key: KeyRef::Pending(serial),
        }
    }

    /// The entity name component.
    pub const fn entity(&self) -> &EntityName {
        &self.entity
    }

    /// The key component.
    pub const fn key(&self) -> &KeyRef {
        &self.key
    }

    /// The assigned key value, if the key is no longer pending.
    pub const fn key_value(&self) -> Option<&Value> {
        self.key.assigned()
    }

    /// Return a copy of this identity with the key assigned to `value`.
    pub fn with_assigned_key(&self, value: Value) -> Self {
        Self {
            entity: self.entity.clone(),
            key: KeyRef::Assigned(value),
        }
    }
}

impl core::fmt::Display for Ident {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}", self.entity, self.key)
    }
}
