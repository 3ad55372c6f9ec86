//! Stored data entities.
//!
//! A [`DataEntity`] is the tagged value held under a key: a byte
//! string, a list, a hash, a set, or a sorted set. Commands check the
//! tag and fail with the WRONGTYPE error when a key holds a different
//! kind of value.

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;

use crate::quicklist::QuickList;
use crate::sorted_set::SortedSet;

/// Error for a command used against a key of the wrong type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongType;

impl std::fmt::Display for WrongType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        )
    }
}

impl std::error::Error for WrongType {}

/// A value stored in the keyspace.
#[derive(Debug, Clone)]
pub enum DataEntity {
    /// Binary-safe string data.
    Bytes(Bytes),
    /// Ordered sequence of byte strings.
    List(QuickList),
    /// Field → value mapping.
    Hash(AHashMap<String, Bytes>),
    /// Unordered set of string members.
    Set(AHashSet<String>),
    /// Member → score mapping ordered by (score, member).
    SortedSet(SortedSet),
}

impl DataEntity {
    /// The type name reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataEntity::Bytes(_) => "string",
            DataEntity::List(_) => "list",
            DataEntity::Hash(_) => "hash",
            DataEntity::Set(_) => "set",
            DataEntity::SortedSet(_) => "zset",
        }
    }

    /// `true` when the entity is a collection with no elements left.
    /// Such entities are removed from the keyspace by the command that
    /// emptied them.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            DataEntity::Bytes(_) => false,
            DataEntity::List(l) => l.is_empty(),
            DataEntity::Hash(h) => h.is_empty(),
            DataEntity::Set(s) => s.is_empty(),
            DataEntity::SortedSet(z) => z.is_empty(),
        }
    }

    pub fn as_bytes(&self) -> Result<&Bytes, WrongType> {
        match self {
            DataEntity::Bytes(b) => Ok(b),
            _ => Err(WrongType),
        }
    }

    pub fn as_list(&self) -> Result<&QuickList, WrongType> {
        match self {
            DataEntity::List(l) => Ok(l),
            _ => Err(WrongType),
        }
    }

    pub fn as_list_mut(&mut self) -> Result<&mut QuickList, WrongType> {
        match self {
            DataEntity::List(l) => Ok(l),
            _ => Err(WrongType),
        }
    }

    pub fn as_hash(&self) -> Result<&AHashMap<String, Bytes>, WrongType> {
        match self {
            DataEntity::Hash(h) => Ok(h),
            _ => Err(WrongType),
        }
    }

    pub fn as_hash_mut(&mut self) -> Result<&mut AHashMap<String, Bytes>, WrongType> {
        match self {
            DataEntity::Hash(h) => Ok(h),
            _ => Err(WrongType),
        }
    }

    pub fn as_set(&self) -> Result<&AHashSet<String>, WrongType> {
        match self {
            DataEntity::Set(s) => Ok(s),
            _ => Err(WrongType),
        }
    }

    pub fn as_set_mut(&mut self) -> Result<&mut AHashSet<String>, WrongType> {
        match self {
            DataEntity::Set(s) => Ok(s),
            _ => Err(WrongType),
        }
    }

    pub fn as_zset(&self) -> Result<&SortedSet, WrongType> {
        match self {
            DataEntity::SortedSet(z) => Ok(z),
            _ => Err(WrongType),
        }
    }

    pub fn as_zset_mut(&mut self) -> Result<&mut SortedSet, WrongType> {
        match self {
            DataEntity::SortedSet(z) => Ok(z),
            _ => Err(WrongType),
        }
    }
}

/// Formats a score the way replies expect: integral values render
/// without a decimal point, others with their shortest round-trip form.
pub fn format_float(val: f64) -> String {
    if val == val.trunc() && val.abs() < 1e17 {
        format!("{}", val as i64)
    } else {
        format!("{val}")
    }
}
