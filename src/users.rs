//! User index registry
//!
//! Maps arbitrary user identifiers to dense indices consumed by the wide
//! (memorization) path. Index 0 is reserved for users never observed.

use crate::error::{BanditError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Dense index handed to the network for users the registry has never seen.
pub const UNKNOWN_USER: usize = 0;

/// Raw user identifier as supplied by callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for UserId {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl From<i64> for UserId {
    fn from(v: i64) -> Self {
        Self(v.to_string())
    }
}

impl From<u32> for UserId {
    fn from(v: u32) -> Self {
        Self(v.to_string())
    }
}

impl From<i32> for UserId {
    fn from(v: i32) -> Self {
        Self(v.to_string())
    }
}

/// Bidirectional user id <-> dense index mapping. Never shrinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRegistry {
    indices: HashMap<UserId, usize>,
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            indices: HashMap::new(),
        }
    }

    /// Number of allocated indices, including the reserved unknown slot.
    pub fn len(&self) -> usize {
        self.indices.len() + 1
    }

    /// True while only the unknown slot exists.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dense index for `user`, or [`UNKNOWN_USER`] if never registered.
    pub fn lookup(&self, user: &UserId) -> usize {
        self.indices.get(user).copied().unwrap_or(UNKNOWN_USER)
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.indices.contains_key(user)
    }

    /// Assign the next free index to `user`; no-op if already known.
    pub fn register(&mut self, user: &UserId) -> usize {
        if let Some(&idx) = self.indices.get(user) {
            return idx;
        }
        let idx = self.len();
        self.indices.insert(user.clone(), idx);
        idx
    }

    /// Bulk lookup for internal paths. Every id must already be registered.
    pub fn lookup_many<'a, I>(&self, users: I) -> Result<Vec<usize>>
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        users
            .into_iter()
            .map(|u| {
                self.indices
                    .get(u)
                    .copied()
                    .ok_or_else(|| BanditError::UnknownUser(u.to_string()))
            })
            .collect()
    }
}
