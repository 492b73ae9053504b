//! Environment instance identifiers.
//!
//! Sortable by creation time: a UUIDv7 places a millisecond Unix timestamp
//! in its high-order bits, so two IDs minted in the same process can never
//! collide and two IDs from different environments sort by when they were
//! created, both as `Uuid` values and as their rendered strings.

use std::fmt;

use uuid::{NoContext, Timestamp, Uuid};

/// Uniquely identifies one running (or torn-down) environment instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Mints a fresh ID from the current wall-clock time.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    fn from_parts(millis: i64) -> Self {
        let secs = (millis / 1000).max(0) as u64;
        let nanos = ((millis.rem_euclid(1000)) * 1_000_000) as u32;
        let ts = Timestamp::from_unix(NoContext, secs, nanos);
        Self(Uuid::new_v7(ts).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_by_creation_time() {
        let a = EnvironmentId::from_parts(1_000);
        let b = EnvironmentId::from_parts(2_000);
        assert!(a < b);
    }

    #[test]
    fn ids_are_unique() {
        let a = EnvironmentId::new();
        let b = EnvironmentId::new();
        assert_ne!(a, b);
    }
}
