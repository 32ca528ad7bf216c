//! Client identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a connected client.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a fresh time-ordered id (`client_<uuid v7>`).
    pub fn new() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client_"));
    }

    #[test]
    fn display_matches_inner() {
        let id = ClientId::from("client_fixed");
        assert_eq!(id.to_string(), "client_fixed");
    }
}
