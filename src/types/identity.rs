//! Bot identity and definition types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque unique key of one bot instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotIdentity(String);

impl BotIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BotIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for BotIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Serialized description of a bot's behaviour.
///
/// The pool never looks inside; it is handed to the worker verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct BotDefinition(Bytes);

impl BotDefinition {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Definitions can be large and may hold private training data.
impl fmt::Debug for BotDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BotDefinition({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_serializes_as_plain_string() {
        let id = BotIdentity::from("b1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"b1\"");
        assert_eq!(id.to_string(), "b1");
    }

    #[test]
    fn test_definition_debug_hides_payload() {
        let def = BotDefinition::new(b"secret intents".to_vec());
        assert_eq!(format!("{:?}", def), "BotDefinition(14 bytes)");
    }
}
