//! MongoDB backend store
//!
//! Bot definitions live in one collection as `{ uuid, bot }` documents,
//! where `bot` is the serialized definition stored as BSON binary.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::{Client, Collection};
use tracing::{debug, info};

use super::BackendStore;
use crate::types::{BotDefinition, BotIdentity, PoolError, Result};

/// Backend store reading definitions from MongoDB
#[derive(Clone)]
pub struct MongoBackend {
    bots: Collection<Document>,
}

impl MongoBackend {
    /// Connect and verify the server answers a ping
    pub async fn connect(uri: &str, db_name: &str, collection: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Fail fast instead of hanging on an unreachable server
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| PoolError::Backend(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| PoolError::Backend(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self::from_collection(
            client.database(db_name).collection::<Document>(collection),
        ))
    }

    pub fn from_collection(bots: Collection<Document>) -> Self {
        Self { bots }
    }
}

/// Pull the definition payload out of a bot document
fn definition_from_document(identity: &BotIdentity, doc: &Document) -> Result<BotDefinition> {
    match doc.get("bot") {
        Some(Bson::Binary(binary)) => Ok(BotDefinition::new(binary.bytes.clone())),
        Some(Bson::String(text)) => Ok(BotDefinition::new(text.clone().into_bytes())),
        Some(other) => Err(PoolError::Internal(format!(
            "bot {} has a definition of unsupported type {:?}",
            identity,
            other.element_type()
        ))),
        None => Err(PoolError::DefinitionNotFound(format!(
            "{} (document has no definition)",
            identity
        ))),
    }
}

#[async_trait]
impl BackendStore for MongoBackend {
    async fn fetch_definition(&self, identity: &BotIdentity) -> Result<BotDefinition> {
        let found = self
            .bots
            .find_one(doc! { "uuid": identity.as_str() })
            .await?;

        let Some(document) = found else {
            return Err(PoolError::DefinitionNotFound(identity.to_string()));
        };

        let definition = definition_from_document(identity, &document)?;
        debug!(identity = %identity, bytes = definition.len(), "Fetched bot definition");
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{spec::BinarySubtype, Binary};

    #[test]
    fn test_binary_definition() {
        let doc = doc! {
            "uuid": "b1",
            "bot": Binary { subtype: BinarySubtype::Generic, bytes: b"D1".to_vec() },
        };
        let def = definition_from_document(&"b1".into(), &doc).unwrap();
        assert_eq!(def.as_bytes(), b"D1");
    }

    #[test]
    fn test_string_definition() {
        let doc = doc! { "uuid": "b1", "bot": "{\"intents\":[]}" };
        let def = definition_from_document(&"b1".into(), &doc).unwrap();
        assert_eq!(def.as_bytes(), b"{\"intents\":[]}");
    }

    #[test]
    fn test_missing_or_invalid_definition() {
        let missing = doc! { "uuid": "b1" };
        assert!(matches!(
            definition_from_document(&"b1".into(), &missing),
            Err(PoolError::DefinitionNotFound(_))
        ));

        let wrong_type = doc! { "uuid": "b1", "bot": 42 };
        let err = definition_from_document(&"b1".into(), &wrong_type).unwrap_err();
        assert!(matches!(err, PoolError::Internal(ref msg) if msg.contains("unsupported type")));
        // Retrying cannot change the stored document
        assert!(!err.is_transient());
    }
}
