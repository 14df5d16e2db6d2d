use crate::error::Result;
use crate::staging::{DocId, StagingEnvelope};
use proven_kv::{Cas, Collection};
use serde::de::DeserializeOwned;

/// A document as seen by one attempt
///
/// Handles are what `replace` and `remove` operate on: they remember the CAS
/// the document had when it was read, so a concurrent change is detected
/// when the mutation is staged.
#[derive(Debug, Clone)]
pub struct TransactionGetResult {
    pub(crate) collection: Collection,
    pub(crate) key: String,
    pub(crate) content: Vec<u8>,
    pub(crate) cas: Cas,
    /// Body the store holds underneath any staging envelope
    pub(crate) committed_body: Option<Vec<u8>>,
    /// Envelope of another attempt found on the document
    pub(crate) foreign: Option<StagingEnvelope>,
}

impl TransactionGetResult {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn cas(&self) -> Cas {
        self.cas
    }

    pub fn content_bytes(&self) -> &[u8] {
        &self.content
    }

    /// Decode the content as JSON
    pub fn content<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.content)?)
    }

    pub(crate) fn doc_id(&self) -> DocId {
        DocId::new(&self.collection, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationError;
    use proven_kv::MemoryStore;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Player {
        name: String,
        level: u32,
    }

    fn handle(content: &str) -> TransactionGetResult {
        TransactionGetResult {
            collection: Collection::new("players", Arc::new(MemoryStore::new())),
            key: "player-1".into(),
            content: content.as_bytes().to_vec(),
            cas: Cas::new(7),
            committed_body: None,
            foreign: None,
        }
    }

    #[test]
    fn test_typed_content() {
        let doc = handle(r#"{"name":"Jane","level":3}"#);
        let player: Player = doc.content().unwrap();
        assert_eq!(
            player,
            Player {
                name: "Jane".into(),
                level: 3
            }
        );
        assert_eq!(doc.doc_id().to_string(), "players/player-1");
    }

    #[test]
    fn test_bad_content_is_serialization_error() {
        let doc = handle("not json");
        let err = doc.content::<Player>().unwrap_err();
        assert!(matches!(err, OperationError::Serialization(_)));
    }
}
