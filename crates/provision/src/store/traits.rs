//! Persistence collaborator interface.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Errors raised by a persistence backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem or transport failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored document is unreadable.
    #[error("Corrupt document: {0}")]
    Corrupt(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Document collections known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Node,
    Policy,
    PolicyTable,
    ActiveModel,
    RebindRequest,
    Image,
    Model,
    TagRule,
}

impl Kind {
    /// Collection name, also used as the on-disk directory name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Policy => "policy",
            Self::PolicyTable => "policy_table",
            Self::ActiveModel => "active_model",
            Self::RebindRequest => "rebind_request",
            Self::Image => "image",
            Self::Model => "model",
            Self::TagRule => "tag_rule",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document store with a fixed, untyped interface.
///
/// `persist` is insert-or-update and bumps the `version` field of the
/// stored copy. No operation spans more than one document.
#[async_trait]
pub trait Store: Send + Sync {
    /// Every document of a kind.
    async fn fetch_all(&self, kind: Kind) -> StoreResult<Vec<Value>>;

    /// A single document, if present.
    async fn fetch_by_uuid(&self, kind: Kind, uuid: &str) -> StoreResult<Option<Value>>;

    /// Insert or update; returns the stored copy.
    async fn persist(&self, kind: Kind, uuid: &str, doc: Value) -> StoreResult<Value>;

    /// Remove a document; `false` when it did not exist.
    async fn delete(&self, kind: Kind, uuid: &str) -> StoreResult<bool>;
}

/// A typed record stored in one collection.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    /// Collection this type lives in.
    const KIND: Kind;

    /// Primary key.
    fn uuid(&self) -> &str;
}

/// Next version for a document about to replace `previous`.
pub(crate) fn bump_version(previous: Option<&Value>, doc: &mut Value) {
    let current = previous
        .and_then(|p| p.get("version"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("version".to_string(), Value::from(current + 1));
    }
}

/// Typed access over any [`Store`].
#[derive(Clone)]
pub struct Documents {
    store: Arc<dyn Store>,
}

impl Documents {
    /// Wrap a backend.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Underlying backend.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Every decodable document of type `T`.
    ///
    /// Documents that fail to decode are skipped with a warning so one bad
    /// record cannot hide the rest of the collection.
    ///
    /// # Errors
    /// Returns an error if the backend fails.
    pub async fn all<T: Document>(&self) -> StoreResult<Vec<T>> {
        let raw = self.store.fetch_all(T::KIND).await?;
        let mut docs = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<T>(value) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(kind = %T::KIND, error = %e, "Skipping undecodable document"),
            }
        }
        Ok(docs)
    }

    /// A single document by primary key.
    ///
    /// # Errors
    /// Returns an error if the backend fails or the document cannot be decoded.
    pub async fn get<T: Document>(&self, uuid: &str) -> StoreResult<Option<T>> {
        match self.store.fetch_by_uuid(T::KIND, uuid).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Insert or update, returning the stored (versioned) copy.
    ///
    /// # Errors
    /// Returns an error if encoding or the backend fails.
    pub async fn persist<T: Document>(&self, doc: &T) -> StoreResult<T> {
        let value = serde_json::to_value(doc)?;
        let stored = self.store.persist(T::KIND, doc.uuid(), value).await?;
        Ok(serde_json::from_value(stored)?)
    }

    /// Remove a document.
    ///
    /// # Errors
    /// Returns an error if the backend fails.
    pub async fn delete<T: Document>(&self, doc: &T) -> StoreResult<bool> {
        self.store.delete(T::KIND, doc.uuid()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_version_from_previous() {
        let previous = serde_json::json!({"uuid": "a", "version": 4});
        let mut doc = serde_json::json!({"uuid": "a", "version": 1});
        bump_version(Some(&previous), &mut doc);
        assert_eq!(doc["version"], 5);
    }

    #[test]
    fn test_bump_version_new_document() {
        let mut doc = serde_json::json!({"uuid": "a"});
        bump_version(None, &mut doc);
        assert_eq!(doc["version"], 1);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Kind::PolicyTable.to_string(), "policy_table");
        assert_eq!(Kind::TagRule.as_str(), "tag_rule");
    }
}
