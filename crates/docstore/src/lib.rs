//! Durable document storage behind a narrow contract.
//!
//! The core only ever sees [`DocumentStore`]; the production Firestore/RTDB
//! client plugs in behind it and stays outside this repository. The bundled
//! [`MemoryDocStore`] backs tests and local development.
//!
//! Documents are addressed by slash-separated paths; a *collection* is a
//! path prefix whose direct children are documents (`paths` centralizes the
//! layout).

pub mod memory;
pub mod paths;

use serde_json::Value;

use ma_domain::Result;

pub use memory::MemoryDocStore;

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_doc(&self, path: &str) -> Result<Option<Value>>;

    /// Write a document, replacing any previous content.
    async fn set_doc(&self, path: &str, doc: Value) -> Result<()>;

    /// Shallow-merge `fields` into the document, creating it if missing.
    /// Top-level keys in `fields` replace existing keys wholesale.
    async fn update_doc(&self, path: &str, fields: Value) -> Result<()>;

    async fn delete_doc(&self, path: &str) -> Result<()>;

    /// List the direct child documents of a collection as (id, doc) pairs.
    async fn list_docs(&self, collection: &str) -> Result<Vec<(String, Value)>>;
}
