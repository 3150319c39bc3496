//! In-memory [`DocumentStore`] for tests and local development.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::Value;

use ma_domain::Result;

use crate::DocumentStore;

#[derive(Default)]
pub struct MemoryDocStore {
    docs: RwLock<BTreeMap<String, Value>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn norm(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocStore {
    async fn get_doc(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.docs.read().get(&Self::norm(path)).cloned())
    }

    async fn set_doc(&self, path: &str, doc: Value) -> Result<()> {
        self.docs.write().insert(Self::norm(path), doc);
        Ok(())
    }

    async fn update_doc(&self, path: &str, fields: Value) -> Result<()> {
        let key = Self::norm(path);
        let mut docs = self.docs.write();
        let entry = docs.entry(key).or_insert_with(|| Value::Object(Default::default()));
        match (entry.as_object_mut(), fields.as_object()) {
            (Some(target), Some(updates)) => {
                for (k, v) in updates {
                    target.insert(k.clone(), v.clone());
                }
            }
            _ => *entry = fields,
        }
        Ok(())
    }

    async fn delete_doc(&self, path: &str) -> Result<()> {
        self.docs.write().remove(&Self::norm(path));
        Ok(())
    }

    async fn list_docs(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let prefix = format!("{}/", Self::norm(collection));
        let docs = self.docs.read();
        Ok(docs
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| {
                let rest = &k[prefix.len()..];
                // Direct children only — no '/' left in the remainder.
                (!rest.is_empty() && !rest.contains('/'))
                    .then(|| (rest.to_string(), v.clone()))
            })
            .collect())
    }
}
