//! Durable `(label -> list<Template>)` mapping (§4.3), backed by a `sled`
//! tree keyed by `"{label}\0{template_id}"` — the same embedded store used
//! for cache L2, so this crate doesn't need a second persistence backend.
//!
//! Writes are serialised per label via a `tokio::sync::Mutex` looked up in a
//! `std::sync::Mutex<HashMap<label, Arc<Mutex<()>>>>` (§5): readers take no
//! lock beyond the brief one needed to clone a consistent snapshot out of
//! `sled`, which already guarantees they never observe a torn write.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::error::ExtractorError;
use crate::template::Template;

const KEY_SEP: u8 = 0;

pub struct TemplateStore {
    tree: sled::Tree,
    label_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    max_per_label: usize,
}

impl TemplateStore {
    pub fn open(db: &sled::Db, max_per_label: usize) -> anyhow::Result<Self> {
        let tree = db.open_tree("templates")?;
        Ok(Self {
            tree,
            label_locks: StdMutex::new(HashMap::new()),
            max_per_label,
        })
    }

    fn lock_for(&self, label: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.label_locks.lock().unwrap();
        locks
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn key(label: &str, template_id: &str) -> Vec<u8> {
        let mut key = label.as_bytes().to_vec();
        key.push(KEY_SEP);
        key.extend_from_slice(template_id.as_bytes());
        key
    }

    /// `list(label) -> ordered list<Template>`, ordered by `sample_count`
    /// descending then `updated_at` (§4.3).
    pub fn list(&self, label: &str) -> Result<Vec<Template>, ExtractorError> {
        let mut prefix = label.as_bytes().to_vec();
        prefix.push(KEY_SEP);

        let mut out = Vec::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (_, value) = item.map_err(|e| ExtractorError::Persistence(e.to_string()))?;
            let template: Template = serde_json::from_slice(&value)
                .map_err(|e| ExtractorError::Persistence(format!("corrupt template record: {}", e)))?;
            out.push(template);
        }

        out.sort_by(|a, b| {
            b.sample_count
                .cmp(&a.sample_count)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        Ok(out)
    }

    pub fn get(&self, label: &str, template_id: &str) -> Result<Option<Template>, ExtractorError> {
        let key = Self::key(label, template_id);
        match self.tree.get(&key).map_err(|e| ExtractorError::Persistence(e.to_string()))? {
            Some(bytes) => {
                let template = serde_json::from_slice(&bytes)
                    .map_err(|e| ExtractorError::Persistence(format!("corrupt template record: {}", e)))?;
                Ok(Some(template))
            }
            None => Ok(None),
        }
    }

    /// `upsert(label, template)`: atomic append-or-replace by `template_id`,
    /// serialised per label. Evicts the lowest-confidence, lowest-
    /// sample-count template on overflow of `max_per_label` (§5 quota).
    pub async fn upsert(&self, label: &str, template: Template) -> Result<(), ExtractorError> {
        let lock = self.lock_for(label);
        let _guard = lock.lock().await;

        let key = Self::key(label, &template.template_id);
        let bytes = serde_json::to_vec(&template)
            .map_err(|e| ExtractorError::Internal(format!("failed to serialise template: {}", e)))?;
        self.tree
            .insert(&key, bytes)
            .map_err(|e| ExtractorError::Persistence(e.to_string()))?;

        self.enforce_quota_locked(label)?;
        Ok(())
    }

    pub async fn delete(&self, label: &str, template_id: &str) -> Result<(), ExtractorError> {
        let lock = self.lock_for(label);
        let _guard = lock.lock().await;

        let key = Self::key(label, template_id);
        self.tree
            .remove(&key)
            .map_err(|e| ExtractorError::Persistence(e.to_string()))?;
        Ok(())
    }

    pub fn count_per_label(&self) -> Result<BTreeMap<String, usize>, ExtractorError> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for item in self.tree.iter() {
            let (key, _) = item.map_err(|e| ExtractorError::Persistence(e.to_string()))?;
            if let Some(sep_pos) = key.iter().position(|&b| b == KEY_SEP) {
                let label = String::from_utf8_lossy(&key[..sep_pos]).to_string();
                *counts.entry(label).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Called with the label lock already held.
    fn enforce_quota_locked(&self, label: &str) -> Result<(), ExtractorError> {
        let mut templates = self.list(label)?;
        if templates.len() <= self.max_per_label {
            return Ok(());
        }

        templates.sort_by(|a, b| {
            let a_conf = average_confidence(a);
            let b_conf = average_confidence(b);
            a_conf
                .partial_cmp(&b_conf)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.sample_count.cmp(&b.sample_count))
        });

        let overflow = templates.len() - self.max_per_label;
        for template in templates.into_iter().take(overflow) {
            let key = Self::key(label, &template.template_id);
            self.tree
                .remove(&key)
                .map_err(|e| ExtractorError::Persistence(e.to_string()))?;
        }
        Ok(())
    }
}

fn average_confidence(template: &Template) -> f64 {
    if template.field_confidence.is_empty() {
        return 0.0;
    }
    template.field_confidence.values().sum::<f64>() / template.field_confidence.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn open_tmp() -> (TemplateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (TemplateStore::open(&db, 16).unwrap(), dir)
    }

    #[tokio::test]
    async fn upsert_then_list_roundtrips() {
        let (store, _dir) = open_tmp();
        let template = Template::new("oab", HashSet::from(["cpf".to_string()]));
        let id = template.template_id.clone();

        store.upsert("oab", template).await.unwrap();
        let listed = store.list("oab").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].template_id, id);
    }

    #[tokio::test]
    async fn list_orders_by_sample_count_descending() {
        let (store, _dir) = open_tmp();
        let mut low = Template::new("oab", HashSet::new());
        low.sample_count = 2;
        let mut high = Template::new("oab", HashSet::new());
        high.sample_count = 9;

        store.upsert("oab", low).await.unwrap();
        store.upsert("oab", high).await.unwrap();

        let listed = store.list("oab").unwrap();
        assert_eq!(listed[0].sample_count, 9);
    }

    #[tokio::test]
    async fn quota_evicts_lowest_confidence_template() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = TemplateStore::open(&db, 1).unwrap();

        let mut weak = Template::new("oab", HashSet::new());
        weak.field_confidence.insert("cpf".to_string(), 0.2);
        store.upsert("oab", weak).await.unwrap();

        let mut strong = Template::new("oab", HashSet::new());
        strong.field_confidence.insert("cpf".to_string(), 0.9);
        store.upsert("oab", strong.clone()).await.unwrap();

        let listed = store.list("oab").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].template_id, strong.template_id);
    }
}
