use crate::database::{Database, PendingWrite};
use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

/// One sled tree per resource.
pub struct Sled {
    db: sled::Db,
    _f: Option<TempDir>,
}

impl Sled {
    pub fn new(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Ok(Sled {
                db: sled::open(p).with_context(|| format!("opening sled at {}", p.display()))?,
                _f: None,
            }),
            None => {
                let f = TempDir::new()?;
                let db = sled::open(f.path())?;
                Ok(Sled { db, _f: Some(f) })
            }
        }
    }

    fn exists(&self, resource: &str) -> bool {
        self.db
            .tree_names()
            .iter()
            .any(|name| &**name == resource.as_bytes())
    }
}

impl Database for Sled {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn get(&self, resource: &str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if !self.exists(resource) {
            return Ok(None);
        }
        Ok(self.db.open_tree(resource)?.get(key)?.map(|v| v.to_vec()))
    }

    fn set(&self, resource: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.db.open_tree(resource)?.insert(key, value)?;
        Ok(())
    }

    fn apply(&self, writes: &[PendingWrite]) -> anyhow::Result<()> {
        let mut batches: BTreeMap<&str, sled::Batch> = BTreeMap::new();
        for w in writes {
            batches
                .entry(w.resource.as_str())
                .or_default()
                .insert(w.key.as_slice(), w.value.as_slice());
        }
        for (resource, batch) in batches {
            self.db.open_tree(resource)?.apply_batch(batch)?;
        }
        Ok(())
    }

    fn len(&self, resource: &str) -> anyhow::Result<Option<u64>> {
        if !self.exists(resource) {
            return Ok(None);
        }
        Ok(Some(self.db.open_tree(resource)?.len() as u64))
    }

    fn drop_resource(&self, resource: &str) -> anyhow::Result<bool> {
        Ok(self.db.drop_tree(resource)?)
    }
}
