use crate::database::{Database, PendingWrite};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
pub struct MemBTree {
    data: RwLock<HashMap<String, Table>>,
}

impl Database for MemBTree {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn get(&self, resource: &str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(resource)
            .and_then(|t| t.get(key).cloned()))
    }

    fn set(&self, resource: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(resource.to_owned())
            .or_default()
            .insert(Vec::from(key), Vec::from(value));
        Ok(())
    }

    fn apply(&self, writes: &[PendingWrite]) -> anyhow::Result<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        for w in writes {
            data.entry(w.resource.clone())
                .or_default()
                .insert(w.key.clone(), w.value.clone());
        }
        Ok(())
    }

    fn len(&self, resource: &str) -> anyhow::Result<Option<u64>> {
        Ok(self
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(resource)
            .map(|t| t.len() as u64))
    }

    fn drop_resource(&self, resource: &str) -> anyhow::Result<bool> {
        Ok(self
            .data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(resource)
            .is_some())
    }
}
