use crate::database::{Database, PendingWrite};
use anyhow::Context;
use redb::{ReadableDatabase, ReadableTableMetadata, TableDefinition, TableError};
use std::path::Path;
use tempfile::NamedTempFile;

fn table(resource: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(resource)
}

/// One redb table per resource.
pub struct Redb {
    _f: Option<NamedTempFile>,
    db: redb::Database,
}

impl Redb {
    /// Opens (or creates) `path`, or a temporary file when no path is given.
    pub fn new(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Ok(Redb {
                _f: None,
                db: redb::Database::create(p)
                    .with_context(|| format!("opening redb file {}", p.display()))?,
            }),
            None => {
                let f = NamedTempFile::new()?;
                let db = redb::Database::create(f.path())?;
                Ok(Redb { _f: Some(f), db })
            }
        }
    }
}

impl Database for Redb {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn get(&self, resource: &str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let t = match tx.open_table(table(resource)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    fn set(&self, resource: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut t = tx.open_table(table(resource))?;
            t.insert(key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn apply(&self, writes: &[PendingWrite]) -> anyhow::Result<()> {
        let tx = self.db.begin_write()?;
        for w in writes {
            let mut t = tx.open_table(table(&w.resource))?;
            t.insert(w.key.as_slice(), w.value.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    fn len(&self, resource: &str) -> anyhow::Result<Option<u64>> {
        let tx = self.db.begin_read()?;
        match tx.open_table(table(resource)) {
            Ok(t) => Ok(Some(t.len()?)),
            Err(TableError::TableDoesNotExist(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn drop_resource(&self, resource: &str) -> anyhow::Result<bool> {
        let tx = self.db.begin_write()?;
        let deleted = tx.delete_table(table(resource))?;
        tx.commit()?;
        Ok(deleted)
    }
}
