mod mem_btree;
mod redb;
mod sled;

use crate::DatabaseType;
use crate::database::mem_btree::MemBTree;
use crate::database::redb::Redb;
use crate::database::sled::Sled;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

/// One buffered write, applied together with its siblings by
/// [`Database::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub resource: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Storage engine behind the producer, consumer and session handles.
/// Every call is synchronous; implementations must be safe to share across
/// worker threads.
pub trait Database: Send + Sync {
    fn name(&self) -> &'static str;
    fn get(&self, resource: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, resource: &str, key: &[u8], value: &[u8]) -> Result<()>;
    /// Applies all writes as one unit.
    fn apply(&self, writes: &[PendingWrite]) -> Result<()>;
    /// Number of entries in `resource`, `None` if it does not exist.
    fn len(&self, resource: &str) -> Result<Option<u64>>;
    /// Destroys `resource`; `false` if there was nothing to destroy.
    fn drop_resource(&self, resource: &str) -> Result<bool>;
}

pub fn get_db(database: DatabaseType, path: Option<&Path>) -> Result<Arc<dyn Database>> {
    match database {
        DatabaseType::Mem => Ok(Arc::new(MemBTree::default())),
        DatabaseType::Redb => Ok(Arc::new(Redb::new(path)?)),
        DatabaseType::Sled => Ok(Arc::new(Sled::new(path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(db: Arc<dyn Database>) {
        assert_eq!(db.len("t1").unwrap(), None);
        assert_eq!(db.get("t1", b"k1").unwrap(), None);
        db.set("t1", b"k1", b"v1").unwrap();
        db.apply(&[
            PendingWrite {
                resource: "t1".into(),
                key: b"k2".to_vec(),
                value: b"v2".to_vec(),
            },
            PendingWrite {
                resource: "t2".into(),
                key: b"k1".to_vec(),
                value: b"x".to_vec(),
            },
        ])
        .unwrap();
        assert_eq!(db.get("t1", b"k2").unwrap().as_deref(), Some(&b"v2"[..]));
        assert_eq!(db.len("t1").unwrap(), Some(2));
        assert_eq!(db.len("t2").unwrap(), Some(1));
        assert!(db.drop_resource("t1").unwrap());
        assert!(!db.drop_resource("t1").unwrap());
        assert_eq!(db.get("t1", b"k1").unwrap(), None);
    }

    #[test]
    fn mem_btree_contract() {
        exercise(get_db(DatabaseType::Mem, None).unwrap());
    }

    #[test]
    fn redb_contract() {
        exercise(get_db(DatabaseType::Redb, None).unwrap());
    }

    #[test]
    fn sled_contract() {
        exercise(get_db(DatabaseType::Sled, None).unwrap());
    }
}
