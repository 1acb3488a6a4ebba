use crate::client::{Consumer, PooledSession, Producer};
use crate::factory::Entry;
use crate::operation::Operation;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// The path a worker uses to reach the store for one operation.
pub trait Channel {
    fn write(&mut self, operation: &Operation, entry: &Entry) -> Result<()>;
    /// Writes every entry as one logical pass.
    fn write_batch(&mut self, operation: &Operation, entries: &[Entry]) -> Result<()>;
    /// Returns whether the key was found.
    fn read(&mut self, operation: &Operation, key: &str) -> Result<bool>;
    /// Returns how many of `keys` were found.
    fn read_batch(&mut self, operation: &Operation, keys: &[String]) -> Result<usize>;
}

/// Live handles attached to one operation for the duration of a run.
#[derive(Default, Clone)]
pub struct OperationHandles {
    pub producer: Option<Arc<Producer>>,
    pub consumer: Option<Arc<Consumer>>,
}

pub type HandleMap = HashMap<String, OperationHandles>;

fn resource(operation: &Operation) -> Result<&str> {
    operation
        .resource()
        .with_context(|| format!("operation {} has no target resource", operation.name))
}

/// Shared producer/consumer handles, one set per operation.
pub struct StreamChannel<'a> {
    handles: &'a HandleMap,
}

impl<'a> StreamChannel<'a> {
    pub fn new(handles: &'a HandleMap) -> Self {
        StreamChannel { handles }
    }

    fn producer(&self, operation: &Operation) -> Result<&Producer> {
        self.handles
            .get(&operation.name)
            .and_then(|h| h.producer.as_deref())
            .with_context(|| format!("no producer attached to {}", operation.name))
    }

    fn consumer(&self, operation: &Operation) -> Result<&Consumer> {
        self.handles
            .get(&operation.name)
            .and_then(|h| h.consumer.as_deref())
            .with_context(|| format!("no consumer attached to {}", operation.name))
    }
}

impl Channel for StreamChannel<'_> {
    fn write(&mut self, operation: &Operation, entry: &Entry) -> Result<()> {
        self.producer(operation)?
            .send(resource(operation)?, &entry.key, &entry.value)
    }

    fn write_batch(&mut self, operation: &Operation, entries: &[Entry]) -> Result<()> {
        let producer = self.producer(operation)?;
        let resource = resource(operation)?;
        for entry in entries {
            producer.send(resource, &entry.key, &entry.value)?;
        }
        Ok(())
    }

    fn read(&mut self, operation: &Operation, key: &str) -> Result<bool> {
        Ok(self
            .consumer(operation)?
            .poll(resource(operation)?, key)?
            .is_some())
    }

    fn read_batch(&mut self, operation: &Operation, keys: &[String]) -> Result<usize> {
        let consumer = self.consumer(operation)?;
        let resource = resource(operation)?;
        let mut found = 0;
        for key in keys {
            if consumer.poll(resource, key)?.is_some() {
                found += 1;
            }
        }
        Ok(found)
    }
}

/// A pooled session; every write runs in its own transaction.
pub struct DbChannel<'a> {
    session: PooledSession<'a>,
}

impl<'a> DbChannel<'a> {
    pub fn new(session: PooledSession<'a>) -> Self {
        DbChannel { session }
    }

    fn table(operation: &Operation) -> Result<&str> {
        operation
            .table()
            .with_context(|| format!("operation {} has no target table", operation.name))
    }
}

impl Channel for DbChannel<'_> {
    fn write(&mut self, operation: &Operation, entry: &Entry) -> Result<()> {
        let table = Self::table(operation)?;
        self.session.begin()?;
        self.session.persist(table, &entry.key, &entry.value)?;
        self.session.commit()
    }

    fn write_batch(&mut self, operation: &Operation, entries: &[Entry]) -> Result<()> {
        let table = Self::table(operation)?;
        self.session.begin()?;
        for entry in entries {
            self.session.persist(table, &entry.key, &entry.value)?;
        }
        self.session.commit()
    }

    fn read(&mut self, operation: &Operation, key: &str) -> Result<bool> {
        Ok(self.session.find(Self::table(operation)?, key)?.is_some())
    }

    /// Queries at most `batchSize` keys per round trip.
    fn read_batch(&mut self, operation: &Operation, keys: &[String]) -> Result<usize> {
        let table = Self::table(operation)?;
        let chunk = operation.settings.batch_size.max(1) as usize;
        let mut found = 0;
        for keys in keys.chunks(chunk) {
            found += self.session.query(table, keys)?.len();
        }
        Ok(found)
    }
}
