//! Client handles the engine hands to its workers: producers and consumers
//! for stream-style runs, pooled transactional sessions for database runs.

use crate::database::{Database, PendingWrite};
use crate::operation::TransportTuning;
use anyhow::{Result, bail};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

pub struct Producer {
    db: Arc<dyn Database>,
    tuning: TransportTuning,
    sent: AtomicU64,
}

impl Producer {
    pub fn new(db: Arc<dyn Database>, tuning: TransportTuning) -> Self {
        debug!(?tuning, store = db.name(), "creating producer");
        Producer {
            db,
            tuning,
            sent: AtomicU64::new(0),
        }
    }

    pub fn send(&self, resource: &str, key: &str, value: &[u8]) -> Result<()> {
        self.db.set(resource, key.as_bytes(), value)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[cfg(test)]
    pub fn tuning(&self) -> &TransportTuning {
        &self.tuning
    }

    /// Number of records sent through this handle so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        debug!(sent = self.sent(), tuning = ?self.tuning, "closing producer");
    }
}

pub struct Consumer {
    db: Arc<dyn Database>,
    tuning: TransportTuning,
}

impl Consumer {
    pub fn new(db: Arc<dyn Database>, tuning: TransportTuning) -> Self {
        debug!(?tuning, store = db.name(), "creating consumer");
        Consumer { db, tuning }
    }

    pub fn poll(&self, resource: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.get(resource, key.as_bytes())
    }

    pub fn close(&self) {
        debug!(tuning = ?self.tuning, "closing consumer");
    }

    #[cfg(test)]
    pub fn tuning(&self) -> &TransportTuning {
        &self.tuning
    }
}

/// A unit-of-work handle: writes persisted between `begin` and `commit`
/// land together.
pub struct Session {
    db: Arc<dyn Database>,
    pending: Vec<PendingWrite>,
    open: bool,
}

impl Session {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Session {
            db,
            pending: Vec::new(),
            open: false,
        }
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.open {
            bail!("transaction already in progress");
        }
        self.open = true;
        self.pending.clear();
        Ok(())
    }

    pub fn persist(&mut self, table: &str, key: &str, value: &[u8]) -> Result<()> {
        if !self.open {
            bail!("persist outside of a transaction");
        }
        self.pending.push(PendingWrite {
            resource: table.to_owned(),
            key: key.as_bytes().to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.open {
            bail!("commit without a transaction");
        }
        self.open = false;
        let writes = std::mem::take(&mut self.pending);
        self.db.apply(&writes)
    }

    pub fn find(&mut self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.get(table, key.as_bytes())
    }

    /// Looks up `keys` in one round and returns the keys that were found.
    pub fn query(&mut self, table: &str, keys: &[String]) -> Result<Vec<String>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if self.db.get(table, key.as_bytes())?.is_some() {
                found.push(key.clone());
            }
        }
        Ok(found)
    }
}

/// Bounded session pool. `checkout` blocks while every session is in use.
pub struct SessionPool {
    idle: Mutex<Vec<Session>>,
    available: Condvar,
}

impl SessionPool {
    pub fn new(db: Arc<dyn Database>, size: usize) -> Self {
        let idle = (0..size.max(1)).map(|_| Session::new(db.clone())).collect();
        SessionPool {
            idle: Mutex::new(idle),
            available: Condvar::new(),
        }
    }

    pub fn checkout(&self) -> PooledSession<'_> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(session) = idle.pop() {
                return PooledSession {
                    pool: self,
                    session: Some(session),
                };
            }
            idle = self
                .available
                .wait(idle)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn give_back(&self, mut session: Session) {
        session.open = false;
        session.pending.clear();
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session);
        self.available.notify_one();
    }
}

/// Returns its session to the pool on drop.
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Option<Session>,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session held until drop")
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session held until drop")
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session);
        }
    }
}
