use crate::channel::{Channel, DbChannel, HandleMap, OperationHandles, StreamChannel};
use crate::client::{Consumer, Producer, SessionPool};
use crate::config::{Properties, RunSettings};
use crate::database::Database;
use crate::error::ConfigError;
use crate::factory::FactoryRegistry;
use crate::group::{ConcurrentGroupSet, assemble_groups};
use crate::operation::{Operation, OperationRegistry, TestCase, TransportTuning};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Producer/consumer handles shared per operation.
    Stream,
    /// Pooled transactional sessions, one per worker.
    Database,
}

/// Everything one benchmark run needs, resolved up front from a single
/// configuration snapshot.
pub struct Engine {
    pub settings: RunSettings,
    pub registry: OperationRegistry,
    pub sets: Vec<ConcurrentGroupSet>,
    pub mode: RunMode,
}

impl Engine {
    pub fn from_properties(
        props: Properties,
        factories: FactoryRegistry,
        mode: RunMode,
    ) -> Result<Self, ConfigError> {
        let props = Arc::new(props);
        let settings = RunSettings::from_properties(&props)?;
        let mut registry = OperationRegistry::new(props.clone(), factories);
        let sets = assemble_groups(&props, &mut registry)?;

        if mode == RunMode::Database {
            for group in sets.iter().flat_map(|s| &s.groups) {
                if let Some(op) = group
                    .all_operations()
                    .find(|op| op.resource().is_some() && op.factory.is_none())
                {
                    return Err(ConfigError::MissingFactory {
                        group: group.name.clone(),
                        operation: op.name.clone(),
                    });
                }
            }
        }

        Ok(Engine {
            settings,
            registry,
            sets,
            mode,
        })
    }

    /// Every distinct operation across all groups, ER children included.
    pub fn operations(&self) -> Vec<Arc<Operation>> {
        let mut seen = HashSet::new();
        self.sets
            .iter()
            .flat_map(|s| &s.groups)
            .flat_map(|g| g.all_operations())
            .filter(|op| seen.insert(op.name.clone()))
            .cloned()
            .collect()
    }

    fn er_children(&self) -> HashSet<String> {
        self.sets
            .iter()
            .flat_map(|s| &s.groups)
            .flat_map(|g| g.er_operations.iter().map(|op| op.name.clone()))
            .collect()
    }

    /// Attaches live handles to every operation for the coming run.
    pub fn open_backend(&self, db: Arc<dyn Database>) -> Backend {
        match self.mode {
            RunMode::Database => {
                Backend::Database(SessionPool::new(db, self.settings.session_pool_size))
            }
            RunMode::Stream => {
                let children = self.er_children();
                let handles = self
                    .operations()
                    .iter()
                    .filter_map(|op| {
                        let handles = open_handles(&db, op, children.contains(&op.name))?;
                        Some((op.name.clone(), handles))
                    })
                    .collect();
                Backend::Stream(handles)
            }
        }
    }
}

fn open_handles(
    db: &Arc<dyn Database>,
    op: &Operation,
    is_er_child: bool,
) -> Option<OperationHandles> {
    let test_case = op.test_case()?;
    let tuning = &op.settings.transport;
    let mut handles = OperationHandles::default();
    match test_case {
        TestCase::Read => {
            handles.consumer = Some(Arc::new(Consumer::new(db.clone(), TransportTuning::default())))
        }
        TestCase::ReadBatch => {
            let fetch = TransportTuning {
                fetch_size: tuning.fetch_size,
                fetch_ms: tuning.fetch_ms,
                ..TransportTuning::default()
            };
            handles.consumer = Some(Arc::new(Consumer::new(db.clone(), fetch)));
        }
        TestCase::Write => {
            handles.producer = Some(Arc::new(Producer::new(db.clone(), TransportTuning::default())))
        }
        TestCase::WriteBatch => {
            let batching = TransportTuning {
                batch_size: tuning.batch_size,
                linger_ms: tuning.linger_ms,
                compression: tuning.compression,
                ..TransportTuning::default()
            };
            handles.producer = Some(Arc::new(Producer::new(db.clone(), batching)));
        }
    }
    // Children are always written to, whatever their own test case says.
    if is_er_child && handles.producer.is_none() {
        handles.producer = Some(Arc::new(Producer::new(db.clone(), *tuning)));
    }
    debug!(operation = %op.name, %test_case, "handles attached");
    Some(handles)
}

/// Live handles for one run; released when dropped.
pub enum Backend {
    Stream(HandleMap),
    Database(SessionPool),
}

impl Backend {
    /// A channel for one worker. In database mode this blocks until a pooled
    /// session is free.
    pub fn open_channel(&self) -> Box<dyn Channel + '_> {
        match self {
            Backend::Stream(handles) => Box::new(StreamChannel::new(handles)),
            Backend::Database(pool) => Box::new(DbChannel::new(pool.checkout())),
        }
    }

    pub fn close(&self) {
        match self {
            Backend::Stream(handles) => {
                for handle in handles.values() {
                    if let Some(producer) = &handle.producer {
                        producer.close();
                    }
                    if let Some(consumer) = &handle.consumer {
                        consumer.close();
                    }
                }
            }
            Backend::Database(pool) => debug!(idle = pool.idle_count(), "session pool released"),
        }
    }
}
