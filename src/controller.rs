use crate::database::Database;
use crate::engine::{Backend, Engine, RunMode};
use crate::group::{ConcurrentGroupSet, Group};
use crate::operation::Operation;
use crate::report::{Report, RunInfo};
use crate::worker::{Repetition, Worker, WorkerResult, plan_workers};
use anyhow::{Result, anyhow};
use chrono::Local;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thousands::Separable;
use tracing::{error, info};

/// Counts down once per finished group coordinator.
pub struct CompletionLatch {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl CompletionLatch {
    pub fn new(count: usize) -> Self {
        CompletionLatch {
            remaining: Mutex::new(count),
            done: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    /// Waits up to `timeout`; returns true once every party has counted down.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        let (remaining, _) = self
            .done
            .wait_timeout_while(remaining, timeout, |r| *r > 0)
            .unwrap_or_else(|e| e.into_inner());
        *remaining == 0
    }
}

/// Counts the latch down even if the coordinator unwinds.
struct CountDownOnDrop<'a>(&'a CompletionLatch);

impl Drop for CountDownOnDrop<'_> {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

pub struct GroupOutcome {
    pub group: String,
    pub result: Result<(Report, PathBuf)>,
}

/// Runs concurrent group sets one after another, the groups of a set in
/// parallel.
pub struct Controller<'a> {
    engine: &'a Engine,
    backend: &'a Backend,
    product: String,
}

impl<'a> Controller<'a> {
    pub fn new(engine: &'a Engine, backend: &'a Backend, product: &str) -> Self {
        Controller {
            engine,
            backend,
            product: product.to_owned(),
        }
    }

    pub fn run_all(&self) -> Vec<GroupOutcome> {
        let mut outcomes = Vec::new();
        for set in &self.engine.sets {
            println!();
            println!("Running Group(s): {}", set.names());
            println!();
            outcomes.extend(self.run_set(set));
        }
        outcomes
    }

    pub fn run_set(&self, set: &ConcurrentGroupSet) -> Vec<GroupOutcome> {
        let names = set.names();
        let latch = CompletionLatch::new(set.groups.len());
        let progress: Vec<AtomicU64> = set.groups.iter().map(|_| AtomicU64::new(0)).collect();
        let started = Instant::now();

        std::thread::scope(|s| {
            let handles: Vec<_> = set
                .groups
                .iter()
                .zip(&progress)
                .map(|(group, counter)| {
                    let latch = &latch;
                    let names = names.as_str();
                    s.spawn(move || {
                        let _guard = CountDownOnDrop(latch);
                        self.run_group(names, group, counter)
                    })
                })
                .collect();

            let interval = self.engine.settings.status_interval;
            while !latch.wait_timeout(interval) {
                print_progress(&set.groups, &progress, started.elapsed());
            }
            print_progress(&set.groups, &progress, started.elapsed());

            set.groups
                .iter()
                .zip(handles)
                .map(|(group, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("coordinator for {} panicked", group.name)));
                    if let Err(err) = &result {
                        error!(group = %group.name, "group run failed: {err:?}");
                    }
                    GroupOutcome {
                        group: group.name.clone(),
                        result,
                    }
                })
                .collect()
        })
    }

    /// Spawns and joins one group's workers, then writes its report.
    pub fn run_group(
        &self,
        concurrent_groups: &str,
        group: &Group,
        progress: &AtomicU64,
    ) -> Result<(Report, PathBuf)> {
        let settings = &self.engine.settings;
        let operations = group.operation_map();
        let plans = plan_workers(group);
        let repetition = Repetition {
            count: settings.test_count,
            interval: settings.test_interval,
        };

        let start_time = Local::now();
        let started = Instant::now();
        let mut results: Vec<WorkerResult> = std::thread::scope(|s| {
            let handles: Vec<_> = plans
                .into_iter()
                .map(|plan| {
                    let operations = &operations;
                    s.spawn(move || -> Result<WorkerResult> {
                        let mut channel = self.backend.open_channel();
                        Worker::new(plan, group, operations, progress)?.run(&mut *channel, repetition)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(anyhow!("worker thread panicked")))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        let wall_clock = started.elapsed();
        let stop_time = Local::now();
        results.sort_by_key(|r| r.thread_num);

        let info = RunInfo {
            product: self.product.clone(),
            database_mode: matches!(self.backend, Backend::Database(_)),
            group: group.name.clone(),
            concurrent_groups: concurrent_groups.to_owned(),
            comment: group.comment.clone(),
            operations: group.operations_str.clone(),
            test_count: settings.test_count,
            test_interval: settings.test_interval,
            total_invocation_count: group.total_invocation_count,
            thread_count: group.thread_count,
            invocations_per_thread: group.invocations_per_thread(),
        };
        let report = Report::new(info, start_time, stop_time, &results, wall_clock)?;
        let path = report.write_to(std::path::Path::new(&settings.results_dir))?;
        println!("   {}", path.display());
        Ok((report, path))
    }
}

fn print_progress(groups: &[Group], progress: &[AtomicU64], elapsed: Duration) {
    for (group, counter) in groups.iter().zip(progress) {
        info!(
            "[{} sec] Invocation Count ({}): {}",
            elapsed.as_secs(),
            group.name,
            counter.load(Ordering::Relaxed).separate_with_commas()
        );
    }
}

/// One line of the list/delete walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceListing {
    pub group: String,
    pub operation: String,
    pub resource: String,
    pub entries: Option<u64>,
    /// `None` when only listing.
    pub deleted: Option<bool>,
}

/// Walks every configured operation, ER children included, and lists or
/// destroys its backing resource: the topic in stream mode, the session
/// table in database mode. No workers are started.
pub fn walk_resources(
    engine: &Engine,
    db: &dyn Database,
    delete: bool,
) -> Result<Vec<ResourceListing>> {
    let mut listings = Vec::new();
    for group in engine.sets.iter().flat_map(|s| &s.groups) {
        for op in &group.operations {
            walk_operation(engine, db, delete, group, op, &mut listings)?;
        }
    }
    Ok(listings)
}

fn walk_operation(
    engine: &Engine,
    db: &dyn Database,
    delete: bool,
    group: &Group,
    op: &Operation,
    listings: &mut Vec<ResourceListing>,
) -> Result<()> {
    let target = match engine.mode {
        RunMode::Stream => op.resource(),
        RunMode::Database => op.table(),
    };
    if let Some(resource) = target {
        let entries = db.len(resource)?;
        let deleted = if delete {
            Some(db.drop_resource(resource)?)
        } else {
            None
        };
        listings.push(ResourceListing {
            group: group.name.clone(),
            operation: op.name.clone(),
            resource: resource.to_owned(),
            entries,
            deleted,
        });
    }
    if let Some(child) = op
        .er_operation_name()
        .and_then(|name| engine.registry.get(name))
    {
        walk_operation(engine, db, delete, group, child, listings)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DatabaseType;
    use crate::config::Properties;
    use crate::database::get_db;
    use crate::factory::FactoryRegistry;
    use std::sync::Arc;

    fn engine(pairs: &[(&str, &str)], results: &std::path::Path, mode: RunMode) -> Engine {
        let results = results.to_string_lossy();
        let props: Properties = pairs
            .iter()
            .copied()
            .chain([("results.dir", &*results)])
            .collect();
        Engine::from_properties(props, FactoryRegistry::with_builtins(), mode).unwrap()
    }

    #[test]
    fn latch_releases_after_all_count_down() {
        let latch = CompletionLatch::new(2);
        assert!(!latch.wait_timeout(Duration::from_millis(5)));
        latch.count_down();
        assert!(!latch.wait_timeout(Duration::from_millis(5)));
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn two_workers_write_thousand_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            &[
                ("groupNames", "g1"),
                ("g1.operations", "op1"),
                ("op1.topic", "t1"),
                ("op1.testCase", "write"),
                ("g1.threadCount", "2"),
                ("g1.totalInvocationCount", "1000"),
            ],
            dir.path(),
            RunMode::Stream,
        );
        let db = get_db(DatabaseType::Mem, None).unwrap();
        let backend = engine.open_backend(db.clone());
        let outcomes = Controller::new(&engine, &backend, db.name()).run_all();
        backend.close();

        assert_eq!(outcomes.len(), 1);
        let (report, path) = outcomes[0].result.as_ref().unwrap();
        assert_eq!(report.total_count, 1000);
        assert_eq!(report.thread_times.len(), 2);
        assert_eq!(db.len("t1").unwrap(), Some(1000));
        assert!(db.get("t1", b"k1").unwrap().is_some());
        assert!(db.get("t1", b"k1000").unwrap().is_some());
        assert!(db.get("t1", b"k1001").unwrap().is_none());
        assert!(path.starts_with(dir.path()));
    }

    #[test]
    fn concurrent_groups_all_complete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            &[
                ("groupNames", "a & b, c"),
                ("a.operations", "w"),
                ("a.threadCount", "2"),
                ("a.totalInvocationCount", "101"),
                ("b.operations", "r, nap"),
                ("b.threadCount", "1"),
                ("b.totalInvocationCount", "10"),
                ("c.operations", "w"),
                ("c.threadCount", "1"),
                ("c.totalInvocationCount", "5"),
                ("w.topic", "t"),
                ("w.testCase", "writeBatch"),
                ("w.batchSize", "10"),
                ("r.topic", "t"),
                ("r.testCase", "read"),
                ("nap.sleep", "1"),
                ("testCount", "2"),
                ("printStatusIntervalInSec", "1"),
            ],
            dir.path(),
            RunMode::Stream,
        );
        let db = get_db(DatabaseType::Mem, None).unwrap();
        let backend = engine.open_backend(db.clone());
        let outcomes = Controller::new(&engine, &backend, "mem").run_all();
        let counts: Vec<(String, u64)> = outcomes
            .iter()
            .map(|o| (o.group.clone(), o.result.as_ref().unwrap().0.total_count))
            .collect();
        assert_eq!(
            counts,
            vec![("a".into(), 200), ("b".into(), 20), ("c".into(), 10)]
        );
    }

    #[test]
    fn database_mode_persists_er_children() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            &[
                ("groupNames", "g"),
                ("g.operations", "emp"),
                ("g.threadCount", "2"),
                ("g.totalInvocationCount", "10"),
                ("emp.testCase", "write"),
                ("emp.factory.class", "employee"),
                ("emp.factory.er.operation", "terr"),
                ("emp.factory.er.maxKeys", "3"),
                ("terr.factory.class", "employee-territory"),
                ("session.pool.size", "1"),
            ],
            dir.path(),
            RunMode::Database,
        );
        let db = get_db(DatabaseType::Redb, None).unwrap();
        let backend = engine.open_backend(db.clone());
        let outcomes = Controller::new(&engine, &backend, db.name()).run_all();
        let (report, _) = outcomes[0].result.as_ref().unwrap();
        assert_eq!(report.children_written, 30);
        assert_eq!(db.len("employee").unwrap(), Some(10));
        assert_eq!(db.len("employee_territory").unwrap(), Some(30));
        assert!(report.to_string().contains("Group Test (Database)"));
    }

    #[test]
    fn failing_group_does_not_block_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            &[
                ("groupNames", "a & b"),
                ("a.operations", "w"),
                ("a.threadCount", "1"),
                ("a.totalInvocationCount", "3"),
                ("b.operations", "w"),
                ("b.threadCount", "2"),
                ("b.totalInvocationCount", "3"),
                ("w.testCase", "write"),
            ],
            dir.path(),
            RunMode::Stream,
        );
        // No handles attached: every write fails.
        let backend = Backend::Stream(Default::default());
        let controller = Controller::new(&engine, &backend, "mem");
        let outcomes = controller.run_set(&engine.sets[0]);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.is_err()));
    }

    #[test]
    fn step_that_is_also_a_child_gets_a_producer() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            &[
                ("groupNames", "g"),
                ("g.operations", "emp, terr"),
                ("g.threadCount", "1"),
                ("g.totalInvocationCount", "4"),
                ("emp.topic", "employees"),
                ("emp.factory.class", "employee"),
                ("emp.factory.er.operation", "terr"),
                ("emp.factory.er.maxKeys", "2"),
                ("terr.topic", "territories"),
                ("terr.factory.class", "employee-territory"),
                ("terr.testCase", "read"),
            ],
            dir.path(),
            RunMode::Stream,
        );
        let db = get_db(DatabaseType::Mem, None).unwrap();
        let backend = engine.open_backend(db.clone());
        let outcomes = Controller::new(&engine, &backend, "mem").run_all();
        let (report, _) = outcomes[0].result.as_ref().unwrap();
        assert_eq!(report.total_count, 4);
        assert_eq!(report.children_written, 8);
        assert_eq!(db.len("territories").unwrap(), Some(8));
    }

    #[test]
    fn database_walk_lists_session_tables() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            &[
                ("groupNames", "g"),
                ("g.operations", "emp"),
                ("emp.topic", "employees"),
                ("emp.factory.class", "employee"),
            ],
            dir.path(),
            RunMode::Database,
        );
        let db: Arc<dyn Database> = get_db(DatabaseType::Mem, None).unwrap();
        db.set("employee", b"e000001", b"{}").unwrap();
        let listed = walk_resources(&engine, db.as_ref(), false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].resource, "employee");
        assert_eq!(listed[0].entries, Some(1));
    }

    #[test]
    fn walk_lists_and_deletes_er_resources() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            &[
                ("groupNames", "g"),
                ("g.operations", "emp"),
                ("emp.topic", "employees"),
                ("emp.factory.class", "employee"),
                ("emp.factory.er.operation", "terr"),
                ("terr.topic", "territories"),
            ],
            dir.path(),
            RunMode::Stream,
        );
        let db: Arc<dyn Database> = get_db(DatabaseType::Mem, None).unwrap();
        db.set("employees", b"e1", b"{}").unwrap();

        let listed = walk_resources(&engine, db.as_ref(), false).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].entries, Some(1));
        assert_eq!(listed[1].resource, "territories");
        assert_eq!(listed[1].entries, None);

        let deleted = walk_resources(&engine, db.as_ref(), true).unwrap();
        assert_eq!(deleted[0].deleted, Some(true));
        assert_eq!(deleted[1].deleted, Some(false));
        assert_eq!(db.len("employees").unwrap(), None);
    }
}
