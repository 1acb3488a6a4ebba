use crate::channel::Channel;
use crate::er::{Generators, OperationMap, synthesize, write_children};
use crate::group::Group;
use crate::operation::{Operation, OperationKind, TestCase};
use anyhow::Result;
use hdrhistogram::Histogram;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The slice of a group's invocation range owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPlan {
    /// 1-based.
    pub thread_num: u32,
    /// First global invocation index, 1-based.
    pub start_index: u64,
    pub invocations: u32,
}

impl WorkerPlan {
    pub fn indexes(&self) -> std::ops::Range<u64> {
        self.start_index..self.start_index + self.invocations as u64
    }
}

/// Consecutive, non-overlapping invocation ranges, one per thread.
pub fn plan_workers(group: &Group) -> Vec<WorkerPlan> {
    let per_thread = group.invocations_per_thread();
    (0..group.thread_count)
        .map(|t| WorkerPlan {
            thread_num: t + 1,
            start_index: 1 + t as u64 * per_thread as u64,
            invocations: per_thread,
        })
        .collect()
}

/// Rotating key offset confined to `[(n-1)*entries, n*entries)` where
/// `entries = totalEntryCount / threadCount`.
#[derive(Debug, Clone)]
pub struct KeyCursor {
    lower: u64,
    upper: u64,
    next: u64,
}

impl KeyCursor {
    pub fn new(thread_num: u32, thread_count: u32, total_entry_count: u32) -> Self {
        let entries = (total_entry_count / thread_count.max(1)) as u64;
        let lower = thread_num.saturating_sub(1) as u64 * entries;
        KeyCursor {
            lower,
            upper: lower + entries,
            next: lower,
        }
    }

    #[cfg(test)]
    pub fn range(&self) -> std::ops::Range<u64> {
        self.lower..self.upper
    }

    /// Returns the current offset and moves on, wrapping to the lower bound
    /// instead of crossing into the next worker's range.
    pub fn advance(&mut self) -> u64 {
        let current = self.next;
        self.next += 1;
        if self.next >= self.upper {
            self.next = self.lower;
        }
        current
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Repetition {
    pub count: u32,
    pub interval: Duration,
}

/// Totals reported by a worker once all repetitions are done.
#[derive(Debug)]
pub struct WorkerResult {
    pub thread_num: u32,
    pub operation_count: u64,
    pub total_elapsed: Duration,
    pub misses: u64,
    pub children_written: u64,
    pub latency_micros: Histogram<u64>,
}

pub fn new_latency_histogram() -> Result<Histogram<u64>> {
    Ok(Histogram::new_with_bounds(1, 10_000_000, 3)?)
}

pub struct Worker<'a> {
    plan: WorkerPlan,
    group: &'a Group,
    operations: &'a OperationMap,
    progress: &'a AtomicU64,
    generators: Generators,
    operation_count: u64,
    misses: u64,
    children_written: u64,
    latency_micros: Histogram<u64>,
}

impl<'a> Worker<'a> {
    pub fn new(
        plan: WorkerPlan,
        group: &'a Group,
        operations: &'a OperationMap,
        progress: &'a AtomicU64,
    ) -> Result<Self> {
        Ok(Worker {
            plan,
            group,
            operations,
            progress,
            generators: Generators::new(plan.thread_num),
            operation_count: 0,
            misses: 0,
            children_written: 0,
            latency_micros: new_latency_histogram()?,
        })
    }

    /// Runs every repetition, sleeping `interval` between them.
    pub fn run(mut self, channel: &mut dyn Channel, repetition: Repetition) -> Result<WorkerResult> {
        let mut total_elapsed = Duration::ZERO;
        for rep in 0..repetition.count {
            let elapsed = self.run_pass(channel)?;
            debug!(
                group = %self.group.name,
                thread = self.plan.thread_num,
                rep,
                elapsed_ms = elapsed.as_millis() as u64,
                "repetition done"
            );
            total_elapsed += Duration::from_millis(elapsed.as_millis() as u64);
            if rep + 1 < repetition.count && !repetition.interval.is_zero() {
                std::thread::sleep(repetition.interval);
            }
        }
        Ok(WorkerResult {
            thread_num: self.plan.thread_num,
            operation_count: self.operation_count,
            total_elapsed,
            misses: self.misses,
            children_written: self.children_written,
            latency_micros: self.latency_micros,
        })
    }

    /// One pass over the worker's invocation range. The caller accumulates
    /// whole milliseconds per pass.
    pub fn run_pass(&mut self, channel: &mut dyn Channel) -> Result<Duration> {
        let group = self.group;
        let mut cursors: Vec<KeyCursor> = group
            .operations
            .iter()
            .map(|op| {
                KeyCursor::new(
                    self.plan.thread_num,
                    group.thread_count,
                    op.settings.total_entry_count,
                )
            })
            .collect();

        let start = Instant::now();
        for index in self.plan.indexes() {
            let invocation = Instant::now();
            for (op, cursor) in group.operations.iter().zip(cursors.iter_mut()) {
                self.step(channel, op, cursor, index)?;
            }
            self.latency_micros
                .saturating_record(invocation.elapsed().as_micros() as u64);
            self.operation_count += 1;
            self.progress.fetch_add(1, Ordering::Relaxed);
        }
        Ok(start.elapsed())
    }

    fn step(
        &mut self,
        channel: &mut dyn Channel,
        op: &Operation,
        cursor: &mut KeyCursor,
        index: u64,
    ) -> Result<()> {
        let test_case = match &op.settings.kind {
            OperationKind::Pause(duration) => {
                std::thread::sleep(*duration);
                return Ok(());
            }
            OperationKind::DataStructure { test_case, .. } => *test_case,
        };
        let s = &op.settings;
        match test_case {
            TestCase::Write => {
                let entry = synthesize(op, s.start_num + index - 1, None)?;
                channel.write(op, &entry)?;
                self.children_written += write_children(
                    channel,
                    self.operations,
                    op,
                    &entry.key,
                    index,
                    &mut self.generators,
                )?;
            }
            TestCase::WriteBatch => {
                // A batch larger than the worker's key share wraps onto keys
                // it already holds; each key is sent once.
                let mut ids = HashSet::with_capacity(s.batch_size as usize);
                let entries = (0..s.batch_size)
                    .map(|_| s.start_num + cursor.advance())
                    .filter(|id| ids.insert(*id))
                    .map(|id| synthesize(op, id, None))
                    .collect::<Result<Vec<_>>>()?;
                channel.write_batch(op, &entries)?;
            }
            TestCase::Read => {
                let key = self.random_key(op);
                if !channel.read(op, &key)? {
                    self.misses += 1;
                    warn!(
                        "{}. [{}.{}.{}] key={} value=null",
                        self.plan.thread_num,
                        self.group.name,
                        op.resource().unwrap_or_default(),
                        test_case,
                        key
                    );
                }
            }
            TestCase::ReadBatch => {
                let mut seen = HashSet::with_capacity(s.batch_size as usize);
                let keys: Vec<String> = (0..s.batch_size)
                    .map(|_| self.random_key(op))
                    .filter(|k| seen.insert(k.clone()))
                    .collect();
                let found = channel.read_batch(op, &keys)?;
                if found < keys.len() {
                    self.misses += (keys.len() - found) as u64;
                    warn!(
                        "{}. [{}.{}.{}] returned {}/{}",
                        self.plan.thread_num,
                        self.group.name,
                        op.resource().unwrap_or_default(),
                        test_case,
                        found,
                        keys.len()
                    );
                }
            }
        }
        Ok(())
    }

    fn random_key(&mut self, op: &Operation) -> String {
        let offset = self
            .generators
            .for_operation(op)
            .random_range(0..op.settings.total_entry_count) as u64;
        op.key_for(op.settings.start_num + offset)
    }
}
