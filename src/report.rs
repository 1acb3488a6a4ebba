use crate::worker::{WorkerResult, new_latency_histogram};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use hdrhistogram::Histogram;
use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thousands::Separable;

/// Rounds the exact value half-up to four decimals and prints without
/// trailing zeros.
pub fn format_decimal(value: f64) -> String {
    match Decimal::from_f64_retain(value) {
        Some(d) => d
            .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
            .normalize()
            .to_string(),
        None => "-".into(),
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// Throughput (invocations/sec) and latency (msec/invocation) derived from
/// one time span.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub time_ms: f64,
    pub per_sec: f64,
    pub latency_ms: f64,
}

impl Throughput {
    pub fn compute(total_count: u64, time_ms: f64) -> Self {
        if total_count == 0 || time_ms <= 0.0 {
            return Throughput {
                time_ms,
                per_sec: 0.0,
                latency_ms: 0.0,
            };
        }
        Throughput {
            time_ms,
            per_sec: total_count as f64 / time_ms * 1000.0,
            latency_ms: time_ms / total_count as f64,
        }
    }
}

/// Run metadata printed at the top of every report.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub product: String,
    pub database_mode: bool,
    pub group: String,
    pub concurrent_groups: String,
    pub comment: String,
    pub operations: String,
    pub test_count: u32,
    pub test_interval: Duration,
    pub total_invocation_count: u32,
    pub thread_count: u32,
    pub invocations_per_thread: u32,
}

#[derive(Debug)]
pub struct Report {
    pub info: RunInfo,
    pub start_time: DateTime<Local>,
    pub stop_time: DateTime<Local>,
    pub thread_times: Vec<Duration>,
    pub total_count: u64,
    /// Bounded by the slowest worker.
    pub max_thread: Throughput,
    /// Includes start-up and join skew between workers.
    pub elapsed: Throughput,
    pub misses: u64,
    pub children_written: u64,
    pub latency_micros: Histogram<u64>,
}

impl Report {
    pub fn new(
        info: RunInfo,
        start_time: DateTime<Local>,
        stop_time: DateTime<Local>,
        workers: &[WorkerResult],
        wall_clock: Duration,
    ) -> Result<Self> {
        let total_count = workers.iter().map(|w| w.operation_count).sum();
        let thread_times: Vec<Duration> = workers.iter().map(|w| w.total_elapsed).collect();
        let mut latency_micros = new_latency_histogram()?;
        for w in workers {
            latency_micros
                .add(&w.latency_micros)
                .map_err(|e| anyhow::anyhow!("merging latency histograms: {e:?}"))?;
        }
        let max_time = thread_times.iter().copied().max().unwrap_or_default();
        Ok(Report {
            info,
            start_time,
            stop_time,
            total_count,
            max_thread: Throughput::compute(total_count, millis(max_time)),
            elapsed: Throughput::compute(total_count, wall_clock.as_millis() as f64),
            thread_times,
            misses: workers.iter().map(|w| w.misses).sum(),
            children_written: workers.iter().map(|w| w.children_written).sum(),
            latency_micros,
        })
    }

    pub fn file_name(&self) -> String {
        format!(
            "group-{}-{}-{}.txt",
            self.info.group,
            self.info.product,
            self.start_time.format("%y%m%d-%H%M%S")
        )
    }

    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating results directory {}", dir.display()))?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, self.to_string())
            .with_context(|| format!("writing report {}", path.display()))?;
        Ok(path)
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let i = &self.info;
        let header = if i.database_mode { " (Database)" } else { "" };
        writeln!(f, "******************************************")?;
        writeln!(f, "Group Test{header}")?;
        writeln!(f, "******************************************")?;
        writeln!(f)?;
        writeln!(f, "                       Product: {}", i.product)?;
        writeln!(f, "                         Group: {}", i.group)?;
        writeln!(f, "           Concurrent Group(s): {}", i.concurrent_groups)?;
        writeln!(f, "                       Comment: {}", i.comment)?;
        writeln!(f, "                    Operations: {}", i.operations)?;
        writeln!(f, "                Test Run Count: {}", i.test_count)?;
        writeln!(f, "      Test Run Interval (msec): {}", i.test_interval.as_millis())?;
        writeln!(f, "Total Invocation Count per Run: {}", i.total_invocation_count)?;
        writeln!(f, "                  Thread Count: {}", i.thread_count)?;
        writeln!(f, "   Invocation Count per Thread: {}", i.invocations_per_thread)?;
        writeln!(f)?;
        writeln!(f, "Start Time: {}", self.start_time.format("%a %b %e %H:%M:%S %Z %Y"))?;
        writeln!(f)?;
        writeln!(f, "Actual Total Number of Invocations: {}", self.total_count)?;
        writeln!(f)?;
        writeln!(f, "Time unit: msec")?;
        for (n, t) in self.thread_times.iter().enumerate() {
            writeln!(f, "   Thread {}: {}", n + 1, format_decimal(millis(*t)))?;
        }
        writeln!(f)?;
        writeln!(f, "                Max Time (msec): {}", format_decimal(self.max_thread.time_ms))?;
        writeln!(f, "            Elapsed Time (msec): {}", format_decimal(self.elapsed.time_ms))?;
        writeln!(f, "         Total Invocation Count: {}", self.total_count)?;
        writeln!(f, " M Throughput (invocations/sec): {}", format_decimal(self.max_thread.per_sec))?;
        writeln!(f, "M Latency per invocation (msec): {}", format_decimal(self.max_thread.latency_ms))?;
        writeln!(f, " E Throughput (invocations/sec): {}", format_decimal(self.elapsed.per_sec))?;
        writeln!(f, "E Latency per invocation (msec): {}", format_decimal(self.elapsed.latency_ms))?;
        writeln!(f)?;
        let percentile = |q: f64| -> String {
            if self.latency_micros.is_empty() {
                "-".into()
            } else {
                self.latency_micros.value_at_quantile(q).separate_with_underscores()
            }
        };
        writeln!(
            f,
            "     Invocation latency (µs): p50: {} | p95: {} | p99: {} | p99.9: {}",
            percentile(0.50),
            percentile(0.95),
            percentile(0.99),
            percentile(0.999)
        )?;
        writeln!(f, "                 Lookup misses: {}", self.misses)?;
        writeln!(f, "          ER child records sent: {}", self.children_written)?;
        writeln!(f)?;
        writeln!(f, "Stop Time: {}", self.stop_time.format("%a %b %e %H:%M:%S %Z %Y"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(thread_num: u32, ms: u64, count: u64) -> WorkerResult {
        WorkerResult {
            thread_num,
            operation_count: count,
            total_elapsed: Duration::from_millis(ms),
            misses: 1,
            children_written: 0,
            latency_micros: new_latency_histogram().unwrap(),
        }
    }

    fn info() -> RunInfo {
        RunInfo {
            product: "mem".into(),
            database_mode: false,
            group: "g1".into(),
            concurrent_groups: "g1 & g2".into(),
            comment: "smoke".into(),
            operations: "op1".into(),
            test_count: 1,
            test_interval: Duration::ZERO,
            total_invocation_count: 300,
            thread_count: 3,
            invocations_per_thread: 100,
        }
    }

    #[test]
    fn max_thread_view_uses_slowest_worker() {
        let workers = [worker(1, 100, 100), worker(2, 150, 100), worker(3, 120, 100)];
        let now = Local::now();
        let report = Report::new(info(), now, now, &workers, Duration::from_millis(200)).unwrap();
        assert_eq!(report.total_count, 300);
        assert_eq!(report.max_thread.per_sec, 2000.0);
        assert_eq!(report.max_thread.latency_ms, 0.5);
        assert_eq!(report.elapsed.per_sec, 1500.0);
        assert!((report.elapsed.latency_ms - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.misses, 3);

        let text = report.to_string();
        assert!(text.contains(" M Throughput (invocations/sec): 2000\n"));
        assert!(text.contains("M Latency per invocation (msec): 0.5\n"));
        assert!(text.contains("E Latency per invocation (msec): 0.6667\n"));
        assert!(text.contains("   Thread 2: 150\n"));
        assert!(text.contains("Concurrent Group(s): g1 & g2"));
    }

    #[test]
    fn decimals_round_half_up() {
        assert_eq!(format_decimal(0.12345), "0.1235");
        assert_eq!(format_decimal(2.0), "2");
        assert_eq!(format_decimal(1.00004), "1");
        assert_eq!(format_decimal(1.03125), "1.0313");
        assert_eq!(format_decimal(-1.03125), "-1.0313");
        assert_eq!(format_decimal(2000.0), "2000");
        assert_eq!(format_decimal(0.0), "0");
    }

    #[test]
    fn rounding_uses_the_exact_binary_value() {
        // Each literal is stored just below its decimal tie.
        assert_eq!(format_decimal(2.00005), "2");
        assert_eq!(format_decimal(10.00005), "10");
        assert_eq!(format_decimal(0.50005), "0.5");
        assert_eq!(format_decimal(100.00035), "100.0003");
        assert_eq!(format_decimal(f64::INFINITY), "-");
    }

    #[test]
    fn zero_time_yields_zero_throughput() {
        let t = Throughput::compute(10, 0.0);
        assert_eq!(t.per_sec, 0.0);
        assert_eq!(t.latency_ms, 0.0);
    }

    #[test]
    fn report_file_follows_naming_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let now = Local::now();
        let report = Report::new(info(), now, now, &[worker(1, 10, 5)], Duration::from_millis(10)).unwrap();
        let path = report.write_to(&dir.path().join("results")).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("group-g1-mem-"), "{name}");
        assert!(name.ends_with(".txt"));
        assert_eq!(name.len(), "group-g1-mem-".len() + "yyMMdd-HHmmss".len() + 4);
        assert!(std::fs::read_to_string(path).unwrap().contains("Stop Time:"));
    }
}
