//! The core benchmark functionality.
//!
//! A benchmark in this crate actually refers to a group of benchmark runs, named **phases**. Users
//! can provide one or multiple phases that will be run sequentially, each with a different
//! operation. Every phase is run once for each thread count it is configured with, and each of
//! those runs goes through the same lifecycle:
//!
//! 1. Worker 0 initializes the store and prefills it, the other workers wait.
//! 2. Every worker computes its own key range (see [`mod@crate::workload`]) and runs the phase's
//! operation over it, `repeat` times. All workers start each repeat together.
//! 3. Once every worker is done, worker 0 tears the store down.
//!
//! No store instance is shared between two thread counts.
//!
//! ## Configuration Format
//!
//! A benchmark configuration file is formatted in TOML. It consists of the definition of multiple
//! phases, each is defined in a dictionary named `benchmark`. Phases are organized in an array, so
//! the configuration of each phase starts with `[[benchmark]]`. It also supports a `[global]`
//! section in the configuration file that will override the missing field in each phase. This can
//! reduce the number of repeated options in each phase (e.g., shared options).
//!
//! A configuration file generally looks like the following:
//!
//! ```toml
//! [global]
//! max_threads = 8
//! threads = [9, 18, 24]
//! repeat = 3
//! prefill = 1000000
//!
//! [[benchmark]]
//! op = "find"
//! ops = 1000000
//!
//! [[benchmark]]
//! op = "insert"
//! ops = 1000000
//! ```
//!
//! Available options and their usage can be found in [`BenchmarkOpt`] and [`GlobalOpt`], for phase
//! and global options, respectively.
//!
//! Options in `[global]` section can be overwritten via environment variables without changing the
//! content in the TOML file.
//! For example, if the user needs to override `x` in `[global]`, setting the environment variable
//! `global.x` will get the job done.
//!
//! The output format is documented in [`mod@crate::report`].

use crate::report::{ReportMode, Reporter};
use crate::stores::{BenchKVMap, BenchKVMapOpt};
use crate::thread::{JoinHandle, Rendezvous, Thread, LEADER};
use crate::workload::{Workload, WorkloadOpt};
use crate::*;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use quanta::Instant;
use serde::Deserialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

// {{{ benchmark

/// The configuration of a single benchmark deserialized from a TOML string.
///
/// The fields are optional to ease parsing from TOML, as there can be global parameters that are
/// set for them.
#[derive(Deserialize, Clone, Debug)]
pub struct BenchmarkOpt {
    /// Thread counts this benchmark is run with, in order.
    ///
    /// If `max_threads` is also given, these are run after the power-of-two sweep.
    pub threads: Option<Vec<usize>>,

    /// Run with 1, 2, 4, ... threads up to and including `max_threads`.
    ///
    /// Default: neither `threads` nor `max_threads`, meaning a single run with 1 thread.
    pub max_threads: Option<usize>,

    /// How many times each worker runs the operation over its range in one run. Every repeat is
    /// timed and reported on its own.
    ///
    /// Default: 1.
    pub repeat: Option<usize>,

    /// Report mode:
    ///
    /// - "hidden": not reported.
    /// - "repeat": after each repeat, the metrics for that repeat is printed.
    /// - "finish": after all repeats are finished, the metrics of the whole run is printed.
    /// - "all": equals to "repeat" + "finish".
    pub report: Option<String>,

    /// Whether or not to print the distribution of per-worker batch times at the end of each
    /// run. A batch is one worker's whole range in one repeat.
    ///
    /// Default: false.
    pub latency: Option<bool>,

    /// The definition of a workload.
    ///
    /// This section is embedded and flattened, so that you can directly use options in
    /// [`WorkloadOpt`].
    #[serde(flatten)]
    pub workload: WorkloadOpt,
}

/// Thread counts of a power-of-two sweep: 1, 2, 4, ... and finally `max` itself.
pub fn thread_sweep(max: usize) -> Vec<usize> {
    let mut threads = Vec::new();
    let mut t = 1;
    while t < max {
        threads.push(t);
        t *= 2;
    }
    threads.push(max);
    threads
}

impl BenchmarkOpt {
    /// The thread counts of this phase, in run order and without duplicates.
    fn thread_counts(&self) -> Vec<usize> {
        let mut threads = self.max_threads.map(thread_sweep).unwrap_or_default();
        threads.extend(self.threads.iter().flatten());
        let mut seen = Vec::with_capacity(threads.len());
        for t in threads {
            if !seen.contains(&t) {
                seen.push(t);
            }
        }
        if seen.is_empty() {
            seen.push(1);
        }
        seen
    }
}

/// The configuration of a benchmark, parsed from user's input.
#[derive(Debug, PartialEq)]
pub struct Benchmark {
    pub(crate) threads: Vec<usize>,
    pub(crate) repeat: usize,
    pub(crate) report: ReportMode,
    pub(crate) latency: bool,
    pub(crate) workload: Workload,
}

impl Benchmark {
    /// The constructor of Benchmark expects all fields have their values, the struct should
    /// contain either its own parameters, or carry the default parameters.
    pub fn new(opt: &BenchmarkOpt) -> Result<Self> {
        let threads = opt.thread_counts();
        if threads.iter().any(|t| *t == 0) {
            return Err(Error::Config("threads should be positive".to_string()));
        }
        let repeat = opt.repeat.unwrap_or(1);
        if repeat == 0 {
            return Err(Error::Config("repeat should be positive".to_string()));
        }
        let report = opt.report.as_deref().unwrap_or("all").parse()?;
        let latency = opt.latency.unwrap_or(false);
        let workload = Workload::new(&opt.workload)?;
        for t in threads.iter() {
            workload.check_threads(*t)?;
        }
        Ok(Self {
            threads,
            repeat,
            report,
            latency,
            workload,
        })
    }

    pub fn threads(&self) -> &[usize] {
        &self.threads
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }
}

// }}} benchmark

// {{{ benchmarkgroup

/// The global options that go to the `[global]` section.
///
/// They will override missing fields in each `[[benchmark]]` section, if the corresponding option
/// is missing. For the usage of each option, please refer to [`BenchmarkOpt`] and
/// [`WorkloadOpt`].
#[derive(Deserialize, Clone, Debug, Default)]
pub struct GlobalOpt {
    // benchmark
    pub threads: Option<Vec<usize>>,
    pub max_threads: Option<usize>,
    pub repeat: Option<usize>,
    pub report: Option<String>,
    pub latency: Option<bool>,
    // workload
    pub prefill: Option<u64>,
    pub ops: Option<u64>,
}

impl GlobalOpt {
    fn apply(&self, opt: &mut BenchmarkOpt) {
        // the thread sweep is taken as a whole, never mixed
        if opt.threads.is_none() && opt.max_threads.is_none() {
            opt.threads = self.threads.clone();
            opt.max_threads = self.max_threads;
        }
        opt.repeat = opt.repeat.or(self.repeat);
        opt.report = opt.report.clone().or_else(|| self.report.clone());
        opt.latency = opt.latency.or(self.latency);
        opt.workload.prefill = opt.workload.prefill.or(self.prefill);
        opt.workload.ops = opt.workload.ops.or(self.ops);
    }
}

/// The configuration of a group of benchmark(s). It has a global option that could possibly
/// override benchmark-local options.
#[derive(Deserialize, Clone, Debug)]
struct BenchmarkGroupOpt {
    /// Global parameters (optional)
    global: Option<GlobalOpt>,

    /// Map configuration
    map: BenchKVMapOpt,

    /// Array of the parameters of consisting Benchmark(s)
    benchmark: Vec<BenchmarkOpt>,
}

// }}} benchmarkgroup

// {{{ bencher

/// Parse a store configuration and a list of phases out of one TOML text. Nothing is run and no
/// store is initialized yet.
pub fn init(text: &str) -> Result<(BenchKVMap, Vec<Arc<Benchmark>>)> {
    let opt: BenchmarkGroupOpt = Figment::new()
        .merge(Toml::string(text))
        .merge(Env::raw())
        .extract()?;
    debug!(
        "Creating benchmark group with the following configurations: {:?}",
        opt
    );
    let global = opt.global.clone().unwrap_or_default();
    let mut bopts: Vec<BenchmarkOpt> = opt.benchmark.clone();
    for bopt in bopts.iter_mut() {
        global.apply(bopt);
    }
    debug!("Global options applied to benchmarks: {:?}", bopts);
    let phases = bopts
        .iter()
        .map(|o| Benchmark::new(o).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;
    let map = BenchKVMap::new(&opt.map)?;
    Ok((map, phases))
}

/// What one worker measured in one repeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunResult {
    /// Time spent on the whole range.
    pub duration: Duration,

    /// Number of keys in the range.
    pub items: u64,

    /// Found or deleted keys, for operations that count them.
    pub hits: Option<u64>,
}

/// The metrics of one worker thread. Each repeat's slot is written once by the worker, and only
/// read by the main thread after all workers have joined.
struct Measurement {
    results: Vec<Mutex<Option<RunResult>>>,

    /// The first error this worker ran into.
    error: Mutex<Option<Error>>,
}

impl Measurement {
    fn new(repeat: usize) -> Self {
        let results = (0..repeat).map(|_| Mutex::new(None)).collect();
        Self {
            results,
            error: Mutex::new(None),
        }
    }

    fn fail(&self, e: Error) {
        let mut error = self.error.lock();
        if error.is_none() {
            *error = Some(e);
        }
    }
}

/// Everything measured in one run of a phase with a given number of threads.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub nr_threads: usize,

    /// The nominal number of keys per thread, before clamping.
    pub per_thread: u64,

    /// For finds and deletes, how many hits a correct store would report per repeat.
    pub expected: Option<u64>,

    /// Indexed by `[thread][repeat]`.
    pub results: Vec<Vec<RunResult>>,
}

impl RunSummary {
    pub fn nr_repeats(&self) -> usize {
        self.results.first().map_or(0, |r| r.len())
    }

    /// Wall time of a repeat, i.e., the slowest worker.
    pub fn duration(&self, repeat: usize) -> Duration {
        self.results
            .iter()
            .map(|r| r[repeat].duration)
            .max()
            .unwrap_or_default()
    }

    pub fn total(&self, repeat: usize) -> u64 {
        self.results.iter().map(|r| r[repeat].items).sum()
    }

    pub fn hits(&self, repeat: usize) -> Option<u64> {
        self.results.iter().map(|r| r[repeat].hits).sum()
    }

    /// Sum of every worker's own throughput in a repeat, in million operations per second.
    pub fn mops(&self, repeat: usize) -> f64 {
        self.results
            .iter()
            .map(|r| &r[repeat])
            .filter(|r| !r.duration.is_zero())
            .map(|r| r.items as f64 / r.duration.as_secs_f64() / 1_000_000.0)
            .sum()
    }
}

struct WorkerContext {
    /// The benchmark phase that the current work is referring to
    benchmark: Arc<Benchmark>,

    /// The measurement of all worker threads. One worker only writes to its own, and the main
    /// thread collects all of them after the run
    measurements: Arc<Vec<Measurement>>,

    /// Barrier and one-time steps shared by all workers
    rendezvous: Arc<Rendezvous>,

    /// `(worker_id, nr_threads)` pair, used to determine the identity of a worker and also its
    /// key range
    thread_info: (usize, usize),
}

/// Run a store call, turning a panic into an error of the given stage. A worker that unwinds
/// past a barrier would leave the others waiting forever.
fn guarded<T>(stage: fn(String) -> Error, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(stage(format!("store panicked: {}", msg)))
        }
    }
}

fn bench_worker(map: Arc<Box<dyn KVMap>>, context: WorkerContext, thread: Arc<dyn Thread>) {
    let WorkerContext {
        benchmark,
        measurements,
        rendezvous,
        thread_info,
    } = context;

    let id = thread_info.0;
    thread.pin(id);
    let measurement = &measurements[id];
    let workload = &benchmark.workload;

    let setup = rendezvous.lead(id, || {
        guarded(Error::Setup, || {
            map.init(workload.nr_prefill, workload.kind.re_init())
        })
    });

    match setup {
        Ok(()) => {
            let range = workload.range(thread_info);
            let mut handle = match guarded(Error::Run, || map.handle()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    measurement.fail(e);
                    None
                }
            };
            for i in 0..benchmark.repeat {
                // start each repeat at roughly the same time
                rendezvous.wait();
                let Some(h) = handle.as_mut() else {
                    continue;
                };
                let start = Instant::now();
                match guarded(Error::Run, || workload.execute(h.as_mut(), range)) {
                    Ok(hits) => {
                        let duration = Instant::now().duration_since(start);
                        *measurement.results[i].lock() = Some(RunResult {
                            duration,
                            items: range.len(),
                            hits,
                        });
                    }
                    Err(e) => {
                        // skip the remaining repeats but keep joining the barriers
                        measurement.fail(e);
                        handle = None;
                    }
                }
            }
            drop(handle);
        }
        Err(e) => {
            if id == LEADER {
                measurement.fail(e);
            }
            for _ in 0..benchmark.repeat {
                rendezvous.wait();
            }
        }
    }

    // nobody may still be running when the store goes away
    rendezvous.wait();
    if let Err(e) = rendezvous.lead(id, || guarded(Error::Teardown, || map.deinit())) {
        if id == LEADER {
            measurement.fail(e);
        }
    }
}

/// Run one phase with `nr_threads` workers: initialize, run all repeats, tear down.
///
/// Returns the first error by lifecycle stage (setup before run before teardown). No partial
/// measurements are returned for a failed run.
pub fn bench_run(
    map: Arc<Box<dyn KVMap>>,
    benchmark: Arc<Benchmark>,
    nr_threads: usize,
) -> Result<RunSummary> {
    let workload = benchmark.workload;
    workload.check_threads(nr_threads)?;
    info!(
        "Running {} with {} threads, {} repeats",
        workload.kind, nr_threads, benchmark.repeat
    );

    let thread: Arc<dyn Thread> = Arc::from(map.thread());
    let rendezvous = Arc::new(Rendezvous::new(nr_threads));
    let measurements: Arc<Vec<Measurement>> = Arc::new(
        (0..nr_threads)
            .map(|_| Measurement::new(benchmark.repeat))
            .collect(),
    );
    let mut handles: Vec<Box<dyn JoinHandle>> = Vec::with_capacity(nr_threads);
    for t in 0..nr_threads {
        let map = map.clone();
        let context = WorkerContext {
            benchmark: benchmark.clone(),
            measurements: measurements.clone(),
            rendezvous: rendezvous.clone(),
            thread_info: (t, nr_threads),
        };
        let worker_thread = thread.clone();
        let handle = thread.spawn(Box::new(move || {
            bench_worker(map, context, worker_thread);
        }));
        handles.push(handle);
    }

    while let Some(handle) = handles.pop() {
        handle.join();
    }

    let first_error = measurements
        .iter()
        .filter_map(|m| m.error.lock().take())
        .min_by_key(|e| match e {
            Error::Config(_) => 0,
            Error::Setup(_) => 1,
            Error::Run(_) => 2,
            Error::Teardown(_) => 3,
            Error::Output(_) => 4,
        });
    if let Some(e) = first_error {
        return Err(e);
    }

    let mut results = Vec::with_capacity(nr_threads);
    for (t, m) in measurements.iter().enumerate() {
        let mut repeats = Vec::with_capacity(benchmark.repeat);
        for (i, r) in m.results.iter().enumerate() {
            let r = r.lock().take().ok_or_else(|| {
                Error::Run(format!("worker {} recorded nothing for repeat {}", t, i))
            })?;
            repeats.push(r);
        }
        results.push(repeats);
    }

    let expected = workload.kind.counts_hits().then(|| {
        (0..nr_threads)
            .map(|t| workload.range((t, nr_threads)).len())
            .sum()
    });

    Ok(RunSummary {
        nr_threads,
        per_thread: workload.per_thread(nr_threads),
        expected,
        results,
    })
}

/// The real benchmark function: every phase, every thread count, in order.
///
/// The first failed run stops the whole benchmark.
pub fn bench(
    map: Arc<Box<dyn KVMap>>,
    phases: &[Arc<Benchmark>],
    reporter: &mut Reporter,
) -> Result<()> {
    debug!("Running bencher with {} phases", phases.len());
    for (i, p) in phases.iter().enumerate() {
        for &nr_threads in p.threads.iter() {
            let summary = bench_run(map.clone(), p.clone(), nr_threads).map_err(|e| {
                error!(
                    "phase {} ({}) with {} threads aborted during {}: {}",
                    i,
                    p.workload.kind,
                    nr_threads,
                    e.stage(),
                    e
                );
                e
            })?;
            if let (Some(hits), Some(expected)) = (summary.hits(0), summary.expected) {
                if hits != expected {
                    warn!(
                        "phase {} ({}) with {} threads: {} of {} keys hit",
                        i, p.workload.kind, nr_threads, hits, expected
                    );
                }
            }
            reporter.report(i, p, &summary)?;
        }
    }
    reporter.flush()
}

// }}} bencher

// {{{ tests


// }}} tests
