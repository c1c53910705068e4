//! Result lines of a benchmark.
//!
//! ## Output Format
//!
//! All outputs are in plain text format, one line per record. This makes the output easy to
//! process using shell scripts and tools including gnuplot. Lines go to stdout, and are appended
//! to the output file as well if one is given.
//!
//! ### Throughput-only Output (default case)
//!
//! A find phase run with 4 threads and 2 repeats may look like the following:
//!
//! ```txt
//! phase 0 op find threads 4 repeat 0 duration 0.52 elapsed 3.10 total 1000000 per_thread 250001 mops 1.93 found 1000000 expected 1000000
//! phase 0 op find threads 4 repeat 1 duration 0.50 elapsed 3.60 total 1000000 per_thread 250001 mops 2.00 found 1000000 expected 1000000
//! phase 0 op find threads 4 finish . duration 1.02 elapsed 3.60 total 2000000 per_thread 250001 mops 1.96 found 1000000 expected 1000000
//! ```
//!
//! The general format is:
//!
//! ```txt
//! phase <p> op <o> threads <n> repeat <r> duration <d> elapsed <e> total <t> per_thread <k> mops <m>
//! ```
//!
//! Where:
//!
//! - `<p>`: phase id.
//! - `<o>`: the operation of the phase.
//! - `<n>`: number of worker threads of the run.
//! - `<r>`: repeat id in a run, or string `finish .`, if the line is the aggregated report of a
//! whole run.
//! - `<d>`: the duration of the repeat/run in seconds, as seen by the slowest worker.
//! - `<e>`: the total elapsed seconds since the starting of the program.
//! - `<t>`: the number of keys processed by all worker threads in the repeat/run.
//! - `<k>`: the nominal number of keys given to each thread.
//! - `<m>`: the throughput in million operations per second of the repeat/run.
//!
//! Finds and deletes append `found <f> expected <x>`, the number of keys that were found (or
//! deleted) and the number a correct store would report. On the `finish` line, `<f>` is taken from
//! the first repeat, the only one that starts from a freshly prefilled store.
//!
//! ### Throughput + Latency Output (when `latency` is `true`)
//!
//! The `finish` line has extra output about the distribution of batch times, where a batch is the
//! whole range of one worker in one repeat:
//!
//! ```txt
//! min_us <i> max_us <a> avg_us <v> p50_us <m> p95_us <n> p99_us <p>
//! ```

use crate::bench::{Benchmark, RunSummary};
use crate::*;
use hdrhistogram::Histogram;
use quanta::Instant;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// How the metrics of a run are printed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportMode {
    Hidden,
    Repeat,
    Finish,
    All,
}

impl ReportMode {
    fn repeat(&self) -> bool {
        matches!(self, ReportMode::Repeat | ReportMode::All)
    }

    fn finish(&self) -> bool {
        matches!(self, ReportMode::Finish | ReportMode::All)
    }
}

impl FromStr for ReportMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hidden" => Ok(ReportMode::Hidden),
            "repeat" => Ok(ReportMode::Repeat),
            "finish" => Ok(ReportMode::Finish),
            "all" => Ok(ReportMode::All),
            _ => Err(Error::Config(format!(
                "report mode should be one of: hidden, repeat, finish, all (got {})",
                s
            ))),
        }
    }
}

fn found_fields(hits: Option<u64>, expected: Option<u64>) -> String {
    match (hits, expected) {
        (Some(f), Some(x)) => format!(" found {} expected {}", f, x),
        _ => String::new(),
    }
}

/// The line of a single repeat.
pub fn repeat_line(
    phase: usize,
    benchmark: &Benchmark,
    summary: &RunSummary,
    repeat: usize,
    elapsed: f64,
) -> String {
    format!(
        "phase {} op {} threads {} repeat {} duration {:.2} elapsed {:.2} total {} per_thread {} mops {:.2}{}",
        phase,
        benchmark.workload.kind,
        summary.nr_threads,
        repeat,
        summary.duration(repeat).as_secs_f64(),
        elapsed,
        summary.total(repeat),
        summary.per_thread,
        summary.mops(repeat),
        found_fields(summary.hits(repeat), summary.expected),
    )
}

/// The aggregated line of a whole run.
pub fn finish_line(
    phase: usize,
    benchmark: &Benchmark,
    summary: &RunSummary,
    elapsed: f64,
) -> Result<String> {
    let repeats = 0..summary.nr_repeats();
    let duration: f64 = repeats
        .clone()
        .map(|r| summary.duration(r).as_secs_f64())
        .sum();
    let total: u64 = repeats.map(|r| summary.total(r)).sum();
    let mops = if duration > 0.0 {
        total as f64 / duration / 1_000_000.0
    } else {
        0.0
    };
    // later repeats of a delete run on keys that are already gone
    let hits = if summary.nr_repeats() > 0 {
        summary.hits(0)
    } else {
        None
    };
    let mut line = format!(
        "phase {} op {} threads {} finish . duration {:.2} elapsed {:.2} total {} per_thread {} mops {:.2}{}",
        phase,
        benchmark.workload.kind,
        summary.nr_threads,
        duration,
        elapsed,
        total,
        summary.per_thread,
        mops,
        found_fields(hits, summary.expected),
    );
    if benchmark.latency {
        line.push(' ');
        line.push_str(&latency_fields(summary)?);
    }
    Ok(line)
}

/// Distribution of the per-worker batch times of a run, in microseconds.
pub fn latency_fields(summary: &RunSummary) -> Result<String> {
    let mut hdr = Histogram::<u64>::new(3)
        .map_err(|e| Error::Output(format!("cannot create histogram: {}", e)))?;
    for r in summary.results.iter().flatten() {
        hdr.record(r.duration.as_nanos() as u64)
            .map_err(|e| Error::Output(format!("cannot record latency: {}", e)))?;
    }
    Ok(format!(
        "min_us {:.2} max_us {:.2} avg_us {:.2} p50_us {:.2} p95_us {:.2} p99_us {:.2}",
        hdr.min() as f64 / 1000.0,
        hdr.max() as f64 / 1000.0,
        hdr.mean() / 1000.0,
        hdr.value_at_quantile(0.50) as f64 / 1000.0,
        hdr.value_at_quantile(0.95) as f64 / 1000.0,
        hdr.value_at_quantile(0.99) as f64 / 1000.0,
    ))
}

/// Where result lines go.
pub struct Reporter {
    out: Option<BufWriter<File>>,
    since: Instant,
}

impl Reporter {
    pub fn stdout() -> Self {
        Self {
            out: None,
            since: Instant::now(),
        }
    }

    /// Print to stdout and append to `path`, creating it and its parent directories if needed.
    pub fn with_file(path: &Path) -> Result<Self> {
        let output = |e: std::io::Error| Error::Output(format!("{}: {}", path.display(), e));
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(output)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(output)?;
        Ok(Self {
            out: Some(BufWriter::new(file)),
            since: Instant::now(),
        })
    }

    fn elapsed(&self) -> f64 {
        self.since.elapsed().as_secs_f64()
    }

    fn emit(&mut self, line: &str) -> Result<()> {
        println!("{}", line);
        if let Some(out) = self.out.as_mut() {
            writeln!(out, "{}", line).map_err(|e| Error::Output(e.to_string()))?;
        }
        Ok(())
    }

    /// Emit the lines of a finished run according to the phase's report mode.
    pub fn report(&mut self, phase: usize, benchmark: &Benchmark, summary: &RunSummary) -> Result<()> {
        let elapsed = self.elapsed();
        if benchmark.report.repeat() {
            for r in 0..summary.nr_repeats() {
                let line = repeat_line(phase, benchmark, summary, r, elapsed);
                self.emit(&line)?;
            }
        }
        if benchmark.report.finish() {
            let line = finish_line(phase, benchmark, summary, elapsed)?;
            self.emit(&line)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        match self.out.as_mut() {
            Some(out) => out.flush().map_err(|e| Error::Output(e.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::RunResult;
    use crate::workload::OperationKind;
    use std::time::Duration;

    fn benchmark(kind: OperationKind, report: &str, latency: bool) -> Benchmark {
        let opt = format!(
            r#"
            op = "{}"
            prefill = 100
            ops = 100
            repeat = 2
            report = "{}"
            latency = {}
            "#,
            kind, report, latency
        );
        let opt: crate::bench::BenchmarkOpt = toml::from_str(&opt).unwrap();
        Benchmark::new(&opt).unwrap()
    }

    fn summary(hits: Option<u64>) -> RunSummary {
        let r = |ms, items, hits| RunResult {
            duration: Duration::from_millis(ms),
            items,
            hits,
        };
        RunSummary {
            nr_threads: 2,
            per_thread: 51,
            expected: hits.map(|_| 100),
            results: vec![
                vec![r(1000, 51, hits), r(500, 51, hits.map(|_| 0))],
                vec![r(500, 49, hits), r(250, 49, hits.map(|_| 0))],
            ],
        }
    }

    #[test]
    fn report_mode_names() {
        assert_eq!("hidden".parse::<ReportMode>().unwrap(), ReportMode::Hidden);
        assert_eq!("all".parse::<ReportMode>().unwrap(), ReportMode::All);
        assert!(matches!("alll".parse::<ReportMode>(), Err(Error::Config(_))));
        assert!(ReportMode::All.repeat() && ReportMode::All.finish());
        assert!(!ReportMode::Hidden.repeat() && !ReportMode::Hidden.finish());
    }

    #[test]
    fn repeat_line_format() {
        let b = benchmark(OperationKind::Insert, "all", false);
        let line = repeat_line(1, &b, &summary(None), 0, 3.0);
        assert_eq!(
            line,
            "phase 1 op insert threads 2 repeat 0 duration 1.00 elapsed 3.00 \
             total 100 per_thread 51 mops 0.00"
        );
    }

    #[test]
    fn find_lines_carry_found_count() {
        let b = benchmark(OperationKind::Find, "all", false);
        let s = summary(Some(50));
        let line = repeat_line(0, &b, &s, 0, 1.0);
        assert!(line.ends_with("found 100 expected 100"), "{}", line);
        // the first repeat counts on the finish line
        let line = finish_line(0, &b, &s, 1.0).unwrap();
        assert!(line.contains("finish . duration 1.50"), "{}", line);
        assert!(line.contains("total 200"), "{}", line);
        assert!(line.ends_with("found 100 expected 100"), "{}", line);

        // a delete that hit everything is not reported as a miss
        let b = benchmark(OperationKind::Delete, "finish", false);
        let s = summary(Some(50));
        let line = finish_line(0, &b, &s, 1.0).unwrap();
        assert!(line.ends_with("found 100 expected 100"), "{}", line);
        assert!(repeat_line(0, &b, &s, 1, 1.0).ends_with("found 0 expected 100"));
    }

    #[test]
    fn finish_line_with_latency() {
        let b = benchmark(OperationKind::Update, "finish", true);
        let line = finish_line(0, &b, &summary(None), 1.0).unwrap();
        assert!(line.contains(" min_us "), "{}", line);
        assert!(line.contains(" p99_us "), "{}", line);
        let fields = latency_fields(&summary(None)).unwrap();
        let min: f64 = fields.split(' ').nth(1).unwrap().parse().unwrap();
        assert!((min - 250_000.0).abs() < 250.0);
    }

    #[test]
    fn lines_are_appended_to_file() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("out").join("results.txt");
        let b = benchmark(OperationKind::Delete, "repeat", false);
        for _ in 0..2 {
            let mut reporter = Reporter::with_file(&path).unwrap();
            reporter.report(0, &b, &summary(Some(100))).unwrap();
            reporter.flush().unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().all(|l| l.starts_with("phase 0 op delete threads 2 repeat")));
    }

    #[test]
    fn hidden_reports_nothing() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("results.txt");
        let b = benchmark(OperationKind::Find, "hidden", true);
        let mut reporter = Reporter::with_file(&path).unwrap();
        reporter.report(0, &b, &summary(Some(1))).unwrap();
        reporter.flush().unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().is_empty());
    }
}
