//! Per-thread partitioning of the key space.
//!
//! A workload is one kind of operation ([`OperationKind`]) applied to a dense key space. Given the
//! number of prefilled keys, the number of operations and a `(thread_id, nr_threads)` pair, each
//! worker derives its own [`ThreadRange`] without talking to the others:
//!
//! - `insert`: `per = ops / threads + 1`, `start = id * per + prefill`,
//! `end = min(start + per, prefill + ops)`. Inserts continue the key space past the prefilled
//! region.
//! - `update`: `per = ops / threads`, `start = id * per`, `end = start + per`. When `ops` is not
//! divisible by `threads`, the trailing `ops % threads` keys are left out.
//! - `find` and `delete`: `per = ops / threads + 1`, `start = id * per`, `end = min(start + per,
//! ops)`.
//!
//! The `+ 1` pads every slice so that nothing is dropped on uneven division; the last threads'
//! slices are cut down (possibly to nothing) by the `min`.

use crate::*;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// The operation a workload runs on every key of a thread's range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Find,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Find => "find",
            OperationKind::Delete => "delete",
        }
    }

    /// Whether the store has to be rebuilt before this operation. Finds only read, so an already
    /// prefilled store can be reused.
    pub fn re_init(&self) -> bool {
        !matches!(self, OperationKind::Find)
    }

    /// Whether the operation reports a found/deleted counter.
    pub fn counts_hits(&self) -> bool {
        matches!(self, OperationKind::Find | OperationKind::Delete)
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "find" | "get" => Ok(OperationKind::Find),
            "delete" => Ok(OperationKind::Delete),
            _ => Err(Error::Config(format!(
                "op should be one of: insert, update, find, delete (got {})",
                s
            ))),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The half-open interval of keys a thread works on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadRange {
    pub start: Key,
    pub end: Key,
}

impl ThreadRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: Key) -> bool {
        self.start <= key && key < self.end
    }
}

/// Number of keys nominally assigned to each thread. This is the padded slice size before the
/// clamp, i.e., what the last threads may not actually get.
pub fn per_thread(kind: OperationKind, nr_ops: u64, nr_threads: usize) -> u64 {
    let nr_threads = nr_threads as u64;
    match kind {
        OperationKind::Update => nr_ops / nr_threads,
        OperationKind::Insert | OperationKind::Find | OperationKind::Delete => {
            nr_ops / nr_threads + 1
        }
    }
}

/// The range of thread `thread_info.0` out of `thread_info.1`.
pub fn thread_range(
    kind: OperationKind,
    nr_prefill: u64,
    nr_ops: u64,
    thread_info: (usize, usize),
) -> ThreadRange {
    let (id, nr_threads) = thread_info;
    assert!(id < nr_threads);
    let per = per_thread(kind, nr_ops, nr_threads);
    let id = id as u64;
    match kind {
        OperationKind::Insert => {
            let start = id * per + nr_prefill;
            let end = (start + per).min(nr_prefill + nr_ops);
            ThreadRange { start, end }
        }
        OperationKind::Update => {
            let start = id * per;
            ThreadRange {
                start,
                end: start + per,
            }
        }
        OperationKind::Find | OperationKind::Delete => {
            let start = id * per;
            let end = (start + per).min(nr_ops);
            ThreadRange { start, end }
        }
    }
}

/// A structure that can be deserialized from a toml string. It is flattened into each
/// `[[benchmark]]` section.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct WorkloadOpt {
    /// One of `insert`, `update`, `find` or `delete`.
    pub op: String,

    /// Number of keys inserted by the initializing thread before the operations start. Marked
    /// optional because it can also come from the `[global]` section.
    pub prefill: Option<u64>,

    /// Total number of operations, split among all threads.
    pub ops: Option<u64>,
}

/// A validated workload: what to run and over which key space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Workload {
    pub kind: OperationKind,
    pub nr_prefill: u64,
    pub nr_ops: u64,
}

impl Workload {
    pub fn new(opt: &WorkloadOpt) -> Result<Self> {
        let kind: OperationKind = opt.op.parse()?;
        let nr_prefill = opt
            .prefill
            .ok_or_else(|| Error::Config("prefill should be specified".to_string()))?;
        let nr_ops = opt
            .ops
            .ok_or_else(|| Error::Config("ops should be specified".to_string()))?;
        if nr_ops == 0 {
            return Err(Error::Config("ops should be positive".to_string()));
        }
        if kind.counts_hits() && nr_ops > nr_prefill {
            log::warn!(
                "{} covers {} keys but only {} are prefilled, expect misses",
                kind,
                nr_ops,
                nr_prefill
            );
        }
        Ok(Self {
            kind,
            nr_prefill,
            nr_ops,
        })
    }

    pub fn new_from_toml_str(text: &str) -> Result<Self> {
        let opt: WorkloadOpt = Figment::new()
            .merge(Toml::string(text))
            .merge(Env::raw())
            .extract()?;
        Self::new(&opt)
    }

    pub fn range(&self, thread_info: (usize, usize)) -> ThreadRange {
        thread_range(self.kind, self.nr_prefill, self.nr_ops, thread_info)
    }

    pub fn per_thread(&self, nr_threads: usize) -> u64 {
        per_thread(self.kind, self.nr_ops, nr_threads)
    }

    /// Reject thread counts that leave every thread with nothing to do.
    pub fn check_threads(&self, nr_threads: usize) -> Result<()> {
        if nr_threads == 0 {
            return Err(Error::Config("threads should be positive".to_string()));
        }
        // updates split by floor division, so fewer keys than threads means empty ranges
        if self.kind == OperationKind::Update && self.nr_ops < nr_threads as u64 {
            return Err(Error::Config(format!(
                "update ops should be at least the thread count ({} < {})",
                self.nr_ops, nr_threads
            )));
        }
        Ok(())
    }

    /// Run this workload's operation over `range` once. Returns the found/deleted count for
    /// operations that have one.
    pub fn execute(
        &self,
        handle: &mut dyn KVMapHandle,
        range: ThreadRange,
    ) -> Result<Option<u64>> {
        match self.kind {
            OperationKind::Insert => {
                handle.setup_and_insert(range.start, range.end)?;
                Ok(None)
            }
            // updates overwrite existing keys through the insert path
            OperationKind::Update => {
                handle.insert_empty(range.start, range.end)?;
                Ok(None)
            }
            OperationKind::Find => Ok(Some(handle.setup_and_find(range.start, range.end)?)),
            OperationKind::Delete => Ok(Some(handle.setup_and_delete(range.start, range.end)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [OperationKind; 4] = [
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Find,
        OperationKind::Delete,
    ];

    /// Count how many threads cover each index of `[lo, lo + n)`. Indices outside that window
    /// must never be touched.
    fn coverage(kind: OperationKind, nr_prefill: u64, nr_ops: u64, nr_threads: usize) -> Vec<u32> {
        let lo = match kind {
            OperationKind::Insert => nr_prefill,
            _ => 0,
        };
        let mut cover = vec![0u32; nr_ops as usize];
        for id in 0..nr_threads {
            let r = thread_range(kind, nr_prefill, nr_ops, (id, nr_threads));
            for k in r.start..r.end {
                assert!(k >= lo && k < lo + nr_ops, "{} out of window: {}", kind, k);
                cover[(k - lo) as usize] += 1;
            }
        }
        cover
    }

    #[test]
    fn padded_kinds_cover_everything_once() {
        for kind in [
            OperationKind::Insert,
            OperationKind::Find,
            OperationKind::Delete,
        ] {
            for nr_ops in [1u64, 7, 100, 1000, 1001] {
                for nr_threads in [1usize, 2, 3, 5, 7, nr_ops as usize] {
                    let cover = coverage(kind, 1000, nr_ops, nr_threads);
                    assert!(
                        cover.iter().all(|c| *c == 1),
                        "{} ops {} threads {}",
                        kind,
                        nr_ops,
                        nr_threads
                    );
                }
            }
        }
    }

    #[test]
    fn update_partitions_when_divisible() {
        for (nr_ops, nr_threads) in [(100u64, 1usize), (100, 2), (99, 3), (100, 5), (98, 7)] {
            let cover = coverage(OperationKind::Update, 1000, nr_ops, nr_threads);
            assert!(cover.iter().all(|c| *c == 1));
        }
    }

    #[test]
    fn update_leaves_the_tail_when_not_divisible() {
        let nr_ops = 100u64;
        for nr_threads in [3usize, 7] {
            let per = per_thread(OperationKind::Update, nr_ops, nr_threads);
            let cover = coverage(OperationKind::Update, 1000, nr_ops, nr_threads);
            let covered = per * nr_threads as u64;
            assert!(covered < nr_ops);
            for (i, c) in cover.iter().enumerate() {
                let expected = if (i as u64) < covered { 1 } else { 0 };
                assert_eq!(*c, expected, "index {} threads {}", i, nr_threads);
            }
        }
    }

    #[test]
    fn update_needs_a_key_per_thread() {
        let w = |kind, nr_ops| Workload {
            kind,
            nr_prefill: 10,
            nr_ops,
        };
        assert!(w(OperationKind::Update, 4).check_threads(4).is_ok());
        assert!(matches!(
            w(OperationKind::Update, 3).check_threads(4),
            Err(Error::Config(_))
        ));
        assert!(w(OperationKind::Find, 3).check_threads(4).is_ok());
        assert!(w(OperationKind::Insert, 1).check_threads(0).is_err());
    }

    #[test]
    fn insert_scenario() {
        assert_eq!(per_thread(OperationKind::Insert, 100, 4), 26);
        let r = thread_range(OperationKind::Insert, 1000, 100, (2, 4));
        assert_eq!(r, ThreadRange { start: 1052, end: 1078 });
        let r = thread_range(OperationKind::Insert, 1000, 100, (3, 4));
        assert_eq!(r, ThreadRange { start: 1078, end: 1100 });
        assert_eq!(r.len(), 22);
    }

    #[test]
    fn find_scenario() {
        assert_eq!(per_thread(OperationKind::Find, 100, 3), 34);
        let r = thread_range(OperationKind::Find, 1000, 100, (2, 3));
        assert_eq!(r, ThreadRange { start: 68, end: 100 });
        assert_eq!(r.len(), 32);
    }

    #[test]
    fn trailing_threads_may_get_nothing() {
        // 5 keys per thread, so threads 20.. start past the end
        let r = thread_range(OperationKind::Delete, 0, 100, (23, 24));
        assert_eq!(r.start, 115);
        assert_eq!(r.end, 100);
        assert!(r.is_empty());
        assert!(!r.contains(100));
        assert!(!r.contains(110));
    }

    #[test]
    #[should_panic]
    fn thread_id_out_of_bound() {
        let _ = thread_range(OperationKind::Find, 0, 100, (4, 4));
    }

    #[test]
    fn operation_kind_names() {
        for kind in KINDS {
            assert_eq!(kind.as_str().parse::<OperationKind>(), Ok(kind));
        }
        assert_eq!("get".parse::<OperationKind>(), Ok(OperationKind::Find));
        assert!(matches!(
            "scan".parse::<OperationKind>(),
            Err(Error::Config(_))
        ));
        assert!(OperationKind::Insert.re_init());
        assert!(!OperationKind::Find.re_init());
        assert!(OperationKind::Delete.counts_hits());
        assert!(!OperationKind::Update.counts_hits());
    }

    #[test]
    fn workloadopt_toml_correct() {
        let s = r#"op = "insert"
                   prefill = 1000
                   ops = 100"#;
        let w = Workload::new_from_toml_str(s).unwrap();
        assert_eq!(w.kind, OperationKind::Insert);
        assert_eq!(w.nr_prefill, 1000);
        assert_eq!(w.per_thread(4), 26);
    }

    #[test]
    fn workloadopt_toml_invalid_missing_fields() {
        let s = r#"op = "find"
                   ops = 100"#;
        assert_eq!(
            Workload::new_from_toml_str(s),
            Err(Error::Config("prefill should be specified".to_string()))
        );
    }

    #[test]
    fn workloadopt_toml_invalid_zero_ops() {
        let s = r#"op = "find"
                   prefill = 100
                   ops = 0"#;
        assert_eq!(
            Workload::new_from_toml_str(s),
            Err(Error::Config("ops should be positive".to_string()))
        );
    }

    #[test]
    fn workloadopt_toml_invalid_op() {
        let s = r#"op = "scan"
                   prefill = 100
                   ops = 10"#;
        assert!(matches!(
            Workload::new_from_toml_str(s),
            Err(Error::Config(_))
        ));
    }
}
