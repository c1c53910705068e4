//! A hybrid store for persistent memory: a volatile hash index in DRAM that points into a pool of
//! fixed-size records kept in a file on a (typically DAX-mounted) persistent memory directory.
//!
//! The pool file is created and pre-sized when the store is initialized, so no allocation happens
//! on the write path, and it is removed when the store is torn down. Records are never moved:
//! inserting an existing key overwrites its record in place, and deleting a key only drops it from
//! the index.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [map]
//! name = "hybrid"
//! path = "..."      # directory that holds the pool file, e.g., a DAX mount
//! capacity = ...    # maximum number of records in the pool
//! shards = ...      # (optional) number of index shards, default 1024
//! ```
//!
//! This store is [`KVMap`].

use crate::stores::hashmap::shard;
use crate::stores::*;
use ::hashbrown::HashMap;
use log::{debug, info};
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of the pool file inside the configured directory.
pub const POOL_FILE: &str = "kvopbench-hybrid.pool";

/// On-media size of one record: the key followed by the value.
pub const RECORD_SIZE: u64 = (KEY_SIZE + VALUE_SIZE) as u64;

const DEFAULT_SHARDS: usize = 1024;

#[derive(Deserialize)]
pub struct HybridOpt {
    pub path: String,
    pub capacity: u64,
    pub shards: Option<usize>,
}

/// Size in bytes of a pool holding `capacity` records.
fn pool_size(capacity: u64) -> Result<u64> {
    capacity.checked_mul(RECORD_SIZE).ok_or_else(|| {
        Error::Config(format!(
            "capacity {} is too large for a pool of {}-byte records",
            capacity, RECORD_SIZE
        ))
    })
}

/// The pool and index of one run.
struct Pool {
    file: File,
    path: PathBuf,
    capacity: u64,
    /// The next never-used slot.
    tail: AtomicU64,
    /// key -> slot
    index: Vec<RwLock<HashMap<Key, u64, FxBuildHasher>>>,
}

impl Pool {
    fn create(dir: &Path, capacity: u64, nr_shards: usize) -> Result<Self> {
        let size = pool_size(capacity)?;
        if !dir.is_dir() {
            return Err(Error::Setup(format!(
                "pool directory {} does not exist",
                dir.display()
            )));
        }
        let path = dir.join(POOL_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Setup(format!("cannot create {}: {}", path.display(), e)))?;
        file.set_len(size).map_err(|e| {
            Error::Setup(format!(
                "cannot size {} to {} bytes: {}",
                path.display(),
                size,
                e
            ))
        })?;
        info!("Created pool {} with {} records", path.display(), capacity);
        let index = (0..nr_shards)
            .map(|_| RwLock::new(HashMap::default()))
            .collect();
        Ok(Self {
            file,
            path,
            capacity,
            tail: AtomicU64::new(0),
            index,
        })
    }

    fn shard(&self, key: Key) -> &RwLock<HashMap<Key, u64, FxBuildHasher>> {
        &self.index[shard(key, self.index.len())]
    }

    fn write_record(&self, slot: u64, key: Key, value: &Value) -> Result<()> {
        let mut record = [0u8; KEY_SIZE + VALUE_SIZE];
        record[..KEY_SIZE].copy_from_slice(&key.to_le_bytes());
        record[KEY_SIZE..].copy_from_slice(&value.to_bytes());
        self.file
            .write_all_at(&record, slot * RECORD_SIZE)
            .map_err(|e| Error::Run(format!("write slot {}: {}", slot, e)))
    }

    fn read_record(&self, slot: u64) -> Result<Option<Value>> {
        let mut record = [0u8; KEY_SIZE + VALUE_SIZE];
        self.file
            .read_exact_at(&mut record, slot * RECORD_SIZE)
            .map_err(|e| Error::Run(format!("read slot {}: {}", slot, e)))?;
        Ok(Value::from_bytes(&record[KEY_SIZE..]))
    }

    fn put(&self, key: Key, value: &Value) -> Result<()> {
        // the shard lock is held during the write so readers never see a partial record
        let mut shard = self.shard(key).write();
        if let Some(slot) = shard.get(&key) {
            return self.write_record(*slot, key, value);
        }
        let slot = self.tail.fetch_add(1, Ordering::Relaxed);
        if slot >= self.capacity {
            return Err(Error::Run(format!(
                "pool is full ({} records)",
                self.capacity
            )));
        }
        self.write_record(slot, key, value)?;
        shard.insert(key, slot);
        Ok(())
    }

    fn get(&self, key: Key) -> Result<Option<Value>> {
        let shard = self.shard(key).read();
        match shard.get(&key) {
            Some(slot) => self.read_record(*slot),
            None => Ok(None),
        }
    }

    fn remove(&self, key: Key) -> bool {
        self.shard(key).write().remove(&key).is_some()
    }
}

pub struct Hybrid {
    dir: PathBuf,
    capacity: u64,
    nr_shards: usize,
    state: Slot<Pool>,
}

impl Hybrid {
    pub fn new(opt: &HybridOpt) -> Self {
        Self {
            dir: PathBuf::from(&opt.path),
            capacity: opt.capacity,
            nr_shards: opt.shards.unwrap_or(DEFAULT_SHARDS).max(1),
            state: Slot::new(),
        }
    }

    pub fn new_benchkvmap(opt: &toml::Table) -> Result<BenchKVMap> {
        let opt: HybridOpt = parse_opt(opt)?;
        if opt.capacity == 0 {
            return Err(Error::Config("capacity should be positive".to_string()));
        }
        pool_size(opt.capacity)?;
        Ok(BenchKVMap::regular(Self::new(&opt)))
    }
}

impl KVMap for Hybrid {
    fn init(&self, nr_prefill: u64, re_init: bool) -> Result<()> {
        if self.state.is_set() && !re_init {
            return Ok(());
        }
        self.deinit()?;
        if nr_prefill > self.capacity {
            return Err(Error::Setup(format!(
                "cannot prefill {} records into a pool of {}",
                nr_prefill, self.capacity
            )));
        }
        self.state
            .set(Pool::create(&self.dir, self.capacity, self.nr_shards)?);
        prefill(self, nr_prefill)
    }

    fn deinit(&self) -> Result<()> {
        let Some(pool) = self.state.take() else {
            return Ok(());
        };
        let path = pool.path.clone();
        debug!("Releasing pool {}", path.display());
        drop(pool);
        std::fs::remove_file(&path)
            .map_err(|e| Error::Teardown(format!("cannot remove {}: {}", path.display(), e)))
    }

    fn handle(&self) -> Result<Box<dyn KVMapHandle>> {
        Ok(Box::new(HybridHandle(self.state.get()?)))
    }
}

pub struct HybridHandle(Arc<Pool>);

impl KVMapHandle for HybridHandle {
    fn insert_empty(&mut self, start: Key, end: Key) -> Result<()> {
        insert_range(start, end, |key, value| self.0.put(key, value))
    }

    fn setup_and_find(&mut self, start: Key, end: Key) -> Result<u64> {
        find_range(start, end, |key| self.0.get(key))
    }

    fn setup_and_delete(&mut self, start: Key, end: Key) -> Result<u64> {
        delete_range(start, end, |key| Ok(self.0.remove(key)))
    }
}

inventory::submit! {
    Registry::new("hybrid", Hybrid::new_benchkvmap)
}
