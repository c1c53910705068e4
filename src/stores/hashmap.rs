//! A plain in-memory map: [`hashbrown::HashMap`] sharded behind [`RwLock`]s.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [map]
//! name = "dram_map"
//! shards = ... # number of shards
//! ```
//!
//! This store is [`KVMap`].

use crate::stores::*;
use ::hashbrown::HashMap;
use parking_lot::RwLock;
use rustc_hash::{FxBuildHasher, FxHasher};
use serde::Deserialize;
use std::hash::Hasher;

/// Calculate the shard of a key using [`FxHasher`].
pub fn shard(key: Key, nr_shards: usize) -> usize {
    let mut hasher = FxHasher::default();
    hasher.write_u64(key);
    (hasher.finish() % nr_shards as u64) as usize
}

/// A wrapper around raw [`HashMap`] with fixed-size keys and values.
///
/// It is used as the building block of other types. Note that this is not [`KVMap`].
pub type BaseHashMap = HashMap<Key, Value, FxBuildHasher>;

/// The shards of one run.
pub struct Shards(Vec<RwLock<BaseHashMap>>);

impl Shards {
    pub fn new(nr_shards: usize) -> Self {
        let shards = (0..nr_shards)
            .map(|_| RwLock::new(BaseHashMap::default()))
            .collect();
        Self(shards)
    }

    fn shard(&self, key: Key) -> &RwLock<BaseHashMap> {
        &self.0[shard(key, self.0.len())]
    }
}

#[derive(Deserialize)]
pub struct DramMapOpt {
    pub shards: usize,
}

pub struct DramMap {
    nr_shards: usize,
    state: Slot<Shards>,
}

impl DramMap {
    pub fn new(opt: &DramMapOpt) -> Self {
        Self {
            nr_shards: opt.shards.max(1),
            state: Slot::new(),
        }
    }

    pub fn new_benchkvmap(opt: &toml::Table) -> Result<BenchKVMap> {
        let opt: DramMapOpt = parse_opt(opt)?;
        if opt.shards == 0 {
            return Err(Error::Config("shards should be positive".to_string()));
        }
        Ok(BenchKVMap::regular(Self::new(&opt)))
    }
}

impl KVMap for DramMap {
    fn init(&self, nr_prefill: u64, re_init: bool) -> Result<()> {
        if self.state.is_set() && !re_init {
            return Ok(());
        }
        self.deinit()?;
        self.state.set(Shards::new(self.nr_shards));
        prefill(self, nr_prefill)
    }

    fn deinit(&self) -> Result<()> {
        drop(self.state.take());
        Ok(())
    }

    fn handle(&self) -> Result<Box<dyn KVMapHandle>> {
        Ok(Box::new(DramMapHandle(self.state.get()?)))
    }
}

pub struct DramMapHandle(Arc<Shards>);

impl KVMapHandle for DramMapHandle {
    fn insert_empty(&mut self, start: Key, end: Key) -> Result<()> {
        insert_range(start, end, |key, value| {
            self.0.shard(key).write().insert(key, *value);
            Ok(())
        })
    }

    fn setup_and_find(&mut self, start: Key, end: Key) -> Result<u64> {
        find_range(start, end, |key| Ok(self.0.shard(key).read().get(&key).copied()))
    }

    fn setup_and_delete(&mut self, start: Key, end: Key) -> Result<u64> {
        delete_range(start, end, |key| {
            Ok(self.0.shard(key).write().remove(&key).is_some())
        })
    }
}

inventory::submit! {
    Registry::new("dram_map", DramMap::new_benchkvmap)
}
