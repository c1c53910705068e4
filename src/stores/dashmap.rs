//! Adapter implementation of [`dashmap::DashMap`].
//!
//! ## Configuration Format
//!
//! ``` toml
//! [map]
//! name = "dashmap"
//! ```
//!
//! This store is [`KVMap`].

use crate::stores::{
    delete_range, find_range, insert_range, prefill, BenchKVMap, Registry, Slot,
};
use crate::*;
use std::sync::Arc;

type Inner = ::dashmap::DashMap<Key, Value>;

pub struct DashMap(Slot<Inner>);

impl DashMap {
    pub fn new() -> Self {
        Self(Slot::new())
    }

    pub fn new_benchkvmap(_opt: &toml::Table) -> Result<BenchKVMap> {
        Ok(BenchKVMap::regular(Self::new()))
    }
}

impl Default for DashMap {
    fn default() -> Self {
        Self::new()
    }
}

impl KVMap for DashMap {
    fn init(&self, nr_prefill: u64, re_init: bool) -> Result<()> {
        if self.0.is_set() && !re_init {
            return Ok(());
        }
        self.deinit()?;
        self.0.set(Inner::new());
        prefill(self, nr_prefill)
    }

    fn deinit(&self) -> Result<()> {
        drop(self.0.take());
        Ok(())
    }

    fn handle(&self) -> Result<Box<dyn KVMapHandle>> {
        Ok(Box::new(DashMapHandle(self.0.get()?)))
    }
}

pub struct DashMapHandle(Arc<Inner>);

impl KVMapHandle for DashMapHandle {
    fn insert_empty(&mut self, start: Key, end: Key) -> Result<()> {
        insert_range(start, end, |key, value| {
            self.0.insert(key, *value);
            Ok(())
        })
    }

    fn setup_and_find(&mut self, start: Key, end: Key) -> Result<u64> {
        find_range(start, end, |key| Ok(self.0.get(&key).map(|v| *v)))
    }

    fn setup_and_delete(&mut self, start: Key, end: Key) -> Result<u64> {
        delete_range(start, end, |key| Ok(self.0.remove(&key).is_some()))
    }
}

inventory::submit! {
    Registry::new("dashmap", DashMap::new_benchkvmap)
}
