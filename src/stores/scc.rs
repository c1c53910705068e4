//! Adapter implementation of [`scc::hash_map::HashMap`].
//!
//! ## Configuration Format
//!
//! ``` toml
//! [map]
//! name = "scchashmap"
//! ```
//! This store is [`KVMap`].

use crate::stores::{
    delete_range, find_range, insert_range, prefill, BenchKVMap, Registry, Slot,
};
use crate::*;
use std::sync::Arc;

type Inner = ::scc::hash_map::HashMap<Key, Value>;

pub struct SccHashMap(Slot<Inner>);

impl SccHashMap {
    pub fn new() -> Self {
        Self(Slot::new())
    }

    pub fn new_benchkvmap(_opt: &toml::Table) -> Result<BenchKVMap> {
        Ok(BenchKVMap::regular(Self::new()))
    }
}

impl Default for SccHashMap {
    fn default() -> Self {
        Self::new()
    }
}

impl KVMap for SccHashMap {
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
        Ok(Box::new(SccHashMapHandle(self.0.get()?)))
    }
}

pub struct SccHashMapHandle(Arc<Inner>);

impl KVMapHandle for SccHashMapHandle {
    fn insert_empty(&mut self, start: Key, end: Key) -> Result<()> {
        insert_range(start, end, |key, value| {
            if let Err((key, value)) = self.0.insert(key, *value) {
                // the key exists, so this is an update
                if self.0.update(&key, |_, v| *v = value).is_none() {
                    return Err(Error::Run(format!("key {} vanished during update", key)));
                }
            }
            Ok(())
        })
    }

    fn setup_and_find(&mut self, start: Key, end: Key) -> Result<u64> {
        find_range(start, end, |key| Ok(self.0.read(&key, |_, v| *v)))
    }

    fn setup_and_delete(&mut self, start: Key, end: Key) -> Result<u64> {
        delete_range(start, end, |key| Ok(self.0.remove(&key).is_some()))
    }
}

inventory::submit! {
    Registry::new("scchashmap", SccHashMap::new_benchkvmap)
}
