//! A store that does nothing. It can be used to measure the overhead of the driver itself.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [map]
//! name = "nullmap"
//! ```
//!
//! This store is [`KVMap`]. Finds and deletes never hit.

use crate::stores::*;

#[derive(Clone)]
pub struct NullMap;

impl NullMap {
    pub fn new() -> Self {
        Self
    }

    pub fn new_benchkvmap(_opt: &toml::Table) -> Result<BenchKVMap> {
        Ok(BenchKVMap::regular(Self::new()))
    }
}

impl Default for NullMap {
    fn default() -> Self {
        Self::new()
    }
}

impl KVMap for NullMap {
    fn init(&self, _nr_prefill: u64, _re_init: bool) -> Result<()> {
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        Ok(())
    }

    fn handle(&self) -> Result<Box<dyn KVMapHandle>> {
        Ok(Box::new(self.clone()))
    }
}

impl KVMapHandle for NullMap {
    fn insert_empty(&mut self, _start: Key, _end: Key) -> Result<()> {
        Ok(())
    }

    fn setup_and_find(&mut self, _start: Key, _end: Key) -> Result<u64> {
        Ok(0)
    }

    fn setup_and_delete(&mut self, _start: Key, _end: Key) -> Result<u64> {
        Ok(0)
    }
}

inventory::submit! {
    Registry::new("nullmap", NullMap::new_benchkvmap)
}
