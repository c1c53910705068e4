//! The implementation of built-in key-value stores, and some helper functions.
//!
//! ## Configuration Format
//!
//! The configuration of a key-value store is stored in a dictionary named `map`. Therefore, a
//! store's configuration file looks like the following:
//!
//! ```toml
//! [map]
//! name = "..."
//! # option1 = ...
//! # option2 = ...
//!
//! ...
//! ```
//! The field `name` must be given and it should be equal to the name registered by the store.
//! Other than `name`, all the fields are parsed as a string map and will be hand over to the
//! constructor of the store's constructor function. For available options other than `name`, one
//! can refer to the module-level documentation of a specific store.
//!
//! ## Registering New Stores
//!
//! When users would like to dynamically register new key-value stores from their own crate, first
//! of all, they need to implement [`KVMap`] and [`KVMapHandle`] for the store. Then, they need to
//! create a constructor function with a signature of `fn(&toml::Table) -> Result<BenchKVMap>`.
//!
//! The final step is to register the store's constructor (along with its name) using
//! [`inventory`]. A minimal example would be: `inventory::submit! { Registry::new("name",
//! constructor_fn) };`.
//!
//! The helpers [`insert_range`], [`find_range`] and [`delete_range`] implement the range
//! operations on top of point operations, and [`Slot`] holds the per-run instance of a store
//! between [`KVMap::init`] and [`KVMap::deinit`]. The source code of all built-in stores provide
//! good examples on this process.

use crate::bench::Benchmark;
use crate::report::Reporter;
use crate::*;
use hashbrown::HashMap;
use log::debug;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use toml::Table;

/// A created key-value store that is ready to run.
pub struct BenchKVMap(Arc<Box<dyn KVMap>>);

impl BenchKVMap {
    pub fn regular(map: impl KVMap) -> Self {
        Self(Arc::new(Box::new(map)))
    }

    pub fn map(&self) -> Arc<Box<dyn KVMap>> {
        self.0.clone()
    }

    pub(crate) fn bench(&self, phases: &[Arc<Benchmark>], reporter: &mut Reporter) -> Result<()> {
        crate::bench::bench(self.0.clone(), phases, reporter)
    }
}

/// The centralized registry that maps the name of newly added key-value store to its constructor
/// function.
///
/// A user-defined store can use the [`inventory::submit!`] macro to register their own stores to
/// be used in the benchmark framework.
pub struct Registry<'a> {
    pub(crate) name: &'a str,
    constructor: fn(&Table) -> Result<BenchKVMap>,
}

impl<'a> Registry<'a> {
    pub const fn new(name: &'a str, constructor: fn(&Table) -> Result<BenchKVMap>) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(Registry<'static>);

/// An aggregated option enum that can be parsed from a TOML string. It contains all necessary
/// parameters for each type of maps to be created.
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct BenchKVMapOpt {
    name: String,
    #[serde(flatten)]
    opt: Table,
}

impl BenchKVMap {
    pub(crate) fn new(opt: &BenchKVMapOpt) -> Result<BenchKVMap> {
        let mut registered: HashMap<&'static str, fn(&Table) -> Result<BenchKVMap>> =
            HashMap::new();
        for r in inventory::iter::<Registry> {
            debug!("Adding supported kvmap: {}", r.name);
            if registered.insert(r.name, r.constructor).is_some() {
                return Err(Error::Config(format!("map {} registered twice", r.name)));
            }
        }
        let f = registered
            .get(opt.name.as_str())
            .ok_or_else(|| Error::Config(format!("map {} not found in registry", opt.name)))?;
        f(&opt.opt)
    }
}

/// Parse a store's own options out of its `[map]` table.
pub fn parse_opt<T: for<'de> Deserialize<'de>>(opt: &Table) -> Result<T> {
    Ok(opt.clone().try_into()?)
}

/// The instance a store builds in [`KVMap::init`] and drops in [`KVMap::deinit`].
///
/// Handles clone the inner [`Arc`], so the instance lives until the last handle is gone even if
/// the slot is cleared.
pub struct Slot<T>(RwLock<Option<Arc<T>>>);

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self(RwLock::new(None))
    }

    pub fn is_set(&self) -> bool {
        self.0.read().is_some()
    }

    pub fn get(&self) -> Result<Arc<T>> {
        self.0
            .read()
            .clone()
            .ok_or_else(|| Error::Run("store is not initialized".to_string()))
    }

    pub fn set(&self, inner: T) {
        *self.0.write() = Some(Arc::new(inner));
    }

    pub fn take(&self) -> Option<Arc<T>> {
        self.0.write().take()
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert `[0, nr_prefill)` through a fresh handle of `map`. Failures are attributed to setup.
pub fn prefill(map: &dyn KVMap, nr_prefill: u64) -> Result<()> {
    debug!("Prefilling {} keys", nr_prefill);
    let mut handle = map.handle().map_err(Error::into_setup)?;
    handle
        .insert_empty(0, nr_prefill)
        .map_err(Error::into_setup)
}

/// Write the canonical value of every key in `[start, end)` with `put`.
pub fn insert_range(
    start: Key,
    end: Key,
    mut put: impl FnMut(Key, &Value) -> Result<()>,
) -> Result<()> {
    for key in start..end {
        put(key, &Value::from_key(key))?;
    }
    Ok(())
}

/// Look up every key in `[start, end)` with `get` and count the ones that come back with the
/// right value.
pub fn find_range(
    start: Key,
    end: Key,
    mut get: impl FnMut(Key) -> Result<Option<Value>>,
) -> Result<u64> {
    let mut found = 0u64;
    for key in start..end {
        if let Some(value) = get(key)? {
            found += u64::from(value.verifies(key));
        }
    }
    Ok(found)
}

/// Remove every key in `[start, end)` with `remove` and count the ones that existed.
pub fn delete_range(
    start: Key,
    end: Key,
    mut remove: impl FnMut(Key) -> Result<bool>,
) -> Result<u64> {
    let mut deleted = 0u64;
    for key in start..end {
        deleted += u64::from(remove(key)?);
    }
    Ok(deleted)
}

#[cfg(feature = "dashmap")]
pub mod dashmap;
pub mod hashmap;
#[cfg(unix)]
pub mod hybrid;
pub mod null;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;
#[cfg(feature = "scc")]
pub mod scc;

#[cfg(test)]
mod tests {
    use super::*;

    fn _map_test(map: &dyn KVMap) {
        map.init(1000, true).unwrap();
        let mut handle = map.handle().unwrap();

        // prefill
        assert_eq!(handle.setup_and_find(0, 1000).unwrap(), 1000);
        assert_eq!(handle.setup_and_find(1000, 1100).unwrap(), 0);

        // insert + find
        handle.insert_empty(1000, 1100).unwrap();
        assert_eq!(handle.setup_and_find(1000, 1100).unwrap(), 100);
        handle.setup_and_insert(5000, 5001).unwrap();
        assert_eq!(handle.setup_and_find(4990, 5010).unwrap(), 1);

        // update
        handle.insert_empty(0, 1000).unwrap();
        assert_eq!(handle.setup_and_find(0, 1100).unwrap(), 1100);

        // delete
        assert_eq!(handle.setup_and_delete(0, 500).unwrap(), 500);
        assert_eq!(handle.setup_and_find(0, 500).unwrap(), 0);
        assert_eq!(handle.setup_and_delete(0, 500).unwrap(), 0);
        assert_eq!(handle.setup_and_find(500, 1000).unwrap(), 500);

        // empty and inverted ranges
        assert_eq!(handle.setup_and_find(700, 700).unwrap(), 0);
        assert_eq!(handle.setup_and_delete(900, 800).unwrap(), 0);
        drop(handle);

        // no re-init: nothing is prefilled again
        map.init(1000, false).unwrap();
        let mut handle = map.handle().unwrap();
        assert_eq!(handle.setup_and_find(0, 1000).unwrap(), 500);
        drop(handle);

        // re-init: a fresh instance
        map.init(1000, true).unwrap();
        let mut handle = map.handle().unwrap();
        assert_eq!(handle.setup_and_find(0, 1000).unwrap(), 1000);
        assert_eq!(handle.setup_and_find(1000, 1100).unwrap(), 0);
        drop(handle);

        map.deinit().unwrap();
        assert!(map.handle().is_err());
        map.deinit().unwrap();
    }

    fn _map_test_concurrent(map: &dyn KVMap) {
        const THREADS: u64 = 4;
        const PER: u64 = 2500;
        map.init(0, true).unwrap();
        std::thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move || {
                    let mut handle = map.handle().unwrap();
                    handle.insert_empty(t * PER, (t + 1) * PER).unwrap();
                    assert_eq!(handle.setup_and_find(t * PER, (t + 1) * PER).unwrap(), PER);
                });
            }
        });
        let mut handle = map.handle().unwrap();
        assert_eq!(handle.setup_and_find(0, THREADS * PER).unwrap(), THREADS * PER);
        std::thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move || {
                    let mut handle = map.handle().unwrap();
                    assert_eq!(
                        handle.setup_and_delete(t * PER, (t + 1) * PER).unwrap(),
                        PER
                    );
                });
            }
        });
        assert_eq!(handle.setup_and_find(0, THREADS * PER).unwrap(), 0);
        drop(handle);
        map.deinit().unwrap();
    }

    #[test]
    fn range_helpers() {
        let mut written = Vec::new();
        insert_range(3, 6, |k, v| {
            assert!(v.verifies(k));
            written.push(k);
            Ok(())
        })
        .unwrap();
        assert_eq!(written, vec![3, 4, 5]);

        // odd keys are found, one of them with a wrong value
        let found = find_range(0, 10, |k| {
            Ok(match k {
                7 => Some(Value::from_key(0)),
                k if k % 2 == 1 => Some(Value::from_key(k)),
                _ => None,
            })
        })
        .unwrap();
        assert_eq!(found, 4);

        let deleted = delete_range(0, 10, |k| Ok(k < 3)).unwrap();
        assert_eq!(deleted, 3);

        let e = delete_range(0, 10, |k| {
            if k == 5 {
                Err(Error::Run("io".to_string()))
            } else {
                Ok(true)
            }
        });
        assert_eq!(e, Err(Error::Run("io".to_string())));
    }

    #[test]
    fn slot_lifecycle() {
        let slot = Slot::<u64>::new();
        assert!(!slot.is_set());
        assert!(slot.get().is_err());
        slot.set(7);
        assert!(slot.is_set());
        let held = slot.get().unwrap();
        assert_eq!(slot.take().map(|v| *v), Some(7));
        assert!(!slot.is_set());
        // a handle keeps the instance alive
        assert_eq!(*held, 7);
    }

    #[test]
    fn unknown_map() {
        let opt: BenchKVMapOpt = toml::from_str(r#"name = "nosuchmap""#).unwrap();
        assert!(matches!(BenchKVMap::new(&opt), Err(Error::Config(_))));
    }

    #[test]
    fn dram_map() {
        let opt = hashmap::DramMapOpt { shards: 64 };
        let map = hashmap::DramMap::new(&opt);
        _map_test(&map);
        _map_test_concurrent(&map);
    }

    #[test]
    #[cfg(unix)]
    fn hybrid() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let opt = hybrid::HybridOpt {
            path: tmp_dir.path().to_str().unwrap().to_string(),
            capacity: 20000,
            shards: Some(16),
        };
        let map = hybrid::Hybrid::new(&opt);
        _map_test(&map);
        _map_test_concurrent(&map);
    }

    #[test]
    fn nullmap() {
        let map = null::NullMap::new();
        map.init(100, true).unwrap();
        let mut handle = map.handle().unwrap();
        handle.insert_empty(0, 100).unwrap();
        assert_eq!(handle.setup_and_find(0, 100).unwrap(), 0);
        assert_eq!(handle.setup_and_delete(0, 100).unwrap(), 0);
        map.deinit().unwrap();
    }

    #[test]
    #[cfg(feature = "dashmap")]
    fn dashmap() {
        let map = dashmap::DashMap::new();
        _map_test(&map);
        _map_test_concurrent(&map);
    }

    #[test]
    #[cfg(feature = "scc")]
    fn scchashmap() {
        let map = scc::SccHashMap::new();
        _map_test(&map);
        _map_test_concurrent(&map);
    }

    #[test]
    #[cfg(feature = "rocksdb")]
    fn disk_rocksdb() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let opt = rocksdb::RocksDBOpt {
            path: tmp_dir.path().to_str().unwrap().to_string(),
        };
        let map = rocksdb::DiskRocksDB::new(&opt);
        _map_test(&map);
        _map_test_concurrent(&map);
    }

    #[test]
    #[cfg(feature = "rocksdb")]
    fn pmem_rocksdb() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let opt = rocksdb::RocksDBOpt {
            path: tmp_dir.path().to_str().unwrap().to_string(),
        };
        let map = rocksdb::PmemRocksDB::new(&opt);
        _map_test(&map);
        _map_test_concurrent(&map);
    }
}
