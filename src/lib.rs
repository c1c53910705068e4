#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A benchmark driver that measures insert, update, find and delete throughput of key-value
//! stores under a sweep of thread counts.
//!
//! With `kvopbench`, a benchmark is a list of phases defined in TOML. Each phase runs one kind of
//! operation over a dense key space: the store is prefilled once by a single thread, every worker
//! thread then runs the operation over its own slice of the key space, and finally the store is
//! torn down by the same single thread. The whole cycle is repeated for every configured thread
//! count, so a phase yields one throughput curve per store.
//!
//! A few key design choices include:
//!
//! - Keys and values are fixed-size synthetic records ([`Key`] and [`Value`]). Key `i` always
//! maps to a value derived from `i`, so every lookup can be validated and the found counter
//! doubles as a correctness check.
//! - Worker threads never coordinate on the key space. Each thread gets a disjoint
//! [`workload::ThreadRange`], and the store is the only shared object while operations run.
//! - Stores are black boxes behind the [`KVMap`] and [`KVMapHandle`] traits. They are registered
//! by name and created from the `[map]` section of a TOML file.
//!
//! More detailed usage could be found in the module-level rustdocs:
//!
//! - [`mod@bench`] for the config format of a benchmark.
//! - [`mod@stores`] for the config format of a built-in key-value store.
//! - [`mod@workload`] for how the key space is split among threads.
//! - [`cmdline()`] for the usage of the default command line interface.

/// The key type shared by all stores and workloads.
pub type Key = u64;

/// Size in bytes of a key handed to byte-oriented stores.
pub const KEY_SIZE: usize = std::mem::size_of::<Key>();

/// Number of 64-bit words in a [`Value`].
pub const VALUE_WORDS: usize = 25;

/// Size in bytes of a value handed to byte-oriented stores.
pub const VALUE_SIZE: usize = VALUE_WORDS * std::mem::size_of::<u64>();

/// A fixed-size value record whose content is derived from its key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Value {
    pub data: [u64; VALUE_WORDS],
}

impl Value {
    /// The canonical value of `key`: every word holds the key.
    pub fn from_key(key: Key) -> Self {
        Self {
            data: [key; VALUE_WORDS],
        }
    }

    /// Whether this value is the one that was written for `key`.
    pub fn verifies(&self, key: Key) -> bool {
        self.data[0] == key
    }

    /// Little-endian encoding of the record, for stores that only deal in bytes.
    pub fn to_bytes(&self) -> [u8; VALUE_SIZE] {
        let mut bytes = [0u8; VALUE_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(self.data.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Decode a record written by [`Value::to_bytes`]. Returns `None` if the length is off.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != VALUE_SIZE {
            return None;
        }
        let mut data = [0u64; VALUE_WORDS];
        for (word, chunk) in data.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *word = u64::from_le_bytes(buf);
        }
        Some(Self { data })
    }
}

/// Big-endian encoding of a key, so byte-ordered stores sort keys numerically.
pub fn key_bytes(key: Key) -> [u8; KEY_SIZE] {
    key.to_be_bytes()
}

/// A key-value store that can be set up, shared by worker threads, and torn down.
///
/// The benchmark calls [`KVMap::init`] and [`KVMap::deinit`] from a single thread, and only
/// while no other thread is using the store. Between the two, every worker creates its own
/// [`KVMapHandle`] and runs operations concurrently; the store is responsible for whatever
/// internal synchronization that needs.
///
/// A panic inside any of these calls is caught by the worker and fails the run with an error of
/// the stage it happened in.
pub trait KVMap: Send + Sync + 'static {
    /// Provision the store and insert the keys `[0, nr_prefill)`.
    ///
    /// If the store is already initialized and `re_init` is false, this is a no-op. If
    /// `re_init` is true, any previous instance is released first and a fresh one is built.
    fn init(&self, nr_prefill: u64, re_init: bool) -> Result<()>;

    /// Release everything created for the current run. A no-op if not initialized.
    fn deinit(&self) -> Result<()>;

    /// Create a per-thread handle to the initialized store.
    fn handle(&self) -> Result<Box<dyn KVMapHandle>>;

    /// The spawn/pin implementation used for this store's worker threads.
    fn thread(&self) -> Box<dyn thread::Thread> {
        Box::new(thread::DefaultThread)
    }
}

/// A per-thread handle that references an initialized [`KVMap`].
///
/// All ranges are half-open. A range whose `start` is not below its `end` is empty.
pub trait KVMapHandle {
    /// Insert the canonical key-value pairs for `[start, end)`. Keys that already exist are
    /// overwritten.
    fn insert_empty(&mut self, start: Key, end: Key) -> Result<()>;

    /// Insert with any per-batch preparation the store needs. Most stores need none.
    fn setup_and_insert(&mut self, start: Key, end: Key) -> Result<()> {
        self.insert_empty(start, end)
    }

    /// Look up `[start, end)` and return how many keys were found with a valid value.
    fn setup_and_find(&mut self, start: Key, end: Key) -> Result<u64>;

    /// Remove `[start, end)` and return how many keys were actually removed.
    fn setup_and_delete(&mut self, start: Key, end: Key) -> Result<u64>;
}

pub mod bench;
mod cmdline;
mod error;
pub mod report;
pub mod stores;
pub mod thread;
pub mod workload;

pub use cmdline::cmdline;
pub use error::{Error, Result};

pub extern crate inventory;
pub extern crate toml;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_is_derived_from_key() {
        let v = Value::from_key(42);
        assert!(v.verifies(42));
        assert!(!v.verifies(43));
        assert!(v.data.iter().all(|w| *w == 42));
    }

    #[test]
    fn value_bytes() {
        let v = Value::from_key(0x0102_0304_0506_0708);
        let bytes = v.to_bytes();
        assert_eq!(bytes.len(), VALUE_SIZE);
        assert_eq!(bytes[0], 0x08);
        assert_eq!(Value::from_bytes(&bytes), Some(v));
        assert_eq!(Value::from_bytes(&bytes[1..]), None);
    }

    #[test]
    fn keys_sort_numerically_as_bytes() {
        let mut keys: Vec<[u8; KEY_SIZE]> = [300u64, 2, 70000, 1]
            .iter()
            .map(|k| key_bytes(*k))
            .collect();
        keys.sort();
        let sorted: Vec<u64> = keys.iter().map(|b| u64::from_be_bytes(*b)).collect();
        assert_eq!(sorted, vec![1, 2, 300, 70000]);
    }

    #[test]
    fn arc_of_map_is_shareable() {
        use std::sync::Arc;
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Arc<Box<dyn KVMap>>>();
    }
}
