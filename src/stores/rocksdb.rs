//! Adapter implementation of [`rocksdb`], on a regular disk and on persistent memory.
//!
//! Both stores create a fresh database directory under `path` when initialized and destroy it
//! when torn down. The persistent memory variant expects `path` to be an existing DAX-mounted
//! directory and accesses the database files through mmap instead of regular I/O.
//!
//! ## Configuration Format
//!
//! ### Disk:
//!
//! ``` toml
//! [map]
//! name = "disk_rocksdb"
//! path = "..." # base directory of the database
//! ```
//!
//! This store is [`KVMap`].
//!
//! ### Persistent memory:
//!
//! ``` toml
//! [map]
//! name = "pmem_rocksdb"
//! path = "..." # DAX-mounted base directory of the database
//! ```
//!
//! This store is [`KVMap`].

use crate::stores::{
    delete_range, find_range, insert_range, parse_opt, prefill, BenchKVMap, Registry, Slot,
};
use crate::*;
use ::rocksdb::{Options, WriteOptions, DB};
use log::{debug, info};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct RocksDBOpt {
    pub path: String,
}

/// An open database and the directory it lives in.
pub struct Database {
    db: DB,
    dir: PathBuf,
}

/// The state shared by both media; they only differ in how the database is provisioned.
struct RocksDBStore {
    base_dir: PathBuf,
    state: Slot<Database>,
}

impl RocksDBStore {
    fn new(opt: &RocksDBOpt) -> Self {
        Self {
            base_dir: PathBuf::from(&opt.path),
            state: Slot::new(),
        }
    }

    fn open(&self, dir: PathBuf, options: &Options) -> Result<()> {
        if dir.exists() {
            DB::destroy(options, &dir)
                .map_err(|e| Error::Setup(format!("cannot clear {}: {}", dir.display(), e)))?;
        }
        let db = DB::open(options, &dir)
            .map_err(|e| Error::Setup(format!("cannot open {}: {}", dir.display(), e)))?;
        info!("Opened rocksdb at {}", dir.display());
        self.state.set(Database { db, dir });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let Some(database) = self.state.take() else {
            return Ok(());
        };
        let dir = database.dir.clone();
        // the database must be closed before its files can go
        drop(database);
        debug!("Destroying rocksdb at {}", dir.display());
        DB::destroy(&Options::default(), &dir)
            .map_err(|e| Error::Teardown(format!("cannot destroy {}: {}", dir.display(), e)))?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| Error::Teardown(format!("cannot remove {}: {}", dir.display(), e)))?;
        }
        Ok(())
    }

    fn handle(&self) -> Result<Box<dyn KVMapHandle>> {
        let mut write_options = WriteOptions::default();
        write_options.set_sync(false);
        Ok(Box::new(RocksDBHandle {
            db: self.state.get()?,
            write_options,
        }))
    }
}

fn base_options() -> Options {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.set_use_fsync(false);
    options
}

pub struct DiskRocksDB(RocksDBStore);

impl DiskRocksDB {
    pub fn new(opt: &RocksDBOpt) -> Self {
        Self(RocksDBStore::new(opt))
    }

    pub fn new_benchkvmap(opt: &toml::Table) -> Result<BenchKVMap> {
        let opt: RocksDBOpt = parse_opt(opt)?;
        Ok(BenchKVMap::regular(Self::new(&opt)))
    }

    fn db_dir(&self) -> PathBuf {
        self.0.base_dir.join("rocksdb-disk")
    }
}

impl KVMap for DiskRocksDB {
    fn init(&self, nr_prefill: u64, re_init: bool) -> Result<()> {
        if self.0.state.is_set() && !re_init {
            return Ok(());
        }
        self.deinit()?;
        std::fs::create_dir_all(&self.0.base_dir).map_err(|e| {
            Error::Setup(format!(
                "cannot create {}: {}",
                self.0.base_dir.display(),
                e
            ))
        })?;
        self.0.open(self.db_dir(), &base_options())?;
        prefill(self, nr_prefill)
    }

    fn deinit(&self) -> Result<()> {
        self.0.close()
    }

    fn handle(&self) -> Result<Box<dyn KVMapHandle>> {
        self.0.handle()
    }
}

pub struct PmemRocksDB(RocksDBStore);

impl PmemRocksDB {
    pub fn new(opt: &RocksDBOpt) -> Self {
        Self(RocksDBStore::new(opt))
    }

    pub fn new_benchkvmap(opt: &toml::Table) -> Result<BenchKVMap> {
        let opt: RocksDBOpt = parse_opt(opt)?;
        Ok(BenchKVMap::regular(Self::new(&opt)))
    }

    fn db_dir(&self) -> PathBuf {
        self.0.base_dir.join("rocksdb-pmem")
    }

    fn check_mount(dir: &Path) -> Result<()> {
        // persistent memory is mounted by the operator, never created here
        if dir.is_dir() {
            Ok(())
        } else {
            Err(Error::Setup(format!(
                "persistent memory directory {} does not exist",
                dir.display()
            )))
        }
    }
}

impl KVMap for PmemRocksDB {
    fn init(&self, nr_prefill: u64, re_init: bool) -> Result<()> {
        if self.0.state.is_set() && !re_init {
            return Ok(());
        }
        self.deinit()?;
        Self::check_mount(&self.0.base_dir)?;
        let mut options = base_options();
        options.set_allow_mmap_reads(true);
        options.set_allow_mmap_writes(true);
        self.0.open(self.db_dir(), &options)?;
        prefill(self, nr_prefill)
    }

    fn deinit(&self) -> Result<()> {
        self.0.close()
    }

    fn handle(&self) -> Result<Box<dyn KVMapHandle>> {
        self.0.handle()
    }
}

pub struct RocksDBHandle {
    db: Arc<Database>,
    write_options: WriteOptions,
}

impl RocksDBHandle {
    fn get(&self, key: Key) -> Result<Option<Value>> {
        match self.db.db.get_pinned(key_bytes(key)) {
            Ok(Some(v)) => Ok(Value::from_bytes(&v)),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Run(format!("get {}: {}", key, e))),
        }
    }
}

impl KVMapHandle for RocksDBHandle {
    fn insert_empty(&mut self, start: Key, end: Key) -> Result<()> {
        insert_range(start, end, |key, value| {
            self.db
                .db
                .put_opt(key_bytes(key), value.to_bytes(), &self.write_options)
                .map_err(|e| Error::Run(format!("put {}: {}", key, e)))
        })
    }

    fn setup_and_find(&mut self, start: Key, end: Key) -> Result<u64> {
        find_range(start, end, |key| self.get(key))
    }

    fn setup_and_delete(&mut self, start: Key, end: Key) -> Result<u64> {
        // a rocksdb delete succeeds whether or not the key exists, so look first
        delete_range(start, end, |key| {
            if self.get(key)?.is_none() {
                return Ok(false);
            }
            self.db
                .db
                .delete_opt(key_bytes(key), &self.write_options)
                .map_err(|e| Error::Run(format!("delete {}: {}", key, e)))?;
            Ok(true)
        })
    }
}

inventory::submit! {
    Registry::new("disk_rocksdb", DiskRocksDB::new_benchkvmap)
}

inventory::submit! {
    Registry::new("pmem_rocksdb", PmemRocksDB::new_benchkvmap)
}
