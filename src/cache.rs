//! Persistence of the last-known structure address per target.
//!
//! Scanning 128 KiB of RAM one word-read at a time is slow over an RPC
//! round trip per word, so the address found on a previous run is recalled
//! first and verified with a single magic read.  The backing file is TOML,
//! one section per target name:
//!
//! ```toml
//! [nrf52]
//! address = "0x20001000"
//! ```
//!
//! Absence of the file, of the key, or an unparseable file is a cache miss,
//! never an error - the worst case is a rescan.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::collections::BTreeMap;
use std::path::PathBuf;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

/// File name under the home directory holding previous addresses.
const CACHE_FILE_NAME: &str = ".buffy_previous_address";

/// Storage backing for [`AddressCache`]: the filesystem in production, a
/// string in tests.
pub trait CacheStore {
    /// Full contents of the store, or `None` if it does not exist yet.
    fn read(&self) -> std::io::Result<Option<String>>;

    /// Replaces the store contents.
    fn write(&mut self, contents: &str) -> std::io::Result<()>;
}

/// Filesystem-backed store, by default `~/.buffy_previous_address`.
pub struct FsStore {
    path: PathBuf,
}

impl FsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at the default location under the user's home directory.
    pub fn at_home() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(CACHE_FILE_NAME))
    }
}

impl CacheStore for FsStore {
    fn read(&self) -> std::io::Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, contents: &str) -> std::io::Result<()> {
        std::fs::write(&self.path, contents)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemStore(Option<String>);

impl CacheStore for MemStore {
    fn read(&self) -> std::io::Result<Option<String>> {
        Ok(self.0.clone())
    }

    fn write(&mut self, contents: &str) -> std::io::Result<()> {
        self.0 = Some(contents.to_string());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TargetRecord {
    address: String,
}

/// Last-known structure address, keyed by target name.
pub struct AddressCache<S: CacheStore> {
    store: S,
}

impl<S: CacheStore> AddressCache<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Previously recorded address for `target_name`, if any.
    pub fn lookup(&self, target_name: &str) -> Option<u32> {
        let records = self.load();
        let record = records.get(target_name)?;
        let address = crate::parse_u32(&record.address);
        if address.is_none() {
            warn!(
                "ignoring unparseable cached address \"{}\" for target {target_name}",
                record.address
            );
        }
        address
    }

    /// Records `address` for `target_name`, overwriting any previous entry.
    pub fn store(&mut self, target_name: &str, address: u32) {
        let mut records = self.load();
        records.insert(
            target_name.to_string(),
            TargetRecord {
                address: format!("{address:#x}"),
            },
        );
        let serialized = match toml::to_string(&records) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to serialize address cache: {e}");
                return;
            }
        };
        if let Err(e) = self.store.write(&serialized) {
            warn!("failed to write address cache: {e}");
        }
    }

    fn load(&self) -> BTreeMap<String, TargetRecord> {
        let contents = match self.store.read() {
            Ok(Some(contents)) => contents,
            Ok(None) => return BTreeMap::new(),
            Err(e) => {
                warn!("failed to read address cache: {e}");
                return BTreeMap::new();
            }
        };
        match toml::from_str(&contents) {
            Ok(records) => records,
            Err(e) => {
                warn!("address cache is unparseable, treating as empty: {e}");
                BTreeMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_store_is_a_miss() {
        let cache = AddressCache::new(MemStore::default());
        assert_eq!(cache.lookup("default"), None);
    }

    #[test]
    fn store_then_lookup_round_trips() {
        let mut cache = AddressCache::new(MemStore::default());
        cache.store("nrf52", 0x2000_1000);
        assert_eq!(cache.lookup("nrf52"), Some(0x2000_1000));
        assert_eq!(cache.lookup("stm32"), None);
    }

    #[test]
    fn store_overwrites_and_keeps_other_targets() {
        let mut cache = AddressCache::new(MemStore::default());
        cache.store("a", 0x1000_0000);
        cache.store("b", 0x1000_4000);
        cache.store("a", 0x1000_8000);
        assert_eq!(cache.lookup("a"), Some(0x1000_8000));
        assert_eq!(cache.lookup("b"), Some(0x1000_4000));
    }

    #[test]
    fn addresses_persist_as_human_editable_hex() {
        let mut cache = AddressCache::new(MemStore::default());
        cache.store("default", 0x1000_1000);
        let contents = cache.store.read().unwrap().unwrap();
        assert!(contents.contains("[default]"));
        assert!(contents.contains("\"0x10001000\""));
    }

    #[test]
    fn garbage_contents_degrade_to_a_miss() {
        let mut store = MemStore::default();
        store.write("not toml at {{ all").unwrap();
        let cache = AddressCache::new(store);
        assert_eq!(cache.lookup("default"), None);
    }

    #[test]
    fn unparseable_address_value_is_a_miss() {
        let mut store = MemStore::default();
        store
            .write("[default]\naddress = \"over there\"\n")
            .unwrap();
        let cache = AddressCache::new(store);
        assert_eq!(cache.lookup("default"), None);
    }

    #[test]
    fn hand_edited_entries_are_honored() {
        let mut store = MemStore::default();
        store
            .write("[bluepill]\naddress = \"0x20000400\"\n")
            .unwrap();
        let cache = AddressCache::new(store);
        assert_eq!(cache.lookup("bluepill"), Some(0x2000_0400));
    }
}
