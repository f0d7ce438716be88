mod schema;

pub(crate) use schema::*;

use rocksdb::{DBCompressionType, DBIterator, Direction, IteratorMode, Options, ReadOptions,
    WriteBatch, DB};
use serde::Serialize;
use std::{path::Path, sync::Arc};
use tracing::info;

pub(crate) fn serialize_to_vec<T: ?Sized + Serialize>(value: &T, field_name: &str) -> Vec<u8> {
    bincode::serialize(value)
        .unwrap_or_else(|e| panic!("serialization of {} failed: {}", field_name, e))
}

pub(crate) fn deserialize_from<'a, T>(slice: &'a [u8], field_name: &str) -> T
where
    T: serde::Deserialize<'a>,
{
    bincode::deserialize(slice)
        .unwrap_or_else(|e| panic!("deserialization of {} failed: {}", field_name, e))
}

#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<DB>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open a store, with a version check.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let store = Self::open_db(path.as_ref())?;
        store.init_or_check_version()?;
        Ok(store)
    }

    /// Open a store, without a version check.
    pub fn open_db(path: &Path) -> Result<Self, String> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.set_compression_type(DBCompressionType::Lz4);
        let db = Arc::new(DB::open(&options, path).map_err(|e| e.to_string())?);
        Ok(Self { db })
    }

    fn init_or_check_version(&self) -> Result<(), String> {
        match self.get([DB_VERSION_PREFIX]) {
            Some(raw) => {
                let version: u32 = deserialize_from(&raw, "db version");
                if version != DB_VERSION {
                    return Err(format!(
                        "incompatible db version {} (expecting {})",
                        version, DB_VERSION
                    ));
                }
            }
            None => {
                info!("Initializing switch store at version {}", DB_VERSION);
                self.put([DB_VERSION_PREFIX], serialize_to_vec(&DB_VERSION, "db version"));
            }
        }
        Ok(())
    }

    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Vec<u8>> {
        self.db
            .get(key.as_ref())
            .map(|v| v.map(|vi| vi.to_vec()))
            .expect("get should be OK")
    }

    pub fn delete<K: AsRef<[u8]>>(&self, key: K) {
        self.db.delete(key).expect("delete should be ok");
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, value: V) {
        self.db.put(key, value).expect("put should be ok");
    }

    pub fn batch(&self) -> Batch {
        Batch {
            db: Arc::clone(&self.db),
            wb: WriteBatch::default(),
        }
    }

    pub fn prefix_iterator<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a {
        self.iter_with_mode(IteratorMode::From(prefix, Direction::Forward))
            .map(|item| item.expect("iterator item should be ok"))
            .take_while(move |(col_key, _)| col_key.starts_with(prefix))
    }

    fn iter_with_mode(&self, mode: IteratorMode) -> DBIterator<'_> {
        let mut opts = ReadOptions::default();
        opts.set_prefix_same_as_start(false);
        self.db.iterator_opt(mode, opts)
    }
}

pub struct Batch {
    db: Arc<DB>,
    wb: WriteBatch,
}

impl Batch {
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Vec<u8>> {
        self.db
            .get(key.as_ref())
            .map(|v| v.map(|vi| vi.to_vec()))
            .expect("get should be OK")
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.wb.put(key, value);
    }

    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.wb.delete(key);
    }

    pub fn commit(self) -> Result<(), String> {
        self.db.write(self.wb).map_err(|e| e.to_string())
    }
}
