//! RocksDB-backed bandit store
//!
//! Uses a pessimistic `TransactionDB`: every counter update reads its row with
//! `get_for_update`, which takes an exclusive row lock held until commit or
//! rollback. Concurrent increments of the same variant serialize on that lock;
//! increments of different variants proceed in parallel.
//!
//! Storage schema (values are bincode unless noted):
//! - `test:{test_id}` - Test row
//! - `test_fp:{fingerprint}` - test id (utf-8), fingerprint index
//! - `test_variants:{test_id}:{index:04}` - variant id (utf-8), ordered variant index
//! - `variant:{variant_id}` - Variant row with counters
//! - `event:{variant_id}:{nanos:020}:{event_id}` - EventRecord, time-ordered per variant

use std::path::Path;
use std::time::Duration;

use rocksdb::{
    Direction, ErrorKind, IteratorMode, Options, Transaction, TransactionDB,
    TransactionDBOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{BanditStore, StoreError, StoreResult, StoreTransaction};
use crate::bandit::types::{
    EventKind, EventRecord, Fingerprint, Test, TestId, TestStatus, Variant, VariantId,
};

const TEST_PREFIX: &str = "test:";

fn test_key(id: TestId) -> String {
    format!("test:{id}")
}

fn fingerprint_key(fingerprint: &Fingerprint) -> String {
    format!("test_fp:{fingerprint}")
}

fn variant_index_prefix(test_id: TestId) -> String {
    format!("test_variants:{test_id}:")
}

fn variant_index_key(test_id: TestId, index: u32) -> String {
    format!("test_variants:{test_id}:{index:04}")
}

fn variant_key(id: VariantId) -> String {
    format!("variant:{id}")
}

fn event_prefix(variant_id: VariantId) -> String {
    format!("event:{variant_id}:")
}

fn event_key(record: &EventRecord) -> String {
    let nanos = record.occurred_at.timestamp_nanos_opt().unwrap_or_default();
    format!("event:{}:{:020}:{}", record.variant_id, nanos, record.id)
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

fn parse_id<T: std::str::FromStr>(bytes: &[u8]) -> StoreResult<T> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::Codec("malformed id in index entry".to_string()))
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            ErrorKind::Busy | ErrorKind::TryAgain => StoreError::Conflict(e.into_string()),
            ErrorKind::TimedOut => StoreError::Timeout(e.into_string()),
            _ => StoreError::Backend(e.into_string()),
        }
    }
}

/// Persistent store on a RocksDB `TransactionDB`
pub struct RocksBanditStore {
    db: TransactionDB,
}

impl RocksBanditStore {
    /// Open (or create) the store at `path`.
    ///
    /// `lock_timeout` bounds how long a transaction waits for a row lock before
    /// failing with [`StoreError::Timeout`].
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(lock_timeout.as_millis() as i64);

        let db = TransactionDB::open(&opts, &txn_opts, path)?;
        info!(path = %path.display(), ?lock_timeout, "Opened bandit store");
        Ok(Self { db })
    }

    fn get_decoded<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Raw (key, value) pairs under `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

impl BanditStore for RocksBanditStore {
    fn load_test(&self, id: TestId) -> StoreResult<Option<Test>> {
        self.get_decoded(&test_key(id))
    }

    fn find_test_by_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<Option<Test>> {
        match self.db.get(fingerprint_key(fingerprint).as_bytes())? {
            Some(bytes) => self.load_test(parse_id(&bytes)?),
            None => Ok(None),
        }
    }

    fn load_variants(&self, test_id: TestId) -> StoreResult<Vec<Variant>> {
        let mut variants = Vec::new();
        for (_, value) in self.scan_prefix(&variant_index_prefix(test_id))? {
            let variant_id: VariantId = parse_id(&value)?;
            // Index entries are removed together with the variant, so a miss
            // means the test was deleted mid-scan
            if let Some(variant) = self.load_variant(variant_id)? {
                variants.push(variant);
            }
        }
        Ok(variants)
    }

    fn load_variant(&self, id: VariantId) -> StoreResult<Option<Variant>> {
        self.get_decoded(&variant_key(id))
    }

    fn list_tests(&self) -> StoreResult<Vec<Test>> {
        let mut tests: Vec<Test> = self
            .scan_prefix(TEST_PREFIX)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect::<StoreResult<_>>()?;
        tests.sort_by_key(|t| t.created_at);
        Ok(tests)
    }

    fn load_events(&self, variant_id: VariantId) -> StoreResult<Vec<EventRecord>> {
        self.scan_prefix(&event_prefix(variant_id))?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    fn create_test(&self, test: &Test, variants: &[Variant]) -> StoreResult<Test> {
        let txn = self.db.transaction();

        // Locks the fingerprint key even when absent, so concurrent creators
        // of the same content serialize here
        let fp_key = fingerprint_key(&test.fingerprint);
        if let Some(existing_id) = txn.get_for_update(fp_key.as_bytes(), true)? {
            let existing_id: TestId = parse_id(&existing_id)?;
            let existing = match txn.get(test_key(existing_id).as_bytes())? {
                Some(bytes) => decode::<Test>(&bytes)?,
                None => return Err(StoreError::MissingRow(format!("test {existing_id}"))),
            };
            txn.rollback()?;
            debug!(test_id = %existing.id, "Test already exists for fingerprint");
            return Ok(existing);
        }

        txn.put(fp_key.as_bytes(), test.id.to_string().as_bytes())?;
        txn.put(test_key(test.id).as_bytes(), encode(test)?)?;
        for variant in variants {
            txn.put(variant_key(variant.id).as_bytes(), encode(variant)?)?;
            txn.put(
                variant_index_key(test.id, variant.index).as_bytes(),
                variant.id.to_string().as_bytes(),
            )?;
        }
        txn.commit()?;

        debug!(test_id = %test.id, variants = variants.len(), "Created test");
        Ok(test.clone())
    }

    fn set_status(&self, id: TestId, status: TestStatus) -> StoreResult<Option<Test>> {
        let txn = self.db.transaction();
        let key = test_key(id);
        let Some(bytes) = txn.get_for_update(key.as_bytes(), true)? else {
            return Ok(None);
        };
        let mut test: Test = decode(&bytes)?;
        test.status = status;
        txn.put(key.as_bytes(), encode(&test)?)?;
        txn.commit()?;
        Ok(Some(test))
    }

    fn delete_test(&self, id: TestId) -> StoreResult<bool> {
        let txn = self.db.transaction();
        let key = test_key(id);
        let Some(bytes) = txn.get_for_update(key.as_bytes(), true)? else {
            return Ok(false);
        };
        let test: Test = decode(&bytes)?;

        for (index_key, value) in self.scan_prefix(&variant_index_prefix(id))? {
            let variant_id: VariantId = parse_id(&value)?;
            txn.get_for_update(variant_key(variant_id).as_bytes(), true)?;
            for (event_key, _) in self.scan_prefix(&event_prefix(variant_id))? {
                txn.delete(&event_key)?;
            }
            txn.delete(variant_key(variant_id).as_bytes())?;
            txn.delete(&index_key)?;
        }
        txn.delete(fingerprint_key(&test.fingerprint).as_bytes())?;
        txn.delete(key.as_bytes())?;
        txn.commit()?;

        info!(test_id = %id, "Deleted test");
        Ok(true)
    }

    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(RocksTransaction {
            txn: self.db.transaction(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "rocksdb"
    }
}

struct RocksTransaction<'a> {
    txn: Transaction<'a, TransactionDB>,
}

impl RocksTransaction<'_> {
    /// Read-modify-write of a variant row under its exclusive lock
    fn update_variant(
        &mut self,
        variant_id: VariantId,
        mutate: impl FnOnce(&mut Variant),
    ) -> StoreResult<Variant> {
        let key = variant_key(variant_id);
        let bytes = self
            .txn
            .get_for_update(key.as_bytes(), true)?
            .ok_or_else(|| StoreError::MissingRow(format!("variant {variant_id}")))?;
        let mut variant: Variant = decode(&bytes)?;
        mutate(&mut variant);
        self.txn.put(key.as_bytes(), encode(&variant)?)?;
        Ok(variant)
    }
}

impl StoreTransaction for RocksTransaction<'_> {
    fn increment_selected(&mut self, variant_id: VariantId) -> StoreResult<Variant> {
        self.update_variant(variant_id, |v| v.counters.times_selected += 1)
    }

    fn apply_event_counter(
        &mut self,
        variant_id: VariantId,
        kind: EventKind,
    ) -> StoreResult<Variant> {
        self.update_variant(variant_id, |v| v.counters.apply(kind))
    }

    fn insert_event(&mut self, record: &EventRecord) -> StoreResult<()> {
        self.txn.put(event_key(record).as_bytes(), encode(record)?)?;
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        self.txn.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.txn.rollback()?;
        Ok(())
    }
}
