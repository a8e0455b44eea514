//! # Persistent Store
//!
//! RocksDB-backed [`ContactStore`]. Tables are kept in a [`MemoryStore`] for
//! reads; every commit is written through as one RocksDB `WriteBatch` before
//! the in-memory copy is replaced, so a failed disk write aborts the batch.

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::memory::{ChangeSet, CommitHook, Counters, MemoryStore, StoreState};
use crate::model::{
    Account, ContactId, ContactRef, DirectoryId, GroupId, RawContactId, StreamItemEntry,
    StreamItemId, StreamItemPhoto,
};
use crate::ops::{OpResult, Operation};
use crate::store::{
    ContactNameRow, ContactStore, ContactTarget, DirectoryRow, EntityRows, GroupRow, ObserverId,
    RawContactEntity, StoreChange,
};
use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use rocksdb::{checkpoint::Checkpoint, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const CF_RAW_CONTACTS: &str = "raw_contacts";
const CF_DATA: &str = "data";
const CF_GROUPS: &str = "groups";
const CF_EXCEPTIONS: &str = "aggregation_exceptions";
const CF_STATUSES: &str = "statuses";
const CF_DIRECTORIES: &str = "directories";
const CF_STREAM_ITEMS: &str = "stream_items";
const CF_STREAM_PHOTOS: &str = "stream_photos";
const CF_PHOTO_FILES: &str = "photo_files";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_COUNTERS: &[u8] = b"counters";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub write_buffer_mb: usize,
    pub max_background_jobs: i32,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for PersistentOpenOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            repair: config.repair,
            write_buffer_mb: config.write_buffer_mb,
            max_background_jobs: config.max_background_jobs,
        }
    }
}

pub struct PersistentStore {
    inner: MemoryStore,
    db: Arc<DB>,
}

struct WriteThrough {
    db: Arc<DB>,
}

fn id_key(id: i64) -> [u8; 8] {
    id.to_be_bytes()
}

fn pair_key(pair: (i64, i64)) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&pair.0.to_be_bytes());
    key[8..].copy_from_slice(&pair.1.to_be_bytes());
    key
}

fn decode_id(key: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| anyhow!("malformed id key of {} bytes", key.len()))?;
    Ok(i64::from_be_bytes(bytes))
}

fn decode_pair(key: &[u8]) -> Result<(i64, i64)> {
    if key.len() != 16 {
        return Err(anyhow!("malformed pair key of {} bytes", key.len()));
    }
    Ok((decode_id(&key[..8])?, decode_id(&key[8..])?))
}

impl WriteThrough {
    fn stage<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf_name: &str,
        keys: &BTreeSet<i64>,
        table: &BTreeMap<i64, T>,
    ) -> Result<()> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| anyhow!("missing column family {cf_name}"))?;
        for key in keys {
            match table.get(key) {
                Some(value) => batch.put_cf(cf, id_key(*key), bincode::serialize(value)?),
                None => batch.delete_cf(cf, id_key(*key)),
            }
        }
        Ok(())
    }

    fn write(&self, state: &StoreState, changes: &ChangeSet) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage(&mut batch, CF_RAW_CONTACTS, &changes.raw_contacts, &state.raw_contacts)?;
        self.stage(&mut batch, CF_DATA, &changes.data, &state.data)?;
        self.stage(&mut batch, CF_GROUPS, &changes.groups, &state.groups)?;
        self.stage(&mut batch, CF_STATUSES, &changes.statuses, &state.statuses)?;
        self.stage(&mut batch, CF_DIRECTORIES, &changes.directories, &state.directories)?;
        self.stage(&mut batch, CF_STREAM_ITEMS, &changes.stream_items, &state.stream_items)?;
        self.stage(&mut batch, CF_STREAM_PHOTOS, &changes.stream_photos, &state.stream_photos)?;
        self.stage(&mut batch, CF_PHOTO_FILES, &changes.photo_files, &state.photo_files)?;

        let exceptions_cf = self
            .db
            .cf_handle(CF_EXCEPTIONS)
            .ok_or_else(|| anyhow!("missing column family {CF_EXCEPTIONS}"))?;
        for pair in &changes.exceptions {
            match state.exceptions.get(pair) {
                Some(code) => batch.put_cf(exceptions_cf, pair_key(*pair), bincode::serialize(code)?),
                None => batch.delete_cf(exceptions_cf, pair_key(*pair)),
            }
        }

        let metadata_cf = self
            .db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| anyhow!("missing metadata column family"))?;
        batch.put_cf(metadata_cf, KEY_COUNTERS, bincode::serialize(&state.counters)?);
        let staged = batch.len();
        self.db.write(batch)?;
        debug!(staged, "write-through committed");
        Ok(())
    }
}

impl CommitHook for WriteThrough {
    fn before_commit(&self, state: &StoreState, changes: &ChangeSet) -> Result<(), StoreError> {
        self.write(state, changes).map_err(StoreError::Storage)
    }
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    /// Opens the store at the configured data directory.
    pub fn open_configured(config: &StorageConfig) -> Result<Self> {
        let path = config
            .data_dir
            .as_ref()
            .ok_or_else(|| anyhow!("storage.data_dir is not set"))?;
        Self::open_with_options(path, PersistentOpenOptions::from(config))
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: PersistentOpenOptions) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = Arc::new(open_db(path, &options)?);
        validate_or_init_manifest(&db)?;
        let state = load_state(&db)?;
        info!(
            raw_contacts = state.raw_contacts.len(),
            data = state.data.len(),
            groups = state.groups.len(),
            "opened persistent contact store"
        );
        let hook = WriteThrough { db: db.clone() };
        Ok(Self {
            inner: MemoryStore::from_state(state, Some(Box::new(hook))),
            db,
        })
    }

    /// The in-memory tables; writes made through it are persisted as well.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl ContactStore for PersistentStore {
    fn resolve(&self, reference: &ContactRef) -> Result<Option<ContactTarget>, StoreError> {
        self.inner.resolve(reference)
    }

    fn query_entities(&self, target: &ContactTarget) -> Result<Option<EntityRows>, StoreError> {
        self.inner.query_entities(target)
    }

    fn query_directory(&self, id: DirectoryId) -> Result<Option<DirectoryRow>, StoreError> {
        self.inner.query_directory(id)
    }

    fn query_groups(&self, accounts: &[Account]) -> Result<Option<Vec<GroupRow>>, StoreError> {
        self.inner.query_groups(accounts)
    }

    fn query_group(&self, id: GroupId) -> Result<Option<GroupRow>, StoreError> {
        self.inner.query_group(id)
    }

    fn query_group_members(&self, id: GroupId) -> Result<Vec<RawContactId>, StoreError> {
        self.inner.query_group_members(id)
    }

    fn query_stream_items(
        &self,
        lookup_key: &str,
    ) -> Result<Option<Vec<StreamItemEntry>>, StoreError> {
        self.inner.query_stream_items(lookup_key)
    }

    fn query_stream_photos(
        &self,
        items: &[StreamItemId],
    ) -> Result<Option<Vec<StreamItemPhoto>>, StoreError> {
        self.inner.query_stream_photos(items)
    }

    fn query_raw_contacts(
        &self,
        ids: &[RawContactId],
        profile: bool,
    ) -> Result<Vec<RawContactEntity>, StoreError> {
        self.inner.query_raw_contacts(ids, profile)
    }

    fn raw_contact_ids_for_contacts(
        &self,
        ids: &[ContactId],
    ) -> Result<Option<Vec<(ContactId, RawContactId)>>, StoreError> {
        self.inner.raw_contact_ids_for_contacts(ids)
    }

    fn query_contact_names(&self, ids: &[ContactId]) -> Result<Vec<ContactNameRow>, StoreError> {
        self.inner.query_contact_names(ids)
    }

    fn apply_batch(&self, ops: &[Operation]) -> Result<Vec<OpResult>, StoreError> {
        self.inner.apply_batch(ops)
    }

    fn open_photo(&self, uri: &str) -> std::io::Result<Box<dyn Read + Send>> {
        self.inner.open_photo(uri)
    }

    fn write_display_photo(&self, raw: RawContactId, bytes: &[u8]) -> Result<(), StoreError> {
        self.inner.write_display_photo(raw, bytes)
    }

    fn register_observer(&self, observer: Sender<StoreChange>) -> ObserverId {
        self.inner.register_observer(observer)
    }

    fn unregister_observer(&self, id: ObserverId) {
        self.inner.unregister_observer(id)
    }
}

fn open_db(path: impl AsRef<Path>, open: &PersistentOpenOptions) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    options.set_write_buffer_size(open.write_buffer_mb * 1024 * 1024);
    options.set_max_background_jobs(open.max_background_jobs);
    let cfs = [
        CF_RAW_CONTACTS,
        CF_DATA,
        CF_GROUPS,
        CF_EXCEPTIONS,
        CF_STATUSES,
        CF_DIRECTORIES,
        CF_STREAM_ITEMS,
        CF_STREAM_PHOTOS,
        CF_PHOTO_FILES,
        CF_METADATA,
    ]
    .into_iter()
    .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
    .collect::<Vec<_>>();
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest)?)?;
    Ok(())
}

fn load_table<T: DeserializeOwned>(db: &DB, cf_name: &str) -> Result<BTreeMap<i64, T>> {
    let cf = db
        .cf_handle(cf_name)
        .ok_or_else(|| anyhow!("missing column family {cf_name}"))?;
    let mut table = BTreeMap::new();
    for entry in db.iterator_cf(cf, IteratorMode::Start) {
        let (key, value) = entry?;
        table.insert(decode_id(&key)?, bincode::deserialize(&value)?);
    }
    Ok(table)
}

fn load_state(db: &DB) -> Result<StoreState> {
    let mut state = StoreState::default();
    state.raw_contacts = load_table(db, CF_RAW_CONTACTS)?;
    state.data = load_table(db, CF_DATA)?;
    state.groups = load_table(db, CF_GROUPS)?;
    state.statuses = load_table(db, CF_STATUSES)?;
    state.directories = load_table(db, CF_DIRECTORIES)?;
    state.stream_items = load_table(db, CF_STREAM_ITEMS)?;
    state.stream_photos = load_table(db, CF_STREAM_PHOTOS)?;
    state.photo_files = load_table(db, CF_PHOTO_FILES)?;

    let exceptions_cf = db
        .cf_handle(CF_EXCEPTIONS)
        .ok_or_else(|| anyhow!("missing column family {CF_EXCEPTIONS}"))?;
    for entry in db.iterator_cf(exceptions_cf, IteratorMode::Start) {
        let (key, value) = entry?;
        state
            .exceptions
            .insert(decode_pair(&key)?, bincode::deserialize(&value)?);
    }

    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_COUNTERS)? {
        let counters: Counters = bincode::deserialize(&bytes)?;
        state.counters = counters;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{DataKind, StructuredName};
    use crate::model::AggregationType;
    use tempfile::tempdir;

    fn name(display: &str) -> DataKind {
        DataKind::StructuredName(StructuredName {
            display_name: Some(display.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn persistent_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path();
        let account = Account::new("a@example.com", "com.example");

        let store = PersistentStore::open(path).unwrap();
        let a = store.inner().insert_raw_contact(&account, &[name("Ada")]).unwrap();
        let b = store.inner().insert_raw_contact(&account, &[name("Lovelace")]).unwrap();
        store
            .apply_batch(&[Operation::aggregation_exception(
                AggregationType::KeepTogether,
                a,
                b,
            )])
            .unwrap();
        let contact = store.inner().contact_id_of(a).unwrap();
        let version = store.inner().raw_contact_version(b).unwrap();
        drop(store);

        let store = PersistentStore::open(path).unwrap();
        assert_eq!(store.inner().contact_id_of(a), Some(contact));
        assert_eq!(store.inner().contact_id_of(b), Some(contact));
        assert_eq!(store.inner().raw_contact_version(b), Some(version));
        assert_eq!(
            store.inner().aggregation_exception(a, b),
            Some(AggregationType::KeepTogether)
        );

        let c = store.inner().insert_raw_contact(&account, &[name("New")]).unwrap();
        assert!(c.0 > b.0);
    }

    #[test]
    fn persistent_store_forgets_hard_deletes() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let store = PersistentStore::open(path).unwrap();
        let local = store
            .inner()
            .insert_raw_contact(&Account::local(), &[name("Temp")])
            .unwrap();
        store
            .apply_batch(&[Operation::delete(crate::ops::Table::RawContacts).with_id(local.0)])
            .unwrap();
        drop(store);

        let store = PersistentStore::open(path).unwrap();
        assert!(store.inner().raw_contact_row(local).is_none());
        assert!(store.inner().data_rows(local).is_empty());
        assert_eq!(store.inner().contact_count(), 0);
    }

    #[test]
    fn manifest_version_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path();
        {
            let db = open_db(path, &PersistentOpenOptions::default()).unwrap();
            let metadata_cf = db.cf_handle(CF_METADATA).unwrap();
            let manifest = StorageManifest {
                format_version: STORAGE_FORMAT_VERSION + 1,
                app_version: "future".to_string(),
            };
            db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest).unwrap())
                .unwrap();
        }
        assert!(PersistentStore::open(path).is_err());
    }
}
