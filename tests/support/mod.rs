use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rolodex_rs::error::StoreError;
use rolodex_rs::model::{
    Account, ContactId, ContactRef, DirectoryId, GroupId, RawContactId, StreamItemEntry,
    StreamItemId, StreamItemPhoto,
};
use rolodex_rs::ops::{OpResult, Operation};
use rolodex_rs::store::{
    ContactNameRow, ContactStore, ContactTarget, DirectoryRow, EntityRows, GroupRow,
    ObserverId, RawContactEntity, StoreChange,
};
use rolodex_rs::MemoryStore;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Routes `RUST_LOG`-filtered tracing output to the test harness. Safe to
/// call from every test.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wraps a [`MemoryStore`], records every batch it is handed and injects
/// failures on request.
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    batches: Mutex<Vec<Vec<Operation>>>,
    /// 1-based batch call that fails with `Unavailable`.
    fail_batch: AtomicUsize,
    /// Every batch fails with an assertion failure.
    always_conflict: AtomicBool,
    fail_photo_reads: AtomicBool,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            batches: Mutex::new(Vec::new()),
            fail_batch: AtomicUsize::new(0),
            always_conflict: AtomicBool::new(false),
            fail_photo_reads: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    pub fn fail_batch(&self, call: usize) {
        self.fail_batch.store(call, Ordering::SeqCst);
    }

    pub fn always_conflict(&self, enabled: bool) {
        self.always_conflict.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_photo_reads(&self, enabled: bool) {
        self.fail_photo_reads.store(enabled, Ordering::SeqCst);
    }

    /// Sizes of every batch submitted so far, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }

    /// Every operation submitted so far, flattened in submission order.
    pub fn submitted(&self) -> Vec<Operation> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn reset_batches(&self) {
        self.batches.lock().clear();
    }
}

impl ContactStore for FaultyStore {
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
        let call = {
            let mut batches = self.batches.lock();
            batches.push(ops.to_vec());
            batches.len()
        };
        if self.fail_batch.load(Ordering::SeqCst) == call {
            return Err(StoreError::Unavailable(format!("injected failure on batch {call}")));
        }
        if self.always_conflict.load(Ordering::SeqCst) {
            return Err(StoreError::AssertionFailed {
                index: 0,
                reason: "injected version conflict".to_string(),
            });
        }
        self.inner.apply_batch(ops)
    }

    fn open_photo(&self, uri: &str) -> io::Result<Box<dyn Read + Send>> {
        if self.fail_photo_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, format!("injected read failure for {uri}")));
        }
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
