//! # Rolodex
//!
//! Aggregation and persistence core for a federated address book.
//!
//! Raw contacts from many accounts are merged into contacts by a store-side
//! aggregation that honours pairwise keep-together and keep-separate edges.
//! This crate assembles immutable contact snapshots from the store, saves
//! edits in bounded batches with optimistic concurrency, joins and splits
//! contacts, and manages groups with undoable deletes.
//!
//! [`Rolodex`] ties the pieces together and runs every caller-visible request
//! on a background worker.

pub mod accounts;
pub mod aggregation;
pub mod apply;
pub mod assembler;
pub mod codec;
pub mod config;
pub mod delta;
pub mod dsu;
pub mod edits;
pub mod encoded;
pub mod error;
pub mod groups;
pub mod kinds;
pub mod memory;
pub mod model;
pub mod notify;
pub mod ops;
pub mod persistence;
pub mod photo;
pub mod store;
#[doc(hidden)]
pub mod test_support;
pub mod worker;

// Re-export main types for convenience
pub use accounts::{AccountTypeInfo, AccountTypes, StaticAccountTypes};
pub use aggregation::{AggregationManager, AggregationOutcome, AggregationResultCode};
pub use apply::{BatchApplier, SaveEngine, SaveOutcome, SaveRequest};
pub use assembler::{ContactAssembler, SnapshotCache};
pub use config::{ApplyTuning, RolodexConfig, TuningProfile};
pub use error::{ContactError, ContactResult, StoreError};
pub use groups::{GroupManager, UndoPayload};
pub use memory::MemoryStore;
pub use model::{Account, Contact, ContactId, ContactRef, DataId, GroupId, LoadResult, RawContactId};
pub use notify::{Broadcast, BroadcastTag, NotificationGateway};
pub use persistence::PersistentStore;
pub use store::ContactStore;
pub use worker::{CancelToken, ContactService, ContactWatcher, RequestHandle, RequestKind};

use crossbeam_channel::Receiver;
use edits::ContactEditor;
use notify::ListenerId;
use std::sync::Arc;
use tracing::info;
use worker::PhotoWorker;

/// Main API: one store, one worker, one notification gateway.
pub struct Rolodex {
    store: Arc<dyn ContactStore>,
    accounts: Arc<dyn AccountTypes>,
    gateway: Arc<NotificationGateway>,
    config: RolodexConfig,
    cache: Arc<SnapshotCache>,
    service: ContactService,
    photos: Option<Arc<PhotoWorker>>,
    saves: SaveEngine,
    aggregation: AggregationManager,
    groups: GroupManager,
    editor: ContactEditor,
}

impl Rolodex {
    pub fn new(
        store: Arc<dyn ContactStore>,
        accounts: Arc<dyn AccountTypes>,
        config: RolodexConfig,
    ) -> ContactResult<Self> {
        Self::with_gateway(store, accounts, Arc::new(NotificationGateway::new()), config)
    }

    /// Opens the durable store when `storage.data_dir` is set, an in-memory
    /// one otherwise.
    pub fn open(config: RolodexConfig, accounts: Arc<dyn AccountTypes>) -> ContactResult<Self> {
        let store: Arc<dyn ContactStore> = if config.storage.data_dir.is_some() {
            Arc::new(PersistentStore::open_configured(&config.storage)?)
        } else {
            Arc::new(MemoryStore::new())
        };
        Self::new(store, accounts, config)
    }

    pub fn with_gateway(
        store: Arc<dyn ContactStore>,
        accounts: Arc<dyn AccountTypes>,
        gateway: Arc<NotificationGateway>,
        config: RolodexConfig,
    ) -> ContactResult<Self> {
        let applier = BatchApplier::new(Arc::clone(&store), config.apply_tuning());
        let service = ContactService::start(&config.worker, Arc::clone(&gateway))?;
        let photos = if config.loader.fetch_photo_in_background {
            Some(Arc::new(PhotoWorker::start(
                &config.worker,
                Arc::clone(&store),
                config.loader.max_photo_bytes,
            )?))
        } else {
            None
        };
        info!(
            max_batch = applier.max_batch(),
            background_photos = photos.is_some(),
            "rolodex started"
        );
        Ok(Self {
            cache: Arc::new(SnapshotCache::new(config.loader.cache_capacity)),
            saves: SaveEngine::new(applier.clone(), Arc::clone(&accounts)),
            aggregation: AggregationManager::new(applier.clone(), Arc::clone(&gateway)),
            groups: GroupManager::new(applier.clone(), Arc::clone(&gateway)),
            editor: ContactEditor::new(applier, Arc::clone(&accounts)),
            store,
            accounts,
            gateway,
            config,
            service,
            photos,
        })
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<NotificationGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &RolodexConfig {
        &self.config
    }

    pub fn service(&self) -> &ContactService {
        &self.service
    }

    pub fn subscribe(&self, tags: &[BroadcastTag]) -> (ListenerId, Receiver<Broadcast>) {
        self.gateway.subscribe(tags)
    }

    /// A fresh assembler sharing this instance's snapshot cache.
    pub fn assembler(&self) -> ContactAssembler {
        ContactAssembler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.accounts),
            Arc::clone(&self.gateway),
            self.config.loader.clone(),
        )
        .with_cache(Arc::clone(&self.cache))
    }

    /// Loads one snapshot. With background photos on, the photo arrives later
    /// as a second snapshot on the returned receiver.
    pub fn load(
        &self,
        reference: ContactRef,
    ) -> ContactResult<(RequestHandle<LoadResult>, Receiver<LoadResult>)> {
        let mut assembler = self.assembler();
        let photos = self.photos.clone();
        let (deliver, updates) = crossbeam_channel::unbounded();
        let handle = self.service.submit(RequestKind::Load, move |_cancel| {
            let result = assembler.load(&reference);
            if let (LoadResult::Loaded(contact), Some(photos)) = (&result, &photos) {
                photos.fetch(Arc::clone(contact), deliver);
            }
            Ok(result)
        })?;
        Ok((handle, updates))
    }

    /// Keeps `reference` loaded on a dedicated thread until the watcher drops.
    pub fn watch(&self, reference: ContactRef) -> ContactResult<ContactWatcher> {
        ContactWatcher::start(
            &self.config.worker,
            self.assembler(),
            reference,
            self.photos.clone(),
        )
    }

    pub fn save(&self, request: SaveRequest) -> ContactResult<RequestHandle<SaveOutcome>> {
        let saves = self.saves.clone();
        self.service
            .submit(RequestKind::Save, move |cancel| Ok(saves.save(request, cancel)))
    }

    pub fn join(&self, contacts: Vec<ContactId>) -> ContactResult<RequestHandle<AggregationOutcome>> {
        let aggregation = self.aggregation.clone();
        self.service.submit(RequestKind::Join, move |cancel| {
            Ok(aggregation.join(&contacts, cancel))
        })
    }

    pub fn join_several(
        &self,
        contacts: Vec<ContactId>,
    ) -> ContactResult<RequestHandle<AggregationOutcome>> {
        let aggregation = self.aggregation.clone();
        self.service.submit(RequestKind::JoinSeveral, move |cancel| {
            Ok(aggregation.join_several(&contacts, cancel))
        })
    }

    pub fn split(
        &self,
        clusters: Vec<Vec<RawContactId>>,
        hard: bool,
    ) -> ContactResult<RequestHandle<AggregationOutcome>> {
        let aggregation = self.aggregation.clone();
        self.service.submit(RequestKind::Split, move |cancel| {
            Ok(aggregation.split(&clusters, hard, cancel))
        })
    }

    pub fn split_contact(
        &self,
        contact: ContactId,
        hard: bool,
    ) -> ContactResult<RequestHandle<AggregationOutcome>> {
        let aggregation = self.aggregation.clone();
        self.service.submit(RequestKind::Split, move |cancel| {
            Ok(aggregation.split_contact(contact, hard, cancel))
        })
    }

    pub fn create_group(
        &self,
        account: Account,
        title: String,
        members: Vec<RawContactId>,
    ) -> ContactResult<RequestHandle<GroupId>> {
        let groups = self.groups.clone();
        self.service.submit(RequestKind::CreateGroup, move |cancel| {
            groups.create(&account, &title, &members, cancel)
        })
    }

    pub fn rename_group(&self, group: GroupId, title: String) -> ContactResult<RequestHandle<()>> {
        let groups = self.groups.clone();
        self.service.submit(RequestKind::RenameGroup, move |cancel| {
            groups.rename(group, &title, cancel)
        })
    }

    pub fn update_group(
        &self,
        group: GroupId,
        title: Option<String>,
        add: Vec<RawContactId>,
        remove: Vec<RawContactId>,
    ) -> ContactResult<RequestHandle<()>> {
        let groups = self.groups.clone();
        self.service.submit(RequestKind::UpdateGroup, move |cancel| {
            groups.update(group, title.as_deref(), &add, &remove, cancel)
        })
    }

    pub fn delete_group(&self, group: GroupId) -> ContactResult<RequestHandle<UndoPayload>> {
        let groups = self.groups.clone();
        self.service
            .submit(RequestKind::DeleteGroup, move |cancel| groups.delete(group, cancel))
    }

    pub fn undo_group_delete(&self, payload: UndoPayload) -> ContactResult<RequestHandle<GroupId>> {
        let groups = self.groups.clone();
        self.service
            .submit(RequestKind::UndoGroup, move |cancel| groups.undo(&payload, cancel))
    }

    pub fn set_starred(&self, contact: ContactId, starred: bool) -> ContactResult<RequestHandle<()>> {
        self.edit(move |editor, cancel| editor.set_starred(contact, starred, cancel))
    }

    pub fn set_send_to_voicemail(
        &self,
        contact: ContactId,
        enabled: bool,
    ) -> ContactResult<RequestHandle<()>> {
        self.edit(move |editor, cancel| editor.set_send_to_voicemail(contact, enabled, cancel))
    }

    pub fn set_ringtone(
        &self,
        contact: ContactId,
        ringtone: Option<String>,
    ) -> ContactResult<RequestHandle<()>> {
        self.edit(move |editor, cancel| editor.set_ringtone(contact, ringtone.as_deref(), cancel))
    }

    pub fn set_super_primary(&self, data: DataId) -> ContactResult<RequestHandle<()>> {
        self.edit(move |editor, cancel| editor.set_super_primary(data, cancel))
    }

    pub fn clear_primary(&self, data: DataId) -> ContactResult<RequestHandle<()>> {
        self.edit(move |editor, cancel| editor.clear_primary(data, cancel))
    }

    pub fn delete_contacts(&self, contacts: Vec<ContactId>) -> ContactResult<RequestHandle<()>> {
        self.edit(move |editor, cancel| editor.delete_multiple_contacts(&contacts, cancel))
    }

    pub fn create_raw_contact(
        &self,
        account: Account,
        data: Vec<codec::RowValues>,
    ) -> ContactResult<RequestHandle<(RawContactId, Option<ContactRef>)>> {
        self.edit(move |editor, cancel| editor.create_raw_contact(&account, &data, cancel))
    }

    fn edit<T, F>(&self, work: F) -> ContactResult<RequestHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&ContactEditor, &CancelToken) -> ContactResult<T> + Send + 'static,
    {
        let editor = self.editor.clone();
        self.service
            .submit(RequestKind::Edit, move |cancel| work(&editor, cancel))
    }
}
