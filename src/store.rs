//! # Store Interface
//!
//! The contact store is treated as a transactional row store: ordered reads for
//! one contact, per-batch atomic writes with assertion support, and change
//! observation. [`crate::memory::MemoryStore`] and
//! [`crate::persistence::PersistentStore`] implement it.

use crate::codec::RowValues;
use crate::error::StoreError;
use crate::model::{
    Account, ContactId, ContactRef, DataId, DataStatus, DirectoryId, DisplayNameSource,
    ExportSupport, GroupId, GroupMetaData, RawContactId, StreamItemEntry, StreamItemId,
    StreamItemPhoto,
};
use crate::ops::{OpResult, Operation};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Canonical query target a reference resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactTarget {
    pub contact_id: ContactId,
    pub lookup_key: String,
    pub directory_id: DirectoryId,
    pub profile: bool,
}

/// Contact-level columns repeated on every entity row of one read.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactHeader {
    pub contact_id: ContactId,
    pub lookup_key: String,
    pub directory_id: DirectoryId,
    pub name_raw_contact_id: Option<RawContactId>,
    pub display_name_source: DisplayNameSource,
    pub display_name: Option<String>,
    pub alt_display_name: Option<String>,
    pub phonetic_name: Option<String>,
    pub photo_id: Option<DataId>,
    pub photo_uri: Option<String>,
    pub starred: bool,
    pub presence: Option<i64>,
    pub send_to_voicemail: bool,
    pub custom_ringtone: Option<String>,
    pub is_user_profile: bool,
}

/// One row of a contact read: a raw contact header plus at most one data row.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub raw_contact_id: RawContactId,
    pub raw_contact: RowValues,
    /// `None` when the raw contact has no data rows.
    pub data: Option<RowValues>,
    pub status: Option<DataStatus>,
}

/// Rows for one contact, ordered by raw contact id.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRows {
    pub header: ContactHeader,
    pub rows: Vec<EntityRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRow {
    pub display_name: Option<String>,
    pub package_name: Option<String>,
    pub type_res_id: Option<i64>,
    pub account_type: Option<String>,
    pub account_name: Option<String>,
    pub export_support: ExportSupport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRow {
    pub id: GroupId,
    pub account: Account,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub visible: bool,
    pub should_sync: bool,
    pub auto_add: bool,
    pub favorites: bool,
}

impl GroupRow {
    pub fn to_metadata(&self) -> GroupMetaData {
        GroupMetaData {
            account_name: self.account.name.clone(),
            account_type: self.account.account_type.clone(),
            data_set: self.account.data_set.clone(),
            group_id: self.id,
            title: self.title.clone(),
            default_group: self.auto_add,
            favorites: self.favorites,
        }
    }
}

/// A raw contact and its data rows, as fetched to rebase a pending edit.
#[derive(Debug, Clone, PartialEq)]
pub struct RawContactEntity {
    pub values: RowValues,
    pub data: Vec<RowValues>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactNameRow {
    pub contact_id: ContactId,
    pub display_name: Option<String>,
    pub alt_display_name: Option<String>,
}

/// Sent to observers after every committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChange {
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Transactional contact store.
///
/// Read methods returning `Option` use `None` for "no result set", which the
/// assembler reports as not found; an empty result set is `Some(empty)`.
pub trait ContactStore: Send + Sync {
    fn resolve(&self, reference: &ContactRef) -> Result<Option<ContactTarget>, StoreError>;

    fn query_entities(&self, target: &ContactTarget) -> Result<Option<EntityRows>, StoreError>;

    fn query_directory(&self, id: DirectoryId) -> Result<Option<DirectoryRow>, StoreError>;

    /// Groups in any of the given accounts, combined with OR.
    fn query_groups(&self, accounts: &[Account]) -> Result<Option<Vec<GroupRow>>, StoreError>;

    fn query_group(&self, id: GroupId) -> Result<Option<GroupRow>, StoreError>;

    fn query_group_members(&self, id: GroupId) -> Result<Vec<RawContactId>, StoreError>;

    fn query_stream_items(
        &self,
        lookup_key: &str,
    ) -> Result<Option<Vec<StreamItemEntry>>, StoreError>;

    /// Photos of the given items, ordered by stream item id.
    fn query_stream_photos(
        &self,
        items: &[StreamItemId],
    ) -> Result<Option<Vec<StreamItemPhoto>>, StoreError>;

    fn query_raw_contacts(
        &self,
        ids: &[RawContactId],
        profile: bool,
    ) -> Result<Vec<RawContactEntity>, StoreError>;

    /// Member raw contacts of each contact. `None` when the read failed to
    /// produce a result set.
    fn raw_contact_ids_for_contacts(
        &self,
        ids: &[ContactId],
    ) -> Result<Option<Vec<(ContactId, RawContactId)>>, StoreError>;

    fn query_contact_names(&self, ids: &[ContactId]) -> Result<Vec<ContactNameRow>, StoreError>;

    /// Applies `ops` atomically. On success the result has one entry per op.
    fn apply_batch(&self, ops: &[Operation]) -> Result<Vec<OpResult>, StoreError>;

    fn open_photo(&self, uri: &str) -> std::io::Result<Box<dyn Read + Send>>;

    fn write_display_photo(&self, raw: RawContactId, bytes: &[u8]) -> Result<(), StoreError>;

    fn register_observer(&self, observer: Sender<StoreChange>) -> ObserverId;

    fn unregister_observer(&self, id: ObserverId);
}

/// Stable lookup reference of the contact `raw` currently belongs to.
pub fn lookup_ref_for_raw(
    store: &dyn ContactStore,
    raw: RawContactId,
) -> Result<Option<ContactRef>, StoreError> {
    Ok(store
        .resolve(&ContactRef::RawContact(raw))?
        .map(|target| {
            if target.profile {
                ContactRef::Profile
            } else {
                ContactRef::Lookup {
                    lookup_key: target.lookup_key,
                    contact_id: Some(target.contact_id),
                }
            }
        }))
}

/// Group filter shared by store implementations: name and type must match, and
/// the data set must match exactly (an account without a data set only
/// matches groups without one).
pub fn group_matches_accounts(group: &Account, accounts: &[Account]) -> bool {
    accounts.iter().any(|account| {
        account.name == group.name
            && account.account_type == group.account_type
            && account.data_set == group.data_set
    })
}
