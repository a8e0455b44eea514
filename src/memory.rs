//! # In-Memory Contact Store
//!
//! Transactional row store behind [`ContactStore`]. Each batch runs against a
//! private copy of the tables and replaces the live state only when every
//! operation succeeded, so a failed batch leaves nothing behind. Contact
//! clusters are recomputed after each committed write.

use crate::codec::{self, columns, get_bool, get_i64, get_text, RowValues, Value};
use crate::dsu::{ClusterDsu, MergeResult};
use crate::error::StoreError;
use crate::kinds::{mimetype, DataKind};
use crate::model::{
    Account, AggregationMode, AggregationType, ContactId, ContactRef, DataId, DataStatus,
    DirectoryId, DisplayNameSource, GroupId, RawContactId, StreamItemEntry, StreamItemId,
    StreamItemPhoto,
};
use crate::ops::{OpKind, OpResult, Operation, Selection, Table};
use crate::store::{
    group_matches_accounts, ContactHeader, ContactNameRow, ContactStore, ContactTarget,
    DirectoryRow, EntityRow, EntityRows, GroupRow, ObserverId, RawContactEntity, StoreChange,
};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, instrument, trace};

/// Raw contact columns the store maintains for itself.
pub mod internal {
    pub const IS_PROFILE: &str = "is_profile";
    pub const DIRECTORY_ID: &str = "directory_id";
}

pub const PHOTO_URI_PREFIX: &str = "content://photo/";

/// Profile contacts live in their own id range.
const PROFILE_CONTACT_ID_BASE: i64 = 9_223_372_034_707_292_160;

/// Thumbnails keep at most this many leading bytes of the full photo.
const THUMBNAIL_BYTES: usize = 4096;

pub fn photo_uri(file_id: i64) -> String {
    format!("{PHOTO_URI_PREFIX}{file_id}")
}

fn lookup_key_for(raw_ids: &[i64]) -> String {
    raw_ids
        .iter()
        .map(|id| format!("r{id}"))
        .collect::<Vec<_>>()
        .join(".")
}

fn lookup_key_segments(key: &str) -> impl Iterator<Item = i64> + '_ {
    key.split('.')
        .filter_map(|segment| segment.strip_prefix('r'))
        .filter_map(|id| id.parse().ok())
}

fn value_matches(row: &RowValues, column: &str, expected: &Value) -> bool {
    let actual = row.get(column).unwrap_or(&Value::Null);
    if actual == expected {
        return true;
    }
    match (actual.as_i64(), expected.as_i64()) {
        (Some(a), Some(b)) => a == b,
        _ => actual.is_null() && expected.is_null(),
    }
}

fn invalid(index: usize, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidOperation {
        index,
        reason: reason.into(),
    }
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub raw_contact: i64,
    pub data: i64,
    pub group: i64,
    pub contact: i64,
    pub photo_file: i64,
    pub stream_item: i64,
    pub stream_photo: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamItemRecord {
    pub raw_contact_id: i64,
    pub entry: StreamItemEntry,
}

/// Derived per-contact summary, rebuilt by aggregation.
#[derive(Debug, Clone, PartialEq)]
struct ContactRecord {
    id: i64,
    lookup_key: String,
    directory_id: i64,
    profile: bool,
    raw_contact_ids: Vec<i64>,
    name_raw_contact_id: Option<i64>,
    display_name_source: DisplayNameSource,
    display_name: Option<String>,
    alt_display_name: Option<String>,
    phonetic_name: Option<String>,
    photo_id: Option<i64>,
    photo_uri: Option<String>,
    starred: bool,
    send_to_voicemail: bool,
    custom_ringtone: Option<String>,
}

impl ContactRecord {
    fn target(&self) -> ContactTarget {
        ContactTarget {
            contact_id: ContactId(self.id),
            lookup_key: self.lookup_key.clone(),
            directory_id: DirectoryId(self.directory_id),
            profile: self.profile,
        }
    }

    fn to_row(&self) -> RowValues {
        let mut row = RowValues::new();
        row.insert(columns::ID.to_string(), self.id.into());
        row.insert("lookup".to_string(), self.lookup_key.as_str().into());
        row.insert("display_name".to_string(), self.display_name.clone().into());
        row.insert(columns::STARRED.to_string(), self.starred.into());
        row.insert(
            columns::SEND_TO_VOICEMAIL.to_string(),
            self.send_to_voicemail.into(),
        );
        row.insert(
            columns::CUSTOM_RINGTONE.to_string(),
            self.custom_ringtone.clone().into(),
        );
        row
    }
}

/// Keys touched by one committed write, per table.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub raw_contacts: BTreeSet<i64>,
    pub data: BTreeSet<i64>,
    pub groups: BTreeSet<i64>,
    pub exceptions: BTreeSet<(i64, i64)>,
    pub statuses: BTreeSet<i64>,
    pub directories: BTreeSet<i64>,
    pub stream_items: BTreeSet<i64>,
    pub stream_photos: BTreeSet<i64>,
    pub photo_files: BTreeSet<i64>,
}

/// Every table of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub raw_contacts: BTreeMap<i64, RowValues>,
    pub data: BTreeMap<i64, RowValues>,
    pub groups: BTreeMap<i64, RowValues>,
    /// Normalized `(smaller, larger)` raw id pairs to aggregation type codes.
    pub exceptions: BTreeMap<(i64, i64), i64>,
    pub statuses: BTreeMap<i64, DataStatus>,
    pub directories: BTreeMap<i64, DirectoryRow>,
    pub stream_items: BTreeMap<i64, StreamItemRecord>,
    pub stream_photos: BTreeMap<i64, StreamItemPhoto>,
    pub photo_files: BTreeMap<i64, Vec<u8>>,
    pub counters: Counters,
    #[serde(skip)]
    contacts: BTreeMap<i64, ContactRecord>,
    #[serde(skip)]
    stale: bool,
}

/// Invoked with the finished working copy before it replaces the live state.
/// An error aborts the commit.
pub trait CommitHook: Send + Sync {
    fn before_commit(&self, state: &StoreState, changes: &ChangeSet) -> Result<(), StoreError>;
}

impl StoreState {
    fn raw_live(&self, id: i64) -> Option<&RowValues> {
        self.raw_contacts
            .get(&id)
            .filter(|row| !get_bool(row, columns::DELETED))
    }

    fn raw_partition(row: &RowValues) -> (bool, i64) {
        (
            get_bool(row, internal::IS_PROFILE),
            get_i64(row, internal::DIRECTORY_ID).unwrap_or(DirectoryId::DEFAULT.0),
        )
    }

    fn data_owner_live(&self, row: &RowValues, profile: bool) -> bool {
        get_i64(row, columns::RAW_CONTACT_ID)
            .and_then(|owner| self.raw_live(owner))
            .is_some_and(|owner| get_bool(owner, internal::IS_PROFILE) == profile)
    }

    fn data_ids_of(&self, raw: i64) -> Vec<i64> {
        self.data
            .iter()
            .filter(|(_, row)| get_i64(row, columns::RAW_CONTACT_ID) == Some(raw))
            .map(|(id, _)| *id)
            .collect()
    }

    fn bump_raw(&mut self, id: i64, changes: &mut ChangeSet) {
        if let Some(row) = self.raw_contacts.get_mut(&id) {
            let version = get_i64(row, columns::VERSION).unwrap_or(0) + 1;
            row.insert(columns::VERSION.to_string(), version.into());
            row.insert(columns::DIRTY.to_string(), Value::Integer(1));
            changes.raw_contacts.insert(id);
        }
        self.stale = true;
    }

    fn refresh(&mut self, changes: &mut ChangeSet) {
        if self.stale {
            self.reaggregate(changes);
        }
    }

    fn candidates(&mut self, table: Table, profile: bool, changes: &mut ChangeSet) -> Vec<(i64, RowValues)> {
        match table {
            Table::RawContacts => self
                .raw_contacts
                .iter()
                .filter(|(_, row)| !get_bool(row, columns::DELETED))
                .filter(|(_, row)| get_bool(row, internal::IS_PROFILE) == profile)
                .map(|(id, row)| (*id, row.clone()))
                .collect(),
            Table::Data => self
                .data
                .iter()
                .filter(|(_, row)| self.data_owner_live(row, profile))
                .map(|(id, row)| (*id, row.clone()))
                .collect(),
            Table::Groups => self
                .groups
                .iter()
                .map(|(id, row)| (*id, row.clone()))
                .collect(),
            Table::Contacts => {
                self.refresh(changes);
                self.contacts
                    .values()
                    .filter(|record| record.profile == profile)
                    .map(|record| (record.id, record.to_row()))
                    .collect()
            }
            Table::AggregationExceptions => Vec::new(),
        }
    }

    fn select(
        &mut self,
        table: Table,
        selection: &Selection,
        profile: bool,
        changes: &mut ChangeSet,
    ) -> Vec<(i64, RowValues)> {
        let rows = self.candidates(table, profile, changes);
        match selection {
            Selection::All => rows,
            Selection::Id(id) => rows.into_iter().filter(|(row_id, _)| row_id == id).collect(),
            Selection::IdBackRef(_) => Vec::new(),
            Selection::Matching(terms) => rows
                .into_iter()
                .filter(|(id, row)| {
                    terms.iter().all(|(column, value)| {
                        if column == columns::ID {
                            value.as_i64() == Some(*id)
                        } else {
                            value_matches(row, column, value)
                        }
                    })
                })
                .collect(),
        }
    }

    fn apply_ops(
        &mut self,
        ops: &[Operation],
        changes: &mut ChangeSet,
    ) -> Result<Vec<OpResult>, StoreError> {
        let mut results: Vec<OpResult> = Vec::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            let mut values = op.values.clone();
            for (column, back_ref) in &op.value_back_refs {
                let id = results
                    .get(*back_ref)
                    .and_then(|result| result.id)
                    .ok_or_else(|| invalid(index, format!("back reference {back_ref} unresolved")))?;
                values.insert(column.clone(), Value::Integer(id));
            }
            let selection = match &op.selection {
                Selection::IdBackRef(back_ref) => results
                    .get(*back_ref)
                    .and_then(|result| result.id)
                    .map(Selection::Id)
                    .ok_or_else(|| invalid(index, format!("back reference {back_ref} unresolved")))?,
                other => other.clone(),
            };
            let result = match op.kind {
                OpKind::Insert => self.insert(index, op, values, changes)?,
                OpKind::Update => self.update(index, op, &selection, values, changes)?,
                OpKind::Delete => self.delete(index, op, &selection, changes)?,
                OpKind::Assert => self.assert(index, op, &selection, &values, changes)?,
            };
            trace!(index, op = %op, count = result.count, "applied");
            results.push(result);
        }
        Ok(results)
    }

    fn insert(
        &mut self,
        index: usize,
        op: &Operation,
        mut values: RowValues,
        changes: &mut ChangeSet,
    ) -> Result<OpResult, StoreError> {
        values.remove(columns::ID);
        match op.table {
            Table::RawContacts => {
                let id = next_id(&mut self.counters.raw_contact);
                for column in [columns::CONTACT_ID, columns::VERSION, columns::DELETED] {
                    values.remove(column);
                }
                values.insert(columns::ID.to_string(), id.into());
                values.insert(columns::VERSION.to_string(), Value::Integer(1));
                values.insert(columns::DELETED.to_string(), Value::Integer(0));
                values.insert(columns::DIRTY.to_string(), Value::Integer(1));
                values.insert(internal::IS_PROFILE.to_string(), op.profile.into());
                values
                    .entry(columns::AGGREGATION_MODE.to_string())
                    .or_insert(Value::Integer(AggregationMode::Default.code()));
                self.raw_contacts.insert(id, values);
                changes.raw_contacts.insert(id);
                self.stale = true;
                Ok(OpResult::inserted(id))
            }
            Table::Data => {
                let owner = get_i64(&values, columns::RAW_CONTACT_ID)
                    .ok_or_else(|| invalid(index, "data insert without raw contact"))?;
                let owner_profile = self
                    .raw_live(owner)
                    .map(|row| get_bool(row, internal::IS_PROFILE))
                    .ok_or_else(|| invalid(index, format!("no raw contact {owner}")))?;
                if owner_profile != op.profile {
                    return Err(invalid(index, format!("raw contact {owner} is in another partition")));
                }
                if get_text(&values, columns::MIMETYPE).is_none() {
                    return Err(invalid(index, "data insert without mimetype"));
                }
                let id = next_id(&mut self.counters.data);
                values.insert(columns::ID.to_string(), id.into());
                values.insert(columns::DATA_VERSION.to_string(), Value::Integer(0));
                let super_primary = get_bool(&values, columns::IS_SUPER_PRIMARY);
                let primary = get_bool(&values, columns::IS_PRIMARY);
                self.data.insert(id, values);
                changes.data.insert(id);
                if super_primary {
                    self.set_super_primary(id, changes);
                } else if primary {
                    self.set_primary(id, changes);
                }
                self.bump_raw(owner, changes);
                Ok(OpResult::inserted(id))
            }
            Table::Groups => {
                let id = next_id(&mut self.counters.group);
                values.insert(columns::ID.to_string(), id.into());
                self.groups.insert(id, values);
                changes.groups.insert(id);
                Ok(OpResult::inserted(id))
            }
            Table::Contacts | Table::AggregationExceptions => {
                Err(invalid(index, format!("cannot insert into {}", op.table)))
            }
        }
    }

    fn update(
        &mut self,
        index: usize,
        op: &Operation,
        selection: &Selection,
        mut values: RowValues,
        changes: &mut ChangeSet,
    ) -> Result<OpResult, StoreError> {
        if op.table == Table::AggregationExceptions {
            return self.update_exception(index, &values, changes);
        }
        values.remove(columns::ID);
        let selected = self.select(op.table, selection, op.profile, changes);
        match op.table {
            Table::RawContacts => {
                for column in [
                    columns::CONTACT_ID,
                    columns::VERSION,
                    internal::IS_PROFILE,
                    internal::DIRECTORY_ID,
                ] {
                    values.remove(column);
                }
                let mode_only = values.keys().all(|column| column == columns::AGGREGATION_MODE);
                for (id, _) in &selected {
                    if let Some(row) = self.raw_contacts.get_mut(id) {
                        row.extend(values.clone());
                        changes.raw_contacts.insert(*id);
                    }
                    if mode_only {
                        self.stale = true;
                    } else {
                        self.bump_raw(*id, changes);
                    }
                }
            }
            Table::Data => {
                values.remove(columns::RAW_CONTACT_ID);
                values.remove(columns::DATA_VERSION);
                let super_primary = values
                    .get(columns::IS_SUPER_PRIMARY)
                    .is_some_and(Value::as_bool);
                let primary = values.get(columns::IS_PRIMARY).is_some_and(Value::as_bool);
                for (id, row) in &selected {
                    if let Some(stored) = self.data.get_mut(id) {
                        let version = get_i64(stored, columns::DATA_VERSION).unwrap_or(0) + 1;
                        stored.extend(values.clone());
                        stored.insert(columns::DATA_VERSION.to_string(), version.into());
                        changes.data.insert(*id);
                    }
                    if super_primary {
                        self.set_super_primary(*id, changes);
                    } else if primary {
                        self.set_primary(*id, changes);
                    }
                    if let Some(owner) = get_i64(row, columns::RAW_CONTACT_ID) {
                        self.bump_raw(owner, changes);
                    }
                }
            }
            Table::Contacts => {
                values.retain(|column, _| {
                    column == columns::STARRED
                        || column == columns::SEND_TO_VOICEMAIL
                        || column == columns::CUSTOM_RINGTONE
                });
                for (id, _) in &selected {
                    let members = self
                        .contacts
                        .get(id)
                        .map(|record| record.raw_contact_ids.clone())
                        .unwrap_or_default();
                    for raw in members {
                        if let Some(row) = self.raw_contacts.get_mut(&raw) {
                            row.extend(values.clone());
                        }
                        self.bump_raw(raw, changes);
                    }
                }
            }
            Table::Groups => {
                for (id, _) in &selected {
                    if let Some(row) = self.groups.get_mut(id) {
                        row.extend(values.clone());
                        changes.groups.insert(*id);
                    }
                }
            }
            Table::AggregationExceptions => {}
        }
        Ok(OpResult::affected(selected.len()))
    }

    fn update_exception(
        &mut self,
        index: usize,
        values: &RowValues,
        changes: &mut ChangeSet,
    ) -> Result<OpResult, StoreError> {
        let code = get_i64(values, columns::EXCEPTION_TYPE)
            .ok_or_else(|| invalid(index, "aggregation exception without type"))?;
        let kind = AggregationType::from_code(code)
            .ok_or_else(|| invalid(index, format!("unknown aggregation type {code}")))?;
        let raw1 = get_i64(values, columns::RAW_CONTACT_ID1)
            .ok_or_else(|| invalid(index, "aggregation exception without raw_contact_id1"))?;
        let raw2 = get_i64(values, columns::RAW_CONTACT_ID2)
            .ok_or_else(|| invalid(index, "aggregation exception without raw_contact_id2"))?;
        if raw1 == raw2 {
            return Err(invalid(index, "aggregation exception on a single raw contact"));
        }
        for raw in [raw1, raw2] {
            if !self.raw_contacts.contains_key(&raw) {
                return Err(invalid(index, format!("no raw contact {raw}")));
            }
        }
        let key = (raw1.min(raw2), raw1.max(raw2));
        if kind == AggregationType::Automatic {
            self.exceptions.remove(&key);
        } else {
            self.exceptions.insert(key, code);
        }
        changes.exceptions.insert(key);
        self.stale = true;
        Ok(OpResult::affected(1))
    }

    fn delete(
        &mut self,
        index: usize,
        op: &Operation,
        selection: &Selection,
        changes: &mut ChangeSet,
    ) -> Result<OpResult, StoreError> {
        let selected = self.select(op.table, selection, op.profile, changes);
        let mut count = 0;
        match op.table {
            Table::RawContacts => {
                for (id, _) in &selected {
                    self.delete_raw_contact(*id, changes);
                    count += 1;
                }
            }
            Table::Data => {
                for (id, row) in &selected {
                    self.data.remove(id);
                    self.statuses.remove(id);
                    changes.data.insert(*id);
                    changes.statuses.insert(*id);
                    if let Some(owner) = get_i64(row, columns::RAW_CONTACT_ID) {
                        self.bump_raw(owner, changes);
                    }
                    count += 1;
                }
            }
            Table::Contacts => {
                for (id, _) in &selected {
                    let members = self
                        .contacts
                        .get(id)
                        .map(|record| record.raw_contact_ids.clone())
                        .unwrap_or_default();
                    for raw in members {
                        self.delete_raw_contact(raw, changes);
                    }
                    count += 1;
                }
            }
            Table::Groups => {
                for (id, _) in &selected {
                    self.groups.remove(id);
                    changes.groups.insert(*id);
                    let memberships: Vec<(i64, Option<i64>)> = self
                        .data
                        .iter()
                        .filter(|(_, row)| {
                            get_text(row, columns::MIMETYPE).as_deref()
                                == Some(mimetype::GROUP_MEMBERSHIP)
                                && get_i64(row, columns::GROUP_ROW_ID) == Some(*id)
                        })
                        .map(|(data_id, row)| (*data_id, get_i64(row, columns::RAW_CONTACT_ID)))
                        .collect();
                    for (data_id, owner) in memberships {
                        self.data.remove(&data_id);
                        changes.data.insert(data_id);
                        if let Some(owner) = owner {
                            self.bump_raw(owner, changes);
                        }
                    }
                    count += 1;
                }
            }
            Table::AggregationExceptions => {
                return Err(invalid(index, "aggregation exceptions are written, not deleted"));
            }
        }
        Ok(OpResult::affected(count))
    }

    fn assert(
        &mut self,
        index: usize,
        op: &Operation,
        selection: &Selection,
        values: &RowValues,
        changes: &mut ChangeSet,
    ) -> Result<OpResult, StoreError> {
        let selected = self.select(op.table, selection, op.profile, changes);
        if let Some(expected) = op.expected_count {
            if selected.len() != expected {
                return Err(StoreError::AssertionFailed {
                    index,
                    reason: format!("expected {expected} rows, found {}", selected.len()),
                });
            }
        }
        for (id, row) in &selected {
            for (column, expected) in values {
                if !value_matches(row, column, expected) {
                    return Err(StoreError::AssertionFailed {
                        index,
                        reason: format!(
                            "{} {id}: {column} is {:?}, expected {expected:?}",
                            op.table,
                            row.get(column).unwrap_or(&Value::Null)
                        ),
                    });
                }
            }
        }
        Ok(OpResult::affected(selected.len()))
    }

    /// Local raw contacts are removed outright; synced ones are flagged so the
    /// sync owner can propagate the deletion.
    fn delete_raw_contact(&mut self, id: i64, changes: &mut ChangeSet) {
        let Some(row) = self.raw_contacts.get(&id) else {
            return;
        };
        if codec::account_from_row(row).is_local() {
            self.raw_contacts.remove(&id);
            changes.raw_contacts.insert(id);
            for data_id in self.data_ids_of(id) {
                self.data.remove(&data_id);
                self.statuses.remove(&data_id);
                changes.data.insert(data_id);
                changes.statuses.insert(data_id);
            }
            let pairs: Vec<(i64, i64)> = self
                .exceptions
                .keys()
                .filter(|(a, b)| *a == id || *b == id)
                .copied()
                .collect();
            for pair in pairs {
                self.exceptions.remove(&pair);
                changes.exceptions.insert(pair);
            }
            let items: Vec<i64> = self
                .stream_items
                .iter()
                .filter(|(_, item)| item.raw_contact_id == id)
                .map(|(item_id, _)| *item_id)
                .collect();
            for item in items {
                self.stream_items.remove(&item);
                changes.stream_items.insert(item);
                self.stream_photos.retain(|photo_id, photo| {
                    let keep = photo.stream_item_id.0 != item;
                    if !keep {
                        changes.stream_photos.insert(*photo_id);
                    }
                    keep
                });
            }
            self.stale = true;
        } else {
            if let Some(row) = self.raw_contacts.get_mut(&id) {
                row.insert(columns::DELETED.to_string(), Value::Integer(1));
            }
            self.bump_raw(id, changes);
        }
    }

    /// Makes `data_id` primary within its raw contact and clears the flag on
    /// siblings of the same mimetype.
    fn set_primary(&mut self, data_id: i64, changes: &mut ChangeSet) {
        let Some(row) = self.data.get(&data_id) else {
            return;
        };
        let owner = get_i64(row, columns::RAW_CONTACT_ID);
        let mime = get_text(row, columns::MIMETYPE);
        for (id, sibling) in self.data.iter_mut() {
            if get_i64(sibling, columns::RAW_CONTACT_ID) != owner
                || get_text(sibling, columns::MIMETYPE) != mime
            {
                continue;
            }
            sibling.insert(columns::IS_PRIMARY.to_string(), (*id == data_id).into());
            changes.data.insert(*id);
        }
    }

    /// Super-primary implies primary, and is unique per mimetype across every
    /// raw contact of the owning contact.
    fn set_super_primary(&mut self, data_id: i64, changes: &mut ChangeSet) {
        self.set_primary(data_id, changes);
        let Some(row) = self.data.get(&data_id) else {
            return;
        };
        let mime = get_text(row, columns::MIMETYPE);
        let owner = get_i64(row, columns::RAW_CONTACT_ID);
        let contact = owner
            .and_then(|owner| self.raw_contacts.get(&owner))
            .and_then(|raw| get_i64(raw, columns::CONTACT_ID));
        let members: BTreeSet<i64> = self
            .raw_contacts
            .iter()
            .filter(|(id, raw)| {
                Some(**id) == owner
                    || (contact.is_some() && get_i64(raw, columns::CONTACT_ID) == contact)
            })
            .map(|(id, _)| *id)
            .collect();
        for (id, sibling) in self.data.iter_mut() {
            let in_contact = get_i64(sibling, columns::RAW_CONTACT_ID)
                .is_some_and(|raw| members.contains(&raw));
            if !in_contact || get_text(sibling, columns::MIMETYPE) != mime {
                continue;
            }
            sibling.insert(columns::IS_SUPER_PRIMARY.to_string(), (*id == data_id).into());
            changes.data.insert(*id);
        }
    }

    /// Recomputes contact clusters: keep-together edges force a merge, then
    /// raw contacts sharing a structured display name merge unless a
    /// keep-separate edge or their aggregation mode forbids it. Contact ids
    /// stay with the cluster holding their lowest surviving member.
    fn reaggregate(&mut self, changes: &mut ChangeSet) {
        let mut dsu = ClusterDsu::new();
        let mut partitions: BTreeMap<i64, (bool, i64)> = BTreeMap::new();
        for (id, row) in &self.raw_contacts {
            if get_bool(row, columns::DELETED) {
                continue;
            }
            dsu.add(RawContactId(*id));
            partitions.insert(*id, Self::raw_partition(row));
        }

        for (&(a, b), &code) in &self.exceptions {
            let (Some(pa), Some(pb)) = (partitions.get(&a), partitions.get(&b)) else {
                continue;
            };
            if pa != pb || pa.0 {
                continue;
            }
            match AggregationType::from_code(code) {
                Some(AggregationType::KeepSeparate) => {
                    dsu.keep_separate(RawContactId(a), RawContactId(b))
                }
                Some(AggregationType::KeepTogether) => {
                    dsu.force_union(RawContactId(a), RawContactId(b));
                }
                _ => {}
            }
        }

        let mut by_raw: BTreeMap<i64, Vec<(i64, DataKind, bool)>> = BTreeMap::new();
        for (id, row) in &self.data {
            let Some(owner) = get_i64(row, columns::RAW_CONTACT_ID) else {
                continue;
            };
            if !partitions.contains_key(&owner) {
                continue;
            }
            if let Ok(kind) = codec::decode_kind(row) {
                by_raw
                    .entry(owner)
                    .or_default()
                    .push((*id, kind, get_bool(row, columns::IS_SUPER_PRIMARY)));
            }
        }

        let mut profile_root: BTreeMap<i64, i64> = BTreeMap::new();
        let mut name_groups: BTreeMap<((bool, i64), String), Vec<i64>> = BTreeMap::new();
        for (&id, &partition) in &partitions {
            if partition.0 {
                let root = *profile_root.entry(partition.1).or_insert(id);
                dsu.force_union(RawContactId(root), RawContactId(id));
                continue;
            }
            let mode = self
                .raw_contacts
                .get(&id)
                .and_then(|row| get_i64(row, columns::AGGREGATION_MODE))
                .map(AggregationMode::from_code)
                .unwrap_or_default();
            if mode != AggregationMode::Default {
                continue;
            }
            let name = by_raw.get(&id).and_then(|items| {
                items.iter().find_map(|(_, kind, _)| {
                    kind.as_structured_name()
                        .and_then(|name| name.display_name.as_deref())
                        .map(|name| name.trim().to_lowercase())
                        .filter(|name| !name.is_empty())
                })
            });
            if let Some(name) = name {
                name_groups.entry((partition, name)).or_default().push(id);
            }
        }
        for members in name_groups.values() {
            for (position, &id) in members.iter().enumerate().skip(1) {
                for &earlier in &members[..position] {
                    match dsu.try_union(RawContactId(earlier), RawContactId(id)) {
                        MergeResult::Blocked { .. } => continue,
                        MergeResult::Success | MergeResult::Unchanged => break,
                    }
                }
            }
        }

        let mut claimed: BTreeSet<i64> = BTreeSet::new();
        let mut contacts = BTreeMap::new();
        for cluster in dsu.clusters() {
            let raw_ids: Vec<i64> = cluster.iter().map(|raw| raw.0).collect();
            let (profile, directory_id) = partitions
                .get(&raw_ids[0])
                .copied()
                .unwrap_or((false, DirectoryId::DEFAULT.0));
            let previous = raw_ids.iter().find_map(|raw| {
                self.raw_contacts
                    .get(raw)
                    .and_then(|row| get_i64(row, columns::CONTACT_ID))
                    .filter(|id| !claimed.contains(id))
                    .filter(|id| (*id >= PROFILE_CONTACT_ID_BASE) == profile)
            });
            let contact_id = match previous {
                Some(id) => id,
                None if profile => PROFILE_CONTACT_ID_BASE + next_id(&mut self.counters.contact),
                None => next_id(&mut self.counters.contact),
            };
            claimed.insert(contact_id);
            for raw in &raw_ids {
                if let Some(row) = self.raw_contacts.get_mut(raw) {
                    if get_i64(row, columns::CONTACT_ID) != Some(contact_id) {
                        row.insert(columns::CONTACT_ID.to_string(), contact_id.into());
                        changes.raw_contacts.insert(*raw);
                    }
                }
            }
            let record = self.summarize(contact_id, raw_ids, profile, directory_id, &by_raw);
            contacts.insert(contact_id, record);
        }
        debug!(contacts = contacts.len(), "reaggregated");
        self.contacts = contacts;
        self.stale = false;
    }

    fn summarize(
        &self,
        id: i64,
        raw_ids: Vec<i64>,
        profile: bool,
        directory_id: i64,
        by_raw: &BTreeMap<i64, Vec<(i64, DataKind, bool)>>,
    ) -> ContactRecord {
        struct NameCandidate {
            raw: i64,
            source: DisplayNameSource,
            super_primary: bool,
            display: String,
            alt: Option<String>,
            phonetic: Option<String>,
        }
        let mut best: Option<NameCandidate> = None;
        let mut photo: Option<(i64, Option<i64>, bool)> = None;
        for raw in &raw_ids {
            for (data_id, kind, super_primary) in by_raw.get(raw).into_iter().flatten() {
                let candidate = match kind {
                    DataKind::StructuredName(name) => {
                        let display = name.display_name.clone().filter(|s| !s.trim().is_empty()).or_else(|| {
                            let composed = [name.given_name.as_deref(), name.family_name.as_deref()]
                                .into_iter()
                                .flatten()
                                .collect::<Vec<_>>()
                                .join(" ");
                            Some(composed).filter(|s| !s.trim().is_empty())
                        });
                        display.map(|display| NameCandidate {
                            raw: *raw,
                            source: DisplayNameSource::StructuredName,
                            super_primary: *super_primary,
                            alt: name.alternative_name(),
                            phonetic: name.phonetic_name(),
                            display,
                        })
                    }
                    DataKind::Nickname(_)
                    | DataKind::Organization(_)
                    | DataKind::Email(_)
                    | DataKind::Phone(_) => {
                        let source = match kind {
                            DataKind::Nickname(_) => DisplayNameSource::Nickname,
                            DataKind::Organization(_) => DisplayNameSource::Organization,
                            DataKind::Email(_) => DisplayNameSource::Email,
                            _ => DisplayNameSource::Phone,
                        };
                        kind.primary_text()
                            .filter(|s| !s.trim().is_empty())
                            .map(|text| NameCandidate {
                                raw: *raw,
                                source,
                                super_primary: false,
                                display: text.to_string(),
                                alt: None,
                                phonetic: None,
                            })
                    }
                    DataKind::Photo(p) => {
                        let replace = match photo {
                            None => true,
                            Some((_, _, current_super)) => *super_primary && !current_super,
                        };
                        if replace {
                            photo = Some((*data_id, p.file_id, *super_primary));
                        }
                        None
                    }
                    _ => None,
                };
                let Some(candidate) = candidate else {
                    continue;
                };
                let better = match &best {
                    None => true,
                    Some(current) => {
                        (candidate.super_primary && !current.super_primary)
                            || (candidate.super_primary == current.super_primary
                                && candidate.source > current.source)
                    }
                };
                if better {
                    best = Some(candidate);
                }
            }
        }

        let rows: Vec<&RowValues> = raw_ids
            .iter()
            .filter_map(|raw| self.raw_contacts.get(raw))
            .collect();
        ContactRecord {
            id,
            lookup_key: lookup_key_for(&raw_ids),
            directory_id,
            profile,
            name_raw_contact_id: best.as_ref().map(|name| name.raw),
            display_name_source: best
                .as_ref()
                .map_or(DisplayNameSource::Undefined, |name| name.source),
            alt_display_name: best
                .as_ref()
                .map(|name| name.alt.clone().unwrap_or_else(|| name.display.clone())),
            phonetic_name: best.as_ref().and_then(|name| name.phonetic.clone()),
            display_name: best.map(|name| name.display),
            photo_id: photo.map(|(data_id, _, _)| data_id),
            photo_uri: photo.and_then(|(_, file_id, _)| file_id).map(photo_uri),
            starred: rows.iter().any(|row| get_bool(row, columns::STARRED)),
            send_to_voicemail: !rows.is_empty()
                && rows.iter().all(|row| get_bool(row, columns::SEND_TO_VOICEMAIL)),
            custom_ringtone: rows
                .iter()
                .find_map(|row| get_text(row, columns::CUSTOM_RINGTONE)),
            raw_contact_ids: raw_ids,
        }
    }

    fn find_by_lookup_key(&self, key: &str, directory_id: i64) -> Option<&ContactRecord> {
        self.contacts
            .values()
            .find(|record| record.lookup_key == key && record.directory_id == directory_id)
            .or_else(|| {
                lookup_key_segments(key).find_map(|raw| {
                    let row = self.raw_live(raw)?;
                    if Self::raw_partition(row).1 != directory_id {
                        return None;
                    }
                    self.contacts.get(&get_i64(row, columns::CONTACT_ID)?)
                })
            })
    }

    fn group_row(id: i64, row: &RowValues) -> GroupRow {
        GroupRow {
            id: GroupId(id),
            account: codec::account_from_row(row),
            title: get_text(row, columns::TITLE),
            notes: get_text(row, columns::NOTES),
            visible: get_bool(row, columns::GROUP_VISIBLE),
            should_sync: get_bool(row, columns::SHOULD_SYNC),
            auto_add: get_bool(row, columns::AUTO_ADD),
            favorites: get_bool(row, columns::FAVORITES),
        }
    }
}

/// In-memory [`ContactStore`].
pub struct MemoryStore {
    state: RwLock<StoreState>,
    hook: Option<Box<dyn CommitHook>>,
    observers: Mutex<Vec<(ObserverId, Sender<StoreChange>)>>,
    next_observer: AtomicU64,
    sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_state(StoreState::default(), None)
    }

    /// Rebuilds derived contact data from restored tables.
    pub fn from_state(mut state: StoreState, hook: Option<Box<dyn CommitHook>>) -> Self {
        state.reaggregate(&mut ChangeSet::default());
        Self {
            state: RwLock::new(state),
            hook,
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
        }
    }

    /// Runs `f` on a private copy of the tables and installs the copy only if
    /// `f` and the commit hook both succeed.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StoreState, &mut ChangeSet) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let result = {
            let mut guard = self.state.write();
            let mut working = guard.clone();
            let mut changes = ChangeSet::default();
            let result = f(&mut working, &mut changes)?;
            working.refresh(&mut changes);
            if let Some(hook) = &self.hook {
                hook.before_commit(&working, &changes)?;
            }
            *guard = working;
            result
        };
        self.notify();
        Ok(result)
    }

    fn notify(&self) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut observers = self.observers.lock();
        observers.retain(|(id, sender)| match sender.try_send(StoreChange { sequence }) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => {
                debug!(observer = id.0, "dropping disconnected observer");
                false
            }
        });
    }

    /// Copy of every table, for snapshots and persistence.
    pub fn snapshot(&self) -> StoreState {
        self.state.read().clone()
    }

    /// Inserts a raw contact with the given data rows in one batch.
    pub fn insert_raw_contact(
        &self,
        account: &Account,
        kinds: &[DataKind],
    ) -> Result<RawContactId, StoreError> {
        self.insert_raw_contact_in(account, kinds, false, DirectoryId::DEFAULT)
    }

    pub fn insert_profile_raw_contact(
        &self,
        account: &Account,
        kinds: &[DataKind],
    ) -> Result<RawContactId, StoreError> {
        self.insert_raw_contact_in(account, kinds, true, DirectoryId::DEFAULT)
    }

    /// Inserts a raw contact served by a remote directory.
    pub fn insert_directory_raw_contact(
        &self,
        directory: DirectoryId,
        account: &Account,
        kinds: &[DataKind],
    ) -> Result<RawContactId, StoreError> {
        self.insert_raw_contact_in(account, kinds, false, directory)
    }

    fn insert_raw_contact_in(
        &self,
        account: &Account,
        kinds: &[DataKind],
        profile: bool,
        directory: DirectoryId,
    ) -> Result<RawContactId, StoreError> {
        let mut raw = Operation::insert(Table::RawContacts).for_profile(profile);
        codec::account_to_row(account, &mut raw.values);
        if directory != DirectoryId::DEFAULT {
            raw = raw.with_value(internal::DIRECTORY_ID, directory.0);
        }
        let mut ops = vec![raw];
        for kind in kinds {
            ops.push(
                Operation::insert(Table::Data)
                    .for_profile(profile)
                    .with_values(codec::encode_kind(kind))
                    .with_value_back_ref(columns::RAW_CONTACT_ID, 0),
            );
        }
        let results = self.apply_batch(&ops)?;
        results
            .first()
            .and_then(|result| result.id)
            .map(RawContactId)
            .ok_or_else(|| invalid(0, "raw contact insert returned no id"))
    }

    pub fn put_directory(&self, id: DirectoryId, row: DirectoryRow) -> Result<(), StoreError> {
        self.mutate(|state, changes| {
            state.directories.insert(id.0, row);
            changes.directories.insert(id.0);
            Ok(())
        })
    }

    pub fn set_status(&self, data: DataId, status: DataStatus) -> Result<(), StoreError> {
        self.mutate(|state, changes| {
            state.statuses.insert(data.0, status);
            changes.statuses.insert(data.0);
            Ok(())
        })
    }

    /// Stores photo bytes and returns the uri they are readable under.
    pub fn put_photo_file(&self, bytes: Vec<u8>) -> Result<String, StoreError> {
        self.mutate(|state, changes| {
            let id = next_id(&mut state.counters.photo_file);
            state.photo_files.insert(id, bytes);
            changes.photo_files.insert(id);
            Ok(photo_uri(id))
        })
    }

    /// Attaches a stream item to `raw`; the entry's id is assigned here.
    pub fn add_stream_item(
        &self,
        raw: RawContactId,
        mut entry: StreamItemEntry,
    ) -> Result<StreamItemId, StoreError> {
        self.mutate(|state, changes| {
            if state.raw_live(raw.0).is_none() {
                return Err(invalid(0, format!("no raw contact {raw}")));
            }
            let id = next_id(&mut state.counters.stream_item);
            entry.id = StreamItemId(id);
            entry.photos.clear();
            state.stream_items.insert(
                id,
                StreamItemRecord {
                    raw_contact_id: raw.0,
                    entry,
                },
            );
            changes.stream_items.insert(id);
            Ok(StreamItemId(id))
        })
    }

    pub fn add_stream_photo(
        &self,
        item: StreamItemId,
        sort_index: Option<i64>,
        bytes: Option<Vec<u8>>,
    ) -> Result<i64, StoreError> {
        self.mutate(|state, changes| {
            if !state.stream_items.contains_key(&item.0) {
                return Err(invalid(0, format!("no stream item {}", item.0)));
            }
            let file_id = bytes.map(|bytes| {
                let file_id = next_id(&mut state.counters.photo_file);
                state.photo_files.insert(file_id, bytes);
                changes.photo_files.insert(file_id);
                file_id
            });
            let id = next_id(&mut state.counters.stream_photo);
            state.stream_photos.insert(
                id,
                StreamItemPhoto {
                    id,
                    stream_item_id: item,
                    sort_index,
                    photo_file_id: file_id,
                    photo_uri: file_id.map(photo_uri),
                },
            );
            changes.stream_photos.insert(id);
            Ok(id)
        })
    }

    /// Current aggregation exceptions as normalized pairs.
    pub fn aggregation_exceptions(&self) -> Vec<(RawContactId, RawContactId, AggregationType)> {
        self.state
            .read()
            .exceptions
            .iter()
            .filter_map(|(&(a, b), &code)| {
                AggregationType::from_code(code).map(|kind| (RawContactId(a), RawContactId(b), kind))
            })
            .collect()
    }

    pub fn aggregation_exception(
        &self,
        a: RawContactId,
        b: RawContactId,
    ) -> Option<AggregationType> {
        let key = (a.0.min(b.0), a.0.max(b.0));
        self.state
            .read()
            .exceptions
            .get(&key)
            .and_then(|code| AggregationType::from_code(*code))
    }

    pub fn contact_id_of(&self, raw: RawContactId) -> Option<ContactId> {
        let state = self.state.read();
        state
            .raw_live(raw.0)
            .and_then(|row| get_i64(row, columns::CONTACT_ID))
            .filter(|id| state.contacts.contains_key(id))
            .map(ContactId)
    }

    pub fn raw_contact_row(&self, raw: RawContactId) -> Option<RowValues> {
        self.state.read().raw_contacts.get(&raw.0).cloned()
    }

    pub fn raw_contact_version(&self, raw: RawContactId) -> Option<i64> {
        self.state
            .read()
            .raw_live(raw.0)
            .and_then(|row| get_i64(row, columns::VERSION))
    }

    pub fn data_rows(&self, raw: RawContactId) -> Vec<RowValues> {
        let state = self.state.read();
        state
            .data_ids_of(raw.0)
            .into_iter()
            .filter_map(|id| state.data.get(&id).cloned())
            .collect()
    }

    pub fn contact_count(&self) -> usize {
        self.state.read().contacts.len()
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        self.state.read().groups.keys().map(|id| GroupId(*id)).collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactStore for MemoryStore {
    fn resolve(&self, reference: &ContactRef) -> Result<Option<ContactTarget>, StoreError> {
        let state = self.state.read();
        let record = match reference {
            ContactRef::Contact(id) => state.contacts.get(&id.0),
            ContactRef::Lookup {
                lookup_key,
                contact_id,
            } => contact_id
                .and_then(|id| state.contacts.get(&id.0))
                .filter(|record| record.lookup_key == *lookup_key)
                .or_else(|| state.find_by_lookup_key(lookup_key, DirectoryId::DEFAULT.0)),
            ContactRef::RawContact(raw) => state
                .raw_live(raw.0)
                .and_then(|row| get_i64(row, columns::CONTACT_ID))
                .and_then(|id| state.contacts.get(&id)),
            ContactRef::Directory {
                directory_id,
                lookup_key,
            } => state.find_by_lookup_key(lookup_key, directory_id.0),
            ContactRef::Profile => state.contacts.values().find(|record| record.profile),
            ContactRef::Encoded { .. } => None,
        };
        Ok(record.map(ContactRecord::target))
    }

    fn query_entities(&self, target: &ContactTarget) -> Result<Option<EntityRows>, StoreError> {
        let state = self.state.read();
        let Some(record) = state.contacts.get(&target.contact_id.0) else {
            return Ok(None);
        };
        let mut rows = Vec::new();
        let mut presence: Option<i64> = None;
        for raw in &record.raw_contact_ids {
            let Some(raw_row) = state.raw_contacts.get(raw) else {
                continue;
            };
            let data_ids = state.data_ids_of(*raw);
            if data_ids.is_empty() {
                rows.push(EntityRow {
                    raw_contact_id: RawContactId(*raw),
                    raw_contact: raw_row.clone(),
                    data: None,
                    status: None,
                });
                continue;
            }
            for data_id in data_ids {
                let status = state.statuses.get(&data_id).cloned();
                if let Some(level) = status.as_ref().and_then(|status| status.presence) {
                    presence = Some(presence.map_or(level, |current| current.max(level)));
                }
                rows.push(EntityRow {
                    raw_contact_id: RawContactId(*raw),
                    raw_contact: raw_row.clone(),
                    data: state.data.get(&data_id).cloned(),
                    status,
                });
            }
        }
        let header = ContactHeader {
            contact_id: ContactId(record.id),
            lookup_key: record.lookup_key.clone(),
            directory_id: DirectoryId(record.directory_id),
            name_raw_contact_id: record.name_raw_contact_id.map(RawContactId),
            display_name_source: record.display_name_source,
            display_name: record.display_name.clone(),
            alt_display_name: record.alt_display_name.clone(),
            phonetic_name: record.phonetic_name.clone(),
            photo_id: record.photo_id.map(DataId),
            photo_uri: record.photo_uri.clone(),
            starred: record.starred,
            presence,
            send_to_voicemail: record.send_to_voicemail,
            custom_ringtone: record.custom_ringtone.clone(),
            is_user_profile: record.profile,
        };
        Ok(Some(EntityRows { header, rows }))
    }

    fn query_directory(&self, id: DirectoryId) -> Result<Option<DirectoryRow>, StoreError> {
        Ok(self.state.read().directories.get(&id.0).cloned())
    }

    fn query_groups(&self, accounts: &[Account]) -> Result<Option<Vec<GroupRow>>, StoreError> {
        let state = self.state.read();
        let groups = state
            .groups
            .iter()
            .map(|(id, row)| StoreState::group_row(*id, row))
            .filter(|group| group_matches_accounts(&group.account, accounts))
            .collect();
        Ok(Some(groups))
    }

    fn query_group(&self, id: GroupId) -> Result<Option<GroupRow>, StoreError> {
        Ok(self
            .state
            .read()
            .groups
            .get(&id.0)
            .map(|row| StoreState::group_row(id.0, row)))
    }

    fn query_group_members(&self, id: GroupId) -> Result<Vec<RawContactId>, StoreError> {
        let state = self.state.read();
        let members: BTreeSet<i64> = state
            .data
            .values()
            .filter(|row| {
                get_text(row, columns::MIMETYPE).as_deref() == Some(mimetype::GROUP_MEMBERSHIP)
                    && get_i64(row, columns::GROUP_ROW_ID) == Some(id.0)
            })
            .filter_map(|row| get_i64(row, columns::RAW_CONTACT_ID))
            .filter(|raw| state.raw_live(*raw).is_some())
            .collect();
        Ok(members.into_iter().map(RawContactId).collect())
    }

    fn query_stream_items(
        &self,
        lookup_key: &str,
    ) -> Result<Option<Vec<StreamItemEntry>>, StoreError> {
        let state = self.state.read();
        let Some(record) = state.find_by_lookup_key(lookup_key, DirectoryId::DEFAULT.0) else {
            return Ok(Some(Vec::new()));
        };
        let items = state
            .stream_items
            .values()
            .filter(|item| record.raw_contact_ids.contains(&item.raw_contact_id))
            .map(|item| item.entry.clone())
            .collect();
        Ok(Some(items))
    }

    fn query_stream_photos(
        &self,
        items: &[StreamItemId],
    ) -> Result<Option<Vec<StreamItemPhoto>>, StoreError> {
        let state = self.state.read();
        let mut photos: Vec<StreamItemPhoto> = state
            .stream_photos
            .values()
            .filter(|photo| items.contains(&photo.stream_item_id))
            .cloned()
            .collect();
        photos.sort_by_key(|photo| (photo.stream_item_id, photo.sort_index, photo.id));
        Ok(Some(photos))
    }

    fn query_raw_contacts(
        &self,
        ids: &[RawContactId],
        profile: bool,
    ) -> Result<Vec<RawContactEntity>, StoreError> {
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let row = state.raw_live(id.0)?;
                if get_bool(row, internal::IS_PROFILE) != profile {
                    return None;
                }
                let data = state
                    .data_ids_of(id.0)
                    .into_iter()
                    .filter_map(|data_id| state.data.get(&data_id).cloned())
                    .collect();
                Some(RawContactEntity {
                    values: row.clone(),
                    data,
                })
            })
            .collect())
    }

    fn raw_contact_ids_for_contacts(
        &self,
        ids: &[ContactId],
    ) -> Result<Option<Vec<(ContactId, RawContactId)>>, StoreError> {
        let state = self.state.read();
        let pairs = ids
            .iter()
            .filter_map(|id| state.contacts.get(&id.0))
            .flat_map(|record| {
                record
                    .raw_contact_ids
                    .iter()
                    .map(move |raw| (ContactId(record.id), RawContactId(*raw)))
            })
            .collect();
        Ok(Some(pairs))
    }

    fn query_contact_names(&self, ids: &[ContactId]) -> Result<Vec<ContactNameRow>, StoreError> {
        let state = self.state.read();
        let unique: BTreeSet<i64> = ids.iter().map(|id| id.0).collect();
        Ok(unique
            .into_iter()
            .filter_map(|id| state.contacts.get(&id))
            .map(|record| ContactNameRow {
                contact_id: ContactId(record.id),
                display_name: record.display_name.clone(),
                alt_display_name: record.alt_display_name.clone(),
            })
            .collect())
    }

    #[instrument(skip(self, ops), fields(ops = ops.len()), level = "debug")]
    fn apply_batch(&self, ops: &[Operation]) -> Result<Vec<OpResult>, StoreError> {
        let results = self.mutate(|state, changes| state.apply_ops(ops, changes))?;
        debug!(results = results.len(), "batch committed");
        Ok(results)
    }

    fn open_photo(&self, uri: &str) -> io::Result<Box<dyn Read + Send>> {
        let file_id: i64 = uri
            .strip_prefix(PHOTO_URI_PREFIX)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported uri {uri}")))?;
        let bytes = self
            .state
            .read()
            .photo_files
            .get(&file_id)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no photo at {uri}")))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn write_display_photo(&self, raw: RawContactId, bytes: &[u8]) -> Result<(), StoreError> {
        self.mutate(|state, changes| {
            let profile = state
                .raw_live(raw.0)
                .map(|row| get_bool(row, internal::IS_PROFILE))
                .ok_or_else(|| invalid(0, format!("no raw contact {raw}")))?;
            let file_id = next_id(&mut state.counters.photo_file);
            state.photo_files.insert(file_id, bytes.to_vec());
            changes.photo_files.insert(file_id);
            let thumbnail: Vec<u8> = bytes.iter().take(THUMBNAIL_BYTES).copied().collect();
            let existing = state.data_ids_of(raw.0).into_iter().find(|id| {
                state
                    .data
                    .get(id)
                    .and_then(|row| get_text(row, columns::MIMETYPE))
                    .as_deref()
                    == Some(mimetype::PHOTO)
            });
            let mut values = RowValues::new();
            values.insert(columns::DATA[13].to_string(), file_id.into());
            values.insert(columns::DATA[14].to_string(), thumbnail.into());
            let op = match existing {
                Some(id) => Operation::update(Table::Data).with_id(id).with_values(values),
                None => Operation::insert(Table::Data)
                    .with_values(values)
                    .with_value(columns::MIMETYPE, mimetype::PHOTO)
                    .with_value(columns::RAW_CONTACT_ID, raw.0)
                    .with_value(columns::IS_PRIMARY, true),
            };
            state.apply_ops(&[op.for_profile(profile)], changes)?;
            Ok(())
        })
    }

    fn register_observer(&self, observer: Sender<StoreChange>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::SeqCst));
        self.observers.lock().push((id, observer));
        id
    }

    fn unregister_observer(&self, id: ObserverId) {
        self.observers.lock().retain(|(existing, _)| *existing != id);
    }
}
