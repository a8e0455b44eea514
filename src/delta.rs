//! # Delta Builder
//!
//! Pending edits to a set of raw contacts, kept as before/after snapshots of
//! every row, and the diff that turns them into an ordered operation batch.
//!
//! A [`RawContactDeltaList`] diff is laid out as:
//! 1. a version assert for every raw contact that already exists,
//! 2. per raw contact its own row operation and its data row operations,
//!    bracketed by aggregation-mode updates so the store does not re-cluster
//!    half-written state,
//! 3. aggregation exceptions binding inserts to the contact being edited, or
//!    separating every raw contact when the list is marked for splitting.
//!
//! If nothing but asserts is produced the diff is empty.

use crate::codec::{self, columns, RowValues, Value};
use crate::error::{ContactError, ContactResult};
use crate::model::{Account, AggregationMode, AggregationType, RawContactId};
use crate::ops::{Operation, Table};
use crate::store::RawContactEntity;
use std::collections::BTreeMap;

/// Hands out placeholder ids for inserted rows. Negative so they never
/// collide with ids the store assigns.
///
/// Each [`RawContactDeltaList`] owns one, so placeholders are unique within
/// the list being saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderIds {
    next: i64,
}

impl Default for PlaceholderIds {
    fn default() -> Self {
        Self { next: -1 }
    }
}

impl PlaceholderIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> i64 {
        let id = self.next;
        self.next -= 1;
        id
    }
}

/// Before/after snapshot of one row.
///
/// `before` is what the store held when the edit started; `after` holds only
/// the columns the edit touched. `after == None` means the row is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuesDelta {
    before: Option<RowValues>,
    after: Option<RowValues>,
    id_column: &'static str,
}

impl ValuesDelta {
    /// Snapshot of an existing row with no edits yet.
    pub fn from_before(before: RowValues) -> Self {
        Self {
            before: Some(before),
            after: Some(RowValues::new()),
            id_column: columns::ID,
        }
    }

    /// A row to be inserted. It is given a placeholder id from `ids`.
    pub fn from_after(mut after: RowValues, ids: &mut PlaceholderIds) -> Self {
        after.insert(columns::ID.to_string(), Value::Integer(ids.next_id()));
        Self {
            before: None,
            after: Some(after),
            id_column: columns::ID,
        }
    }

    pub fn before(&self) -> Option<&RowValues> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&RowValues> {
        self.after.as_ref()
    }

    pub fn before_exists(&self) -> bool {
        self.before
            .as_ref()
            .is_some_and(|before| before.contains_key(self.id_column))
    }

    pub fn is_visible(&self) -> bool {
        self.after.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.before_exists() && self.after.is_none()
    }

    /// Neither stored nor pending: an insert that was deleted again.
    pub fn is_transient(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }

    pub fn is_insert(&self) -> bool {
        !self.before_exists() && self.after.is_some()
    }

    /// Some touched column differs from what the store holds.
    pub fn is_update(&self) -> bool {
        let (Some(before), Some(after)) = (self.before.as_ref(), self.after.as_ref()) else {
            return false;
        };
        if !self.before_exists() {
            return false;
        }
        after.iter().any(|(column, value)| match before.get(column) {
            None => !value.is_null(),
            Some(old) => old != value,
        })
    }

    pub fn is_noop(&self) -> bool {
        self.before_exists() && self.after.as_ref().is_some_and(RowValues::is_empty)
    }

    /// Pending value if touched, stored value otherwise.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.after
            .as_ref()
            .and_then(|after| after.get(column))
            .or_else(|| self.before.as_ref().and_then(|before| before.get(column)))
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn get_text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(Value::as_str).map(str::to_string)
    }

    pub fn id(&self) -> Option<i64> {
        self.get_i64(self.id_column)
    }

    pub fn mimetype(&self) -> Option<String> {
        self.get_text(columns::MIMETYPE)
    }

    pub fn is_super_primary(&self) -> bool {
        self.get(columns::IS_SUPER_PRIMARY).is_some_and(Value::as_bool)
    }

    /// Sets a pending value, reviving the row if it was deleted.
    pub fn put(&mut self, column: &str, value: impl Into<Value>) {
        self.after
            .get_or_insert_with(RowValues::new)
            .insert(column.to_string(), value.into());
    }

    pub fn mark_deleted(&mut self) {
        self.after = None;
    }

    /// Stored values overlaid with pending ones. A group membership that
    /// names its group by row id drops the source id.
    pub fn complete_values(&self) -> RowValues {
        let mut values = self.before.clone().unwrap_or_default();
        if let Some(after) = &self.after {
            values.extend(after.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if values.contains_key(columns::GROUP_ROW_ID) {
            values.remove(columns::GROUP_SOURCE_ID);
        }
        values
    }

    /// Re-applies the edits in `remote` on top of `local`, a fresher view of
    /// the same row. Stored values (ids, versions) come from `local`; pending
    /// values come from `remote`.
    pub fn merge_after(local: Option<ValuesDelta>, remote: &ValuesDelta) -> Option<ValuesDelta> {
        if local.is_none() && (remote.is_delete() || remote.is_transient()) {
            return None;
        }
        let mut local = local.unwrap_or(ValuesDelta {
            before: None,
            after: None,
            id_column: remote.id_column,
        });
        local.after = if local.before_exists() {
            remote.after.clone()
        } else {
            Some(remote.complete_values())
        };
        Some(local)
    }

    /// The single operation that brings the store in line, if any.
    pub fn build_diff(&self, table: Table) -> Option<Operation> {
        if self.is_insert() {
            let mut values = self.after.clone().unwrap_or_default();
            values.remove(self.id_column);
            Some(Operation::insert(table).with_values(values))
        } else if self.is_delete() {
            Some(Operation::delete(table).with_id(self.id()?))
        } else if self.is_update() {
            let values = self.after.clone().unwrap_or_default();
            Some(Operation::update(table).with_id(self.id()?).with_values(values))
        } else {
            None
        }
    }
}

/// One raw contact and its data rows, grouped by mimetype.
#[derive(Debug, Clone, PartialEq)]
pub struct RawContactDelta {
    values: ValuesDelta,
    entries: BTreeMap<String, Vec<ValuesDelta>>,
    profile: bool,
}

impl RawContactDelta {
    pub fn new(values: ValuesDelta) -> Self {
        Self {
            values,
            entries: BTreeMap::new(),
            profile: false,
        }
    }

    /// A brand-new raw contact in `account`.
    pub fn insert(account: &Account, ids: &mut PlaceholderIds) -> Self {
        let mut values = RowValues::new();
        codec::account_to_row(account, &mut values);
        Self::new(ValuesDelta::from_after(values, ids))
    }

    pub fn from_entity(entity: RawContactEntity, profile: bool) -> Self {
        let mut delta = Self::new(ValuesDelta::from_before(entity.values));
        delta.profile = profile;
        for row in entity.data {
            delta.add_entry(ValuesDelta::from_before(row));
        }
        delta
    }

    pub fn values(&self) -> &ValuesDelta {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValuesDelta {
        &mut self.values
    }

    pub fn raw_contact_id(&self) -> Option<RawContactId> {
        self.values.id().map(RawContactId)
    }

    pub fn account(&self) -> Account {
        codec::account_from_row(&self.values.complete_values())
    }

    pub fn is_profile(&self) -> bool {
        self.profile
    }

    pub fn set_profile(&mut self, profile: bool) {
        self.profile = profile;
    }

    pub fn is_contact_insert(&self) -> bool {
        self.values.is_insert()
    }

    pub fn add_entry(&mut self, entry: ValuesDelta) {
        let mimetype = entry.mimetype().unwrap_or_default();
        self.entries.entry(mimetype).or_default().push(entry);
    }

    pub fn mime_entries(&self, mimetype: &str) -> &[ValuesDelta] {
        self.entries.get(mimetype).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn mime_entries_mut(&mut self, mimetype: &str) -> Option<&mut Vec<ValuesDelta>> {
        self.entries.get_mut(mimetype)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ValuesDelta> {
        self.entries.values().flatten()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut ValuesDelta> {
        self.entries.values_mut().flatten()
    }

    pub fn entry(&self, id: i64) -> Option<&ValuesDelta> {
        self.entries().find(|entry| entry.id() == Some(id))
    }

    pub fn entry_mut(&mut self, id: i64) -> Option<&mut ValuesDelta> {
        self.entries_mut().find(|entry| entry.id() == Some(id))
    }

    /// Visible entries of one mimetype.
    pub fn visible_count(&self, mimetype: &str) -> usize {
        self.mime_entries(mimetype)
            .iter()
            .filter(|entry| entry.is_visible())
            .count()
    }

    pub fn super_primary_entry(&self, mimetype: &str) -> Option<&ValuesDelta> {
        self.mime_entries(mimetype)
            .iter()
            .find(|entry| entry.is_visible() && entry.is_super_primary())
    }

    /// Marks touched data rows whose slots are all blank as deleted. Returns
    /// whether any row still carries content.
    pub fn trim_empty(&mut self) -> bool {
        let mut has_values = false;
        let mut trimmed = false;
        for entry in self.entries_mut() {
            if !(entry.is_insert() || entry.is_update()) {
                has_values |= entry.is_visible();
                continue;
            }
            if codec::is_empty_data(&entry.complete_values()) {
                entry.mark_deleted();
                trimmed = true;
            } else {
                has_values = true;
            }
        }
        if !has_values && (trimmed || self.values.is_insert()) {
            self.values.mark_deleted();
        }
        has_values
    }

    /// Assert that the stored version is still the one this edit was built
    /// against.
    pub fn build_assert(&self) -> Option<Operation> {
        if self.values.is_insert() {
            return None;
        }
        let id = self.values.id()?;
        let version = self.values.get_i64(columns::VERSION)?;
        Some(
            Operation::assert(Table::RawContacts)
                .for_profile(self.profile)
                .with_id(id)
                .with_value(columns::VERSION, version)
                .with_expected_count(1),
        )
    }

    fn aggregation_mode_update(&self, mode: AggregationMode) -> Operation {
        Operation::update(Table::RawContacts)
            .for_profile(self.profile)
            .with_value(columns::AGGREGATION_MODE, mode.code())
    }

    /// Appends this raw contact's operations to `ops`.
    pub fn build_diff(&self, ops: &mut Vec<Operation>) -> ContactResult<()> {
        let first_index = ops.len();
        let is_insert = self.values.is_insert();
        let is_delete = self.values.is_delete();
        let is_update = !is_insert && !is_delete;
        let before_id = self.values.id();

        let mut values = self.values.clone();
        if is_insert {
            values.put(columns::AGGREGATION_MODE, AggregationMode::Suspended.code());
        }
        if let Some(op) = values.build_diff(Table::RawContacts) {
            ops.push(op.for_profile(self.profile));
        }

        if !is_delete {
            for child in self.entries() {
                let Some(op) = child.build_diff(Table::Data) else {
                    continue;
                };
                let op = if child.is_insert() {
                    if is_insert {
                        op.with_value_back_ref(columns::RAW_CONTACT_ID, first_index)
                    } else {
                        let owner = before_id.ok_or_else(|| {
                            ContactError::bad_arguments("data insert under a raw contact without id")
                        })?;
                        op.with_value(columns::RAW_CONTACT_ID, owner)
                    }
                } else if is_insert {
                    return Err(ContactError::bad_arguments(
                        "data rows of an inserted raw contact must be inserts",
                    ));
                } else {
                    op
                };
                ops.push(op.for_profile(self.profile));
            }
        }

        let added = ops.len() > first_index;
        if added && is_update {
            if let Some(id) = before_id {
                ops.insert(
                    first_index,
                    self.aggregation_mode_update(AggregationMode::Suspended).with_id(id),
                );
                ops.push(self.aggregation_mode_update(AggregationMode::Default).with_id(id));
            }
        } else if is_insert {
            ops.push(
                self.aggregation_mode_update(AggregationMode::Default)
                    .with_selection_back_ref(first_index),
            );
        }
        Ok(())
    }

    /// Re-applies `remote`'s edits on top of `local`, a fresher read of the
    /// same raw contact.
    pub fn merge_after(
        local: Option<RawContactDelta>,
        remote: &RawContactDelta,
    ) -> Option<RawContactDelta> {
        if local.is_none() && (remote.values.is_delete() || remote.values.is_transient()) {
            return None;
        }
        let mut local = local.unwrap_or_else(|| RawContactDelta {
            values: ValuesDelta {
                before: None,
                after: None,
                id_column: columns::ID,
            },
            entries: BTreeMap::new(),
            profile: remote.profile,
        });
        local.values = ValuesDelta::merge_after(Some(local.values), &remote.values)?;
        for remote_entry in remote.entries() {
            match remote_entry.id().and_then(|id| local.entry_mut(id)) {
                Some(slot) => {
                    if let Some(merged) = ValuesDelta::merge_after(Some(slot.clone()), remote_entry) {
                        *slot = merged;
                    }
                }
                None => {
                    if let Some(merged) = ValuesDelta::merge_after(None, remote_entry) {
                        local.add_entry(merged);
                    }
                }
            }
        }
        Some(local)
    }
}

enum Endpoint {
    Id(i64),
    BackRef(usize),
}

fn exception_between(kind: AggregationType, first: Endpoint, second: Endpoint) -> Operation {
    let mut op = Operation::update(Table::AggregationExceptions)
        .with_value(columns::EXCEPTION_TYPE, kind.code());
    for (column, endpoint) in [
        (columns::RAW_CONTACT_ID1, first),
        (columns::RAW_CONTACT_ID2, second),
    ] {
        op = match endpoint {
            Endpoint::Id(id) => op.with_value(column, id),
            Endpoint::BackRef(index) => op.with_value_back_ref(column, index),
        };
    }
    op
}

/// The raw contacts making up one contact being edited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawContactDeltaList {
    deltas: Vec<RawContactDelta>,
    split: bool,
    join_with: Option<Vec<RawContactId>>,
    placeholders: PlaceholderIds,
}

impl RawContactDeltaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: Vec<RawContactEntity>, profile: bool) -> Self {
        Self {
            deltas: entities
                .into_iter()
                .map(|entity| RawContactDelta::from_entity(entity, profile))
                .collect(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, delta: RawContactDelta) {
        self.deltas.push(delta);
    }

    /// Source of placeholder ids for rows added to this list.
    pub fn placeholders_mut(&mut self) -> &mut PlaceholderIds {
        &mut self.placeholders
    }

    /// Adds a brand-new raw contact in `account` and returns it for editing.
    pub fn insert_raw_contact(&mut self, account: &Account) -> &mut RawContactDelta {
        let delta = RawContactDelta::insert(account, &mut self.placeholders);
        self.deltas.push(delta);
        let last = self.deltas.len() - 1;
        &mut self.deltas[last]
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RawContactDelta> {
        self.deltas.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawContactDelta> {
        self.deltas.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RawContactDelta> {
        self.deltas.iter_mut()
    }

    pub fn by_raw_contact_id(&self, id: RawContactId) -> Option<&RawContactDelta> {
        self.deltas
            .iter()
            .find(|delta| delta.raw_contact_id() == Some(id))
    }

    pub fn by_raw_contact_id_mut(&mut self, id: RawContactId) -> Option<&mut RawContactDelta> {
        self.deltas
            .iter_mut()
            .find(|delta| delta.raw_contact_id() == Some(id))
    }

    /// Ids of raw contacts the store already holds.
    pub fn existing_raw_contact_ids(&self) -> Vec<RawContactId> {
        self.deltas
            .iter()
            .filter(|delta| delta.values.before_exists())
            .filter_map(RawContactDelta::raw_contact_id)
            .filter(|id| !id.is_placeholder())
            .collect()
    }

    /// First stored raw contact of this contact, if any.
    pub fn find_raw_contact_id(&self) -> Option<RawContactId> {
        self.existing_raw_contact_ids().into_iter().next()
    }

    pub fn is_profile(&self) -> bool {
        self.deltas.iter().any(RawContactDelta::is_profile)
    }

    pub fn set_profile(&mut self, profile: bool) {
        for delta in &mut self.deltas {
            delta.set_profile(profile);
        }
    }

    pub fn mark_raw_contacts_for_splitting(&mut self) {
        self.split = true;
    }

    pub fn is_marked_for_splitting(&self) -> bool {
        self.split
    }

    pub fn set_join_with_raw_contacts(&mut self, ids: Vec<RawContactId>) {
        self.join_with = Some(ids);
    }

    pub fn join_with(&self) -> Option<&[RawContactId]> {
        self.join_with.as_deref()
    }

    /// The super-primary entry of `mimetype`, falling back to the first
    /// visible one.
    pub fn super_primary_entry(&self, mimetype: &str) -> Option<&ValuesDelta> {
        self.deltas
            .iter()
            .find_map(|delta| delta.super_primary_entry(mimetype))
            .or_else(|| {
                self.deltas.iter().find_map(|delta| {
                    delta
                        .mime_entries(mimetype)
                        .iter()
                        .find(|entry| entry.is_visible())
                })
            })
    }

    /// Removes blank data rows; drops raw contacts left without content.
    pub fn trim_empty(&mut self) {
        for delta in &mut self.deltas {
            delta.trim_empty();
        }
    }

    /// Every raw contact's edits as one ordered batch.
    pub fn build_diff(&self) -> ContactResult<Vec<Operation>> {
        let mut diff: Vec<Operation> = self.deltas.iter().filter_map(RawContactDelta::build_assert).collect();
        let assert_mark = diff.len();
        let existing = self.find_raw_contact_id();
        let mut back_refs: Vec<Option<usize>> = Vec::with_capacity(self.deltas.len());
        let mut first_insert: Option<usize> = None;

        for delta in &self.deltas {
            let first_batch = diff.len();
            let is_insert = delta.is_contact_insert();
            back_refs.push(is_insert.then_some(first_batch));
            delta.build_diff(&mut diff)?;

            for joined in self.join_with.iter().flatten() {
                let target = match existing {
                    Some(id) => Endpoint::Id(id.0),
                    None => Endpoint::BackRef(first_batch),
                };
                diff.push(exception_between(
                    AggregationType::KeepTogether,
                    Endpoint::Id(joined.0),
                    target,
                ));
            }

            if !is_insert || self.split {
                continue;
            }
            match (existing, first_insert) {
                (Some(id), _) => diff.push(exception_between(
                    AggregationType::KeepTogether,
                    Endpoint::Id(id.0),
                    Endpoint::BackRef(first_batch),
                )),
                (None, None) => first_insert = Some(first_batch),
                (None, Some(first)) => diff.push(exception_between(
                    AggregationType::KeepTogether,
                    Endpoint::BackRef(first),
                    Endpoint::BackRef(first_batch),
                )),
            }
        }

        if self.split {
            self.build_split_diff(&mut diff, &back_refs);
        }
        if diff.len() == assert_mark {
            diff.clear();
        }
        Ok(diff)
    }

    fn endpoint(&self, index: usize, back_refs: &[Option<usize>]) -> Option<Endpoint> {
        match self.deltas[index].values.id() {
            Some(id) if id >= 0 => Some(Endpoint::Id(id)),
            _ => back_refs[index].map(Endpoint::BackRef),
        }
    }

    fn build_split_diff(&self, diff: &mut Vec<Operation>, back_refs: &[Option<usize>]) {
        let count = self.deltas.len();
        for i in 0..count {
            for j in 0..count {
                if i == j {
                    continue;
                }
                if let (Some(first), Some(second)) =
                    (self.endpoint(i, back_refs), self.endpoint(j, back_refs))
                {
                    diff.push(exception_between(AggregationType::KeepSeparate, first, second));
                }
            }
        }
    }

    /// Re-applies the edits in `remote` on top of `local`, a fresh read of the
    /// same raw contacts. Raw contacts only `remote` knows about are added.
    /// The split flag and join targets of `remote` are kept.
    pub fn merge_after(local: RawContactDeltaList, remote: &RawContactDeltaList) -> RawContactDeltaList {
        let mut local = local;
        for remote_delta in &remote.deltas {
            let position = remote_delta.raw_contact_id().and_then(|id| {
                local
                    .deltas
                    .iter()
                    .position(|delta| delta.raw_contact_id() == Some(id))
            });
            match position {
                Some(index) => {
                    let stored = local.deltas.remove(index);
                    if let Some(merged) = RawContactDelta::merge_after(Some(stored), remote_delta) {
                        local.deltas.insert(index, merged);
                    }
                }
                None => {
                    if let Some(merged) = RawContactDelta::merge_after(None, remote_delta) {
                        local.deltas.push(merged);
                    }
                }
            }
        }
        local.split = remote.split;
        local.join_with = remote.join_with.clone();
        local.placeholders = remote.placeholders.clone();
        local
    }
}

/// A data row of `mimetype` with the given slots filled.
pub fn data_row(mimetype: &str, slots: &[(usize, Value)]) -> RowValues {
    let mut values = RowValues::new();
    values.insert(columns::MIMETYPE.to_string(), Value::from(mimetype));
    for (slot, value) in slots {
        if let Some(column) = columns::DATA.get(*slot) {
            values.insert(column.to_string(), value.clone());
        }
    }
    values
}
