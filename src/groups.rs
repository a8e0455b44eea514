//! # Group Lifecycle
//!
//! Create, rename, membership edits, delete and undo. Deleting a group first
//! captures an [`UndoPayload`] with the group's fields and member raw contacts;
//! undo re-creates the group from it under a new id.

use crate::apply::BatchApplier;
use crate::codec::{self, columns};
use crate::error::{ContactError, ContactResult};
use crate::kinds::mimetype;
use crate::model::{Account, GroupId, RawContactId};
use crate::notify::{Broadcast, NotificationGateway};
use crate::ops::{Operation, Table};
use crate::store::{ContactStore, GroupRow};
use crate::worker::CancelToken;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Everything needed to rebuild a deleted group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoPayload {
    pub group: GroupRow,
    pub members: Vec<RawContactId>,
}

impl UndoPayload {
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("encoding undo payload")
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("decoding undo payload")
    }
}

#[derive(Clone)]
pub struct GroupManager {
    applier: BatchApplier,
    gateway: Arc<NotificationGateway>,
}

impl GroupManager {
    pub fn new(applier: BatchApplier, gateway: Arc<NotificationGateway>) -> Self {
        Self { applier, gateway }
    }

    fn store(&self) -> &Arc<dyn ContactStore> {
        self.applier.store()
    }

    /// Creates a visible, synced group in `account` and adds `members`.
    #[instrument(skip(self, members, cancel), fields(members = members.len()), level = "debug")]
    pub fn create(
        &self,
        account: &Account,
        title: &str,
        members: &[RawContactId],
        cancel: &CancelToken,
    ) -> ContactResult<GroupId> {
        let title = require_title(title)?;
        let row = GroupRow {
            id: GroupId(0),
            account: account.clone(),
            title: Some(title.to_string()),
            notes: None,
            visible: true,
            should_sync: true,
            auto_add: false,
            favorites: false,
        };
        let group = self.insert_group(&row, cancel)?;
        self.add_members(group, members, cancel)?;
        info!(group = %group, "group created");
        Ok(group)
    }

    pub fn rename(&self, group: GroupId, title: &str, cancel: &CancelToken) -> ContactResult<()> {
        let title = require_title(title)?;
        let results = self.applier.apply(
            &[Operation::update(Table::Groups)
                .with_id(group.0)
                .with_value(columns::TITLE, title)],
            cancel,
        )?;
        if results.first().map_or(0, |result| result.count) == 0 {
            return Err(ContactError::NotFound);
        }
        Ok(())
    }

    /// Optional rename followed by membership edits.
    pub fn update(
        &self,
        group: GroupId,
        title: Option<&str>,
        add: &[RawContactId],
        remove: &[RawContactId],
        cancel: &CancelToken,
    ) -> ContactResult<()> {
        if let Some(title) = title {
            self.rename(group, title, cancel)?;
        }
        self.add_members(group, add, cancel)?;
        self.remove_members(group, remove, cancel)?;
        Ok(())
    }

    /// Adds each raw contact in its own batch. Returns how many were added.
    /// Raw contacts already in the group are skipped, and so is any member
    /// whose insert fails, so one vanished raw contact does not strand the
    /// rest.
    pub fn add_members(
        &self,
        group: GroupId,
        members: &[RawContactId],
        cancel: &CancelToken,
    ) -> ContactResult<usize> {
        let mut added = 0;
        for &raw in members {
            let ops = [
                membership(Operation::assert(Table::Data), raw, group).with_expected_count(0),
                Operation::insert(Table::Data)
                    .with_value(columns::MIMETYPE, mimetype::GROUP_MEMBERSHIP)
                    .with_value(columns::RAW_CONTACT_ID, raw.0)
                    .with_value(columns::GROUP_ROW_ID, group.0),
            ];
            match self.applier.apply(&ops, cancel) {
                Ok(_) => added += 1,
                Err(ContactError::VersionConflict(reason)) => {
                    debug!(raw = %raw, group = %group, %reason, "already a member");
                }
                Err(err) if cancel.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(raw = %raw, group = %group, error = %err, "membership insert failed, skipping");
                }
            }
        }
        Ok(added)
    }

    pub fn remove_members(
        &self,
        group: GroupId,
        members: &[RawContactId],
        cancel: &CancelToken,
    ) -> ContactResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let ops: Vec<Operation> = members
            .iter()
            .map(|&raw| membership(Operation::delete(Table::Data), raw, group))
            .collect();
        self.applier.apply(&ops, cancel)?;
        Ok(())
    }

    /// Deletes `group` and returns the payload that can rebuild it. The
    /// payload is also broadcast as `GroupDeleted`.
    #[instrument(skip(self, cancel), level = "debug")]
    pub fn delete(&self, group: GroupId, cancel: &CancelToken) -> ContactResult<UndoPayload> {
        let store = self.store();
        let row = store.query_group(group)?.ok_or(ContactError::NotFound)?;
        let members = store.query_group_members(group)?;
        let undo = UndoPayload { group: row, members };
        self.applier
            .apply(&[Operation::delete(Table::Groups).with_id(group.0)], cancel)?;
        info!(group = %group, members = undo.members.len(), "group deleted");
        self.gateway.broadcast(Broadcast::GroupDeleted {
            group,
            undo: undo.clone(),
        });
        Ok(undo)
    }

    /// Re-creates a deleted group. The group gets a new id.
    #[instrument(skip(self, payload, cancel), fields(group = %payload.group.id), level = "debug")]
    pub fn undo(&self, payload: &UndoPayload, cancel: &CancelToken) -> ContactResult<GroupId> {
        let group = self.insert_group(&payload.group, cancel)?;
        self.add_members(group, &payload.members, cancel)?;
        info!(old = %payload.group.id, new = %group, "group restored");
        Ok(group)
    }

    fn insert_group(&self, row: &GroupRow, cancel: &CancelToken) -> ContactResult<GroupId> {
        let mut op = Operation::insert(Table::Groups)
            .with_value(columns::TITLE, row.title.clone())
            .with_value(columns::NOTES, row.notes.clone())
            .with_value(columns::GROUP_VISIBLE, row.visible)
            .with_value(columns::SHOULD_SYNC, row.should_sync)
            .with_value(columns::AUTO_ADD, row.auto_add)
            .with_value(columns::FAVORITES, row.favorites);
        codec::account_to_row(&row.account, &mut op.values);
        let results = self.applier.apply(&[op], cancel)?;
        results
            .first()
            .and_then(|result| result.id)
            .map(GroupId)
            .ok_or_else(|| ContactError::store_conflict("group insert returned no id"))
    }
}

fn membership(op: Operation, raw: RawContactId, group: GroupId) -> Operation {
    op.matching(columns::RAW_CONTACT_ID, raw.0)
        .matching(columns::MIMETYPE, mimetype::GROUP_MEMBERSHIP)
        .matching(columns::GROUP_ROW_ID, group.0)
}

fn require_title(title: &str) -> ContactResult<&str> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ContactError::bad_arguments("group title is blank"));
    }
    Ok(title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApplyTuning;
    use crate::memory::MemoryStore;
    use crate::notify::BroadcastTag;

    fn manager(store: Arc<MemoryStore>) -> (GroupManager, Arc<NotificationGateway>) {
        let gateway = Arc::new(NotificationGateway::new());
        (
            GroupManager::new(BatchApplier::new(store, ApplyTuning::default()), gateway.clone()),
            gateway,
        )
    }

    #[test]
    fn test_create_and_add_members_once() {
        let store = Arc::new(MemoryStore::new());
        let account = Account::new("me@mail", "com.mail");
        let raw = store.insert_raw_contact(&account, &[]).unwrap();
        let (groups, _) = manager(store.clone());
        let cancel = CancelToken::new();

        let group = groups.create(&account, "  Climbing ", &[raw], &cancel).unwrap();
        let row = store.query_group(group).unwrap().unwrap();
        assert_eq!(row.title.as_deref(), Some("Climbing"));
        assert!(row.visible);
        assert_eq!(groups.add_members(group, &[raw], &cancel).unwrap(), 0);
        assert_eq!(store.query_group_members(group).unwrap(), vec![raw]);

        groups.remove_members(group, &[raw], &cancel).unwrap();
        assert!(store.query_group_members(group).unwrap().is_empty());
    }

    #[test]
    fn test_blank_title_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (groups, _) = manager(store.clone());
        let err = groups
            .create(&Account::local(), "   ", &[], &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ContactError::BadArguments(_)));
        assert!(store.group_ids().is_empty());
    }

    #[test]
    fn test_delete_broadcasts_undo_payload() {
        let store = Arc::new(MemoryStore::new());
        let account = Account::new("me@mail", "com.mail");
        let a = store.insert_raw_contact(&account, &[]).unwrap();
        let b = store.insert_raw_contact(&account, &[]).unwrap();
        let (groups, gateway) = manager(store.clone());
        let (_, deleted) = gateway.subscribe(&[BroadcastTag::GroupDeleted]);
        let cancel = CancelToken::new();
        let group = groups.create(&account, "Family", &[a, b], &cancel).unwrap();

        let undo = groups.delete(group, &cancel).unwrap();
        assert_eq!(undo.members, vec![a, b]);
        assert!(store.query_group(group).unwrap().is_none());
        let event = deleted.try_recv().unwrap();
        assert_eq!(event.undo_payload(), Some(&undo));

        let json = undo.to_json().unwrap();
        let restored = groups.undo(&UndoPayload::from_json(&json).unwrap(), &cancel).unwrap();
        assert_ne!(restored, group);
        let row = store.query_group(restored).unwrap().unwrap();
        assert_eq!(row.title.as_deref(), Some("Family"));
        assert_eq!(row.account, account);
        assert_eq!(store.query_group_members(restored).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_undo_skips_members_that_vanished() {
        let store = Arc::new(MemoryStore::new());
        let account = Account::new("me@mail", "com.mail");
        let members: Vec<RawContactId> = (0..3)
            .map(|_| store.insert_raw_contact(&account, &[]).unwrap())
            .collect();
        let (groups, _) = manager(store.clone());
        let cancel = CancelToken::new();

        let group = groups.create(&account, "Choir", &members, &cancel).unwrap();
        let payload = groups.delete(group, &cancel).unwrap();
        store
            .apply_batch(&[Operation::delete(Table::RawContacts).with_id(members[0].0)])
            .unwrap();

        let restored = groups.undo(&payload, &cancel).unwrap();
        assert_ne!(restored, group);
        assert_eq!(
            store.query_group_members(restored).unwrap(),
            vec![members[1], members[2]]
        );
    }

    #[test]
    fn test_unknown_group_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let (groups, _) = manager(store);
        let cancel = CancelToken::new();
        assert!(matches!(groups.delete(GroupId(42), &cancel), Err(ContactError::NotFound)));
        assert!(matches!(
            groups.rename(GroupId(42), "New", &cancel),
            Err(ContactError::NotFound)
        ));
    }
}
