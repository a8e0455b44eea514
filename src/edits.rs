//! # Single-Shot Edits
//!
//! Contact options, primary flags, deletes and raw contact creation. Each edit
//! is one small batch through the [`BatchApplier`]; none of them needs the
//! diff and rebase machinery of a full save.

use crate::accounts::AccountTypes;
use crate::apply::BatchApplier;
use crate::codec::{self, columns, RowValues};
use crate::error::{ContactError, ContactResult};
use crate::model::{Account, ContactId, ContactRef, DataId, RawContactId};
use crate::ops::{OpResult, Operation, Table};
use crate::store::{lookup_ref_for_raw, ContactStore};
use crate::worker::CancelToken;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct ContactEditor {
    applier: BatchApplier,
    accounts: Arc<dyn AccountTypes>,
}

impl ContactEditor {
    pub fn new(applier: BatchApplier, accounts: Arc<dyn AccountTypes>) -> Self {
        Self { applier, accounts }
    }

    fn store(&self) -> &Arc<dyn ContactStore> {
        self.applier.store()
    }

    pub fn set_starred(&self, contact: ContactId, starred: bool, cancel: &CancelToken) -> ContactResult<()> {
        self.update_contact(contact, columns::STARRED, starred.into(), cancel)
    }

    pub fn set_send_to_voicemail(
        &self,
        contact: ContactId,
        enabled: bool,
        cancel: &CancelToken,
    ) -> ContactResult<()> {
        self.update_contact(contact, columns::SEND_TO_VOICEMAIL, enabled.into(), cancel)
    }

    /// `None` restores the default ringtone.
    pub fn set_ringtone(
        &self,
        contact: ContactId,
        ringtone: Option<&str>,
        cancel: &CancelToken,
    ) -> ContactResult<()> {
        self.update_contact(contact, columns::CUSTOM_RINGTONE, ringtone.into(), cancel)
    }

    /// Makes `data` the definitive value of its mimetype for the whole
    /// contact. Super-primary implies primary.
    pub fn set_super_primary(&self, data: DataId, cancel: &CancelToken) -> ContactResult<()> {
        let op = Operation::update(Table::Data)
            .with_id(data.0)
            .with_value(columns::IS_PRIMARY, true)
            .with_value(columns::IS_SUPER_PRIMARY, true);
        expect_rows(self.applier.apply(&[op], cancel)?)
    }

    pub fn clear_primary(&self, data: DataId, cancel: &CancelToken) -> ContactResult<()> {
        let op = Operation::update(Table::Data)
            .with_id(data.0)
            .with_value(columns::IS_PRIMARY, false)
            .with_value(columns::IS_SUPER_PRIMARY, false);
        expect_rows(self.applier.apply(&[op], cancel)?)
    }

    pub fn delete_contact(&self, contact: ContactId, cancel: &CancelToken) -> ContactResult<()> {
        self.delete_multiple_contacts(&[contact], cancel)
    }

    /// Deletes every contact in one apply. Fails as a whole when any of them
    /// is already gone.
    #[instrument(skip(self, cancel), level = "debug")]
    pub fn delete_multiple_contacts(&self, contacts: &[ContactId], cancel: &CancelToken) -> ContactResult<()> {
        if contacts.is_empty() {
            return Err(ContactError::bad_arguments("no contacts to delete"));
        }
        let ops: Vec<Operation> = contacts
            .iter()
            .map(|contact| Operation::delete(Table::Contacts).with_id(contact.0))
            .collect();
        expect_rows(self.applier.apply(&ops, cancel)?)?;
        info!(contacts = contacts.len(), "contacts deleted");
        Ok(())
    }

    /// Inserts a raw contact in `account` with one data row per entry of
    /// `data`. Columns outside the writable set are dropped; a row without a
    /// mimetype is rejected before anything is written.
    #[instrument(skip(self, data, cancel), fields(rows = data.len()), level = "debug")]
    pub fn create_raw_contact(
        &self,
        account: &Account,
        data: &[RowValues],
        cancel: &CancelToken,
    ) -> ContactResult<(RawContactId, Option<ContactRef>)> {
        if !self.accounts.is_writable(&account.type_key()) {
            return Err(ContactError::PermissionDenied(format!(
                "account type {:?} is read-only",
                account.account_type
            )));
        }
        let mut raw = Operation::insert(Table::RawContacts);
        codec::account_to_row(account, &mut raw.values);
        let mut ops = vec![raw];
        for (index, values) in data.iter().enumerate() {
            let mut values = values.clone();
            codec::retain_writable(&mut values);
            if codec::get_text(&values, columns::MIMETYPE).is_none() {
                return Err(ContactError::bad_arguments(format!("data row {index} has no mimetype")));
            }
            ops.push(
                Operation::insert(Table::Data)
                    .with_values(values)
                    .with_value_back_ref(columns::RAW_CONTACT_ID, 0),
            );
        }
        let results = self.applier.apply(&ops, cancel)?;
        let raw_id = results
            .first()
            .and_then(|result| result.id)
            .map(RawContactId)
            .ok_or_else(|| ContactError::store_conflict("raw contact insert returned no id"))?;
        let lookup = lookup_ref_for_raw(self.store().as_ref(), raw_id).unwrap_or_else(|err| {
            warn!(raw = %raw_id, error = %err, "created raw contact did not resolve");
            None
        });
        info!(raw = %raw_id, "raw contact created");
        Ok((raw_id, lookup))
    }

    fn update_contact(
        &self,
        contact: ContactId,
        column: &str,
        value: codec::Value,
        cancel: &CancelToken,
    ) -> ContactResult<()> {
        let op = Operation::update(Table::Contacts)
            .with_id(contact.0)
            .with_value(column, value);
        expect_rows(self.applier.apply(&[op], cancel)?)
    }
}

/// An edit that touched nothing addressed a row that no longer exists.
fn expect_rows(results: Vec<OpResult>) -> ContactResult<()> {
    if results.iter().any(|result| result.count == 0) {
        return Err(ContactError::NotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountTypeInfo, StaticAccountTypes};
    use crate::codec::{get_bool, get_i64, Value};
    use crate::config::ApplyTuning;
    use crate::kinds::{mimetype, DataKind, Phone};
    use crate::memory::MemoryStore;
    use crate::model::AccountTypeKey;

    fn editor(store: Arc<MemoryStore>, accounts: StaticAccountTypes) -> ContactEditor {
        ContactEditor::new(BatchApplier::new(store, ApplyTuning::default()), Arc::new(accounts))
    }

    fn phone(number: &str) -> DataKind {
        DataKind::Phone(Phone {
            number: Some(number.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_contact_options() {
        let store = Arc::new(MemoryStore::new());
        let raw = store.insert_raw_contact(&Account::local(), &[]).unwrap();
        let contact = store.contact_id_of(raw).unwrap();
        let editor = editor(store.clone(), StaticAccountTypes::new());
        let cancel = CancelToken::new();

        editor.set_starred(contact, true, &cancel).unwrap();
        editor.set_send_to_voicemail(contact, true, &cancel).unwrap();
        editor.set_ringtone(contact, Some("bell.ogg"), &cancel).unwrap();
        let row = store.raw_contact_row(raw).unwrap();
        assert!(get_bool(&row, columns::STARRED));
        assert!(get_bool(&row, columns::SEND_TO_VOICEMAIL));
        assert_eq!(row.get(columns::CUSTOM_RINGTONE), Some(&Value::from("bell.ogg")));

        assert!(matches!(
            editor.set_starred(ContactId(999), true, &cancel),
            Err(ContactError::NotFound)
        ));
    }

    #[test]
    fn test_super_primary_is_unique() {
        let store = Arc::new(MemoryStore::new());
        let raw = store
            .insert_raw_contact(&Account::local(), &[phone("111"), phone("222")])
            .unwrap();
        let ids: Vec<DataId> = store
            .data_rows(raw)
            .iter()
            .filter_map(|row| get_i64(row, columns::ID))
            .map(DataId)
            .collect();
        let editor = editor(store.clone(), StaticAccountTypes::new());
        let cancel = CancelToken::new();

        editor.set_super_primary(ids[0], &cancel).unwrap();
        editor.set_super_primary(ids[1], &cancel).unwrap();
        let flags: Vec<(bool, bool)> = store
            .data_rows(raw)
            .iter()
            .map(|row| (get_bool(row, columns::IS_PRIMARY), get_bool(row, columns::IS_SUPER_PRIMARY)))
            .collect();
        assert_eq!(flags, vec![(false, false), (true, true)]);

        editor.clear_primary(ids[1], &cancel).unwrap();
        assert!(store
            .data_rows(raw)
            .iter()
            .all(|row| !get_bool(row, columns::IS_PRIMARY)));
    }

    #[test]
    fn test_create_raw_contact_filters_columns() {
        let store = Arc::new(MemoryStore::new());
        let editor = editor(store.clone(), StaticAccountTypes::new());
        let mut row = RowValues::new();
        row.insert(columns::MIMETYPE.to_string(), Value::from(mimetype::NOTE));
        row.insert("data1".to_string(), Value::from("hello"));
        row.insert(columns::RAW_CONTACT_ID.to_string(), Value::Integer(77));

        let (raw, lookup) = editor
            .create_raw_contact(&Account::local(), &[row], &CancelToken::new())
            .unwrap();
        assert!(matches!(lookup, Some(ContactRef::Lookup { .. })));
        let rows = store.data_rows(raw);
        assert_eq!(rows.len(), 1);
        assert_eq!(get_i64(&rows[0], columns::RAW_CONTACT_ID), Some(raw.0));

        let err = editor
            .create_raw_contact(&Account::local(), &[RowValues::new()], &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ContactError::BadArguments(_)));
    }

    #[test]
    fn test_read_only_account_denied() {
        let store = Arc::new(MemoryStore::new());
        let accounts = StaticAccountTypes::new()
            .with_type(AccountTypeInfo::read_only(AccountTypeKey::new("com.readonly", None)));
        let editor = editor(store.clone(), accounts);
        let err = editor
            .create_raw_contact(&Account::new("x", "com.readonly"), &[], &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ContactError::PermissionDenied(_)));
        assert_eq!(store.contact_count(), 0);
    }

    #[test]
    fn test_delete_multiple_contacts() {
        let store = Arc::new(MemoryStore::new());
        let a = store.insert_raw_contact(&Account::local(), &[phone("1")]).unwrap();
        let b = store.insert_raw_contact(&Account::local(), &[phone("2")]).unwrap();
        let ids = [store.contact_id_of(a).unwrap(), store.contact_id_of(b).unwrap()];
        let editor = editor(store.clone(), StaticAccountTypes::new());
        editor.delete_multiple_contacts(&ids, &CancelToken::new()).unwrap();
        assert_eq!(store.contact_count(), 0);
        assert!(editor.delete_contact(ids[0], &CancelToken::new()).is_err());
    }
}
