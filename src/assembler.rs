//! # Contact Assembler
//!
//! Turns a [`ContactRef`] into one immutable [`Contact`] snapshot. The primary
//! read returns every data row of the contact ordered by raw contact id, so
//! rows are grouped with a single linear scan. Directory metadata, group
//! metadata, stream items, phone formatting, photos and invitable account
//! types are layered on afterwards according to [`LoaderConfig`].
//!
//! Every load ends in exactly one of `Loaded`, `NotFound` or `Error`. A primary
//! read with no result set, or with no rows, is `NotFound`; any other failure
//! is caught here and reported as `Error`.

use crate::accounts::{AccountTypeInfo, AccountTypes};
use crate::config::LoaderConfig;
use crate::encoded::decode_encoded_contact;
use crate::error::CodecError;
use crate::kinds::DataKind;
use crate::model::{
    Account, AccountTypeKey, Contact, ContactRef, DataId, DataItem, DataStatus,
    DirectoryMetaData, GroupMetaData, LoadResult, RawContact, RawContactId,
};
use crate::notify::NotificationGateway;
use crate::photo::{inline_photo, load_display_photo, load_stream_items};
use crate::store::{ContactStore, EntityRows, GroupRow};
use anyhow::{Context, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Previously delivered snapshots, keyed by their canonical lookup reference.
///
/// An entry is handed out at most once; the next load of the same reference
/// reads the store again.
pub struct SnapshotCache {
    entries: Mutex<LruCache<ContactRef, Arc<Contact>>>,
}

impl SnapshotCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn put(&self, contact: Arc<Contact>) {
        self.entries.lock().put(contact.lookup.clone(), contact);
    }

    pub fn take(&self, reference: &ContactRef) -> Option<Arc<Contact>> {
        self.entries.lock().pop(reference)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Groups the rows of one contact read into a snapshot.
///
/// Rows must be ordered by raw contact id. A row without data contributes
/// only its raw contact.
pub fn assemble(requested: ContactRef, entities: EntityRows) -> Result<Contact, CodecError> {
    let EntityRows { header, rows } = entities;
    let mut raw_contacts: Vec<RawContact> = Vec::new();
    let mut statuses = BTreeMap::new();
    let mut current: Option<RawContactId> = None;
    for row in rows {
        if current != Some(row.raw_contact_id) {
            current = Some(row.raw_contact_id);
            raw_contacts.push(RawContact::from_row(&row.raw_contact)?);
        }
        let Some(data) = row.data else {
            continue;
        };
        let item = DataItem::from_row(&data)?;
        if let (Some(id), Some(status)) = (item.id, row.status) {
            if status.presence.is_some() || status.is_valid() {
                statuses
                    .entry(id)
                    .and_modify(|existing: &mut DataStatus| existing.possible_update(&status))
                    .or_insert(status);
            }
        }
        if let Some(raw_contact) = raw_contacts.last_mut() {
            raw_contact.data.push(item);
        }
    }

    let lookup = if header.is_user_profile {
        ContactRef::Profile
    } else if header.directory_id.is_remote() {
        ContactRef::Directory {
            directory_id: header.directory_id,
            lookup_key: header.lookup_key.clone(),
        }
    } else {
        ContactRef::Lookup {
            lookup_key: header.lookup_key.clone(),
            contact_id: Some(header.contact_id),
        }
    };

    Ok(Contact {
        requested,
        lookup,
        id: header.contact_id,
        lookup_key: Some(header.lookup_key),
        directory_id: header.directory_id,
        name_raw_contact_id: header.name_raw_contact_id,
        display_name_source: header.display_name_source,
        display_name: header.display_name,
        alt_display_name: header.alt_display_name,
        phonetic_name: header.phonetic_name,
        photo_id: header.photo_id,
        photo_uri: header.photo_uri,
        starred: header.starred,
        presence: header.presence,
        send_to_voicemail: header.send_to_voicemail,
        custom_ringtone: header.custom_ringtone,
        is_user_profile: header.is_user_profile,
        raw_contacts,
        statuses,
        invitable_account_types: None,
        directory: None,
        groups: None,
        stream_items: None,
        photo: None,
        thumbnail: None,
    })
}

/// Loads contacts for one consumer.
pub struct ContactAssembler {
    store: Arc<dyn ContactStore>,
    accounts: Arc<dyn AccountTypes>,
    gateway: Arc<NotificationGateway>,
    options: LoaderConfig,
    cache: Arc<SnapshotCache>,
    /// Raw contacts whose account service already heard about this consumer.
    notified: FxHashSet<RawContactId>,
}

impl ContactAssembler {
    pub fn new(
        store: Arc<dyn ContactStore>,
        accounts: Arc<dyn AccountTypes>,
        gateway: Arc<NotificationGateway>,
        options: LoaderConfig,
    ) -> Self {
        let cache = Arc::new(SnapshotCache::new(options.cache_capacity));
        Self {
            store,
            accounts,
            gateway,
            options,
            cache,
            notified: FxHashSet::default(),
        }
    }

    /// Shares a snapshot cache with other assemblers.
    pub fn with_cache(mut self, cache: Arc<SnapshotCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    pub fn options(&self) -> &LoaderConfig {
        &self.options
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Turns on every optional part of a load. `current` is kept so the next
    /// load only fetches the parts it lacks. Returns false when everything was
    /// already on.
    pub fn upgrade_to_full(&mut self, current: Option<Arc<Contact>>) -> bool {
        let options = &mut self.options;
        if options.load_group_metadata
            && options.load_invitable_account_types
            && options.post_view_notification
            && options.format_phone_numbers
        {
            return false;
        }
        options.load_group_metadata = true;
        options.load_invitable_account_types = true;
        options.post_view_notification = true;
        options.format_phone_numbers = true;
        if let Some(contact) = current {
            self.cache.put(contact);
        }
        true
    }

    #[instrument(skip(self), fields(reference = %reference), level = "debug")]
    pub fn load(&mut self, reference: &ContactRef) -> LoadResult {
        let result = match self.try_load(reference) {
            Ok(Some(contact)) => LoadResult::Loaded(Arc::new(contact)),
            Ok(None) => {
                debug!("contact not found");
                LoadResult::NotFound {
                    requested: reference.clone(),
                }
            }
            Err(err) => {
                warn!(error = %err, "contact load failed");
                LoadResult::Error {
                    requested: reference.clone(),
                    cause: Arc::new(err),
                }
            }
        };
        if let LoadResult::Loaded(contact) = &result {
            if self.options.post_view_notification {
                self.post_view_notifications(contact);
            }
        }
        result
    }

    fn try_load(&self, reference: &ContactRef) -> Result<Option<Contact>> {
        let (mut contact, cached) = match self.cache.take(reference) {
            Some(snapshot) => {
                trace!("reusing cached snapshot");
                (snapshot.for_request(reference.clone()), true)
            }
            None => {
                let loaded = match reference {
                    ContactRef::Encoded { directory_id, json } => {
                        Some(decode_encoded_contact(reference, *directory_id, json)?)
                    }
                    _ => self.load_entity(reference)?,
                };
                match loaded {
                    Some(contact) => (contact, false),
                    None => return Ok(None),
                }
            }
        };

        if contact.is_directory_entry() {
            if !cached {
                self.load_directory_metadata(&mut contact)?;
            }
        } else if self.options.load_group_metadata && contact.groups.is_none() {
            contact.groups = Some(self.load_group_metadata(&contact)?);
        }
        if self.options.load_stream_items && contact.stream_items.is_none() {
            if let Some(lookup_key) = contact.lookup_key.as_deref() {
                contact.stream_items = Some(
                    load_stream_items(self.store.as_ref(), lookup_key, contact.is_user_profile)
                        .context("loading stream items")?,
                );
            }
        }
        if self.options.format_phone_numbers {
            format_phone_numbers(&mut contact);
        }
        if !cached {
            contact.thumbnail = inline_photo(&contact);
            if !self.options.fetch_photo_in_background {
                contact.photo =
                    load_display_photo(self.store.as_ref(), &contact, self.options.max_photo_bytes);
            }
        }
        if self.options.load_invitable_account_types && contact.invitable_account_types.is_none() {
            contact.invitable_account_types = Some(self.invitable_account_types(&contact));
        }
        Ok(Some(contact))
    }

    fn load_entity(&self, reference: &ContactRef) -> Result<Option<Contact>> {
        let Some(target) = self.store.resolve(reference)? else {
            return Ok(None);
        };
        let Some(entities) = self.store.query_entities(&target)? else {
            debug!(contact = %target.contact_id, "entity read returned no result set");
            return Ok(None);
        };
        if entities.rows.is_empty() {
            return Ok(None);
        }
        let contact = assemble(reference.clone(), entities)
            .with_context(|| format!("decoding contact {}", target.contact_id))?;
        Ok(Some(contact))
    }

    /// Directory display name, type label, account and export support. A
    /// label that cannot be resolved leaves the type unset.
    fn load_directory_metadata(&self, contact: &mut Contact) -> Result<()> {
        let Some(row) = self.store.query_directory(contact.directory_id)? else {
            debug!(directory = contact.directory_id.0, "no directory row");
            return Ok(());
        };
        let directory_type = match (row.package_name.as_deref(), row.type_res_id) {
            (Some(package), Some(res_id)) if !package.is_empty() => {
                match self.accounts.resolve_label(package, res_id) {
                    Ok(label) => Some(label),
                    Err(err) => {
                        warn!(%package, res_id, error = %err, "directory type label not found");
                        None
                    }
                }
            }
            _ => None,
        };
        contact.directory = Some(DirectoryMetaData {
            display_name: row.display_name,
            directory_type,
            account_type: row.account_type,
            account_name: row.account_name,
            export_support: row.export_support,
        });
        Ok(())
    }

    /// Groups of every distinct account among the raw contacts, read with one
    /// OR-combined filter.
    fn load_group_metadata(&self, contact: &Contact) -> Result<Vec<GroupMetaData>> {
        let mut accounts: Vec<Account> = Vec::new();
        for raw in &contact.raw_contacts {
            let account = &raw.account;
            if account.name.is_none() || account.account_type.is_none() {
                continue;
            }
            if !accounts.contains(account) {
                accounts.push(account.clone());
            }
        }
        if accounts.is_empty() {
            return Ok(Vec::new());
        }
        match self.store.query_groups(&accounts)? {
            Some(groups) => Ok(groups.iter().map(GroupRow::to_metadata).collect()),
            None => {
                debug!("group read returned no result set");
                Ok(Vec::new())
            }
        }
    }

    /// Invitable account types minus those already present. Always empty for
    /// the profile.
    fn invitable_account_types(&self, contact: &Contact) -> Vec<AccountTypeInfo> {
        if contact.is_user_profile {
            return Vec::new();
        }
        let present: FxHashSet<AccountTypeKey> = contact
            .raw_contacts
            .iter()
            .map(|raw| raw.account.type_key())
            .collect();
        self.accounts
            .invitable_account_types()
            .into_iter()
            .filter(|info| !present.contains(&info.key))
            .collect()
    }

    fn post_view_notifications(&mut self, contact: &Contact) {
        for raw in &contact.raw_contacts {
            if !self.notified.insert(raw.id) {
                continue;
            }
            let Some(endpoint) = self
                .accounts
                .account_type(&raw.account.type_key())
                .and_then(|info| info.view_notify)
            else {
                continue;
            };
            if endpoint.package.is_empty() || endpoint.service.is_empty() {
                continue;
            }
            self.gateway.notify_viewed(&endpoint, raw.id);
        }
    }
}

fn format_phone_numbers(contact: &mut Contact) {
    for item in contact
        .raw_contacts
        .iter_mut()
        .flat_map(|raw| raw.data.iter_mut())
    {
        if let DataKind::Phone(phone) = &mut item.kind {
            phone.formatted_number = phone.format();
        }
    }
}

/// Data id of the structured name row of `raw` inside `contact`.
pub fn structured_name_id(contact: &Contact, raw: RawContactId) -> Option<DataId> {
    contact
        .raw_contacts
        .iter()
        .find(|candidate| candidate.id == raw)?
        .data_of(crate::kinds::mimetype::STRUCTURED_NAME)
        .find_map(|item| item.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::StaticAccountTypes;
    use crate::codec::{columns, get_i64};
    use crate::kinds::{Phone, StructuredName};
    use crate::memory::MemoryStore;
    use crate::model::{DirectoryId, ExportSupport};
    use crate::ops::{Operation, Table};
    use crate::notify::ViewedEvent;
    use crate::store::DirectoryRow;
    use crossbeam_channel::unbounded;

    fn name(display: &str) -> DataKind {
        DataKind::StructuredName(StructuredName {
            display_name: Some(display.to_string()),
            ..Default::default()
        })
    }

    fn phone(number: &str, normalized: &str) -> DataKind {
        DataKind::Phone(Phone {
            number: Some(number.to_string()),
            normalized_number: Some(normalized.to_string()),
            ..Default::default()
        })
    }

    fn loader_for(
        store: Arc<MemoryStore>,
        accounts: StaticAccountTypes,
        options: LoaderConfig,
    ) -> ContactAssembler {
        ContactAssembler::new(
            store,
            Arc::new(accounts),
            Arc::new(NotificationGateway::new()),
            options,
        )
    }

    #[test]
    fn test_groups_rows_per_raw_contact() {
        let store = Arc::new(MemoryStore::new());
        let mail = Account::new("ada@example.com", "com.mail");
        let social = Account::new("ada", "com.social");
        let first = store
            .insert_raw_contact(&mail, &[name("Ada"), phone("555", "+15550000000")])
            .unwrap();
        let second = store.insert_raw_contact(&social, &[name("Ada")]).unwrap();

        let mut assembler = loader_for(store, StaticAccountTypes::new(), LoaderConfig::default());
        let result = assembler.load(&ContactRef::RawContact(first));
        let contact = result.contact().unwrap();
        assert_eq!(contact.raw_contact_ids(), vec![first, second]);
        assert_eq!(contact.raw_contacts[0].data.len(), 2);
        assert_eq!(contact.raw_contacts[1].data.len(), 1);
        assert!(matches!(contact.lookup, ContactRef::Lookup { .. }));
    }

    #[test]
    fn test_unknown_reference_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let mut assembler = loader_for(store, StaticAccountTypes::new(), LoaderConfig::default());
        let result = assembler.load(&ContactRef::Lookup {
            lookup_key: "r99".to_string(),
            contact_id: None,
        });
        assert!(result.is_not_found());
    }

    #[test]
    fn test_bad_encoded_contact_is_error() {
        let store = Arc::new(MemoryStore::new());
        let mut assembler = loader_for(store, StaticAccountTypes::new(), LoaderConfig::default());
        let result = assembler.load(&ContactRef::Encoded {
            directory_id: DirectoryId(4),
            json: "{not json".to_string(),
        });
        assert!(result.is_error());
    }

    #[test]
    fn test_statuses_keep_newest() {
        let store = Arc::new(MemoryStore::new());
        let raw = store
            .insert_raw_contact(&Account::local(), &[name("Linus")])
            .unwrap();
        let data_id = DataId(get_i64(&store.data_rows(raw)[0], columns::ID).unwrap());
        store
            .set_status(
                data_id,
                DataStatus {
                    presence: Some(5),
                    status: Some("hacking".to_string()),
                    timestamp: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        let mut assembler = loader_for(store, StaticAccountTypes::new(), LoaderConfig::default());
        let contact = assembler
            .load(&ContactRef::RawContact(raw))
            .contact()
            .cloned()
            .unwrap();
        assert_eq!(contact.statuses[&data_id].status.as_deref(), Some("hacking"));
        assert_eq!(contact.presence, Some(5));
    }

    #[test]
    fn test_directory_metadata_replaces_groups() {
        let store = Arc::new(MemoryStore::new());
        let directory = DirectoryId(7);
        store
            .put_directory(
                directory,
                DirectoryRow {
                    display_name: Some("Corp".to_string()),
                    package_name: Some("com.corp".to_string()),
                    type_res_id: Some(3),
                    account_type: Some("com.corp".to_string()),
                    account_name: Some("me@corp".to_string()),
                    export_support: ExportSupport::SameAccountOnly,
                },
            )
            .unwrap();
        let raw = store
            .insert_directory_raw_contact(directory, &Account::new("me@corp", "com.corp"), &[name("Boss")])
            .unwrap();
        let options = LoaderConfig {
            load_group_metadata: true,
            ..Default::default()
        };

        let mut labelled = loader_for(
            store.clone(),
            StaticAccountTypes::new().with_label("com.corp", 3, "Corporate"),
            options.clone(),
        );
        let contact = labelled.load(&ContactRef::RawContact(raw)).contact().cloned().unwrap();
        assert!(contact.is_directory_entry());
        assert!(contact.groups.is_none());
        let meta = contact.directory.as_ref().unwrap();
        assert_eq!(meta.directory_type.as_deref(), Some("Corporate"));

        let mut unlabelled = loader_for(store, StaticAccountTypes::new(), options);
        let contact = unlabelled.load(&ContactRef::RawContact(raw)).contact().cloned().unwrap();
        let meta = contact.directory.as_ref().unwrap();
        assert_eq!(meta.display_name.as_deref(), Some("Corp"));
        assert_eq!(meta.directory_type, None);
    }

    #[test]
    fn test_invitables_exclude_present_accounts() {
        let store = Arc::new(MemoryStore::new());
        let raw = store
            .insert_raw_contact(&Account::new("a@mail", "com.mail"), &[name("Eve")])
            .unwrap();
        let accounts = StaticAccountTypes::new()
            .with_type(AccountTypeInfo::writable(AccountTypeKey::new("com.mail", None)).with_invite("Mail"))
            .with_type(AccountTypeInfo::writable(AccountTypeKey::new("com.chat", None)).with_invite("Chat"));
        let options = LoaderConfig {
            load_invitable_account_types: true,
            ..Default::default()
        };
        let mut assembler = loader_for(store.clone(), accounts.clone(), options.clone());
        let contact = assembler.load(&ContactRef::RawContact(raw)).contact().cloned().unwrap();
        let invitable: Vec<_> = contact
            .invitable_account_types
            .clone()
            .unwrap()
            .into_iter()
            .map(|info| info.key)
            .collect();
        assert_eq!(invitable, vec![AccountTypeKey::new("com.chat", None)]);

        let me = store
            .insert_profile_raw_contact(&Account::local(), &[name("Me")])
            .unwrap();
        let mut profile = loader_for(store, accounts, options);
        let contact = profile.load(&ContactRef::RawContact(me)).contact().cloned().unwrap();
        assert!(contact.is_user_profile);
        assert_eq!(contact.invitable_account_types, Some(Vec::new()));
    }

    #[test]
    fn test_view_notifications_once_per_raw_contact() {
        let store = Arc::new(MemoryStore::new());
        let account = Account::new("a@mail", "com.mail");
        let raw = store.insert_raw_contact(&account, &[name("Zed")]).unwrap();
        let (sender, viewed) = unbounded::<ViewedEvent>();
        let accounts = StaticAccountTypes::new().with_type(
            AccountTypeInfo::writable(account.type_key()).with_view_notify("com.mail", "ViewService"),
        );
        let mut assembler = ContactAssembler::new(
            store,
            Arc::new(accounts),
            Arc::new(NotificationGateway::new().with_view_notifier(Arc::new(sender))),
            LoaderConfig {
                post_view_notification: true,
                ..Default::default()
            },
        );
        for _ in 0..3 {
            assert!(assembler.load(&ContactRef::RawContact(raw)).is_loaded());
        }
        assert_eq!(viewed.try_iter().count(), 1);
    }

    #[test]
    fn test_cached_snapshot_reused_once() {
        let store = Arc::new(MemoryStore::new());
        let raw = store
            .insert_raw_contact(&Account::local(), &[phone("555", "+15551234567")])
            .unwrap();
        let mut assembler = loader_for(store.clone(), StaticAccountTypes::new(), LoaderConfig::default());
        let first = assembler.load(&ContactRef::RawContact(raw)).contact().cloned().unwrap();
        let lookup = first.lookup.clone();

        assert!(assembler.upgrade_to_full(Some(first.clone())));
        assert!(!assembler.upgrade_to_full(None));
        store
            .apply_batch(&[Operation::delete(Table::RawContacts).with_id(raw.0)])
            .unwrap();

        // The cached snapshot is served once, upgraded in place.
        let upgraded = assembler.load(&lookup).contact().cloned().unwrap();
        assert_eq!(upgraded.id, first.id);
        assert_eq!(upgraded.groups, Some(Vec::new()));
        assert!(matches!(
            &upgraded.raw_contacts[0].data[0].kind,
            DataKind::Phone(p) if p.formatted_number.as_deref() == Some("+1 555-123-4567")
        ));
        assert!(assembler.load(&lookup).is_not_found());
    }
}
