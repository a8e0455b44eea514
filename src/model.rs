//! # Data Model
//!
//! Identifiers, account identity, and the immutable contact snapshot produced
//! by the assembler.

use crate::accounts::AccountTypeInfo;
use crate::kinds::DataKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Volatile numeric id of an aggregated contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub i64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Identifier of one account-scoped identity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawContactId(pub i64);

impl RawContactId {
    /// Placeholder ids are negative until the store assigns a real one.
    pub fn is_placeholder(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for RawContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RC{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId(pub i64);

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamItemId(pub i64);

/// Contact directory. `0` is the local default partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectoryId(pub i64);

impl DirectoryId {
    pub const DEFAULT: DirectoryId = DirectoryId(0);
    pub const LOCAL_INVISIBLE: DirectoryId = DirectoryId(1);

    /// True for any directory other than the two local partitions.
    pub fn is_remote(self) -> bool {
        self != Self::DEFAULT && self != Self::LOCAL_INVISIBLE
    }
}

/// Account identity a raw contact or group is scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Account {
    pub name: Option<String>,
    pub account_type: Option<String>,
    pub data_set: Option<String>,
}

impl Account {
    pub fn new(name: &str, account_type: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            account_type: Some(account_type.to_string()),
            data_set: None,
        }
    }

    pub fn with_data_set(mut self, data_set: &str) -> Self {
        self.data_set = Some(data_set.to_string());
        self
    }

    /// Device-local account with no sync owner.
    pub fn local() -> Self {
        Self::default()
    }

    pub fn is_local(&self) -> bool {
        self.account_type.is_none()
    }

    pub fn type_key(&self) -> AccountTypeKey {
        AccountTypeKey {
            account_type: self.account_type.clone(),
            data_set: self.data_set.clone(),
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.account_type.as_deref().unwrap_or("local"),
            self.name.as_deref().unwrap_or("-")
        )?;
        if let Some(data_set) = &self.data_set {
            write!(f, "/{data_set}")?;
        }
        Ok(())
    }
}

/// Account type plus optional data-set qualifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountTypeKey {
    pub account_type: Option<String>,
    pub data_set: Option<String>,
}

impl AccountTypeKey {
    pub fn new(account_type: &str, data_set: Option<&str>) -> Self {
        Self {
            account_type: Some(account_type.to_string()),
            data_set: data_set.map(str::to_string),
        }
    }
}

/// Which kind of row the contact display name was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum DisplayNameSource {
    #[default]
    Undefined,
    Email,
    Phone,
    Organization,
    Nickname,
    StructuredPhoneticName,
    StructuredName,
}

impl DisplayNameSource {
    pub fn code(self) -> i64 {
        match self {
            DisplayNameSource::Undefined => 0,
            DisplayNameSource::Email => 10,
            DisplayNameSource::Phone => 20,
            DisplayNameSource::Organization => 30,
            DisplayNameSource::Nickname => 35,
            DisplayNameSource::StructuredPhoneticName => 37,
            DisplayNameSource::StructuredName => 40,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            10 => DisplayNameSource::Email,
            20 => DisplayNameSource::Phone,
            30 => DisplayNameSource::Organization,
            35 => DisplayNameSource::Nickname,
            37 => DisplayNameSource::StructuredPhoneticName,
            40 => DisplayNameSource::StructuredName,
            _ => DisplayNameSource::Undefined,
        }
    }
}

/// How far a directory lets its contacts be copied into local accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExportSupport {
    #[default]
    None,
    SameAccountOnly,
    AnyAccount,
}

impl ExportSupport {
    pub fn code(self) -> i64 {
        match self {
            ExportSupport::None => 0,
            ExportSupport::SameAccountOnly => 1,
            ExportSupport::AnyAccount => 2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ExportSupport::SameAccountOnly,
            2 => ExportSupport::AnyAccount,
            _ => ExportSupport::None,
        }
    }
}

/// Pairwise aggregation constraint between two raw contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationType {
    /// Removes any forced relationship; the store's heuristic decides.
    Automatic,
    KeepTogether,
    KeepSeparate,
}

impl AggregationType {
    pub fn code(self) -> i64 {
        match self {
            AggregationType::Automatic => 0,
            AggregationType::KeepTogether => 1,
            AggregationType::KeepSeparate => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AggregationType::Automatic),
            1 => Some(AggregationType::KeepTogether),
            2 => Some(AggregationType::KeepSeparate),
            _ => None,
        }
    }
}

/// Per raw contact switch for the store's clustering heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AggregationMode {
    #[default]
    Default,
    Suspended,
    Disabled,
}

impl AggregationMode {
    pub fn code(self) -> i64 {
        match self {
            AggregationMode::Default => 0,
            AggregationMode::Suspended => 2,
            AggregationMode::Disabled => 3,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            2 => AggregationMode::Suspended,
            3 => AggregationMode::Disabled,
            _ => AggregationMode::Default,
        }
    }
}

/// One typed field attached to a raw contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    pub id: Option<DataId>,
    pub raw_contact_id: Option<RawContactId>,
    pub is_primary: bool,
    pub is_super_primary: bool,
    pub version: i64,
    pub sync: [Option<String>; 4],
    pub kind: DataKind,
}

impl DataItem {
    pub fn new(kind: DataKind) -> Self {
        Self {
            id: None,
            raw_contact_id: None,
            is_primary: false,
            is_super_primary: false,
            version: 0,
            sync: Default::default(),
            kind,
        }
    }

    pub fn mimetype(&self) -> &str {
        self.kind.mimetype()
    }
}

/// One account-scoped identity record with its data rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawContact {
    pub id: RawContactId,
    pub contact_id: Option<ContactId>,
    pub account: Account,
    pub dirty: bool,
    pub version: i64,
    pub deleted: bool,
    pub source_id: Option<String>,
    pub sync: [Option<String>; 4],
    pub starred: bool,
    pub name_verified: bool,
    pub data: Vec<DataItem>,
}

impl RawContact {
    pub fn new(id: RawContactId, account: Account) -> Self {
        Self {
            id,
            contact_id: None,
            account,
            dirty: false,
            version: 0,
            deleted: false,
            source_id: None,
            sync: Default::default(),
            starred: false,
            name_verified: false,
            data: Vec::new(),
        }
    }

    pub fn data_of<'a>(&'a self, mimetype: &'a str) -> impl Iterator<Item = &'a DataItem> + 'a {
        self.data.iter().filter(move |d| d.mimetype() == mimetype)
    }
}

/// Presence and status attached to a data row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStatus {
    pub presence: Option<i64>,
    pub status: Option<String>,
    pub timestamp: Option<i64>,
    pub res_package: Option<String>,
    pub icon_res: Option<i64>,
    pub label_res: Option<i64>,
}

impl DataStatus {
    /// Status text is present.
    pub fn is_valid(&self) -> bool {
        self.status.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Replace with `other` when it carries a strictly newer timestamp.
    pub fn possible_update(&mut self, other: &DataStatus) {
        let newer = match (self.timestamp, other.timestamp) {
            (None, Some(_)) => true,
            (Some(current), Some(candidate)) => candidate > current,
            _ => !self.is_valid() && other.is_valid(),
        };
        if newer {
            *self = other.clone();
        }
    }
}

/// Group decoration for a contact's accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetaData {
    pub account_name: Option<String>,
    pub account_type: Option<String>,
    pub data_set: Option<String>,
    pub group_id: GroupId,
    pub title: Option<String>,
    pub default_group: bool,
    pub favorites: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamItemPhoto {
    pub id: i64,
    pub stream_item_id: StreamItemId,
    pub sort_index: Option<i64>,
    pub photo_file_id: Option<i64>,
    pub photo_uri: Option<String>,
}

/// One social stream post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamItemEntry {
    pub id: StreamItemId,
    pub text: Option<String>,
    pub comments: Option<String>,
    pub timestamp: i64,
    pub account_type: Option<String>,
    pub account_name: Option<String>,
    pub data_set: Option<String>,
    pub res_package: Option<String>,
    pub icon_res: Option<i64>,
    pub label_res: Option<i64>,
    pub photos: Vec<StreamItemPhoto>,
}

impl StreamItemEntry {
    /// Newest first; ties broken by id so the order is total.
    pub fn display_order(a: &StreamItemEntry, b: &StreamItemEntry) -> std::cmp::Ordering {
        b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMetaData {
    pub display_name: Option<String>,
    pub directory_type: Option<String>,
    pub account_type: Option<String>,
    pub account_name: Option<String>,
    pub export_support: ExportSupport,
}

/// How a caller names the contact it wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContactRef {
    /// Stable lookup key, with the numeric id last seen for it.
    Lookup {
        lookup_key: String,
        contact_id: Option<ContactId>,
    },
    Contact(ContactId),
    RawContact(RawContactId),
    Directory {
        directory_id: DirectoryId,
        lookup_key: String,
    },
    /// A directory contact passed by value as JSON.
    Encoded {
        directory_id: DirectoryId,
        json: String,
    },
    /// The device owner's own contact.
    Profile,
}

impl fmt::Display for ContactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContactRef::Lookup {
                lookup_key,
                contact_id: Some(id),
            } => write!(f, "lookup:{lookup_key}/{id}"),
            ContactRef::Lookup { lookup_key, .. } => write!(f, "lookup:{lookup_key}"),
            ContactRef::Contact(id) => write!(f, "contact:{id}"),
            ContactRef::RawContact(id) => write!(f, "raw:{id}"),
            ContactRef::Directory {
                directory_id,
                lookup_key,
            } => write!(f, "directory:{}/{lookup_key}", directory_id.0),
            ContactRef::Encoded { directory_id, .. } => write!(f, "encoded:{}", directory_id.0),
            ContactRef::Profile => write!(f, "profile"),
        }
    }
}

/// Materialized view of one contact. Never mutated after delivery; new facts
/// produce a new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub requested: ContactRef,
    /// Canonical reference for reloading this contact.
    pub lookup: ContactRef,
    pub id: ContactId,
    pub lookup_key: Option<String>,
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
    pub raw_contacts: Vec<RawContact>,
    pub statuses: BTreeMap<DataId, DataStatus>,
    pub invitable_account_types: Option<Vec<AccountTypeInfo>>,
    pub directory: Option<DirectoryMetaData>,
    pub groups: Option<Vec<GroupMetaData>>,
    pub stream_items: Option<Vec<StreamItemEntry>>,
    pub photo: Option<Vec<u8>>,
    pub thumbnail: Option<Vec<u8>>,
}

impl Contact {
    pub fn is_directory_entry(&self) -> bool {
        self.directory_id.is_remote()
    }

    pub fn raw_contact_ids(&self) -> Vec<RawContactId> {
        self.raw_contacts.iter().map(|r| r.id).collect()
    }

    pub fn find_data(&self, id: DataId) -> Option<&DataItem> {
        self.raw_contacts
            .iter()
            .flat_map(|r| r.data.iter())
            .find(|d| d.id == Some(id))
    }

    /// Same contact, re-addressed to a different requesting reference.
    pub fn for_request(&self, requested: ContactRef) -> Contact {
        Contact {
            requested,
            ..self.clone()
        }
    }

    /// New snapshot with the full-size photo replaced.
    pub fn with_photo(&self, photo: Option<Vec<u8>>) -> Contact {
        Contact {
            photo,
            ..self.clone()
        }
    }
}

/// Outcome of one assembler read.
#[derive(Debug, Clone)]
pub enum LoadResult {
    Loaded(Arc<Contact>),
    NotFound {
        requested: ContactRef,
    },
    Error {
        requested: ContactRef,
        cause: Arc<anyhow::Error>,
    },
}

impl LoadResult {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadResult::Loaded(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LoadResult::NotFound { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LoadResult::Error { .. })
    }

    pub fn contact(&self) -> Option<&Arc<Contact>> {
        match self {
            LoadResult::Loaded(contact) => Some(contact),
            _ => None,
        }
    }

    pub fn requested(&self) -> &ContactRef {
        match self {
            LoadResult::Loaded(contact) => &contact.requested,
            LoadResult::NotFound { requested } | LoadResult::Error { requested, .. } => requested,
        }
    }
}
