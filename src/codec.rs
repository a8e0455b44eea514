//! # DataRow Codec
//!
//! Converts between typed rows ([`DataItem`], [`RawContact`]) and the generic
//! column bags the store speaks, and decides which columns an external caller
//! may write.

use crate::error::CodecError;
use crate::kinds::{
    mimetype, Custom, DataKind, Email, GroupMembership, Identity, Im, Labeled, Note,
    Organization, Phone, Photo, StructuredName, StructuredPostal,
};
use crate::model::{Account, ContactId, DataId, DataItem, RawContact, RawContactId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null, or text that is blank after trimming.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(text) => text.trim().is_empty(),
            Value::Blob(bytes) => bytes.is_empty(),
            Value::Integer(_) => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        self.as_i64().is_some_and(|v| v != 0)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column name to value, ordered so operation dumps are stable.
pub type RowValues = BTreeMap<String, Value>;

/// Column names shared by every table the store exposes.
pub mod columns {
    pub const ID: &str = "_id";
    pub const CONTACT_ID: &str = "contact_id";
    pub const RAW_CONTACT_ID: &str = "raw_contact_id";
    pub const VERSION: &str = "version";
    pub const DELETED: &str = "deleted";

    pub const ACCOUNT_NAME: &str = "account_name";
    pub const ACCOUNT_TYPE: &str = "account_type";
    pub const DATA_SET: &str = "data_set";
    pub const DIRTY: &str = "dirty";
    pub const SOURCE_ID: &str = "sourceid";
    pub const SYNC: [&str; 4] = ["sync1", "sync2", "sync3", "sync4"];
    pub const STARRED: &str = "starred";
    pub const NAME_VERIFIED: &str = "name_verified";
    pub const AGGREGATION_MODE: &str = "aggregation_mode";
    pub const SEND_TO_VOICEMAIL: &str = "send_to_voicemail";
    pub const CUSTOM_RINGTONE: &str = "custom_ringtone";

    pub const MIMETYPE: &str = "mimetype";
    pub const IS_PRIMARY: &str = "is_primary";
    pub const IS_SUPER_PRIMARY: &str = "is_super_primary";
    pub const DATA_VERSION: &str = "data_version";
    pub const DATA: [&str; 15] = [
        "data1", "data2", "data3", "data4", "data5", "data6", "data7", "data8", "data9",
        "data10", "data11", "data12", "data13", "data14", "data15",
    ];
    pub const DATA_SYNC: [&str; 4] = ["data_sync1", "data_sync2", "data_sync3", "data_sync4"];
    pub const GROUP_SOURCE_ID: &str = "group_sourceid";

    pub const TITLE: &str = "title";
    pub const NOTES: &str = "notes";
    pub const GROUP_VISIBLE: &str = "group_visible";
    pub const SHOULD_SYNC: &str = "should_sync";
    pub const AUTO_ADD: &str = "auto_add";
    pub const FAVORITES: &str = "favorites";

    pub const EXCEPTION_TYPE: &str = "type";
    pub const RAW_CONTACT_ID1: &str = "raw_contact_id1";
    pub const RAW_CONTACT_ID2: &str = "raw_contact_id2";

    /// Group membership stores the group row id in `data1`.
    pub const GROUP_ROW_ID: &str = DATA[0];
}

/// Columns an external caller may set on a data row.
pub const WRITABLE_DATA_COLUMNS: [&str; 17] = [
    columns::MIMETYPE,
    columns::IS_PRIMARY,
    "data1",
    "data2",
    "data3",
    "data4",
    "data5",
    "data6",
    "data7",
    "data8",
    "data9",
    "data10",
    "data11",
    "data12",
    "data13",
    "data14",
    "data15",
];

pub fn is_writable_column(column: &str) -> bool {
    WRITABLE_DATA_COLUMNS.contains(&column)
}

/// Drops every column outside [`WRITABLE_DATA_COLUMNS`].
pub fn retain_writable(values: &mut RowValues) {
    values.retain(|column, _| is_writable_column(column));
}

/// Rejects values carrying any column outside [`WRITABLE_DATA_COLUMNS`].
pub fn check_writable(values: &RowValues) -> Result<(), CodecError> {
    let rejected: Vec<String> = values
        .keys()
        .filter(|column| !is_writable_column(column))
        .cloned()
        .collect();
    if rejected.is_empty() {
        Ok(())
    } else {
        Err(CodecError::NotWritable(rejected))
    }
}

/// True when none of the fifteen data slots holds a value.
pub fn is_empty_data(values: &RowValues) -> bool {
    columns::DATA
        .iter()
        .all(|column| values.get(*column).map_or(true, Value::is_empty))
}

pub fn get_i64(values: &RowValues, column: &str) -> Option<i64> {
    values.get(column).and_then(Value::as_i64)
}

pub fn get_text(values: &RowValues, column: &str) -> Option<String> {
    values.get(column).and_then(Value::as_str).map(str::to_string)
}

pub fn get_bool(values: &RowValues, column: &str) -> bool {
    values.get(column).is_some_and(Value::as_bool)
}

fn slot_text(values: &RowValues, slot: usize) -> Result<Option<String>, CodecError> {
    let column = columns::DATA[slot];
    match values.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Text(text)) => Ok(Some(text.clone())),
        Some(Value::Integer(v)) => Ok(Some(v.to_string())),
        Some(Value::Blob(_)) => Err(CodecError::WrongType {
            column: column.to_string(),
            expected: "text",
        }),
    }
}

fn slot_i64(values: &RowValues, slot: usize) -> Result<Option<i64>, CodecError> {
    let column = columns::DATA[slot];
    match values.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or(CodecError::WrongType {
            column: column.to_string(),
            expected: "integer",
        }),
    }
}

fn slot_blob(values: &RowValues, slot: usize) -> Result<Option<Vec<u8>>, CodecError> {
    let column = columns::DATA[slot];
    match values.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Blob(bytes)) => Ok(Some(bytes.clone())),
        Some(_) => Err(CodecError::WrongType {
            column: column.to_string(),
            expected: "blob",
        }),
    }
}

fn labeled(values: &RowValues) -> Result<Labeled, CodecError> {
    Ok(Labeled {
        value: slot_text(values, 0)?,
        kind: slot_i64(values, 1)?,
        label: slot_text(values, 2)?,
    })
}

/// Decodes the typed payload of a data row from its mimetype and slots.
pub fn decode_kind(values: &RowValues) -> Result<DataKind, CodecError> {
    let mime = get_text(values, columns::MIMETYPE).ok_or(CodecError::MissingColumn(columns::MIMETYPE))?;
    let kind = match mime.as_str() {
        mimetype::STRUCTURED_NAME => DataKind::StructuredName(StructuredName {
            display_name: slot_text(values, 0)?,
            given_name: slot_text(values, 1)?,
            family_name: slot_text(values, 2)?,
            prefix: slot_text(values, 3)?,
            middle_name: slot_text(values, 4)?,
            suffix: slot_text(values, 5)?,
            phonetic_given_name: slot_text(values, 6)?,
            phonetic_middle_name: slot_text(values, 7)?,
            phonetic_family_name: slot_text(values, 8)?,
        }),
        mimetype::PHONE => DataKind::Phone(Phone {
            number: slot_text(values, 0)?,
            kind: slot_i64(values, 1)?,
            label: slot_text(values, 2)?,
            normalized_number: slot_text(values, 3)?,
            formatted_number: None,
        }),
        mimetype::EMAIL => DataKind::Email(Email {
            address: slot_text(values, 0)?,
            kind: slot_i64(values, 1)?,
            label: slot_text(values, 2)?,
            display_name: slot_text(values, 3)?,
        }),
        mimetype::STRUCTURED_POSTAL => DataKind::StructuredPostal(StructuredPostal {
            formatted_address: slot_text(values, 0)?,
            kind: slot_i64(values, 1)?,
            label: slot_text(values, 2)?,
            street: slot_text(values, 3)?,
            pobox: slot_text(values, 4)?,
            neighborhood: slot_text(values, 5)?,
            city: slot_text(values, 6)?,
            region: slot_text(values, 7)?,
            postcode: slot_text(values, 8)?,
            country: slot_text(values, 9)?,
        }),
        mimetype::ORGANIZATION => DataKind::Organization(Organization {
            company: slot_text(values, 0)?,
            kind: slot_i64(values, 1)?,
            label: slot_text(values, 2)?,
            title: slot_text(values, 3)?,
            department: slot_text(values, 4)?,
            job_description: slot_text(values, 5)?,
            symbol: slot_text(values, 6)?,
            phonetic_name: slot_text(values, 7)?,
            office_location: slot_text(values, 8)?,
        }),
        mimetype::PHOTO => DataKind::Photo(Photo {
            file_id: slot_i64(values, 13)?,
            thumbnail: slot_blob(values, 14)?,
        }),
        mimetype::NICKNAME => DataKind::Nickname(labeled(values)?),
        mimetype::IM => DataKind::Im(Im {
            data: slot_text(values, 0)?,
            kind: slot_i64(values, 1)?,
            label: slot_text(values, 2)?,
            protocol: slot_i64(values, 4)?,
            custom_protocol: slot_text(values, 5)?,
        }),
        mimetype::WEBSITE => DataKind::Website(labeled(values)?),
        mimetype::NOTE => DataKind::Note(Note {
            note: slot_text(values, 0)?,
        }),
        mimetype::GROUP_MEMBERSHIP => DataKind::GroupMembership(GroupMembership {
            group_row_id: slot_i64(values, 0)?,
            group_source_id: get_text(values, columns::GROUP_SOURCE_ID),
        }),
        mimetype::SIP_ADDRESS => DataKind::SipAddress(labeled(values)?),
        mimetype::RELATION => DataKind::Relation(labeled(values)?),
        mimetype::EVENT => DataKind::Event(labeled(values)?),
        mimetype::IDENTITY => DataKind::Identity(Identity {
            identity: slot_text(values, 0)?,
            namespace: slot_text(values, 1)?,
        }),
        _ => DataKind::Custom(Custom {
            mimetype: mime.clone(),
            slots: columns::DATA
                .iter()
                .map(|c| values.get(*c).cloned().unwrap_or_default())
                .collect(),
        }),
    };
    Ok(kind)
}

/// Writes the mimetype and the populated slots of `kind`.
pub fn encode_kind(kind: &DataKind) -> RowValues {
    let mut values = RowValues::new();
    values.insert(columns::MIMETYPE.to_string(), Value::from(kind.mimetype()));
    let mut put = |slot: usize, value: Value| {
        if !value.is_null() {
            values.insert(columns::DATA[slot].to_string(), value);
        }
    };
    match kind {
        DataKind::StructuredName(name) => {
            put(0, name.display_name.clone().into());
            put(1, name.given_name.clone().into());
            put(2, name.family_name.clone().into());
            put(3, name.prefix.clone().into());
            put(4, name.middle_name.clone().into());
            put(5, name.suffix.clone().into());
            put(6, name.phonetic_given_name.clone().into());
            put(7, name.phonetic_middle_name.clone().into());
            put(8, name.phonetic_family_name.clone().into());
        }
        DataKind::Phone(phone) => {
            put(0, phone.number.clone().into());
            put(1, phone.kind.into());
            put(2, phone.label.clone().into());
            put(3, phone.normalized_number.clone().into());
        }
        DataKind::Email(email) => {
            put(0, email.address.clone().into());
            put(1, email.kind.into());
            put(2, email.label.clone().into());
            put(3, email.display_name.clone().into());
        }
        DataKind::StructuredPostal(postal) => {
            put(0, postal.formatted_address.clone().into());
            put(1, postal.kind.into());
            put(2, postal.label.clone().into());
            put(3, postal.street.clone().into());
            put(4, postal.pobox.clone().into());
            put(5, postal.neighborhood.clone().into());
            put(6, postal.city.clone().into());
            put(7, postal.region.clone().into());
            put(8, postal.postcode.clone().into());
            put(9, postal.country.clone().into());
        }
        DataKind::Organization(org) => {
            put(0, org.company.clone().into());
            put(1, org.kind.into());
            put(2, org.label.clone().into());
            put(3, org.title.clone().into());
            put(4, org.department.clone().into());
            put(5, org.job_description.clone().into());
            put(6, org.symbol.clone().into());
            put(7, org.phonetic_name.clone().into());
            put(8, org.office_location.clone().into());
        }
        DataKind::Photo(photo) => {
            put(13, photo.file_id.into());
            put(14, photo.thumbnail.clone().into());
        }
        DataKind::Nickname(v)
        | DataKind::Website(v)
        | DataKind::SipAddress(v)
        | DataKind::Relation(v)
        | DataKind::Event(v) => {
            put(0, v.value.clone().into());
            put(1, v.kind.into());
            put(2, v.label.clone().into());
        }
        DataKind::Im(im) => {
            put(0, im.data.clone().into());
            put(1, im.kind.into());
            put(2, im.label.clone().into());
            put(4, im.protocol.into());
            put(5, im.custom_protocol.clone().into());
        }
        DataKind::Note(note) => put(0, note.note.clone().into()),
        DataKind::GroupMembership(membership) => {
            put(0, membership.group_row_id.into());
        }
        DataKind::Identity(identity) => {
            put(0, identity.identity.clone().into());
            put(1, identity.namespace.clone().into());
        }
        DataKind::Custom(custom) => {
            for (slot, value) in custom.slots.iter().enumerate().take(columns::DATA.len()) {
                put(slot, value.clone());
            }
        }
    }
    if let DataKind::GroupMembership(GroupMembership {
        group_source_id: Some(source_id),
        ..
    }) = kind
    {
        values.insert(
            columns::GROUP_SOURCE_ID.to_string(),
            Value::from(source_id.as_str()),
        );
    }
    values
}

impl DataItem {
    pub fn from_row(values: &RowValues) -> Result<Self, CodecError> {
        let mut sync: [Option<String>; 4] = Default::default();
        for (slot, column) in columns::DATA_SYNC.iter().enumerate() {
            sync[slot] = get_text(values, column);
        }
        Ok(Self {
            id: get_i64(values, columns::ID).map(DataId),
            raw_contact_id: get_i64(values, columns::RAW_CONTACT_ID).map(RawContactId),
            is_primary: get_bool(values, columns::IS_PRIMARY),
            is_super_primary: get_bool(values, columns::IS_SUPER_PRIMARY),
            version: get_i64(values, columns::DATA_VERSION).unwrap_or(0),
            sync,
            kind: decode_kind(values)?,
        })
    }

    pub fn to_row(&self) -> RowValues {
        let mut values = encode_kind(&self.kind);
        if let Some(id) = self.id {
            values.insert(columns::ID.to_string(), Value::Integer(id.0));
        }
        if let Some(raw) = self.raw_contact_id {
            values.insert(columns::RAW_CONTACT_ID.to_string(), Value::Integer(raw.0));
        }
        values.insert(columns::IS_PRIMARY.to_string(), self.is_primary.into());
        values.insert(
            columns::IS_SUPER_PRIMARY.to_string(),
            self.is_super_primary.into(),
        );
        values.insert(columns::DATA_VERSION.to_string(), self.version.into());
        for (slot, column) in columns::DATA_SYNC.iter().enumerate() {
            if let Some(sync) = &self.sync[slot] {
                values.insert(column.to_string(), Value::from(sync.as_str()));
            }
        }
        values
    }
}

pub fn account_from_row(values: &RowValues) -> Account {
    Account {
        name: get_text(values, columns::ACCOUNT_NAME),
        account_type: get_text(values, columns::ACCOUNT_TYPE),
        data_set: get_text(values, columns::DATA_SET),
    }
}

pub fn account_to_row(account: &Account, values: &mut RowValues) {
    values.insert(columns::ACCOUNT_NAME.to_string(), account.name.clone().into());
    values.insert(
        columns::ACCOUNT_TYPE.to_string(),
        account.account_type.clone().into(),
    );
    values.insert(columns::DATA_SET.to_string(), account.data_set.clone().into());
}

impl RawContact {
    /// Decodes the raw contact header; data rows are attached separately.
    pub fn from_row(values: &RowValues) -> Result<Self, CodecError> {
        let id = get_i64(values, columns::ID).ok_or(CodecError::MissingColumn(columns::ID))?;
        let mut sync: [Option<String>; 4] = Default::default();
        for (slot, column) in columns::SYNC.iter().enumerate() {
            sync[slot] = get_text(values, column);
        }
        Ok(Self {
            id: RawContactId(id),
            contact_id: get_i64(values, columns::CONTACT_ID).map(ContactId),
            account: account_from_row(values),
            dirty: get_bool(values, columns::DIRTY),
            version: get_i64(values, columns::VERSION).unwrap_or(0),
            deleted: get_bool(values, columns::DELETED),
            source_id: get_text(values, columns::SOURCE_ID),
            sync,
            starred: get_bool(values, columns::STARRED),
            name_verified: get_bool(values, columns::NAME_VERIFIED),
            data: Vec::new(),
        })
    }

    pub fn to_row(&self) -> RowValues {
        let mut values = RowValues::new();
        values.insert(columns::ID.to_string(), Value::Integer(self.id.0));
        if let Some(contact_id) = self.contact_id {
            values.insert(columns::CONTACT_ID.to_string(), Value::Integer(contact_id.0));
        }
        account_to_row(&self.account, &mut values);
        values.insert(columns::DIRTY.to_string(), self.dirty.into());
        values.insert(columns::VERSION.to_string(), self.version.into());
        values.insert(columns::DELETED.to_string(), self.deleted.into());
        values.insert(columns::SOURCE_ID.to_string(), self.source_id.clone().into());
        for (slot, column) in columns::SYNC.iter().enumerate() {
            values.insert(column.to_string(), self.sync[slot].clone().into());
        }
        values.insert(columns::STARRED.to_string(), self.starred.into());
        values.insert(columns::NAME_VERIFIED.to_string(), self.name_verified.into());
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> RowValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_decode_phone_row() {
        let values = row(&[
            (columns::ID, Value::Integer(7)),
            (columns::RAW_CONTACT_ID, Value::Integer(3)),
            (columns::MIMETYPE, Value::from(mimetype::PHONE)),
            ("data1", Value::from("555-0100")),
            ("data2", Value::from("2")),
            (columns::IS_SUPER_PRIMARY, Value::Integer(1)),
        ]);
        let item = DataItem::from_row(&values).unwrap();
        assert_eq!(item.id, Some(DataId(7)));
        assert_eq!(item.raw_contact_id, Some(RawContactId(3)));
        assert!(item.is_super_primary);
        match &item.kind {
            DataKind::Phone(phone) => {
                assert_eq!(phone.number.as_deref(), Some("555-0100"));
                assert_eq!(phone.kind, Some(2));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_photo_slots() {
        let kind = DataKind::Photo(Photo {
            file_id: Some(11),
            thumbnail: Some(vec![1, 2, 3]),
        });
        let values = encode_kind(&kind);
        assert_eq!(values.get("data14"), Some(&Value::Integer(11)));
        assert_eq!(values.get("data15"), Some(&Value::Blob(vec![1, 2, 3])));
        assert_eq!(decode_kind(&values).unwrap(), kind);
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let values = row(&[
            (columns::MIMETYPE, Value::from(mimetype::PHOTO)),
            ("data15", Value::from("not bytes")),
        ]);
        assert!(matches!(
            decode_kind(&values),
            Err(CodecError::WrongType { expected: "blob", .. })
        ));
    }

    #[test]
    fn test_unknown_mimetype_is_custom() {
        let values = row(&[
            (columns::MIMETYPE, Value::from("vnd.example/loyalty")),
            ("data3", Value::from("gold")),
        ]);
        let kind = decode_kind(&values).unwrap();
        match &kind {
            DataKind::Custom(custom) => {
                assert_eq!(custom.slots.len(), 15);
                assert_eq!(custom.slots[2], Value::from("gold"));
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(encode_kind(&kind), values);
    }

    #[test]
    fn test_writable_columns() {
        let mut values = row(&[
            (columns::MIMETYPE, Value::from(mimetype::NOTE)),
            ("data1", Value::from("hello")),
            (columns::IS_SUPER_PRIMARY, Value::Integer(1)),
            (columns::RAW_CONTACT_ID, Value::Integer(9)),
        ]);
        match check_writable(&values) {
            Err(CodecError::NotWritable(cols)) => {
                assert_eq!(cols, vec!["is_super_primary", "raw_contact_id"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        retain_writable(&mut values);
        assert!(check_writable(&values).is_ok());
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_empty_data_detection() {
        let blank = row(&[
            (columns::MIMETYPE, Value::from(mimetype::EMAIL)),
            ("data1", Value::from("  ")),
            ("data2", Value::Null),
        ]);
        assert!(is_empty_data(&blank));
        let filled = row(&[("data2", Value::Integer(1))]);
        assert!(!is_empty_data(&filled));
    }

    #[test]
    fn test_raw_contact_header() {
        let mut raw = RawContact::new(RawContactId(4), Account::new("a@example.com", "com.example"));
        raw.version = 6;
        raw.starred = true;
        let decoded = RawContact::from_row(&raw.to_row()).unwrap();
        assert_eq!(decoded.id, RawContactId(4));
        assert_eq!(decoded.version, 6);
        assert!(decoded.starred);
        assert_eq!(decoded.account.account_type.as_deref(), Some("com.example"));
    }
}
