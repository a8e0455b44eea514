//! # Encoded Directory Contacts
//!
//! A remote directory may hand out a contact by value, as a JSON object, rather
//! than by a key the local store can resolve. This module turns that object
//! into a [`Contact`] snapshot with a single synthetic raw contact.

use crate::codec::{columns, RowValues, Value};
use crate::model::{
    Account, Contact, ContactId, ContactRef, DataItem, DirectoryId, DirectoryMetaData,
    DisplayNameSource, ExportSupport, RawContact, RawContactId,
};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;

pub const DISPLAY_NAME: &str = "display_name";
pub const DISPLAY_NAME_ALTERNATIVE: &str = "display_name_alt";
pub const DISPLAY_NAME_SOURCE: &str = "display_name_source";
pub const PHOTO_URI: &str = "photo_uri";
pub const EXPORT_SUPPORT: &str = "exportSupport";
/// Key of the object holding the contact's data rows, keyed by mimetype.
pub const CONTACT_ITEM_TYPE: &str = "vnd.android.cursor.item/contact";

/// Id given to the synthetic raw contact and its data rows.
const SYNTHETIC_ID: i64 = -1;

/// Decodes `json` into a snapshot served by `directory_id`.
pub fn decode_encoded_contact(
    requested: &ContactRef,
    directory_id: DirectoryId,
    json: &str,
) -> Result<Contact> {
    let root: Json = serde_json::from_str(json).context("encoded contact is not valid JSON")?;
    let root = root
        .as_object()
        .ok_or_else(|| anyhow!("encoded contact must be a JSON object"))?;

    let display_name = optional_text(root, DISPLAY_NAME);
    let alt_display_name = optional_text(root, DISPLAY_NAME_ALTERNATIVE).or_else(|| display_name.clone());
    let display_name_source = root
        .get(DISPLAY_NAME_SOURCE)
        .and_then(Json::as_i64)
        .map(DisplayNameSource::from_code)
        .ok_or_else(|| anyhow!("encoded contact has no {DISPLAY_NAME_SOURCE}"))?;

    let account_name = optional_text(root, columns::ACCOUNT_NAME);
    let directory = match account_name {
        Some(name) => {
            let account_type = optional_text(root, columns::ACCOUNT_TYPE).ok_or_else(|| {
                anyhow!("encoded contact names an account without {}", columns::ACCOUNT_TYPE)
            })?;
            DirectoryMetaData {
                display_name: None,
                directory_type: None,
                account_type: Some(account_type),
                account_name: Some(name),
                export_support: export_support(root, ExportSupport::SameAccountOnly),
            }
        }
        None => DirectoryMetaData {
            display_name: None,
            directory_type: None,
            account_type: None,
            account_name: None,
            export_support: export_support(root, ExportSupport::AnyAccount),
        },
    };

    let mut raw_contact = RawContact::new(RawContactId(SYNTHETIC_ID), Account::local());
    raw_contact.contact_id = Some(ContactId(SYNTHETIC_ID));
    let items = root
        .get(CONTACT_ITEM_TYPE)
        .and_then(Json::as_object)
        .ok_or_else(|| anyhow!("encoded contact has no {CONTACT_ITEM_TYPE} object"))?;
    for (mimetype, records) in items {
        match records {
            Json::Object(record) => raw_contact.data.push(decode_record(mimetype, record)?),
            Json::Array(records) => {
                for record in records {
                    let record = record
                        .as_object()
                        .ok_or_else(|| anyhow!("{mimetype} entries must be objects"))?;
                    raw_contact.data.push(decode_record(mimetype, record)?);
                }
            }
            _ => bail!("{mimetype} must be an object or an array of objects"),
        }
    }

    Ok(Contact {
        requested: requested.clone(),
        lookup: requested.clone(),
        id: ContactId(SYNTHETIC_ID),
        lookup_key: None,
        directory_id,
        name_raw_contact_id: None,
        display_name_source,
        display_name,
        alt_display_name,
        phonetic_name: None,
        photo_id: None,
        photo_uri: optional_text(root, PHOTO_URI),
        starred: false,
        presence: None,
        send_to_voicemail: false,
        custom_ringtone: None,
        is_user_profile: false,
        raw_contacts: vec![raw_contact],
        statuses: BTreeMap::new(),
        invitable_account_types: None,
        directory: Some(directory),
        groups: None,
        stream_items: None,
        photo: None,
        thumbnail: None,
    })
}

fn optional_text(object: &Map<String, Json>, key: &str) -> Option<String> {
    object.get(key).and_then(Json::as_str).map(str::to_string)
}

fn export_support(object: &Map<String, Json>, default: ExportSupport) -> ExportSupport {
    object
        .get(EXPORT_SUPPORT)
        .and_then(Json::as_i64)
        .map_or(default, ExportSupport::from_code)
}

/// Only string and integer values are carried over.
fn decode_record(mimetype: &str, record: &Map<String, Json>) -> Result<DataItem> {
    let mut values = RowValues::new();
    for (column, value) in record {
        match value {
            Json::String(text) => {
                values.insert(column.clone(), Value::Text(text.clone()));
            }
            Json::Number(number) => {
                if let Some(integer) = number.as_i64() {
                    values.insert(column.clone(), Value::Integer(integer));
                }
            }
            _ => {}
        }
    }
    values.insert(columns::MIMETYPE.to_string(), Value::from(mimetype));
    values.insert(columns::ID.to_string(), Value::Integer(SYNTHETIC_ID));
    DataItem::from_row(&values).with_context(|| format!("bad {mimetype} record"))
}
