//! # Data Kinds
//!
//! One variant per mimetype. Each variant carries only the fields that make
//! sense for that kind; the generic slot layout lives in [`crate::codec`].

use crate::codec::Value;
use serde::{Deserialize, Serialize};

/// Mimetype tags as stored in the `mimetype` column.
pub mod mimetype {
    pub const STRUCTURED_NAME: &str = "vnd.android.cursor.item/name";
    pub const PHONE: &str = "vnd.android.cursor.item/phone_v2";
    pub const EMAIL: &str = "vnd.android.cursor.item/email_v2";
    pub const STRUCTURED_POSTAL: &str = "vnd.android.cursor.item/postal-address_v2";
    pub const ORGANIZATION: &str = "vnd.android.cursor.item/organization";
    pub const PHOTO: &str = "vnd.android.cursor.item/photo";
    pub const NICKNAME: &str = "vnd.android.cursor.item/nickname";
    pub const IM: &str = "vnd.android.cursor.item/im";
    pub const WEBSITE: &str = "vnd.android.cursor.item/website";
    pub const NOTE: &str = "vnd.android.cursor.item/note";
    pub const GROUP_MEMBERSHIP: &str = "vnd.android.cursor.item/group_membership";
    pub const SIP_ADDRESS: &str = "vnd.android.cursor.item/sip_address";
    pub const RELATION: &str = "vnd.android.cursor.item/relation";
    pub const EVENT: &str = "vnd.android.cursor.item/contact_event";
    pub const IDENTITY: &str = "vnd.android.cursor.item/identity";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredName {
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub prefix: Option<String>,
    pub middle_name: Option<String>,
    pub suffix: Option<String>,
    pub phonetic_given_name: Option<String>,
    pub phonetic_middle_name: Option<String>,
    pub phonetic_family_name: Option<String>,
}

impl StructuredName {
    /// Phonetic parts joined with single spaces, if any are present.
    pub fn phonetic_name(&self) -> Option<String> {
        let parts: Vec<&str> = [
            &self.phonetic_given_name,
            &self.phonetic_middle_name,
            &self.phonetic_family_name,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .filter(|p| !p.trim().is_empty())
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    /// "Family, Given" ordering, falling back to the display name.
    pub fn alternative_name(&self) -> Option<String> {
        match (&self.family_name, &self.given_name) {
            (Some(family), Some(given)) if !family.is_empty() && !given.is_empty() => {
                Some(format!("{family}, {given}"))
            }
            _ => self.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phone {
    pub number: Option<String>,
    pub kind: Option<i64>,
    pub label: Option<String>,
    pub normalized_number: Option<String>,
    /// Presentation form, filled in by the assembler on request. Never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_number: Option<String>,
}

impl Phone {
    /// Groups a normalized North American number as `+1 555-123-4567`;
    /// anything else is returned unchanged.
    pub fn format(&self) -> Option<String> {
        let normalized = self.normalized_number.as_deref();
        if let Some(digits) = normalized.and_then(|n| n.strip_prefix("+1")) {
            if digits.len() == 10 && digits.bytes().all(|b| b.is_ascii_digit()) {
                return Some(format!(
                    "+1 {}-{}-{}",
                    &digits[0..3],
                    &digits[3..6],
                    &digits[6..]
                ));
            }
        }
        self.number.clone().or_else(|| normalized.map(str::to_string))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub address: Option<String>,
    pub kind: Option<i64>,
    pub label: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredPostal {
    pub formatted_address: Option<String>,
    pub kind: Option<i64>,
    pub label: Option<String>,
    pub street: Option<String>,
    pub pobox: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub company: Option<String>,
    pub kind: Option<i64>,
    pub label: Option<String>,
    pub title: Option<String>,
    pub department: Option<String>,
    pub job_description: Option<String>,
    pub symbol: Option<String>,
    pub phonetic_name: Option<String>,
    pub office_location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    /// Id of the full-size photo file, if one was stored.
    pub file_id: Option<i64>,
    /// Inline thumbnail bytes.
    pub thumbnail: Option<Vec<u8>>,
}

/// Shape shared by kinds that are a single value plus a type/label pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labeled {
    pub value: Option<String>,
    pub kind: Option<i64>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Im {
    pub data: Option<String>,
    pub kind: Option<i64>,
    pub label: Option<String>,
    pub protocol: Option<i64>,
    pub custom_protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_row_id: Option<i64>,
    pub group_source_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub identity: Option<String>,
    pub namespace: Option<String>,
}

/// A mimetype this crate has no dedicated variant for. Slots are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Custom {
    pub mimetype: String,
    pub slots: Vec<Value>,
}

/// Typed payload of one data row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataKind {
    StructuredName(StructuredName),
    Phone(Phone),
    Email(Email),
    StructuredPostal(StructuredPostal),
    Organization(Organization),
    Photo(Photo),
    Nickname(Labeled),
    Im(Im),
    Website(Labeled),
    Note(Note),
    GroupMembership(GroupMembership),
    SipAddress(Labeled),
    Relation(Labeled),
    Event(Labeled),
    Identity(Identity),
    Custom(Custom),
}

impl DataKind {
    pub fn mimetype(&self) -> &str {
        match self {
            DataKind::StructuredName(_) => mimetype::STRUCTURED_NAME,
            DataKind::Phone(_) => mimetype::PHONE,
            DataKind::Email(_) => mimetype::EMAIL,
            DataKind::StructuredPostal(_) => mimetype::STRUCTURED_POSTAL,
            DataKind::Organization(_) => mimetype::ORGANIZATION,
            DataKind::Photo(_) => mimetype::PHOTO,
            DataKind::Nickname(_) => mimetype::NICKNAME,
            DataKind::Im(_) => mimetype::IM,
            DataKind::Website(_) => mimetype::WEBSITE,
            DataKind::Note(_) => mimetype::NOTE,
            DataKind::GroupMembership(_) => mimetype::GROUP_MEMBERSHIP,
            DataKind::SipAddress(_) => mimetype::SIP_ADDRESS,
            DataKind::Relation(_) => mimetype::RELATION,
            DataKind::Event(_) => mimetype::EVENT,
            DataKind::Identity(_) => mimetype::IDENTITY,
            DataKind::Custom(custom) => &custom.mimetype,
        }
    }

    /// The text a person would read as this row's value.
    pub fn primary_text(&self) -> Option<&str> {
        let text = match self {
            DataKind::StructuredName(name) => name.display_name.as_deref(),
            DataKind::Phone(phone) => phone.number.as_deref(),
            DataKind::Email(email) => email.address.as_deref(),
            DataKind::StructuredPostal(postal) => postal.formatted_address.as_deref(),
            DataKind::Organization(org) => org.company.as_deref().or(org.title.as_deref()),
            DataKind::Nickname(v)
            | DataKind::Website(v)
            | DataKind::SipAddress(v)
            | DataKind::Relation(v)
            | DataKind::Event(v) => v.value.as_deref(),
            DataKind::Im(im) => im.data.as_deref(),
            DataKind::Note(note) => note.note.as_deref(),
            DataKind::Identity(identity) => identity.identity.as_deref(),
            DataKind::Photo(_) | DataKind::GroupMembership(_) | DataKind::Custom(_) => None,
        };
        text.filter(|t| !t.trim().is_empty())
    }

    pub fn as_photo(&self) -> Option<&Photo> {
        match self {
            DataKind::Photo(photo) => Some(photo),
            _ => None,
        }
    }

    pub fn as_structured_name(&self) -> Option<&StructuredName> {
        match self {
            DataKind::StructuredName(name) => Some(name),
            _ => None,
        }
    }

    pub fn group_row_id(&self) -> Option<i64> {
        match self {
            DataKind::GroupMembership(membership) => membership.group_row_id,
            _ => None,
        }
    }
}
