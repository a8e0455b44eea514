use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec::columns;
use crate::kinds::{DataKind, Email, Note, Phone, StructuredName};
use crate::memory::MemoryStore;
use crate::model::{Account, RawContactId};
use crate::ops::{Operation, Table};

const ACCOUNTS: [(&str, &str); 3] = [
    ("me@mail.example", "com.example.mail"),
    ("me", "com.example.chat"),
    ("me@work.example", "com.example.exchange"),
];

#[derive(Debug, Clone)]
pub struct GeneratedBook {
    pub raw_contacts: Vec<RawContactId>,
    pub accounts: Vec<Account>,
}

pub fn book_accounts() -> Vec<Account> {
    let mut accounts: Vec<Account> = ACCOUNTS
        .iter()
        .map(|(name, account_type)| Account::new(name, account_type))
        .collect();
    accounts.push(Account::local());
    accounts
}

/// Fills `store` with `count` raw contacts. With `overlap_probability` a raw
/// contact reuses an earlier person's name, so the store's aggregation puts
/// both into one contact.
pub fn generate_address_book(
    store: &MemoryStore,
    count: u32,
    overlap_probability: f64,
    seed: u64,
) -> GeneratedBook {
    let mut rng = StdRng::seed_from_u64(seed);
    let accounts = book_accounts();
    let mut raw_contacts = Vec::with_capacity(count as usize);

    for i in 1..=count {
        let account = &accounts[rng.random_range(0..accounts.len())];
        let person = if i > 1 && rng.random_bool(overlap_probability) {
            rng.random_range(1..i)
        } else {
            i
        };
        let mut kinds = vec![DataKind::StructuredName(StructuredName {
            display_name: Some(format!("Person {person:06}")),
            given_name: Some("Person".to_string()),
            family_name: Some(format!("{person:06}")),
            ..Default::default()
        })];
        let digits = rng.random_range(0..10_000_000u32);
        kinds.push(DataKind::Phone(Phone {
            number: Some(format!("555-{digits:07}")),
            normalized_number: Some(format!("+1555{digits:07}")),
            kind: Some(2),
            ..Default::default()
        }));
        if rng.random_bool(0.5) {
            kinds.push(DataKind::Email(Email {
                address: Some(format!("person{person:06}@example.com")),
                ..Default::default()
            }));
        }
        let raw = store
            .insert_raw_contact(account, &kinds)
            .expect("generated raw contact");
        raw_contacts.push(raw);
    }

    GeneratedBook {
        raw_contacts,
        accounts,
    }
}

/// One raw contact insert followed by `count - 1` note inserts that
/// back-reference it.
pub fn generate_insert_ops(account: &Account, count: usize, seed: u64) -> Vec<Operation> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut raw = Operation::insert(Table::RawContacts);
    crate::codec::account_to_row(account, &mut raw.values);
    let mut ops = Vec::with_capacity(count);
    ops.push(raw);
    for i in 1..count {
        let note = DataKind::Note(Note {
            note: Some(format!("note {i} #{}", rng.random_range(0..1_000_000u32))),
        });
        ops.push(
            Operation::insert(Table::Data)
                .with_values(crate::codec::encode_kind(&note))
                .with_value_back_ref(columns::RAW_CONTACT_ID, 0),
        );
    }
    ops
}
