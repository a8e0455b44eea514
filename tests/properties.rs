//! End-to-end checks of the engine's core guarantees: grouping, empty saves,
//! group undo, conflict convergence, join and split edge sets, batch slicing
//! and photo fallback.

mod support;

use rolodex_rs::aggregation::AggregationResultCode;
use rolodex_rs::codec::{columns, get_i64, Value};
use rolodex_rs::config::{ApplyTuning, LoaderConfig};
use rolodex_rs::delta::RawContactDeltaList;
use rolodex_rs::kinds::{DataKind, Note, Phone, Photo, StructuredName};
use rolodex_rs::model::{AggregationType, RawContactId};
use rolodex_rs::ops::{OpKind, Operation, Table};
use rolodex_rs::test_support::generate_insert_ops;
use rolodex_rs::{
    Account, AggregationManager, BatchApplier, CancelToken, ContactAssembler, ContactError,
    ContactRef, ContactStore, GroupManager, MemoryStore, NotificationGateway, SaveEngine,
    SaveRequest, StaticAccountTypes,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use support::FaultyStore;

fn name(display: &str) -> DataKind {
    DataKind::StructuredName(StructuredName {
        display_name: Some(display.to_string()),
        ..Default::default()
    })
}

fn note(text: &str) -> DataKind {
    DataKind::Note(Note {
        note: Some(text.to_string()),
    })
}

fn faulty() -> (Arc<MemoryStore>, Arc<FaultyStore>) {
    support::init_tracing();
    let inner = Arc::new(MemoryStore::new());
    let store = Arc::new(FaultyStore::new(Arc::clone(&inner)));
    (inner, store)
}

fn applier(store: Arc<FaultyStore>, max_batch: usize) -> BatchApplier {
    BatchApplier::new(
        store,
        ApplyTuning {
            max_batch,
            ..ApplyTuning::default()
        },
    )
}

fn exception_edges(ops: &[Operation]) -> BTreeSet<(i64, i64, i64)> {
    ops.iter()
        .filter(|op| op.table == Table::AggregationExceptions)
        .map(|op| {
            (
                get_i64(&op.values, columns::RAW_CONTACT_ID1).unwrap_or_default(),
                get_i64(&op.values, columns::RAW_CONTACT_ID2).unwrap_or_default(),
                get_i64(&op.values, columns::EXCEPTION_TYPE).unwrap_or_default(),
            )
        })
        .collect()
}

#[test]
fn assembler_groups_rows_per_raw_contact() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut raws = Vec::new();
    for (i, count) in [2usize, 0, 3].into_iter().enumerate() {
        let mut kinds = vec![name("Grace Hopper")];
        kinds.extend((0..count).map(|n| note(&format!("raw {i} note {n}"))));
        raws.push(store.insert_raw_contact(&Account::new(&format!("acct{i}"), "com.mail"), &kinds)?);
    }

    let mut assembler = ContactAssembler::new(
        store.clone(),
        Arc::new(StaticAccountTypes::new()),
        Arc::new(NotificationGateway::new()),
        LoaderConfig::default(),
    );
    let result = assembler.load(&ContactRef::RawContact(raws[1]));
    let contact = result.contact().expect("contact loads");
    assert_eq!(contact.raw_contact_ids(), raws);
    for (raw, expected) in contact.raw_contacts.iter().zip([3usize, 1, 4]) {
        assert_eq!(raw.data.len(), expected);
        assert!(raw.data.iter().all(|item| item.raw_contact_id == Some(raw.id)));
    }
    Ok(())
}

#[test]
fn empty_delta_saves_without_side_effects() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let raw = inner.insert_raw_contact(&Account::local(), &[name("Idle"), note("unchanged")])?;
    let version = inner.raw_contact_version(raw);
    let baseline = RawContactDeltaList::from_entities(store.query_raw_contacts(&[raw], false)?, false);

    let engine = SaveEngine::new(applier(store.clone(), 499), Arc::new(StaticAccountTypes::new()));
    let outcome = engine.save(SaveRequest::new(baseline), &CancelToken::new());
    assert!(outcome.succeeded(), "{:?}", outcome.result);
    assert_eq!(outcome.operations, 0);
    assert!(store.batch_sizes().is_empty());
    assert_eq!(inner.raw_contact_version(raw), version);
    Ok(())
}

#[test]
fn group_delete_then_undo_restores_members() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let account = Account::new("me@mail", "com.mail");
    let members: Vec<RawContactId> = (0..3)
        .map(|i| inner.insert_raw_contact(&account, &[name(&format!("Member {i}"))]))
        .collect::<Result<_, _>>()?;
    let groups = GroupManager::new(applier(store.clone(), 499), Arc::new(NotificationGateway::new()));
    let cancel = CancelToken::new();

    let group = groups.create(&account, "Book club", &members, &cancel)?;
    let payload = groups.delete(group, &cancel)?;
    assert!(store.query_group(group)?.is_none());

    let restored = groups.undo(&payload, &cancel)?;
    assert_ne!(restored, group);
    let row = store.query_group(restored)?.expect("restored group");
    assert_eq!(row.title.as_deref(), Some("Book club"));
    assert_eq!(row.account, account);
    assert_eq!(store.query_group_members(restored)?, members);
    Ok(())
}

#[test]
fn version_conflict_rebases_then_gives_up() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let raw = inner.insert_raw_contact(&Account::local(), &[name("Edsger"), note("draft")])?;
    let engine = SaveEngine::new(applier(store.clone(), 499), Arc::new(StaticAccountTypes::new()));

    let edit = |state: &mut RawContactDeltaList, text: &str| {
        let delta = state.by_raw_contact_id_mut(raw).expect("loaded raw contact");
        let note_id = delta
            .entries()
            .find(|entry| entry.mimetype().as_deref() == Some(rolodex_rs::kinds::mimetype::NOTE))
            .and_then(|entry| entry.id())
            .expect("note row");
        delta
            .entry_mut(note_id)
            .expect("note entry")
            .put(columns::DATA[0], text);
    };

    let mut state = RawContactDeltaList::from_entities(store.query_raw_contacts(&[raw], false)?, false);
    edit(&mut state, "final");
    // A concurrent writer advances the raw contact's version.
    inner.apply_batch(&[Operation::update(Table::RawContacts)
        .with_id(raw.0)
        .with_value(columns::STARRED, true)])?;

    let outcome = engine.save(SaveRequest::new(state), &CancelToken::new());
    assert!(outcome.succeeded(), "{:?}", outcome.result);
    assert_eq!(outcome.attempts, 2);
    let rows = inner.data_rows(raw);
    assert!(rows
        .iter()
        .any(|row| row.get(columns::DATA[0]) == Some(&Value::from("final"))));

    let mut state = RawContactDeltaList::from_entities(store.query_raw_contacts(&[raw], false)?, false);
    edit(&mut state, "never lands");
    store.always_conflict(true);
    store.reset_batches();
    let outcome = engine.save(SaveRequest::new(state), &CancelToken::new());
    assert_eq!(outcome.attempts, 3);
    assert!(matches!(outcome.result, Err(ContactError::StoreConflict(_))));
    assert_eq!(store.batch_sizes().len(), 3);
    assert!(!inner
        .data_rows(raw)
        .iter()
        .any(|row| row.get(columns::DATA[0]) == Some(&Value::from("never lands"))));
    Ok(())
}

#[test]
fn join_writes_every_ordered_pair() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let r1 = inner.insert_raw_contact(&Account::local(), &[name("Alan Turing")])?;
    let r2 = inner.insert_raw_contact(&Account::new("alan@mail", "com.mail"), &[name("Alan Turing")])?;
    let r3 = inner.insert_raw_contact(&Account::local(), &[name("A. M. Turing")])?;
    let c1 = inner.contact_id_of(r1).expect("c1");
    assert_eq!(inner.contact_id_of(r2), Some(c1));
    let c2 = inner.contact_id_of(r3).expect("c2");
    assert_ne!(c1, c2);

    let manager = AggregationManager::new(applier(store.clone(), 499), Arc::new(NotificationGateway::new()));
    let outcome = manager.join(&[c1, c2], &CancelToken::new());
    assert_eq!(outcome.code, AggregationResultCode::ContactsLinked);

    let together = AggregationType::KeepTogether.code();
    let ids = [r1.0, r2.0, r3.0];
    let expected: BTreeSet<(i64, i64, i64)> = ids
        .iter()
        .flat_map(|a| ids.iter().filter(move |b| *b != a).map(move |b| (*a, *b, together)))
        .collect();
    let submitted = store.submitted();
    assert_eq!(exception_edges(&submitted), expected);
    assert_eq!(
        submitted
            .iter()
            .filter(|op| op.table == Table::AggregationExceptions)
            .count(),
        6
    );
    assert!(submitted
        .iter()
        .any(|op| op.table == Table::Data && op.kind == OpKind::Update));
    assert_eq!(inner.contact_id_of(r3), inner.contact_id_of(r1));
    Ok(())
}

#[test]
fn hard_split_only_separates_across_clusters() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let r1 = inner.insert_raw_contact(&Account::local(), &[name("Twin")])?;
    let r2 = inner.insert_raw_contact(&Account::new("t@mail", "com.mail"), &[name("Twin")])?;
    let r3 = inner.insert_raw_contact(&Account::new("t@chat", "com.chat"), &[name("Twin")])?;
    assert_eq!(inner.contact_count(), 1);

    let manager = AggregationManager::new(applier(store.clone(), 499), Arc::new(NotificationGateway::new()));
    let outcome = manager.split(&[vec![r1, r2], vec![r3]], true, &CancelToken::new());
    assert_eq!(outcome.code, AggregationResultCode::ContactsSplit);

    let separate = AggregationType::KeepSeparate.code();
    let expected = BTreeSet::from([(r1.0, r3.0, separate), (r2.0, r3.0, separate)]);
    assert_eq!(exception_edges(&store.submitted()), expected);
    assert_eq!(inner.aggregation_exception(r1, r2), None);
    assert_eq!(inner.contact_id_of(r1), inner.contact_id_of(r2));
    assert_ne!(inner.contact_id_of(r1), inner.contact_id_of(r3));
    Ok(())
}

#[test]
fn soft_split_hands_cross_pairs_back_to_the_store() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let r1 = inner.insert_raw_contact(&Account::local(), &[name("Twin")])?;
    let r2 = inner.insert_raw_contact(&Account::new("t@mail", "com.mail"), &[name("Twin")])?;
    let r3 = inner.insert_raw_contact(&Account::new("t@chat", "com.chat"), &[name("Other")])?;
    inner.apply_batch(&[
        Operation::aggregation_exception(AggregationType::KeepSeparate, r1, r3),
        Operation::aggregation_exception(AggregationType::KeepSeparate, r2, r3),
    ])?;
    assert_eq!(inner.aggregation_exception(r1, r3), Some(AggregationType::KeepSeparate));

    let manager = AggregationManager::new(applier(store.clone(), 499), Arc::new(NotificationGateway::new()));
    let outcome = manager.split(&[vec![r1, r2], vec![r3]], false, &CancelToken::new());
    assert_eq!(outcome.code, AggregationResultCode::ContactsSplit);

    let automatic = AggregationType::Automatic.code();
    let expected = BTreeSet::from([(r1.0, r3.0, automatic), (r2.0, r3.0, automatic)]);
    assert_eq!(exception_edges(&store.submitted()), expected);
    assert_eq!(inner.aggregation_exception(r1, r3), None);
    assert_eq!(inner.aggregation_exception(r2, r3), None);
    assert_eq!(inner.contact_id_of(r1), inner.contact_id_of(r2));
    assert_ne!(inner.contact_id_of(r1), inner.contact_id_of(r3));
    Ok(())
}

#[test]
fn profile_save_rebases_within_the_profile() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let raw = inner.insert_profile_raw_contact(&Account::local(), &[name("Me"), note("draft")])?;
    let mut state = RawContactDeltaList::from_entities(store.query_raw_contacts(&[raw], true)?, true);
    let delta = state.by_raw_contact_id_mut(raw).expect("profile raw contact");
    let note_id = delta
        .entries()
        .find(|entry| entry.mimetype().as_deref() == Some(rolodex_rs::kinds::mimetype::NOTE))
        .and_then(|entry| entry.id())
        .expect("note row");
    delta
        .entry_mut(note_id)
        .expect("note entry")
        .put(columns::DATA[0], "mine");

    inner.apply_batch(&[Operation::update(Table::RawContacts)
        .with_id(raw.0)
        .with_value(columns::STARRED, true)
        .for_profile(true)])?;

    let engine = SaveEngine::new(applier(store.clone(), 499), Arc::new(StaticAccountTypes::new()));
    let outcome = engine.save(SaveRequest::new(state), &CancelToken::new());
    assert!(outcome.succeeded(), "{:?}", outcome.result);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.lookup, Some(ContactRef::Profile));
    let submitted = store.submitted();
    assert!(!submitted.is_empty());
    assert!(submitted.iter().all(|op| op.profile));
    assert!(inner
        .data_rows(raw)
        .iter()
        .any(|row| row.get(columns::DATA[0]) == Some(&Value::from("mine"))));
    Ok(())
}

#[test]
fn large_apply_is_sliced_in_order() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let ops = generate_insert_ops(&Account::local(), 1200, 7);
    let applier = applier(store.clone(), 499);

    let results = applier.apply(&ops, &CancelToken::new())?;
    assert_eq!(results.len(), 1200);
    assert_eq!(store.batch_sizes(), vec![499, 499, 202]);
    let raw = RawContactId(results[0].id.expect("raw contact id"));
    assert_eq!(inner.data_rows(raw).len(), 1199);
    Ok(())
}

#[test]
fn failed_sub_batch_stops_the_apply() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let ops = generate_insert_ops(&Account::local(), 1200, 7);
    store.fail_batch(2);

    let err = applier(store.clone(), 499)
        .apply(&ops, &CancelToken::new())
        .expect_err("second sub-batch fails");
    assert!(matches!(err, ContactError::StoreConflict(_)));
    assert_eq!(store.batch_sizes(), vec![499, 499]);
    // The first sub-batch stays committed.
    assert_eq!(inner.contact_count(), 1);
    Ok(())
}

#[test]
fn photo_read_failure_falls_back_to_inline_bytes() -> anyhow::Result<()> {
    let (inner, store) = faulty();
    let raw = inner.insert_raw_contact(
        &Account::local(),
        &[
            name("Ansel"),
            DataKind::Phone(Phone {
                number: Some("555".to_string()),
                ..Default::default()
            }),
            DataKind::Photo(Photo::default()),
        ],
    )?;
    let full: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    inner.write_display_photo(raw, &full)?;
    store.fail_photo_reads(true);

    let mut assembler = ContactAssembler::new(
        store.clone(),
        Arc::new(StaticAccountTypes::new()),
        Arc::new(NotificationGateway::new()),
        LoaderConfig::default(),
    );
    let result = assembler.load(&ContactRef::RawContact(raw));
    let contact = result.contact().expect("load succeeds despite photo failure");
    assert!(contact.photo_uri.is_some());
    assert_eq!(contact.photo.as_deref(), Some(&full[..4096]));

    store.fail_photo_reads(false);
    let result = assembler.load(&ContactRef::RawContact(raw));
    assert_eq!(result.contact().and_then(|c| c.photo.clone()), Some(full));
    Ok(())
}
