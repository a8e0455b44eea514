use crossbeam_channel::bounded;
use rolodex_rs::kinds::{DataKind, Phone, StructuredName};
use rolodex_rs::notify::BroadcastTag;
use rolodex_rs::{
    Account, Broadcast, ContactError, ContactRef, ContactStore, LoadResult, MemoryStore,
    RequestKind, Rolodex, RolodexConfig, StaticAccountTypes,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn person(name: &str, number: &str) -> Vec<DataKind> {
    vec![
        DataKind::StructuredName(StructuredName {
            display_name: Some(name.to_string()),
            ..Default::default()
        }),
        DataKind::Phone(Phone {
            number: Some(number.to_string()),
            ..Default::default()
        }),
    ]
}

fn rolodex(store: Arc<MemoryStore>) -> anyhow::Result<Rolodex> {
    Ok(Rolodex::new(
        store,
        Arc::new(StaticAccountTypes::new()),
        RolodexConfig::default(),
    )?)
}

#[test]
fn join_then_load_through_the_worker() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let a = store.insert_raw_contact(&Account::local(), &person("Ada", "111"))?;
    let b = store.insert_raw_contact(&Account::new("ada@mail", "com.mail"), &person("Countess", "222"))?;
    let rolodex = rolodex(store.clone())?;
    let (_, links) = rolodex.subscribe(&[BroadcastTag::LinkComplete]);

    let contacts = vec![
        store.contact_id_of(a).expect("a"),
        store.contact_id_of(b).expect("b"),
    ];
    let outcome = rolodex.join(contacts)?.wait()?;
    assert!(outcome.succeeded());
    assert_eq!(outcome.display_name.as_deref(), Some("Ada"));
    let lookup = match links.recv_timeout(WAIT)? {
        Broadcast::LinkComplete { lookup } => lookup.expect("joined contact resolves"),
        other => panic!("unexpected broadcast {other:?}"),
    };

    let (handle, _photos) = rolodex.load(lookup)?;
    let result = handle.wait()?;
    let contact = result.contact().expect("joined contact loads");
    assert_eq!(contact.raw_contact_ids(), vec![a, b]);
    Ok(())
}

#[test]
fn group_delete_broadcast_carries_undo() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let account = Account::new("me@mail", "com.mail");
    let member = store.insert_raw_contact(&account, &person("Member", "1"))?;
    let rolodex = rolodex(store.clone())?;
    let (_, deletes) = rolodex.subscribe(&[BroadcastTag::GroupDeleted]);

    let group = rolodex
        .create_group(account.clone(), "Friends".to_string(), vec![member])?
        .wait()?;
    rolodex.delete_group(group)?.wait()?;
    let event = deletes.recv_timeout(WAIT)?;
    assert!(event.can_undo());
    let payload = event.undo_payload().cloned().expect("undo payload");

    let restored = rolodex.undo_group_delete(payload)?.wait()?;
    assert_eq!(store.query_group_members(restored)?, vec![member]);
    assert!(matches!(
        rolodex.rename_group(group, "Gone".to_string())?.wait(),
        Err(ContactError::NotFound)
    ));
    Ok(())
}

#[test]
fn dropped_handle_cancels_queued_request() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let raw = store.insert_raw_contact(&Account::local(), &person("Quiet", "9"))?;
    let contact = store.contact_id_of(raw).expect("contact");
    let rolodex = rolodex(store.clone())?;

    let (release, gate) = bounded::<()>(0);
    let blocker = rolodex.service().submit(RequestKind::Edit, move |_cancel| {
        let _ = gate.recv();
        Ok(())
    })?;
    drop(rolodex.set_starred(contact, true)?);
    release.send(())?;
    blocker.wait()?;

    let followup = rolodex.set_send_to_voicemail(contact, true)?;
    followup.wait()?;
    let row = store.raw_contact_row(raw).expect("raw contact");
    assert!(!rolodex_rs::codec::get_bool(&row, rolodex_rs::codec::columns::STARRED));
    assert!(rolodex_rs::codec::get_bool(&row, rolodex_rs::codec::columns::SEND_TO_VOICEMAIL));
    Ok(())
}

#[test]
fn service_state_is_broadcast() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let raw = store.insert_raw_contact(&Account::local(), &person("Busy", "5"))?;
    let rolodex = rolodex(store.clone())?;
    let (_, states) = rolodex.subscribe(&[BroadcastTag::ServiceStateChanged]);

    let contact = store.contact_id_of(raw).expect("contact");
    rolodex.set_starred(contact, true)?.wait()?;

    let first = states.recv_timeout(WAIT)?;
    assert_eq!(
        first,
        Broadcast::ServiceStateChanged {
            pending: vec![RequestKind::Edit]
        }
    );
    let second = states.recv_timeout(WAIT)?;
    assert_eq!(second, Broadcast::ServiceStateChanged { pending: vec![] });
    assert!(rolodex.service().state().is_idle());
    Ok(())
}

#[test]
fn watcher_reloads_after_commit() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let raw = store.insert_raw_contact(&Account::local(), &person("Watched", "7"))?;
    let contact = store.contact_id_of(raw).expect("contact");
    let rolodex = rolodex(store.clone())?;

    let watcher = rolodex.watch(ContactRef::RawContact(raw))?;
    let initial = watcher.recv_timeout(WAIT).expect("initial snapshot");
    assert!(!initial.contact().expect("loaded").starred);

    rolodex.set_starred(contact, true)?.wait()?;
    let mut starred = false;
    while let Some(result) = watcher.recv_timeout(WAIT) {
        if let LoadResult::Loaded(snapshot) = result {
            if snapshot.starred {
                starred = true;
                break;
            }
        }
    }
    assert!(starred, "watcher never delivered the starred snapshot");

    store.apply_batch(&[rolodex_rs::ops::Operation::delete(rolodex_rs::ops::Table::Contacts)
        .with_id(contact.0)])?;
    let mut gone = false;
    while let Some(result) = watcher.recv_timeout(WAIT) {
        if result.is_not_found() {
            gone = true;
            break;
        }
    }
    assert!(gone, "watcher never reported the deleted contact");
    Ok(())
}

#[test]
fn load_missing_contact_is_not_found() -> anyhow::Result<()> {
    let rolodex = rolodex(Arc::new(MemoryStore::new()))?;
    let (handle, _) = rolodex.load(ContactRef::RawContact(rolodex_rs::RawContactId(404)))?;
    assert!(handle.wait()?.is_not_found());
    Ok(())
}
