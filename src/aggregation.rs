//! # Aggregation Exceptions
//!
//! Join and split rewrite the pairwise edge set that decides which raw
//! contacts share a contact. Nothing is kept between calls: every request
//! reads membership from the store, writes its edges and reports an
//! [`AggregationOutcome`].
//!
//! Edge construction is quadratic in the number of raw contacts involved.
//! Large requests are flushed in chunks of at most the configured batch
//! ceiling; a failed chunk stops the request and leaves earlier chunks
//! committed.

use crate::apply::BatchApplier;
use crate::codec::columns;
use crate::error::{ContactError, ContactResult};
use crate::kinds::mimetype;
use crate::model::{AggregationType, ContactId, ContactRef, RawContactId};
use crate::notify::{Broadcast, NotificationGateway};
use crate::ops::{Operation, Table};
use crate::store::{lookup_ref_for_raw, ContactStore, ContactTarget};
use crate::worker::CancelToken;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result code carried by every aggregation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationResultCode {
    StoreError,
    ContactsLinked,
    ContactsSplit,
    BadArguments,
}

impl AggregationResultCode {
    pub fn code(self) -> i64 {
        match self {
            AggregationResultCode::StoreError => 0,
            AggregationResultCode::ContactsLinked => 1,
            AggregationResultCode::ContactsSplit => 2,
            AggregationResultCode::BadArguments => 3,
        }
    }

    fn for_error(err: &ContactError) -> Self {
        match err {
            ContactError::BadArguments(_) => AggregationResultCode::BadArguments,
            _ => AggregationResultCode::StoreError,
        }
    }
}

#[derive(Debug)]
pub struct AggregationOutcome {
    pub code: AggregationResultCode,
    /// Joined contact, when it resolves after the write.
    pub lookup: Option<ContactRef>,
    /// Raw contact ids per input contact (join) or per cluster (split).
    pub raw_contact_ids: Vec<Vec<RawContactId>>,
    /// Display name of the joined contact, empty when it has none.
    pub display_name: Option<String>,
    /// Edge and flag writes that committed.
    pub operations: usize,
    pub result: ContactResult<()>,
}

impl AggregationOutcome {
    fn failed(raw_contact_ids: Vec<Vec<RawContactId>>, operations: usize, err: ContactError) -> Self {
        Self {
            code: AggregationResultCode::for_error(&err),
            lookup: None,
            raw_contact_ids,
            display_name: None,
            operations,
            result: Err(err),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Accumulates edge writes and applies them whenever a full chunk is ready.
struct ChunkWriter<'a> {
    applier: &'a BatchApplier,
    cancel: &'a CancelToken,
    pending: Vec<Operation>,
    committed: usize,
    chunks: usize,
}

impl<'a> ChunkWriter<'a> {
    fn new(applier: &'a BatchApplier, cancel: &'a CancelToken) -> Self {
        Self {
            applier,
            cancel,
            pending: Vec::with_capacity(applier.max_batch()),
            committed: 0,
            chunks: 0,
        }
    }

    fn push(&mut self, op: Operation) -> ContactResult<()> {
        self.pending.push(op);
        if self.pending.len() >= self.applier.max_batch() {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> ContactResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.pending);
        let results = self.applier.apply(&chunk, self.cancel).map_err(|err| {
            warn!(chunk = self.chunks, committed = self.committed, error = %err, "edge chunk failed");
            ContactError::store_conflict(format!(
                "chunk {} failed after {} writes committed: {err}",
                self.chunks, self.committed
            ))
        })?;
        if let Some(index) = results.iter().position(|result| result.count == 0) {
            return Err(ContactError::store_conflict(format!(
                "chunk {} operation {index} affected no rows",
                self.chunks
            )));
        }
        debug!(chunk = self.chunks, size = chunk.len(), "edge chunk applied");
        self.committed += chunk.len();
        self.chunks += 1;
        Ok(())
    }
}

/// Writes aggregation exception edges.
#[derive(Clone)]
pub struct AggregationManager {
    applier: BatchApplier,
    gateway: Arc<NotificationGateway>,
}

impl AggregationManager {
    pub fn new(applier: BatchApplier, gateway: Arc<NotificationGateway>) -> Self {
        Self { applier, gateway }
    }

    fn store(&self) -> &Arc<dyn ContactStore> {
        self.applier.store()
    }

    /// Joins `contacts` into one. The structured name of the first contact's
    /// name raw contact becomes super-primary, so the joined contact keeps
    /// its display name. All writes go out as one apply.
    #[instrument(skip(self, cancel), level = "debug")]
    pub fn join(&self, contacts: &[ContactId], cancel: &CancelToken) -> AggregationOutcome {
        let groups = match self.member_groups(contacts) {
            Ok(groups) => groups,
            Err(err) => return AggregationOutcome::failed(Vec::new(), 0, err),
        };
        let raw_ids: Vec<RawContactId> = groups.iter().flatten().copied().collect();
        let mut ops = pairwise_edges(&raw_ids);
        match self.name_row_of(contacts[0]) {
            Ok(Some(data_id)) => ops.push(
                Operation::update(Table::Data)
                    .with_id(data_id)
                    .with_value(columns::IS_PRIMARY, true)
                    .with_value(columns::IS_SUPER_PRIMARY, true),
            ),
            Ok(None) => debug!(contact = %contacts[0], "no structured name to pin"),
            Err(err) => return AggregationOutcome::failed(groups, 0, err),
        }

        let applied = self.applier.apply(&ops, cancel).and_then(|results| {
            match results.iter().position(|result| result.count == 0) {
                Some(index) => Err(ContactError::store_conflict(format!(
                    "join operation {index} affected no rows"
                ))),
                None => Ok(()),
            }
        });
        if let Err(err) = applied {
            let err = match err {
                ContactError::BadArguments(_) | ContactError::StoreConflict(_) => err,
                other => ContactError::store_conflict(other.to_string()),
            };
            warn!(error = %err, "join failed");
            return AggregationOutcome::failed(groups, 0, err);
        }
        self.linked(groups, ops.len())
    }

    /// Joins any number of contacts, flushing edges in chunks.
    #[instrument(skip(self, cancel), fields(contacts = contacts.len()), level = "debug")]
    pub fn join_several(&self, contacts: &[ContactId], cancel: &CancelToken) -> AggregationOutcome {
        let groups = match self.member_groups(contacts) {
            Ok(groups) => groups,
            Err(err) => return AggregationOutcome::failed(Vec::new(), 0, err),
        };
        let shared_name = match self.shared_display_name(contacts) {
            Ok(name) => name,
            Err(err) => return AggregationOutcome::failed(groups, 0, err),
        };
        let raw_ids: Vec<RawContactId> = groups.iter().flatten().copied().collect();
        let mut writer = ChunkWriter::new(&self.applier, cancel);
        let written = raw_ids
            .iter()
            .enumerate()
            .flat_map(|(i, a)| {
                raw_ids
                    .iter()
                    .enumerate()
                    .filter(move |(j, _)| *j != i)
                    .map(move |(_, b)| (*a, *b))
            })
            .try_for_each(|(a, b)| {
                writer.push(Operation::aggregation_exception(AggregationType::KeepTogether, a, b))
            })
            .and_then(|()| writer.flush());
        if let Err(err) = written {
            return AggregationOutcome::failed(groups, writer.committed, err);
        }
        let mut outcome = self.linked(groups, writer.committed);
        if outcome.succeeded() {
            outcome.display_name = Some(shared_name);
        }
        outcome
    }

    /// The display name every contact in `contacts` already carries, or ""
    /// when they disagree or one of them is unnamed.
    fn shared_display_name(&self, contacts: &[ContactId]) -> ContactResult<String> {
        let rows = self.store().query_contact_names(contacts)?;
        let mut names = rows.into_iter().map(|row| row.display_name.unwrap_or_default());
        let Some(first) = names.next() else {
            return Ok(String::new());
        };
        if first.is_empty() || names.any(|name| name != first) {
            return Ok(String::new());
        }
        Ok(first)
    }

    /// Separates `clusters` from each other. A hard split pins every cross
    /// pair apart; a soft split hands the pairs back to the store's own
    /// aggregation, which may merge them again.
    #[instrument(skip(self, clusters, cancel), fields(clusters = clusters.len()), level = "debug")]
    pub fn split(
        &self,
        clusters: &[Vec<RawContactId>],
        hard: bool,
        cancel: &CancelToken,
    ) -> AggregationOutcome {
        let clusters = clusters.to_vec();
        if let Err(err) = validate_clusters(&clusters) {
            return AggregationOutcome::failed(clusters, 0, err);
        }
        let kind = if hard {
            AggregationType::KeepSeparate
        } else {
            AggregationType::Automatic
        };
        let mut writer = ChunkWriter::new(&self.applier, cancel);
        let mut written = Ok(());
        'clusters: for (index, cluster) in clusters.iter().enumerate() {
            for other in clusters.iter().skip(index + 1) {
                for &a in cluster {
                    for &b in other {
                        written = writer.push(Operation::aggregation_exception(kind, a, b));
                        if written.is_err() {
                            break 'clusters;
                        }
                    }
                }
            }
        }
        if let Err(err) = written.and_then(|()| writer.flush()) {
            return AggregationOutcome::failed(clusters, writer.committed, err);
        }
        info!(operations = writer.committed, hard, "contacts split");
        self.gateway.broadcast(Broadcast::UnlinkComplete);
        AggregationOutcome {
            code: AggregationResultCode::ContactsSplit,
            lookup: None,
            raw_contact_ids: clusters,
            display_name: None,
            operations: writer.committed,
            result: Ok(()),
        }
    }

    /// Splits every raw contact of `contact` into its own cluster.
    pub fn split_contact(&self, contact: ContactId, hard: bool, cancel: &CancelToken) -> AggregationOutcome {
        let clusters = match self.member_groups(&[contact]) {
            Ok(groups) => groups
                .into_iter()
                .flatten()
                .map(|raw| vec![raw])
                .collect::<Vec<_>>(),
            Err(err) => return AggregationOutcome::failed(Vec::new(), 0, err),
        };
        self.split(&clusters, hard, cancel)
    }

    /// Member raw contacts of each distinct input contact, in input order.
    fn member_groups(&self, contacts: &[ContactId]) -> ContactResult<Vec<Vec<RawContactId>>> {
        let mut seen = FxHashSet::default();
        let contacts: Vec<ContactId> = contacts.iter().copied().filter(|id| seen.insert(*id)).collect();
        let pairs = self
            .store()
            .raw_contact_ids_for_contacts(&contacts)?
            .unwrap_or_default();
        let groups: Vec<Vec<RawContactId>> = contacts
            .iter()
            .map(|contact| {
                pairs
                    .iter()
                    .filter(|(owner, _)| owner == contact)
                    .map(|(_, raw)| *raw)
                    .collect()
            })
            .collect();
        let total: usize = groups.iter().map(Vec::len).sum();
        if total < 2 {
            return Err(ContactError::bad_arguments(format!(
                "need at least two raw contacts, {} resolved from {} contacts",
                total,
                contacts.len()
            )));
        }
        Ok(groups)
    }

    /// Data id of the structured name row on the contact's name raw contact.
    fn name_row_of(&self, contact: ContactId) -> ContactResult<Option<i64>> {
        let store = self.store();
        let Some(target) = store.resolve(&ContactRef::Contact(contact))? else {
            return Ok(None);
        };
        let Some(entities) = store.query_entities(&target)? else {
            return Ok(None);
        };
        let Some(name_raw) = entities.header.name_raw_contact_id else {
            return Ok(None);
        };
        Ok(entities
            .rows
            .iter()
            .filter(|row| row.raw_contact_id == name_raw)
            .filter_map(|row| row.data.as_ref())
            .find(|data| {
                crate::codec::get_text(data, columns::MIMETYPE).as_deref()
                    == Some(mimetype::STRUCTURED_NAME)
            })
            .and_then(|data| crate::codec::get_i64(data, columns::ID)))
    }

    /// Confirms the join landed in one contact and reports its name.
    fn linked(&self, groups: Vec<Vec<RawContactId>>, operations: usize) -> AggregationOutcome {
        let store = self.store().as_ref();
        let mut contacts: Vec<ContactTarget> = Vec::new();
        for &raw in groups.iter().flatten() {
            match store.resolve(&ContactRef::RawContact(raw)) {
                Ok(Some(target)) => {
                    if !contacts.iter().any(|seen| seen.contact_id == target.contact_id) {
                        contacts.push(target);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    return AggregationOutcome::failed(groups, operations, err.into());
                }
            }
        }
        if contacts.len() != 1 {
            let err = ContactError::store_conflict(format!(
                "joined raw contacts ended up in {} contacts",
                contacts.len()
            ));
            warn!(error = %err, "join did not converge");
            return AggregationOutcome::failed(groups, operations, err);
        }
        let joined = contacts[0].contact_id;
        let display_name = match store.query_contact_names(&[joined]) {
            Ok(rows) => rows
                .into_iter()
                .next()
                .and_then(|row| row.display_name.or(row.alt_display_name))
                .unwrap_or_default(),
            Err(err) => return AggregationOutcome::failed(groups, operations, err.into()),
        };
        let first = groups.iter().flatten().next().copied();
        let lookup = first.and_then(|raw| {
            lookup_ref_for_raw(store, raw).unwrap_or_else(|err| {
                warn!(raw = %raw, error = %err, "joined contact did not resolve");
                None
            })
        });
        info!(contact = %joined, operations, "contacts linked");
        self.gateway.broadcast(Broadcast::LinkComplete {
            lookup: lookup.clone(),
        });
        AggregationOutcome {
            code: AggregationResultCode::ContactsLinked,
            lookup,
            raw_contact_ids: groups,
            display_name: Some(display_name),
            operations,
            result: Ok(()),
        }
    }
}

/// KEEP_TOGETHER edges for every ordered pair of distinct raw contacts.
fn pairwise_edges(raw_ids: &[RawContactId]) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(raw_ids.len() * raw_ids.len().saturating_sub(1));
    for (i, &a) in raw_ids.iter().enumerate() {
        for (j, &b) in raw_ids.iter().enumerate() {
            if i != j {
                ops.push(Operation::aggregation_exception(AggregationType::KeepTogether, a, b));
            }
        }
    }
    ops
}

fn validate_clusters(clusters: &[Vec<RawContactId>]) -> ContactResult<()> {
    let non_empty = clusters.iter().filter(|cluster| !cluster.is_empty()).count();
    if non_empty < 2 {
        return Err(ContactError::bad_arguments(format!(
            "split needs at least two non-empty clusters, got {non_empty}"
        )));
    }
    let mut seen = FxHashSet::default();
    for raw in clusters.iter().flatten() {
        if !seen.insert(*raw) {
            return Err(ContactError::bad_arguments(format!(
                "raw contact {raw} appears in more than one cluster"
            )));
        }
    }
    Ok(())
}
