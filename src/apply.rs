//! # Batched Apply Engine
//!
//! [`BatchApplier`] submits an operation list in consecutive sub-batches no
//! larger than the configured ceiling, carrying ids assigned by earlier
//! sub-batches into later ones. [`SaveEngine`] drives one contact save on top
//! of it: diff, apply, rebase on version conflict, then photo writes.

use crate::accounts::AccountTypes;
use crate::config::ApplyTuning;
use crate::delta::{RawContactDelta, RawContactDeltaList};
use crate::error::{ContactError, ContactResult};
use crate::model::{ContactRef, RawContactId};
use crate::ops::{OpResult, Operation, Table};
use crate::store::{lookup_ref_for_raw, ContactStore};
use crate::worker::CancelToken;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Sliced, in-order submission of an operation list.
#[derive(Clone)]
pub struct BatchApplier {
    store: Arc<dyn ContactStore>,
    tuning: ApplyTuning,
}

impl BatchApplier {
    pub fn new(store: Arc<dyn ContactStore>, tuning: ApplyTuning) -> Self {
        Self { store, tuning }
    }

    pub fn max_batch(&self) -> usize {
        self.tuning.batch_limit()
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Applies `ops` in order. Returns one result per operation.
    ///
    /// A failure in the first sub-batch keeps its own kind, so a version
    /// conflict can still be rebased. A failure after any sub-batch has
    /// committed is a store conflict, and later sub-batches are not submitted.
    /// Cancellation is checked between sub-batches only.
    #[instrument(skip(self, ops, cancel), fields(ops = ops.len()), level = "debug")]
    pub fn apply(&self, ops: &[Operation], cancel: &CancelToken) -> ContactResult<Vec<OpResult>> {
        let mut results: Vec<OpResult> = Vec::with_capacity(ops.len());
        for (sub_batch, chunk) in ops.chunks(self.max_batch()).enumerate() {
            let offset = results.len();
            if cancel.is_cancelled() {
                warn!(sub_batch, committed = offset, "apply cancelled");
                return Err(ContactError::store_conflict(format!(
                    "cancelled after {offset} of {} operations",
                    ops.len()
                )));
            }
            let prior: Vec<Option<OpResult>> = results.iter().copied().map(Some).collect();
            let rebased = chunk
                .iter()
                .map(|op| op.rebased(offset, &prior))
                .collect::<Result<Vec<_>, _>>()
                .map_err(ContactError::BadArguments)?;

            let chunk_results = match self.store.apply_batch(&rebased) {
                Ok(chunk_results) => chunk_results,
                Err(err) if offset == 0 => return Err(err.into()),
                Err(err) => {
                    warn!(sub_batch, committed = offset, error = %err, "sub-batch failed");
                    return Err(ContactError::store_conflict(format!(
                        "sub-batch {sub_batch} failed after {offset} operations committed: {err}"
                    )));
                }
            };
            if chunk_results.len() != chunk.len() {
                return Err(ContactError::store_conflict(format!(
                    "sub-batch {sub_batch} returned {} results for {} operations",
                    chunk_results.len(),
                    chunk.len()
                )));
            }
            debug!(sub_batch, size = chunk.len(), "sub-batch applied");
            results.extend(chunk_results);
        }
        Ok(results)
    }
}

/// One pending contact edit.
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub state: RawContactDeltaList,
    /// New display photos keyed by raw contact. A placeholder id stands for
    /// the raw contact this save inserts.
    pub photos: BTreeMap<RawContactId, Vec<u8>>,
}

impl SaveRequest {
    pub fn new(state: RawContactDeltaList) -> Self {
        Self {
            state,
            photos: BTreeMap::new(),
        }
    }

    pub fn with_photo(mut self, raw: RawContactId, bytes: Vec<u8>) -> Self {
        self.photos.insert(raw, bytes);
        self
    }
}

/// Result of one save.
#[derive(Debug)]
pub struct SaveOutcome {
    /// Contact the edit landed in, when it can still be found.
    pub lookup: Option<ContactRef>,
    pub raw_contact_id: Option<RawContactId>,
    pub attempts: usize,
    /// Operations in the batch that finally committed.
    pub operations: usize,
    /// `Ok` only when the structural writes and every photo write succeeded.
    pub result: ContactResult<()>,
}

impl SaveOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

struct Committed {
    diff: Vec<Operation>,
    results: Vec<OpResult>,
    state: RawContactDeltaList,
    attempts: usize,
}

/// Saves contact edits with optimistic concurrency.
#[derive(Clone)]
pub struct SaveEngine {
    applier: BatchApplier,
    accounts: Arc<dyn AccountTypes>,
}

impl SaveEngine {
    pub fn new(applier: BatchApplier, accounts: Arc<dyn AccountTypes>) -> Self {
        Self { applier, accounts }
    }

    fn store(&self) -> &Arc<dyn ContactStore> {
        self.applier.store()
    }

    #[instrument(skip(self, request, cancel), fields(raw_contacts = request.state.len()), level = "debug")]
    pub fn save(&self, request: SaveRequest, cancel: &CancelToken) -> SaveOutcome {
        let SaveRequest { mut state, photos } = request;
        if let Err(err) = self.check_writable(&state) {
            return SaveOutcome {
                lookup: None,
                raw_contact_id: None,
                attempts: 0,
                operations: 0,
                result: Err(err),
            };
        }
        state.trim_empty();

        let (mut outcome, inserted) = match self.persist(state, cancel) {
            Ok(committed) => {
                let inserted = inserted_raw_contact_id(&committed.diff, &committed.results);
                let raw_contact_id = committed.state.find_raw_contact_id().or(inserted);
                let lookup = raw_contact_id
                    .and_then(|raw| self.lookup_for(raw, committed.state.is_profile()));
                info!(
                    attempts = committed.attempts,
                    operations = committed.diff.len(),
                    "contact saved"
                );
                (
                    SaveOutcome {
                        lookup,
                        raw_contact_id,
                        attempts: committed.attempts,
                        operations: committed.diff.len(),
                        result: Ok(()),
                    },
                    inserted,
                )
            }
            Err((err, attempts)) => {
                warn!(attempts, error = %err, "contact save failed");
                (
                    SaveOutcome {
                        lookup: None,
                        raw_contact_id: None,
                        attempts,
                        operations: 0,
                        result: Err(err),
                    },
                    None,
                )
            }
        };

        for (raw, bytes) in photos {
            let target = if raw.is_placeholder() { inserted } else { Some(raw) };
            let Some(target) = target else {
                warn!(raw = %raw, "no raw contact for pending photo");
                if outcome.result.is_ok() {
                    outcome.result = Err(ContactError::store_conflict(format!(
                        "photo for {raw} has no saved raw contact"
                    )));
                }
                continue;
            };
            if let Err(err) = self.store().write_display_photo(target, &bytes) {
                warn!(raw = %target, error = %err, "photo write failed");
                if outcome.result.is_ok() {
                    outcome.result = Err(err.into());
                }
            }
        }
        outcome
    }

    /// Every raw contact this save touches must live in a writable account.
    fn check_writable(&self, state: &RawContactDeltaList) -> ContactResult<()> {
        for delta in state.iter().filter(|delta| touches_store(delta)) {
            let account = delta.account();
            if !self.accounts.is_writable(&account.type_key()) {
                return Err(ContactError::PermissionDenied(format!(
                    "account {account} is read-only"
                )));
            }
        }
        Ok(())
    }

    fn persist(
        &self,
        mut state: RawContactDeltaList,
        cancel: &CancelToken,
    ) -> Result<Committed, (ContactError, usize)> {
        let max_attempts = self.applier.tuning.attempt_limit();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let diff = state.build_diff().map_err(|err| (err, attempt))?;
            if diff.is_empty() {
                return Ok(Committed {
                    diff,
                    results: Vec::new(),
                    state,
                    attempts: attempt,
                });
            }
            match self.applier.apply(&diff, cancel) {
                Ok(results) => {
                    return Ok(Committed {
                        diff,
                        results,
                        state,
                        attempts: attempt,
                    })
                }
                Err(ContactError::VersionConflict(reason)) => {
                    warn!(attempt, %reason, "version conflict, rebasing");
                    if attempt >= max_attempts {
                        return Err((
                            ContactError::store_conflict(format!(
                                "version conflict persisted after {attempt} attempts"
                            )),
                            attempt,
                        ));
                    }
                    state = self.rebase(state).map_err(|err| (err, attempt))?;
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }

    /// Re-reads every stored raw contact of `state` and replays its edits on
    /// top of the fresh rows.
    fn rebase(&self, state: RawContactDeltaList) -> ContactResult<RawContactDeltaList> {
        let ids = state.existing_raw_contact_ids();
        if ids.is_empty() {
            return Err(ContactError::store_conflict(
                "version conflict on a contact with no stored raw contacts",
            ));
        }
        let profile = state.is_profile();
        let fresh = self.store().query_raw_contacts(&ids, profile)?;
        let mut merged =
            RawContactDeltaList::merge_after(RawContactDeltaList::from_entities(fresh, profile), &state);
        if profile {
            merged.set_profile(true);
        }
        Ok(merged)
    }

    fn lookup_for(&self, raw: RawContactId, profile: bool) -> Option<ContactRef> {
        if profile {
            return Some(ContactRef::Profile);
        }
        lookup_ref_for_raw(self.store().as_ref(), raw).unwrap_or_else(|err| {
            warn!(raw = %raw, error = %err, "saved raw contact did not resolve");
            None
        })
    }
}

fn touches_store(delta: &RawContactDelta) -> bool {
    let values = delta.values();
    values.is_insert()
        || values.is_delete()
        || values.is_update()
        || delta
            .entries()
            .any(|entry| entry.is_insert() || entry.is_delete() || entry.is_update())
}

/// Id assigned to the first raw contact inserted by `diff`.
pub fn inserted_raw_contact_id(diff: &[Operation], results: &[OpResult]) -> Option<RawContactId> {
    diff.iter()
        .zip(results)
        .find(|(op, _)| op.is_insert_into(Table::RawContacts))
        .and_then(|(_, result)| result.id)
        .map(RawContactId)
}
