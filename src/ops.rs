//! # Operation Descriptors
//!
//! Ordered insert/update/delete/assert instructions addressed to a table, with
//! optional back-references to ids assigned earlier in the same batch.

use crate::codec::{columns, RowValues, Value};
use crate::model::{AggregationType, RawContactId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    RawContacts,
    Data,
    /// Aggregated contacts. Updates fan out to every member raw contact.
    Contacts,
    Groups,
    AggregationExceptions,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Table::RawContacts => "raw_contacts",
            Table::Data => "data",
            Table::Contacts => "contacts",
            Table::Groups => "groups",
            Table::AggregationExceptions => "aggregation_exceptions",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Assert,
}

/// Which rows an update, delete or assert addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    All,
    Id(i64),
    /// The id assigned by the operation at this batch index.
    IdBackRef(usize),
    /// Every row whose columns equal all the given values.
    Matching(Vec<(String, Value)>),
}

/// One instruction in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub table: Table,
    /// Addressed to the device owner's profile partition.
    pub profile: bool,
    pub selection: Selection,
    pub values: RowValues,
    /// Columns filled from the id assigned by an earlier operation.
    pub value_back_refs: Vec<(String, usize)>,
    /// For asserts: the number of rows the selection must match.
    pub expected_count: Option<usize>,
}

/// Per-operation outcome returned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpResult {
    /// Id assigned by an insert.
    pub id: Option<i64>,
    /// Rows affected or matched.
    pub count: usize,
}

impl OpResult {
    pub fn inserted(id: i64) -> Self {
        Self {
            id: Some(id),
            count: 1,
        }
    }

    pub fn affected(count: usize) -> Self {
        Self { id: None, count }
    }
}

impl Operation {
    fn new(kind: OpKind, table: Table) -> Self {
        Self {
            kind,
            table,
            profile: false,
            selection: Selection::All,
            values: RowValues::new(),
            value_back_refs: Vec::new(),
            expected_count: None,
        }
    }

    pub fn insert(table: Table) -> Self {
        Self::new(OpKind::Insert, table)
    }

    pub fn update(table: Table) -> Self {
        Self::new(OpKind::Update, table)
    }

    pub fn delete(table: Table) -> Self {
        Self::new(OpKind::Delete, table)
    }

    pub fn assert(table: Table) -> Self {
        Self::new(OpKind::Assert, table)
    }

    /// Pairwise aggregation exception write.
    pub fn aggregation_exception(
        kind: AggregationType,
        raw1: RawContactId,
        raw2: RawContactId,
    ) -> Self {
        Self::update(Table::AggregationExceptions)
            .with_value(columns::EXCEPTION_TYPE, kind.code())
            .with_value(columns::RAW_CONTACT_ID1, raw1.0)
            .with_value(columns::RAW_CONTACT_ID2, raw2.0)
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.selection = Selection::Id(id);
        self
    }

    pub fn with_selection_back_ref(mut self, index: usize) -> Self {
        self.selection = Selection::IdBackRef(index);
        self
    }

    pub fn matching(mut self, column: &str, value: impl Into<Value>) -> Self {
        let mut terms = match std::mem::replace(&mut self.selection, Selection::All) {
            Selection::Matching(terms) => terms,
            _ => Vec::new(),
        };
        terms.push((column.to_string(), value.into()));
        self.selection = Selection::Matching(terms);
        self
    }

    pub fn with_value(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    pub fn with_values(mut self, values: RowValues) -> Self {
        self.values.extend(values);
        self
    }

    pub fn with_value_back_ref(mut self, column: &str, index: usize) -> Self {
        self.values.remove(column);
        self.value_back_refs.push((column.to_string(), index));
        self
    }

    pub fn with_expected_count(mut self, count: usize) -> Self {
        self.expected_count = Some(count);
        self
    }

    pub fn for_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    pub fn is_insert_into(&self, table: Table) -> bool {
        self.kind == OpKind::Insert && self.table == table
    }

    /// Highest batch index this operation refers back to.
    pub fn max_back_ref(&self) -> Option<usize> {
        let selection = match self.selection {
            Selection::IdBackRef(index) => Some(index),
            _ => None,
        };
        self.value_back_refs
            .iter()
            .map(|(_, index)| *index)
            .chain(selection)
            .max()
    }

    /// Re-addresses this operation for a sub-batch starting at `offset`.
    ///
    /// Back-references into earlier sub-batches are replaced by the ids those
    /// sub-batches produced; the rest are shifted to sub-batch indices.
    pub fn rebased(&self, offset: usize, prior: &[Option<OpResult>]) -> Result<Operation, String> {
        let mut op = self.clone();
        let resolve = |index: usize| -> Result<i64, String> {
            prior
                .get(index)
                .copied()
                .flatten()
                .and_then(|result| result.id)
                .ok_or_else(|| format!("back reference {index} has no assigned id"))
        };
        let mut back_refs = Vec::with_capacity(self.value_back_refs.len());
        for (column, index) in &self.value_back_refs {
            if *index < offset {
                op.values.insert(column.clone(), Value::Integer(resolve(*index)?));
            } else {
                back_refs.push((column.clone(), index - offset));
            }
        }
        op.value_back_refs = back_refs;
        if let Selection::IdBackRef(index) = self.selection {
            op.selection = if index < offset {
                Selection::Id(resolve(index)?)
            } else {
                Selection::IdBackRef(index - offset)
            };
        }
        Ok(op)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.table)?;
        if self.profile {
            write!(f, " (profile)")?;
        }
        match &self.selection {
            Selection::All => {}
            Selection::Id(id) => write!(f, " id={id}")?,
            Selection::IdBackRef(index) => write!(f, " id=<{index}>")?,
            Selection::Matching(terms) => {
                for (column, value) in terms {
                    write!(f, " {column}={value:?}")?;
                }
            }
        }
        for (column, value) in &self.values {
            write!(f, " {column}:={value:?}")?;
        }
        for (column, index) in &self.value_back_refs {
            write!(f, " {column}:=<{index}>")?;
        }
        if let Some(count) = self.expected_count {
            write!(f, " expect={count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase_resolves_earlier_sub_batch() {
        let op = Operation::insert(Table::Data)
            .with_value(columns::MIMETYPE, "x")
            .with_value_back_ref(columns::RAW_CONTACT_ID, 1);
        let prior = vec![None, Some(OpResult::inserted(42))];
        let rebased = op.rebased(2, &prior).unwrap();
        assert!(rebased.value_back_refs.is_empty());
        assert_eq!(
            rebased.values.get(columns::RAW_CONTACT_ID),
            Some(&Value::Integer(42))
        );
    }

    #[test]
    fn test_rebase_shifts_same_sub_batch() {
        let op = Operation::update(Table::RawContacts)
            .with_selection_back_ref(5)
            .with_value(columns::AGGREGATION_MODE, 0);
        let rebased = op.rebased(3, &[None, None, None]).unwrap();
        assert_eq!(rebased.selection, Selection::IdBackRef(2));
    }

    #[test]
    fn test_rebase_missing_id_is_error() {
        let op = Operation::insert(Table::Data).with_value_back_ref(columns::RAW_CONTACT_ID, 0);
        assert!(op.rebased(1, &[Some(OpResult::affected(1))]).is_err());
    }

    #[test]
    fn test_matching_accumulates_terms() {
        let op = Operation::assert(Table::Data)
            .matching(columns::RAW_CONTACT_ID, 3)
            .matching(columns::MIMETYPE, "m")
            .with_expected_count(0);
        match &op.selection {
            Selection::Matching(terms) => assert_eq!(terms.len(), 2),
            other => panic!("unexpected selection {other:?}"),
        }
        assert_eq!(op.max_back_ref(), None);
    }
}
