//! Allow-list filtering of decoded transactions
//!
//! A transaction decoded from the slot may touch any table in the database.
//! [`ChangeFilter`] keeps only changes on the configured schema and tables and
//! regroups them into batches that each carry the transaction's end position.

use crate::types::{ChangeBatch, ChangeKind, ChangeRecord};
use std::collections::HashSet;

/// Keeps changes on an allow-listed set of tables in one schema
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    schema: String,
    tables: HashSet<String>,
    separate_changes: bool,
}

impl ChangeFilter {
    pub fn new<I, S>(tables: I, schema: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            schema: schema.into(),
            tables: tables.into_iter().map(Into::into).collect(),
            separate_changes: false,
        }
    }

    /// Emit one batch per change instead of grouping same-table runs
    pub fn with_separate_changes(mut self, separate_changes: bool) -> Self {
        self.separate_changes = separate_changes;
        self
    }

    /// Row changes on an allow-listed table; other entries never pass
    pub fn accepts(&self, record: &ChangeRecord) -> bool {
        record.kind.is_row_change()
            && record.schema == self.schema
            && self.tables.contains(&record.table)
    }

    /// Split `batch` into the sub-batches the consumer should see
    ///
    /// Every produced batch carries the input position and at least one
    /// record. Deletes get their column arrays rebuilt from the old keys.
    /// Applying the filter to its own output yields the same batches.
    pub fn filter(&self, batch: &ChangeBatch) -> Vec<ChangeBatch> {
        let mut out: Vec<ChangeBatch> = Vec::new();

        for record in batch.records.iter().filter(|r| self.accepts(r)) {
            let record = normalize(record);

            let extend_last = !self.separate_changes
                && out.last().is_some_and(|last| {
                    last.records.last().is_some_and(|prev| {
                        prev.schema == record.schema && prev.table == record.table
                    })
                });

            match out.last_mut() {
                Some(last) if extend_last => last.records.push(record),
                _ => out.push(ChangeBatch::new(batch.position, vec![record])),
            }
        }

        out
    }
}

/// Deletes carry their identity only in `oldkeys`; surface it as columns
fn normalize(record: &ChangeRecord) -> ChangeRecord {
    let mut record = record.clone();
    if record.kind == ChangeKind::Delete {
        if let Some(keys) = &record.old_keys {
            record.column_names = keys.key_names.clone();
            record.column_types = keys.key_types.clone();
            record.column_values = keys.key_values.clone();
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Lsn, OldKeys};
    use serde_json::json;

    fn record(kind: ChangeKind, schema: &str, table: &str) -> ChangeRecord {
        ChangeRecord {
            kind,
            schema: schema.into(),
            table: table.into(),
            column_names: vec!["id".into(), "status".into()],
            column_types: vec!["integer".into(), "text".into()],
            column_values: vec![json!(1), json!("new")],
            old_keys: None,
        }
    }

    fn delete(id: i64) -> ChangeRecord {
        ChangeRecord {
            kind: ChangeKind::Delete,
            schema: "public".into(),
            table: "orders".into(),
            column_names: Vec::new(),
            column_types: Vec::new(),
            column_values: Vec::new(),
            old_keys: Some(OldKeys {
                key_names: vec!["id".into()],
                key_types: vec!["integer".into()],
                key_values: vec![json!(id)],
            }),
        }
    }

    fn filter() -> ChangeFilter {
        ChangeFilter::new(["orders", "customers"], "public")
    }

    fn mixed_batch() -> ChangeBatch {
        ChangeBatch::new(
            Some(Lsn(0x1000)),
            vec![
                record(ChangeKind::Insert, "public", "orders"),
                record(ChangeKind::Update, "public", "orders"),
                record(ChangeKind::Insert, "audit", "orders"),
                record(ChangeKind::Insert, "public", "invoices"),
                record(ChangeKind::Insert, "public", "customers"),
                delete(5),
            ],
        )
    }

    #[test]
    fn test_drops_unlisted_schema_and_tables() {
        let out = filter().filter(&mixed_batch());
        let tables: Vec<_> = out
            .iter()
            .flat_map(|b| b.records.iter().map(|r| r.full_table_name()))
            .collect();
        assert_eq!(
            tables,
            vec!["public.orders", "public.orders", "public.customers", "public.orders"]
        );
    }

    #[test]
    fn test_groups_consecutive_same_table_runs() {
        let out = filter().filter(&mixed_batch());
        let sizes: Vec<_> = out.iter().map(ChangeBatch::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
        assert!(out.iter().all(|b| b.position == Some(Lsn(0x1000))));
    }

    #[test]
    fn test_separate_changes_yields_one_batch_per_record() {
        let out = filter().with_separate_changes(true).filter(&mixed_batch());
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|b| b.len() == 1 && b.position == Some(Lsn(0x1000))));
    }

    #[test]
    fn test_delete_is_rebuilt_from_old_keys() {
        let batch = ChangeBatch::new(Some(Lsn(7)), vec![delete(5)]);
        let out = filter().filter(&batch);
        assert_eq!(out.len(), 1);

        let deleted = &out[0].records[0];
        assert_eq!(deleted.kind, ChangeKind::Delete);
        assert_eq!(deleted.column_names, vec!["id"]);
        assert_eq!(deleted.column_types, vec!["integer"]);
        assert_eq!(deleted.column_values, vec![json!(5)]);
        assert_eq!(
            deleted.column_values.len(),
            deleted.old_keys.as_ref().unwrap().key_values.len()
        );
        assert!(deleted.is_consistent());
    }

    #[test]
    fn test_filter_is_idempotent() {
        for f in [filter(), filter().with_separate_changes(true)] {
            let once = f.filter(&mixed_batch());
            let twice: Vec<_> = once.iter().flat_map(|b| f.filter(b)).collect();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_drops_non_row_entries_on_listed_tables() {
        let mut other = record(ChangeKind::Other, "public", "orders");
        other.column_names.clear();
        let batch = ChangeBatch::new(
            Some(Lsn(9)),
            vec![record(ChangeKind::Insert, "public", "orders"), other],
        );

        let out = filter().filter(&batch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].records.len(), 1);
        assert_eq!(out[0].records[0].kind, ChangeKind::Insert);
    }

    #[test]
    fn test_never_yields_empty_batches() {
        let nothing_relevant = ChangeBatch::new(
            Some(Lsn(1)),
            vec![record(ChangeKind::Insert, "public", "invoices")],
        );
        assert!(filter().filter(&nothing_relevant).is_empty());
        assert!(filter().filter(&ChangeBatch::heartbeat(Lsn(2))).is_empty());
    }
}
