//! Consistent bulk load of the captured tables
//!
//! The snapshotter reads every captured table through one `REPEATABLE READ`
//! transaction pinned to the snapshot exported when the slot was created, so
//! the rows it returns are exactly the state at the slot's start position.
//!
//! Tables are paged in primary-key order with `LIMIT`/`OFFSET`. The page size
//! is derived from the memory available to the process and the table's average
//! row size, capped by the configured batch size:
//!
//! ```text
//! batch = clamp(floor(available_memory * safety_factor / avg_row_size), 1, batch_size)
//! ```
//!
//! Each page becomes one [`ChangeBatch`] of synthetic inserts with no position.

use crate::config::CaptureConfig;
use crate::connection::{quote_identifier, quote_sql_string_value, PgReplicationConnection};
use crate::error::{CaptureError, Result};
use crate::types::{ChangeBatch, ChangeRecord, Oid};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Size and row-width estimate of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub row_count: u64,
    /// Average on-disk row size in bytes; `None` for an empty table
    pub avg_row_size: Option<u64>,
}

/// One page of rows in result order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePage {
    pub column_names: Vec<String>,
    pub column_types: Vec<String>,
    /// Text form of each value; `None` is SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
}

/// Where snapshot rows are read from
pub trait SnapshotSource {
    /// Primary-key columns in key order
    fn primary_key(&mut self, schema: &str, table: &str) -> Result<Vec<String>>;

    fn table_stats(&mut self, schema: &str, table: &str) -> Result<TableStats>;

    fn query_page(
        &mut self,
        schema: &str,
        table: &str,
        primary_key: &[String],
        limit: u64,
        offset: u64,
    ) -> Result<TablePage>;

    /// End the snapshot transaction and release the connection
    fn release(&mut self) -> Result<()>;
}

/// Paging state of the table being loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCursor {
    pub table: String,
    pub primary_key: Vec<String>,
    pub offset: u64,
    pub batch_size: u64,
    /// Rows emitted so far
    pub rows: u64,
    /// Pages read so far, including an empty or short final page
    pub pages: u64,
    /// Rows visible in the snapshot
    pub total: u64,
}

impl SnapshotCursor {
    /// `true` once the offset has passed the last visible row
    pub fn exhausted(&self) -> bool {
        self.offset >= self.total
    }

    /// Record a page of `len` rows; returns `false` on a short page
    fn advance(&mut self, len: u64) -> bool {
        self.pages += 1;
        self.rows += len;
        self.offset += self.batch_size;
        len == self.batch_size
    }
}

/// Totals of a finished snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub tables: usize,
    pub rows: u64,
    pub pages: u64,
}

/// Rows per page for a given memory budget, capped by `cap`
///
/// ```
/// use pg_capture::compute_batch_size;
///
/// // 1 MiB at 0.5 with 1 KiB rows gives 512 rows, under the cap
/// assert_eq!(compute_batch_size(1 << 20, 0.5, 1024, 1000), 512);
/// // never zero, never above the cap
/// assert_eq!(compute_batch_size(10, 0.7, 4096, 1000), 1);
/// assert_eq!(compute_batch_size(1 << 30, 0.7, 100, 2), 2);
/// ```
pub fn compute_batch_size(
    available_memory: u64,
    safety_factor: f64,
    avg_row_size: u64,
    cap: usize,
) -> u64 {
    let budget = (available_memory as f64 * safety_factor / avg_row_size.max(1) as f64).floor();
    let cap = (cap as u64).max(1);
    if budget.is_finite() && budget >= 1.0 {
        (budget as u64).min(cap)
    } else {
        1
    }
}

/// Free memory reported by the kernel, in bytes
pub fn available_memory() -> Option<u64> {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|text| parse_mem_available(&text))
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let mut parts = rest.split_whitespace();
        let value: u64 = parts.next()?.parse().ok()?;
        match parts.next() {
            Some("kB") | None => value.checked_mul(1024),
            Some(_) => None,
        }
    })
}

/// Reads the captured tables and emits them as insert batches
pub struct Snapshotter<S: SnapshotSource> {
    source: S,
    schema: String,
    tables: Vec<String>,
    batch_cap: usize,
    safety_factor: f64,
    default_row_size: u64,
    available_memory: Option<u64>,
    start_offset: u64,
    released: bool,
}

impl Snapshotter<PgSnapshotSource> {
    /// Open a regular connection and pin it to `snapshot_name`
    ///
    /// Without a snapshot name the transaction takes a fresh snapshot.
    pub fn prepare(config: &CaptureConfig, snapshot_name: Option<&str>) -> Result<Self> {
        let source = PgSnapshotSource::begin(&config.regular_conninfo(), snapshot_name)?;
        Ok(Self::with_source(source, config))
    }
}

impl<S: SnapshotSource> Snapshotter<S> {
    pub fn with_source(source: S, config: &CaptureConfig) -> Self {
        Self {
            source,
            schema: config.schema.clone(),
            tables: config.tables.clone(),
            batch_cap: config.batch_size,
            safety_factor: config.snapshot_memory_safety_factor,
            default_row_size: config.default_row_size,
            available_memory: config.available_memory,
            start_offset: config.snapshot_offset,
            released: false,
        }
    }

    /// Load every table in configuration order
    ///
    /// `emit` receives one batch per page; an error from it aborts the load.
    pub fn run<F>(&mut self, mut emit: F) -> Result<SnapshotSummary>
    where
        F: FnMut(ChangeBatch) -> Result<()>,
    {
        let mut summary = SnapshotSummary::default();
        for table in self.tables.clone() {
            let cursor = self.snapshot_table(&table, &mut emit)?;
            summary.tables += 1;
            summary.rows += cursor.rows;
            summary.pages += cursor.pages;
        }

        info!(
            "Snapshot finished: {} tables, {} rows, {} pages",
            summary.tables, summary.rows, summary.pages
        );
        Ok(summary)
    }

    /// Load one table and return its final cursor
    pub fn snapshot_table<F>(&mut self, table: &str, emit: &mut F) -> Result<SnapshotCursor>
    where
        F: FnMut(ChangeBatch) -> Result<()>,
    {
        let schema = self.schema.clone();
        info!("Processing snapshot for table {}.{}", schema, table);

        let primary_key = self
            .source
            .primary_key(&schema, table)
            .map_err(|e| snapshot_error(table, e))?;
        if primary_key.is_empty() {
            return Err(CaptureError::snapshot(format!(
                "{schema}.{table} has no primary key"
            )));
        }

        let stats = self
            .source
            .table_stats(&schema, table)
            .map_err(|e| snapshot_error(table, e))?;
        let avg_row_size = stats
            .avg_row_size
            .filter(|size| *size > 0)
            .unwrap_or(self.default_row_size);
        let batch_size = self.batch_size_for(avg_row_size);

        info!(
            "Querying snapshot of {}.{}: rows={} batch_size={} avg_row_size={}",
            schema, table, stats.row_count, batch_size, avg_row_size
        );

        let mut cursor = SnapshotCursor {
            table: table.to_string(),
            primary_key,
            offset: self.start_offset,
            batch_size,
            rows: 0,
            pages: 0,
            total: stats.row_count,
        };

        while !cursor.exhausted() {
            let page = self
                .source
                .query_page(&schema, table, &cursor.primary_key, cursor.batch_size, cursor.offset)
                .map_err(|e| snapshot_error(table, e))?;
            let len = page.rows.len() as u64;
            debug!(
                "Snapshot page of {}.{} at offset {}: {} rows",
                schema, table, cursor.offset, len
            );

            if len > 0 {
                emit(page_to_batch(&schema, table, page)?)?;
            }
            if !cursor.advance(len) {
                break;
            }
        }

        info!("Snapshot of {}.{} done: {} rows", schema, table, cursor.rows);
        Ok(cursor)
    }

    fn batch_size_for(&self, avg_row_size: u64) -> u64 {
        match self.available_memory.or_else(available_memory) {
            Some(memory) => {
                compute_batch_size(memory, self.safety_factor, avg_row_size, self.batch_cap)
            }
            None => {
                warn!("Available memory unknown; using configured batch size");
                (self.batch_cap as u64).max(1)
            }
        }
    }

    /// Commit the snapshot transaction and close its connection
    pub fn release_snapshot(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.source.release()
    }
}

impl<S: SnapshotSource> Drop for Snapshotter<S> {
    fn drop(&mut self) {
        if let Err(e) = self.release_snapshot() {
            warn!("Failed to release snapshot: {}", e);
        }
    }
}

fn snapshot_error(table: &str, e: CaptureError) -> CaptureError {
    match e {
        CaptureError::Snapshot(_) | CaptureError::Cancelled(_) | CaptureError::ChannelClosed(_) => e,
        other => CaptureError::snapshot(format!("{table}: {other}")),
    }
}

fn page_to_batch(schema: &str, table: &str, page: TablePage) -> Result<ChangeBatch> {
    let TablePage {
        column_names,
        column_types,
        rows,
    } = page;

    let records = rows
        .into_iter()
        .map(|row| {
            if row.len() != column_names.len() {
                return Err(CaptureError::snapshot(format!(
                    "{table}: row has {} values for {} columns",
                    row.len(),
                    column_names.len()
                )));
            }
            let values = row
                .into_iter()
                .map(|value| value.map(Value::String).unwrap_or(Value::Null))
                .collect();
            Ok(ChangeRecord::insert(
                schema,
                table,
                column_names.clone(),
                column_types.clone(),
                values,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ChangeBatch::new(None, records))
}

/// Snapshot source over a regular libpq connection
pub struct PgSnapshotSource {
    conn: Option<PgReplicationConnection>,
    type_names: HashMap<Oid, String>,
}

impl PgSnapshotSource {
    /// Connect and open the snapshot transaction
    pub fn begin(conninfo: &str, snapshot_name: Option<&str>) -> Result<Self> {
        let conn = PgReplicationConnection::connect(conninfo)
            .map_err(|e| CaptureError::snapshot(format!("connecting: {e}")))?;

        conn.exec("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .map_err(|e| CaptureError::snapshot(format!("starting transaction: {e}")))?;

        if let Some(name) = snapshot_name {
            conn.exec(&format!(
                "SET TRANSACTION SNAPSHOT {}",
                quote_sql_string_value(name)
            ))
            .map_err(|e| CaptureError::snapshot(format!("importing snapshot {name}: {e}")))?;
            info!("Snapshot transaction pinned to exported snapshot {}", name);
        } else {
            info!("Snapshot transaction uses a fresh snapshot");
        }

        Ok(Self {
            conn: Some(conn),
            type_names: HashMap::new(),
        })
    }

    fn conn(&self) -> Result<&PgReplicationConnection> {
        self.conn
            .as_ref()
            .ok_or_else(|| CaptureError::snapshot("snapshot connection already released"))
    }

    fn resolve_types(&mut self, oids: &[Oid]) -> Result<Vec<String>> {
        let missing: Vec<String> = oids
            .iter()
            .filter(|oid| !self.type_names.contains_key(*oid))
            .map(|oid| oid.to_string())
            .collect();

        if !missing.is_empty() {
            let result = self.conn()?.exec(&format!(
                "SELECT oid, typname FROM pg_type WHERE oid IN ({})",
                missing.join(",")
            ))?;
            for row in 0..result.ntuples() {
                if let (Some(oid), Some(name)) = (result.get_value(row, 0), result.get_value(row, 1)) {
                    if let Ok(oid) = oid.parse::<Oid>() {
                        self.type_names.insert(oid, name);
                    }
                }
            }
        }

        Ok(oids
            .iter()
            .map(|oid| {
                self.type_names
                    .get(oid)
                    .cloned()
                    .unwrap_or_else(|| "text".to_string())
            })
            .collect())
    }
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

impl SnapshotSource for PgSnapshotSource {
    fn primary_key(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let result = self.conn()?.exec(&format!(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = {}::regclass AND i.indisprimary \
             ORDER BY array_position(i.indkey::int2[], a.attnum)",
            quote_sql_string_value(&qualified(schema, table))
        ))?;

        Ok((0..result.ntuples())
            .filter_map(|row| result.get_value(row, 0))
            .collect())
    }

    fn table_stats(&mut self, schema: &str, table: &str) -> Result<TableStats> {
        let result = self.conn()?.exec(&format!(
            "SELECT count(*), avg(pg_column_size(t.*))::bigint FROM {} t",
            qualified(schema, table)
        ))?;

        let row_count = result
            .get_value(0, 0)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0);
        let avg_row_size = if result.is_null(0, 1) {
            None
        } else {
            result.get_value(0, 1).and_then(|size| size.parse().ok())
        };

        Ok(TableStats {
            row_count,
            avg_row_size,
        })
    }

    fn query_page(
        &mut self,
        schema: &str,
        table: &str,
        primary_key: &[String],
        limit: u64,
        offset: u64,
    ) -> Result<TablePage> {
        let order_by = primary_key
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(", ");

        let result = self.conn()?.exec(&format!(
            "SELECT * FROM {} ORDER BY {} LIMIT {} OFFSET {}",
            qualified(schema, table),
            order_by,
            limit,
            offset
        ))?;

        let columns = result.nfields();
        let column_names = (0..columns)
            .map(|col| result.field_name(col).unwrap_or_default())
            .collect();
        let oids: Vec<Oid> = (0..columns).map(|col| result.field_type(col)).collect();

        let rows = (0..result.ntuples())
            .map(|row| {
                (0..columns)
                    .map(|col| {
                        if result.is_null(row, col) {
                            None
                        } else {
                            result.get_value(row, col)
                        }
                    })
                    .collect()
            })
            .collect();
        drop(result);

        Ok(TablePage {
            column_names,
            column_types: self.resolve_types(&oids)?,
            rows,
        })
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let committed = conn.exec("COMMIT").map(|_| ());
        conn.close();
        debug!("Snapshot connection released");
        committed.map_err(|e| CaptureError::snapshot(format!("releasing snapshot: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeKind;

    /// In-memory table with an integer key in the first column
    #[derive(Default)]
    struct FakeSource {
        tables: HashMap<String, Vec<Vec<Option<String>>>>,
        page_reads: u64,
        released: usize,
        fail_on_page: Option<u64>,
        /// Rows reported by `table_stats` beyond the ones actually stored
        overcount: u64,
    }

    impl FakeSource {
        fn with_table(mut self, table: &str, rows: u64) -> Self {
            let rows = (1..=rows)
                .map(|id| {
                    vec![
                        Some(id.to_string()),
                        if id % 2 == 0 { None } else { Some(format!("status-{id}")) },
                    ]
                })
                .collect();
            self.tables.insert(table.to_string(), rows);
            self
        }
    }

    impl SnapshotSource for FakeSource {
        fn primary_key(&mut self, _schema: &str, table: &str) -> Result<Vec<String>> {
            if table == "no_pk" {
                return Ok(Vec::new());
            }
            Ok(vec!["id".to_string()])
        }

        fn table_stats(&mut self, _schema: &str, table: &str) -> Result<TableStats> {
            let rows = self
                .tables
                .get(table)
                .ok_or_else(|| CaptureError::protocol(format!("relation {table} does not exist")))?;
            Ok(TableStats {
                row_count: rows.len() as u64 + self.overcount,
                avg_row_size: if rows.is_empty() { None } else { Some(64) },
            })
        }

        fn query_page(
            &mut self,
            _schema: &str,
            table: &str,
            _primary_key: &[String],
            limit: u64,
            offset: u64,
        ) -> Result<TablePage> {
            self.page_reads += 1;
            if self.fail_on_page == Some(self.page_reads) {
                return Err(CaptureError::protocol("canceling statement due to conflict"));
            }
            let rows = self.tables.get(table).cloned().unwrap_or_default();
            Ok(TablePage {
                column_names: vec!["id".into(), "status".into()],
                column_types: vec!["int4".into(), "text".into()],
                rows: rows
                    .into_iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .collect(),
            })
        }

        fn release(&mut self) -> Result<()> {
            self.released += 1;
            Ok(())
        }
    }

    fn config(batch_size: usize, tables: &[&str]) -> CaptureConfig {
        CaptureConfig {
            schema: "public".into(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
            batch_size,
            snapshot_memory_safety_factor: 0.7,
            available_memory: Some(1 << 30),
            ..Default::default()
        }
    }

    fn collect(snapshotter: &mut Snapshotter<FakeSource>) -> Result<Vec<ChangeBatch>> {
        let mut batches = Vec::new();
        snapshotter.run(|batch| {
            batches.push(batch);
            Ok(())
        })?;
        Ok(batches)
    }

    #[test]
    fn test_three_rows_with_batch_two() {
        let source = FakeSource::default().with_table("orders", 3);
        let mut snapshotter = Snapshotter::with_source(source, &config(2, &["orders"]));
        let batches = collect(&mut snapshotter).unwrap();

        let sizes: Vec<_> = batches.iter().map(ChangeBatch::len).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert!(batches.iter().all(|b| b.position.is_none()));
        assert!(batches
            .iter()
            .flat_map(|b| &b.records)
            .all(|r| r.kind == ChangeKind::Insert && r.table == "orders" && r.is_consistent()));
    }

    #[test]
    fn test_page_reads_are_ceil_n_over_b() {
        for (rows, batch) in [(0u64, 2usize), (1, 2), (4, 2), (5, 2), (10, 3), (7, 100)] {
            let source = FakeSource::default().with_table("orders", rows);
            let mut snapshotter = Snapshotter::with_source(source, &config(batch, &["orders"]));
            let batches = collect(&mut snapshotter).unwrap();

            let records: usize = batches.iter().map(ChangeBatch::len).sum();
            assert_eq!(records as u64, rows, "rows={rows} batch={batch}");
            assert_eq!(
                snapshotter.source.page_reads,
                rows.div_ceil(batch as u64),
                "rows={rows} batch={batch}"
            );
        }
    }

    #[test]
    fn test_summary_counts_actual_page_reads() {
        let source = FakeSource::default().with_table("orders", 3);
        let mut snapshotter = Snapshotter::with_source(source, &config(2, &["orders"]));
        let summary = snapshotter.run(|_| Ok(())).unwrap();
        assert_eq!((summary.rows, summary.pages), (3, 2));

        // Rows vanish between the count and the last page: the empty page still counts
        let mut source = FakeSource::default().with_table("orders", 4);
        source.overcount = 2;
        let mut snapshotter = Snapshotter::with_source(source, &config(2, &["orders"]));
        let summary = snapshotter.run(|_| Ok(())).unwrap();
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.pages, 3);
        assert_eq!(summary.pages, snapshotter.source.page_reads);
    }

    #[test]
    fn test_rows_keep_key_order_and_nulls() {
        let source = FakeSource::default().with_table("orders", 4);
        let mut snapshotter = Snapshotter::with_source(source, &config(3, &["orders"]));
        let batches = collect(&mut snapshotter).unwrap();

        let records: Vec<_> = batches.iter().flat_map(|b| &b.records).collect();
        let ids: Vec<_> = records.iter().map(|r| r.column_values[0].clone()).collect();
        assert_eq!(ids, vec![Value::from("1"), Value::from("2"), Value::from("3"), Value::from("4")]);
        assert_eq!(records[1].column_values[1], Value::Null);
        assert_eq!(records[0].column_types, vec!["int4", "text"]);
    }

    #[test]
    fn test_snapshot_offset_skips_rows() {
        let source = FakeSource::default().with_table("orders", 5);
        let mut cfg = config(2, &["orders"]);
        cfg.snapshot_offset = 2;
        let mut snapshotter = Snapshotter::with_source(source, &cfg);
        let batches = collect(&mut snapshotter).unwrap();

        let records: usize = batches.iter().map(ChangeBatch::len).sum();
        assert_eq!(records, 3);
        assert_eq!(batches[0].records[0].column_values[0], Value::from("3"));
    }

    #[test]
    fn test_tables_in_configuration_order() {
        let source = FakeSource::default()
            .with_table("orders", 2)
            .with_table("customers", 1);
        let mut snapshotter =
            Snapshotter::with_source(source, &config(10, &["customers", "orders"]));
        let batches = collect(&mut snapshotter).unwrap();

        let tables: Vec<_> = batches.iter().map(|b| b.records[0].table.clone()).collect();
        assert_eq!(tables, vec!["customers", "orders"]);
    }

    #[test]
    fn test_missing_primary_key_is_snapshot_error() {
        let source = FakeSource::default().with_table("no_pk", 3);
        let mut snapshotter = Snapshotter::with_source(source, &config(2, &["no_pk"]));
        let err = collect(&mut snapshotter).unwrap_err();
        assert!(matches!(err, CaptureError::Snapshot(ref msg) if msg.contains("primary key")));
    }

    #[test]
    fn test_query_failure_is_snapshot_error() {
        let mut source = FakeSource::default().with_table("orders", 5);
        source.fail_on_page = Some(2);
        let mut snapshotter = Snapshotter::with_source(source, &config(2, &["orders"]));
        let err = collect(&mut snapshotter).unwrap_err();
        assert!(matches!(err, CaptureError::Snapshot(_)));

        let source = FakeSource::default();
        let mut snapshotter = Snapshotter::with_source(source, &config(2, &["missing"]));
        assert!(matches!(
            collect(&mut snapshotter),
            Err(CaptureError::Snapshot(_))
        ));
    }

    #[test]
    fn test_emit_error_stops_the_load() {
        let source = FakeSource::default().with_table("orders", 6);
        let mut snapshotter = Snapshotter::with_source(source, &config(2, &["orders"]));
        let mut seen = 0;
        let err = snapshotter
            .run(|_| {
                seen += 1;
                Err(CaptureError::channel_closed("consumer gone"))
            })
            .unwrap_err();
        assert!(matches!(err, CaptureError::ChannelClosed(_)));
        assert_eq!(seen, 1);
        assert_eq!(snapshotter.source.page_reads, 1);
    }

    #[test]
    fn test_release_runs_once() {
        let source = FakeSource::default().with_table("orders", 1);
        let mut snapshotter = Snapshotter::with_source(source, &config(2, &["orders"]));
        snapshotter.release_snapshot().unwrap();
        snapshotter.release_snapshot().unwrap();
        assert_eq!(snapshotter.source.released, 1);
    }

    #[test]
    fn test_batch_size_follows_memory_budget() {
        let mut cfg = config(1000, &["orders"]);
        cfg.available_memory = Some(64 * 10);
        cfg.snapshot_memory_safety_factor = 0.5;
        let snapshotter = Snapshotter::with_source(FakeSource::default(), &cfg);
        assert_eq!(snapshotter.batch_size_for(64), 5);
        assert_eq!(snapshotter.batch_size_for(10_000), 1);
    }

    #[test]
    fn test_compute_batch_size_edges() {
        assert_eq!(compute_batch_size(0, 0.7, 100, 10), 1);
        assert_eq!(compute_batch_size(1000, 1.0, 0, 10), 10);
        assert_eq!(compute_batch_size(1000, 1.0, 100, 0), 1);
    }

    #[test]
    fn test_parse_mem_available() {
        let meminfo = "MemTotal:       16318000 kB\nMemFree:         1000000 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(8_000_000 * 1024));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }
}
