use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use tracing::{debug, trace};

use crate::stats::precision::Precision;

/// Upper bound on bound parameters per generated IN (...) statement.
const DELETE_CHUNK: usize = 500;

/// One staged row selected for stage-1 aggregation.
#[derive(Debug, sqlx::FromRow)]
struct SourceRow {
    rowid: i64,
    time_ms: i64,
    name: String,
    value: f64,
    count: i64,
}

/// One aggregate row selected for stage-2 rollup.
#[derive(Debug, sqlx::FromRow)]
struct AggregateRow {
    rowid: i64,
    key_id: i64,
    time_ms: i64,
    value: f64,
    count: i64,
}

/// Owns the multi-stage SQL aggregation protocol.
///
/// Every batch method runs inside its own transaction: the merge upsert and
/// the delete of consumed source rows commit together, so a failure rolls the
/// whole batch back and a re-run sees exactly the rows whose merge never
/// committed. Merge-before-delete is the invariant that makes re-runs safe;
/// the reverse ordering would double-count.
pub struct AggregationTransactionHelper {
    pool: SqlitePool,
}

impl AggregationTransactionHelper {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stage 1: selects up to `batch_size` staging rows strictly older than
    /// `safe_before_ms`, resolves their key ids, merges them into the finest
    /// aggregate tier, and deletes the consumed rows, all in one transaction.
    ///
    /// `safe_before_ms` must be "now" truncated to the finest tier so that an
    /// in-flight bucket is never partially aggregated.
    ///
    /// Returns the number of staging rows consumed; zero means no more work.
    pub async fn stage_one_batch(&self, safe_before_ms: i64, batch_size: u32) -> Result<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning stage-1 transaction")?;

        let rows: Vec<SourceRow> = sqlx::query_as(
            "SELECT rowid, time_ms, name, value, count FROM stat_val_src \
             WHERE time_ms < ?1 ORDER BY rowid LIMIT ?2",
        )
        .bind(safe_before_ms)
        .bind(i64::from(batch_size))
        .fetch_all(&mut *tx)
        .await
        .context("selecting staging batch")?;

        if rows.is_empty() {
            return Ok(0);
        }

        // KEY-RESOLVE: insert-if-absent, read back the id, per distinct name.
        let mut key_ids: HashMap<&str, i64> = HashMap::new();
        for row in &rows {
            if key_ids.contains_key(row.name.as_str()) {
                continue;
            }
            let id = resolve_key_id(&mut tx, &row.name).await?;
            key_ids.insert(row.name.as_str(), id);
        }

        // MERGE-UPSERT: group by (key id, finest bucket) and upsert sums.
        let mut groups: HashMap<(i64, i64), (f64, i64)> = HashMap::new();
        for row in &rows {
            let key_id = key_ids[row.name.as_str()];
            let bucket = Precision::finest().truncate(row.time_ms);
            let entry = groups.entry((key_id, bucket)).or_default();
            entry.0 += row.value;
            entry.1 += row.count;
        }

        for ((key_id, bucket), (value, count)) in &groups {
            upsert_aggregate(&mut tx, *key_id, Precision::finest(), *bucket, *value, *count)
                .await?;
        }

        // DELETE-CONSUMED, after the merge and in the same transaction.
        let rowids: Vec<i64> = rows.iter().map(|r| r.rowid).collect();
        delete_by_rowid(&mut tx, "stat_val_src", &rowids).await?;

        tx.commit().await.context("committing stage-1 batch")?;

        trace!(
            consumed = rows.len(),
            buckets = groups.len(),
            "stage-1 batch merged"
        );

        Ok(rows.len())
    }

    /// Stage 2: rolls up to `batch_size` rows from the `source` tier into the
    /// `target` tier, deleting the finer source rows in the same transaction.
    ///
    /// Only source rows whose target bucket has closed relative to `now_ms`
    /// are taken: for bucket-aligned times, `truncate_target(t) <
    /// truncate_target(now)` is exactly `t < truncate_target(now)`, which
    /// keeps the SQL predicate a plain comparison.
    ///
    /// Returns the number of source rows consumed; zero means no more work.
    pub async fn stage_two_batch(
        &self,
        source: Precision,
        target: Precision,
        now_ms: i64,
        batch_size: u32,
    ) -> Result<usize> {
        let threshold = target.truncate(now_ms);

        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning stage-2 transaction")?;

        let rows: Vec<AggregateRow> = sqlx::query_as(
            "SELECT rowid, key_id, time_ms, value, count FROM stat_val \
             WHERE precision = ?1 AND time_ms < ?2 ORDER BY rowid LIMIT ?3",
        )
        .bind(source.code())
        .bind(threshold)
        .bind(i64::from(batch_size))
        .fetch_all(&mut *tx)
        .await
        .with_context(|| format!("selecting {} rows for rollup", source.as_str()))?;

        if rows.is_empty() {
            return Ok(0);
        }

        let mut groups: HashMap<(i64, i64), (f64, i64)> = HashMap::new();
        for row in &rows {
            let bucket = target.truncate(row.time_ms);
            let entry = groups.entry((row.key_id, bucket)).or_default();
            entry.0 += row.value;
            entry.1 += row.count;
        }

        for ((key_id, bucket), (value, count)) in &groups {
            upsert_aggregate(&mut tx, *key_id, target, *bucket, *value, *count).await?;
        }

        let rowids: Vec<i64> = rows.iter().map(|r| r.rowid).collect();
        delete_by_rowid(&mut tx, "stat_val", &rowids).await?;

        tx.commit().await.context("committing stage-2 batch")?;

        trace!(
            source = source.as_str(),
            target = target.as_str(),
            consumed = rows.len(),
            buckets = groups.len(),
            "stage-2 batch rolled up"
        );

        Ok(rows.len())
    }

    /// Deletes aggregate rows at every tier whose bucket start is strictly
    /// older than `oldest_retained_ms`. Rows exactly at the boundary stay.
    pub async fn delete_expired(&self, oldest_retained_ms: i64) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM stat_val WHERE time_ms < ?1")
            .bind(oldest_retained_ms)
            .execute(&self.pool)
            .await
            .context("deleting expired aggregate rows")?
            .rows_affected();

        if deleted > 0 {
            debug!(deleted, oldest_retained_ms, "expired aggregate rows");
        }

        Ok(deleted)
    }

    /// Deletes key-table rows with no remaining referencing aggregate row.
    pub async fn delete_orphan_keys(&self) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM stat_key WHERE NOT EXISTS \
             (SELECT 1 FROM stat_val WHERE stat_val.key_id = stat_key.id)",
        )
        .execute(&self.pool)
        .await
        .context("deleting orphan keys")?
        .rows_affected();

        if deleted > 0 {
            debug!(deleted, "removed orphan key rows");
        }

        Ok(deleted)
    }

    /// Number of rows currently in the staging table.
    pub async fn staged_row_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stat_val_src")
            .fetch_one(&self.pool)
            .await
            .context("counting staging rows")?;
        Ok(count)
    }

    /// Total (value, count) stored at one tier, over all keys and times.
    /// Pins the aggregate-table shape the external query layer reads.
    pub async fn tier_totals(&self, precision: Precision) -> Result<(f64, i64)> {
        let (value, count): (f64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(value), 0.0), COALESCE(SUM(count), 0) \
             FROM stat_val WHERE precision = ?1",
        )
        .bind(precision.code())
        .fetch_one(&self.pool)
        .await
        .context("summing tier totals")?;
        Ok((value, count))
    }

    /// Resolves a key string to its id, if it has ever been aggregated.
    pub async fn find_key_id(&self, key: &str) -> Result<Option<i64>> {
        let id: Option<(i64,)> = sqlx::query_as("SELECT id FROM stat_key WHERE name = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("looking up key id")?;
        Ok(id.map(|(id,)| id))
    }

    /// Number of rows in the key table.
    pub async fn key_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stat_key")
            .fetch_one(&self.pool)
            .await
            .context("counting key rows")?;
        Ok(count)
    }
}

/// Insert-if-absent then read back the compact key id.
async fn resolve_key_id(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<i64> {
    sqlx::query("INSERT INTO stat_key (name) VALUES (?1) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(&mut **tx)
        .await
        .context("inserting key row")?;

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM stat_key WHERE name = ?1")
        .bind(name)
        .fetch_one(&mut **tx)
        .await
        .context("reading back key id")?;

    Ok(id)
}

/// Row-atomic merge into the aggregate table: insert, or add value/count to
/// the existing (key_id, precision, time) row.
async fn upsert_aggregate(
    tx: &mut Transaction<'_, Sqlite>,
    key_id: i64,
    precision: Precision,
    time_ms: i64,
    value: f64,
    count: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO stat_val (key_id, precision, time_ms, value, count) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(key_id, precision, time_ms) DO UPDATE SET \
           value = value + excluded.value, \
           count = count + excluded.count",
    )
    .bind(key_id)
    .bind(precision.code())
    .bind(time_ms)
    .bind(value)
    .bind(count)
    .execute(&mut **tx)
    .await
    .context("upserting aggregate row")?;

    Ok(())
}

/// Deletes rows by rowid, chunked to stay under the bind parameter limit.
async fn delete_by_rowid(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    rowids: &[i64],
) -> Result<()> {
    for chunk in rowids.chunks(DELETE_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("DELETE FROM {table} WHERE rowid IN ("));
        let mut separated = builder.separated(", ");
        for rowid in chunk {
            separated.push_bind(rowid);
        }
        builder.push(")");

        builder
            .build()
            .execute(&mut **tx)
            .await
            .with_context(|| format!("deleting consumed rows from {table}"))?;
    }

    Ok(())
}
