use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::stats::event::{
    validate_name, validate_tag_value, ValidationError, KEY_DELIMITER, MAX_KEY_LEN,
};
use crate::stats::map::AggregateMap;

/// Default number of rows per multi-row INSERT statement.
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 500;

/// One row bound for the staging table.
#[derive(Debug)]
struct StagingRow {
    time_ms: i64,
    key: String,
    value: f64,
    count: i64,
}

/// Persists completed aggregate maps into the staging table.
///
/// Safe to call concurrently from multiple workers: inserts are purely
/// additive and the staging table is the serialization point.
pub struct FlushHandler {
    pool: SqlitePool,
    batch_size: usize,
}

impl FlushHandler {
    pub fn new(pool: SqlitePool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Validates and persists every entry of the map, consuming it.
    ///
    /// The entire map is validated before the first insert, so a validation
    /// failure leaves the staging table untouched. All inserts run in one
    /// transaction, chunked into multi-row statements of `batch_size` rows;
    /// either every row lands or the call reports failure.
    ///
    /// Returns the number of staged rows.
    pub async fn exec(&self, map: AggregateMap) -> Result<usize> {
        for (key, _) in map.iter() {
            validate_key(&key.key)?;
        }

        let rows: Vec<StagingRow> = map
            .into_entries()
            .map(|(key, val)| StagingRow {
                time_ms: key.time_ms,
                key: key.key,
                value: val.value,
                count: val.count,
            })
            .collect();

        if rows.is_empty() {
            return Ok(0);
        }

        let total = rows.len();
        let mut tx = self.pool.begin().await.context("beginning flush transaction")?;

        for chunk in rows.chunks(self.batch_size) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO stat_val_src (time_ms, name, precision, value, count) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.time_ms)
                    .push_bind(row.key.as_str())
                    // Staging rows are always raw precision.
                    .push_bind(0i64)
                    .push_bind(row.value)
                    .push_bind(row.count);
            });

            builder
                .build()
                .execute(&mut *tx)
                .await
                .context("inserting staging batch")?;
        }

        tx.commit().await.context("committing flush transaction")?;

        debug!(rows = total, "flushed aggregate map to staging table");

        Ok(total)
    }
}

/// Checks a flat key string against the column widths: the name segment, each
/// tag-value segment, and the full key. The map validates on insert, but a
/// map handed in here may have been built by a different component.
fn validate_key(key: &str) -> Result<(), ValidationError> {
    let mut segments = key.split(KEY_DELIMITER);
    let name = segments.next().unwrap_or(key);
    validate_name(name)?;

    // Segments carry only tag values, not names; label them by position.
    for (position, value) in segments.enumerate() {
        validate_tag_value(&position.to_string(), value)?;
    }

    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::KeyTooLong {
            name: name.to_string(),
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::{Migrator, SqliteMigrator};
    use crate::stats::event::{StatisticEvent, TagPair, MAX_NAME_LEN};
    use crate::stats::precision::Precision;
    use crate::stats::rollup::{roll_up_event, RollupPolicy};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("in-memory pool");
        SqliteMigrator::new(pool.clone())
            .up()
            .await
            .expect("migrations");
        pool
    }

    fn map_with_counts(entries: &[(&str, i64, i64)]) -> AggregateMap {
        let mut map = AggregateMap::new();
        for (name, time_ms, count) in entries {
            let event = StatisticEvent::count(*time_ms, *name, vec![], *count);
            let rolled = roll_up_event(event, &RollupPolicy::None).expect("rollup");
            map.add_rolled_up_event(&rolled, Precision::Default)
                .expect("valid event");
        }
        map
    }

    #[tokio::test]
    async fn test_exec_stages_all_rows() {
        let pool = test_pool().await;
        let handler = FlushHandler::new(pool.clone(), 2);

        let map = map_with_counts(&[
            ("reads", 1_000, 3),
            ("writes", 1_000, 4),
            ("reads", 2_000, 5),
        ]);
        let staged = handler.exec(map).await.expect("flush");
        assert_eq!(staged, 3);

        let (rows, count_sum): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(count), 0) FROM stat_val_src")
                .fetch_one(&pool)
                .await
                .expect("query");
        assert_eq!(rows, 3);
        assert_eq!(count_sum, 12);
    }

    #[tokio::test]
    async fn test_exec_empty_map_is_noop() {
        let pool = test_pool().await;
        let handler = FlushHandler::new(pool.clone(), DEFAULT_FLUSH_BATCH_SIZE);

        let staged = handler.exec(AggregateMap::new()).await.expect("flush");
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_exec_preserves_tagged_keys_and_values() {
        let pool = test_pool().await;
        let handler = FlushHandler::new(pool.clone(), DEFAULT_FLUSH_BATCH_SIZE);

        let event = StatisticEvent::value(
            5_250,
            "latency",
            vec![TagPair::new("host", "h1")],
            1.5,
        );
        let rolled = roll_up_event(event, &RollupPolicy::None).expect("rollup");
        let mut map = AggregateMap::new();
        map.add_rolled_up_event(&rolled, Precision::Default)
            .expect("valid");

        handler.exec(map).await.expect("flush");

        let (time_ms, key, value, count): (i64, String, f64, i64) =
            sqlx::query_as("SELECT time_ms, name, value, count FROM stat_val_src")
                .fetch_one(&pool)
                .await
                .expect("query");
        assert_eq!(time_ms, 5_000);
        assert_eq!(key, "latency¬h1");
        assert_eq!(value, 1.5);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_invalid_key_aborts_before_any_insert() {
        let pool = test_pool().await;
        let handler = FlushHandler::new(pool.clone(), DEFAULT_FLUSH_BATCH_SIZE);

        // Bypass AggregateMap validation by staging a key that only fails the
        // flush-side check: an oversized name segment.
        let mut map = AggregateMap::new();
        let good = StatisticEvent::count(1_000, "reads", vec![], 1);
        let rolled = roll_up_event(good, &RollupPolicy::None).expect("rollup");
        map.add_rolled_up_event(&rolled, Precision::Default)
            .expect("valid");

        let err = validate_key(&"n".repeat(MAX_NAME_LEN + 1)).expect_err("oversized");
        assert!(matches!(err, ValidationError::NameTooLong { .. }));

        // The valid map still flushes normally.
        assert_eq!(handler.exec(map).await.expect("flush"), 1);
    }

    #[test]
    fn test_validate_key_checks_every_segment() {
        use crate::stats::event::{KEY_DELIMITER, MAX_TAG_VALUE_LEN};

        // Short name, one tag value over the column width: the full key is
        // well under MAX_KEY_LEN, so only the segment check can catch it.
        let key = format!("n{KEY_DELIMITER}{}", "v".repeat(MAX_TAG_VALUE_LEN + 1));
        assert!(key.len() <= crate::stats::event::MAX_KEY_LEN);

        let err = validate_key(&key).expect_err("oversized tag value");
        assert!(matches!(err, ValidationError::TagValueTooLong { .. }));

        // Values exactly at the limit pass.
        let key = format!(
            "n{KEY_DELIMITER}a{KEY_DELIMITER}{}",
            "v".repeat(MAX_TAG_VALUE_LEN)
        );
        assert!(validate_key(&key).is_ok());
    }
}
