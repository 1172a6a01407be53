use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::info;

use crate::config::AggregationConfig;
use crate::stats::precision::Precision;

use super::transaction::AggregationTransactionHelper;
use sqlx::SqlitePool;

/// Tuning knobs for one aggregation pass. Passed explicitly per run so tests
/// can shrink batch sizes without touching shared state.
#[derive(Debug, Clone, Copy)]
pub struct AggregationOptions {
    /// Staging rows consumed per stage-1 transaction.
    pub stage_one_batch_size: u32,
    /// Finer-tier rows consumed per stage-2 transaction.
    pub stage_two_batch_size: u32,
    /// Aggregate rows older than this are expired. `None` or zero: keep
    /// everything forever.
    pub max_processing_age: Option<Duration>,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            stage_one_batch_size: 5_000,
            stage_two_batch_size: 5_000,
            max_processing_age: None,
        }
    }
}

impl AggregationOptions {
    /// Production options derived from configuration.
    pub fn from_config(cfg: &AggregationConfig) -> Self {
        Self {
            stage_one_batch_size: cfg.stage_one_batch_size,
            stage_two_batch_size: cfg.stage_two_batch_size,
            max_processing_age: cfg.max_processing_age,
        }
    }

    /// Expiry age with the zero-means-disabled rule applied.
    fn effective_max_age(&self) -> Option<Duration> {
        self.max_processing_age.filter(|age| !age.is_zero())
    }
}

/// Outcome of one aggregation pass, logged for the operator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregationSummary {
    /// Staging rows merged into the finest tier.
    pub staged_rows_merged: u64,
    /// Finer-tier rows rolled up into coarser tiers.
    pub rows_rolled_up: u64,
    /// Aggregate rows deleted by age.
    pub rows_expired: u64,
    /// Key rows deleted as orphans.
    pub orphan_keys_deleted: u64,
}

/// Drives the aggregation protocol to exhaustion for a given "now".
///
/// One pass is the idempotent unit of work: safe to invoke repeatedly, safe
/// to run concurrently with flushes (flushes only append to the staging
/// table), and designed to be re-run after a failure since every stage only
/// acts on rows still present in its source table. Scheduling is the
/// caller's concern.
pub struct AggregationManager {
    helper: AggregationTransactionHelper,
    options: AggregationOptions,
}

impl AggregationManager {
    pub fn new(pool: SqlitePool, options: AggregationOptions) -> Self {
        Self {
            helper: AggregationTransactionHelper::new(pool),
            options,
        }
    }

    pub fn options(&self) -> AggregationOptions {
        self.options
    }

    /// Runs one pass against the current wall-clock time.
    pub async fn aggregate(&self) -> Result<AggregationSummary> {
        self.aggregate_at(Utc::now().timestamp_millis()).await
    }

    /// Runs one pass: stage 1 to exhaustion, then stage 2 per tier pair to
    /// exhaustion, then expiry and orphan cleanup.
    pub async fn aggregate_at(&self, now_ms: i64) -> Result<AggregationSummary> {
        let opts = self.options;
        if opts.stage_one_batch_size == 0 || opts.stage_two_batch_size == 0 {
            bail!("aggregation batch sizes must be positive");
        }

        let mut summary = AggregationSummary::default();

        // Stage 1: only buckets that have closed at the finest tier are safe;
        // the current bucket may still receive flushes.
        let safe_before_ms = Precision::finest().truncate(now_ms);
        loop {
            let consumed = self
                .helper
                .stage_one_batch(safe_before_ms, opts.stage_one_batch_size)
                .await?;
            summary.staged_rows_merged += consumed as u64;
            if consumed < opts.stage_one_batch_size as usize {
                break;
            }
        }

        // Stage 2: finer tiers roll into the next coarser tier, in order of
        // increasing coarseness.
        for (source, target) in Precision::rollup_pairs() {
            loop {
                let consumed = self
                    .helper
                    .stage_two_batch(source, target, now_ms, opts.stage_two_batch_size)
                    .await?;
                summary.rows_rolled_up += consumed as u64;
                if consumed < opts.stage_two_batch_size as usize {
                    break;
                }
            }
        }

        if let Some(max_age) = opts.effective_max_age() {
            // Ages beyond the i64 millisecond range saturate, which pushes
            // the cutoff before every representable bucket instead of
            // wrapping it into the future.
            let age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
            let oldest_retained_ms = now_ms.saturating_sub(age_ms);
            summary.rows_expired = self.helper.delete_expired(oldest_retained_ms).await?;
            summary.orphan_keys_deleted = self.helper.delete_orphan_keys().await?;
        }

        info!(
            staged_rows_merged = summary.staged_rows_merged,
            rows_rolled_up = summary.rows_rolled_up,
            rows_expired = summary.rows_expired,
            orphan_keys_deleted = summary.orphan_keys_deleted,
            "aggregation pass complete"
        );

        Ok(summary)
    }

    /// Read access for callers that report on the staging backlog.
    pub fn helper(&self) -> &AggregationTransactionHelper {
        &self.helper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::{Migrator, SqliteMigrator};
    use sqlx::sqlite::SqlitePoolOptions;

    const HOUR_MS: i64 = 3_600_000;
    const DAY_MS: i64 = 24 * HOUR_MS;

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

    async fn stage(pool: &SqlitePool, time_ms: i64, key: &str, value: f64, count: i64) {
        sqlx::query(
            "INSERT INTO stat_val_src (time_ms, name, precision, value, count) \
             VALUES (?1, ?2, 0, ?3, ?4)",
        )
        .bind(time_ms)
        .bind(key)
        .bind(value)
        .bind(count)
        .execute(pool)
        .await
        .expect("staging insert");
    }

    fn manager(pool: &SqlitePool, options: AggregationOptions) -> AggregationManager {
        AggregationManager::new(pool.clone(), options)
    }

    #[tokio::test]
    async fn test_single_pass_drains_staging() {
        let pool = test_pool().await;
        let mgr = manager(
            &pool,
            AggregationOptions {
                stage_one_batch_size: 2,
                ..Default::default()
            },
        );

        for i in 0..7 {
            stage(&pool, 1_000 * i, "reads", 0.0, 1).await;
        }

        let summary = mgr.aggregate_at(100_000).await.expect("pass");
        assert_eq!(summary.staged_rows_merged, 7);
        assert_eq!(mgr.helper().staged_row_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let pool = test_pool().await;
        let mgr = manager(&pool, AggregationOptions::default());

        stage(&pool, 1_000, "reads", 0.0, 5).await;
        stage(&pool, 2_000, "reads", 0.0, 5).await;

        let now = 2 * DAY_MS;
        mgr.aggregate_at(now).await.expect("pass 1");
        let totals_after_first: Vec<(f64, i64)> = {
            let mut v = Vec::new();
            for tier in Precision::ALL {
                v.push(mgr.helper().tier_totals(tier).await.expect("totals"));
            }
            v
        };

        let summary = mgr.aggregate_at(now).await.expect("pass 2");
        assert_eq!(summary.staged_rows_merged, 0);
        assert_eq!(summary.rows_rolled_up, 0);

        for (i, tier) in Precision::ALL.iter().enumerate() {
            let totals = mgr.helper().tier_totals(*tier).await.expect("totals");
            assert_eq!(totals, totals_after_first[i], "tier {}", tier.as_str());
        }
    }

    #[tokio::test]
    async fn test_rollup_cascades_through_tiers() {
        let pool = test_pool().await;
        let mgr = manager(&pool, AggregationOptions::default());

        // Ten second-buckets inside one hour, two days in the past.
        for i in 0..10 {
            stage(&pool, 1_000 * i, "reads", 0.0, 10).await;
        }

        // Far enough in the future that hour, day, and month have all closed.
        let now = 40 * DAY_MS;
        let summary = mgr.aggregate_at(now).await.expect("pass");
        assert_eq!(summary.staged_rows_merged, 10);
        // 10 default rows -> 1 hour row -> 1 day row -> 1 month row.
        assert_eq!(summary.rows_rolled_up, 12);

        for tier in [Precision::Default, Precision::Hour, Precision::Day] {
            let (_, count) = mgr.helper().tier_totals(tier).await.expect("totals");
            assert_eq!(count, 0, "tier {} should be drained", tier.as_str());
        }
        let (value, count) = mgr
            .helper()
            .tier_totals(Precision::Month)
            .await
            .expect("totals");
        assert_eq!(count, 100);
        assert_eq!(value, 0.0);
    }

    #[tokio::test]
    async fn test_in_flight_bucket_left_for_next_pass() {
        let pool = test_pool().await;
        let mgr = manager(&pool, AggregationOptions::default());

        stage(&pool, 10_000, "reads", 0.0, 1).await;
        stage(&pool, 11_000, "reads", 0.0, 1).await;

        // Now is inside the 11s bucket.
        let summary = mgr.aggregate_at(11_400).await.expect("pass");
        assert_eq!(summary.staged_rows_merged, 1);
        assert_eq!(mgr.helper().staged_row_count().await.expect("count"), 1);

        // Once the bucket closes, the next pass picks it up.
        let summary = mgr.aggregate_at(12_000).await.expect("pass");
        assert_eq!(summary.staged_rows_merged, 1);
    }

    #[tokio::test]
    async fn test_expiry_and_orphan_cleanup() {
        let pool = test_pool().await;
        let max_age = Duration::from_millis(DAY_MS as u64);
        let mgr = manager(
            &pool,
            AggregationOptions {
                max_processing_age: Some(max_age),
                ..Default::default()
            },
        );

        stage(&pool, 1_000, "old_stat", 0.0, 1).await;
        let t0 = 2_000;
        mgr.aggregate_at(t0).await.expect("pass 1");
        assert_eq!(mgr.helper().key_count().await.expect("keys"), 1);

        // Advance beyond the processing age with no new data.
        let summary = mgr
            .aggregate_at(t0 + DAY_MS + 1_000)
            .await
            .expect("pass 2");
        assert!(summary.rows_expired > 0);
        assert_eq!(summary.orphan_keys_deleted, 1);
        assert_eq!(mgr.helper().key_count().await.expect("keys"), 0);
    }

    #[tokio::test]
    async fn test_zero_max_age_disables_expiry() {
        let pool = test_pool().await;
        let mgr = manager(
            &pool,
            AggregationOptions {
                max_processing_age: Some(Duration::ZERO),
                ..Default::default()
            },
        );

        stage(&pool, 1_000, "reads", 0.0, 1).await;
        mgr.aggregate_at(2_000).await.expect("pass 1");

        let summary = mgr.aggregate_at(400 * DAY_MS).await.expect("pass 2");
        assert_eq!(summary.rows_expired, 0);
        assert_eq!(summary.orphan_keys_deleted, 0);
    }

    #[tokio::test]
    async fn test_huge_max_age_never_expires() {
        let pool = test_pool().await;
        let mgr = manager(
            &pool,
            AggregationOptions {
                // Beyond the i64 millisecond range: must saturate, not wrap.
                max_processing_age: Some(Duration::from_secs(u64::MAX)),
                ..Default::default()
            },
        );

        stage(&pool, 1_000, "reads", 0.0, 1).await;
        mgr.aggregate_at(2_000).await.expect("pass 1");

        let summary = mgr.aggregate_at(400 * DAY_MS).await.expect("pass 2");
        assert_eq!(summary.rows_expired, 0);
        assert_eq!(summary.orphan_keys_deleted, 0);
        assert_eq!(mgr.helper().key_count().await.expect("keys"), 1);
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let pool = test_pool().await;
        let mgr = manager(
            &pool,
            AggregationOptions {
                stage_one_batch_size: 0,
                ..Default::default()
            },
        );

        let err = mgr.aggregate_at(1_000).await.expect_err("must fail");
        assert!(err.to_string().contains("batch sizes"));
    }
}
