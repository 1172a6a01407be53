use std::collections::HashMap;

use super::event::{
    build_key_string, validate_name, validate_tag_value, ValidationError, MAX_KEY_LEN,
};
use super::precision::Precision;
use super::rollup::RolledUpStatisticEvent;

/// Identity of one aggregate bucket: flattened key string (name plus tag
/// values, wildcards included), bucket start time, and precision tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    /// `name¬val1¬val2…` with `*` at rolled-up positions.
    pub key: String,
    /// Event time truncated to the tier's bucket start.
    pub time_ms: i64,
    /// Precision tier of the bucket.
    pub precision: Precision,
}

/// Running totals for one aggregate bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateValue {
    /// Occurrence count (COUNT observations, or number of VALUE samples).
    pub count: i64,
    /// Value sum (zero for COUNT statistics).
    pub value: f64,
}

impl AggregateValue {
    fn add(&mut self, count: i64, value: f64) {
        self.count += count;
        self.value += value;
    }
}

/// In-process accumulator mapping aggregate keys to running totals.
///
/// Append-only until flushed, then discarded; a flushed map is never reused.
/// Not thread-safe: each worker accumulates its own map and flushes
/// independently, the staging table is the serialization point.
#[derive(Debug, Default)]
pub struct AggregateMap {
    entries: HashMap<AggregateKey, AggregateValue>,
}

impl AggregateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges every tag-value combination of a rolled-up event into the map
    /// at the given precision tier.
    ///
    /// Name, tag value, and key lengths are validated against the database
    /// column widths before anything is merged; a failure leaves the map
    /// unchanged and is never silently truncated.
    pub fn add_rolled_up_event(
        &mut self,
        rolled: &RolledUpStatisticEvent,
        precision: Precision,
    ) -> Result<(), ValidationError> {
        let event = &rolled.event;

        validate_name(&event.name)?;
        for pair in &event.tags {
            validate_tag_value(&pair.tag, &pair.value)?;
        }

        let time_ms = precision.truncate(event.time_ms);
        let count = event.count_part();
        let value = event.value_part();

        // Build all keys first so an oversized key rejects the whole event
        // rather than merging a prefix of its combinations.
        let mut keys = Vec::with_capacity(rolled.combinations().len());
        for combination in rolled.combinations() {
            let key = build_key_string(&event.name, combination);
            if key.len() > MAX_KEY_LEN {
                return Err(ValidationError::KeyTooLong {
                    name: event.name.clone(),
                    len: key.len(),
                    max: MAX_KEY_LEN,
                });
            }
            keys.push(key);
        }

        for key in keys {
            self.entries
                .entry(AggregateKey {
                    key,
                    time_ms,
                    precision,
                })
                .or_default()
                .add(count, value);
        }

        Ok(())
    }

    /// Number of distinct aggregate keys (not raw events merged).
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates all entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&AggregateKey, &AggregateValue)> {
        self.entries.iter()
    }

    /// Consumes the map into its entries for flushing.
    pub fn into_entries(self) -> impl Iterator<Item = (AggregateKey, AggregateValue)> {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::event::{StatisticEvent, TagPair, MAX_NAME_LEN};
    use crate::stats::rollup::{roll_up_event, RollupPolicy};

    fn rolled_count(
        time_ms: i64,
        name: &str,
        tags: &[(&str, &str)],
        count: i64,
        policy: &RollupPolicy,
    ) -> RolledUpStatisticEvent {
        let event = StatisticEvent::count(
            time_ms,
            name,
            tags.iter().map(|(t, v)| TagPair::new(*t, *v)).collect(),
            count,
        );
        roll_up_event(event, policy).expect("rollup should succeed")
    }

    #[test]
    fn test_same_key_accumulates() {
        let mut map = AggregateMap::new();
        let policy = RollupPolicy::None;

        // Same second bucket, same tags: one entry, summed counts.
        let a = rolled_count(10_100, "reads", &[("host", "h1")], 3, &policy);
        let b = rolled_count(10_900, "reads", &[("host", "h1")], 4, &policy);
        map.add_rolled_up_event(&a, Precision::Default).expect("valid");
        map.add_rolled_up_event(&b, Precision::Default).expect("valid");

        assert_eq!(map.size(), 1);
        let (key, val) = map.iter().next().expect("one entry");
        assert_eq!(key.time_ms, 10_000);
        assert_eq!(val.count, 7);
        assert_eq!(val.value, 0.0);
    }

    #[test]
    fn test_distinct_buckets_stay_separate() {
        let mut map = AggregateMap::new();
        let policy = RollupPolicy::None;

        let a = rolled_count(10_000, "reads", &[], 1, &policy);
        let b = rolled_count(11_000, "reads", &[], 1, &policy);
        let c = rolled_count(10_000, "writes", &[], 1, &policy);
        map.add_rolled_up_event(&a, Precision::Default).expect("valid");
        map.add_rolled_up_event(&b, Precision::Default).expect("valid");
        map.add_rolled_up_event(&c, Precision::Default).expect("valid");

        assert_eq!(map.size(), 3);
    }

    #[test]
    fn test_rollup_combinations_get_distinct_keys() {
        let mut map = AggregateMap::new();
        let rolled = rolled_count(
            10_000,
            "reads",
            &[("host", "h1"), ("user", "u1")],
            5,
            &RollupPolicy::All,
        );
        map.add_rolled_up_event(&rolled, Precision::Default)
            .expect("valid");

        // 2 tags, full cross-product: 4 distinct keys, each with the count.
        assert_eq!(map.size(), 4);
        for (_, val) in map.iter() {
            assert_eq!(val.count, 5);
        }
    }

    #[test]
    fn test_value_statistic_tracks_sample_count() {
        let mut map = AggregateMap::new();
        let policy = RollupPolicy::None;

        for sample in [1.5, 2.5] {
            let event = StatisticEvent::value(10_000, "latency", vec![], sample);
            let rolled = roll_up_event(event, &policy).expect("valid");
            map.add_rolled_up_event(&rolled, Precision::Default)
                .expect("valid");
        }

        let (_, val) = map.iter().next().expect("one entry");
        assert_eq!(val.count, 2);
        assert_eq!(val.value, 4.0);
    }

    #[test]
    fn test_oversized_name_rejected_and_map_unchanged() {
        let mut map = AggregateMap::new();
        let rolled = rolled_count(
            10_000,
            &"n".repeat(MAX_NAME_LEN + 1),
            &[],
            1,
            &RollupPolicy::None,
        );

        let err = map
            .add_rolled_up_event(&rolled, Precision::Default)
            .expect_err("oversized name must be rejected");
        assert!(matches!(err, ValidationError::NameTooLong { .. }));
        assert!(map.is_empty());
    }

    #[test]
    fn test_oversized_key_rejected_before_partial_merge() {
        let mut map = AggregateMap::new();
        // Name and each tag value individually fit, the combined key does not.
        let tags: Vec<(String, String)> = (0..4)
            .map(|i| (format!("t{i}"), "v".repeat(200)))
            .collect();
        let pairs: Vec<(&str, &str)> = tags
            .iter()
            .map(|(t, v)| (t.as_str(), v.as_str()))
            .collect();
        let rolled = rolled_count(10_000, "reads", &pairs, 1, &RollupPolicy::None);

        let err = map
            .add_rolled_up_event(&rolled, Precision::Default)
            .expect_err("oversized key must be rejected");
        assert!(matches!(err, ValidationError::KeyTooLong { .. }));
        assert!(map.is_empty());
    }

    #[test]
    fn test_precision_governs_truncation() {
        let mut map = AggregateMap::new();
        let rolled = rolled_count(7_262_500, "reads", &[], 1, &RollupPolicy::None);
        map.add_rolled_up_event(&rolled, Precision::Hour).expect("valid");

        let (key, _) = map.iter().next().expect("one entry");
        assert_eq!(key.time_ms, 7_200_000);
        assert_eq!(key.precision, Precision::Hour);
    }
}
