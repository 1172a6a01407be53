use std::collections::HashSet;

use super::event::{StatisticEvent, TagValue, ValidationError};

/// Hard ceiling on tag positions for `RollupPolicy::All`: 2^16 combinations
/// is already far beyond anything a sane statistic declares.
pub const MAX_ROLLUP_TAGS: usize = 16;

/// Which wildcard tag combinations a statistic produces alongside its
/// exact-match rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollupPolicy {
    /// Only the exact-match combination.
    None,
    /// Every subset of tag positions rolled up (full cross-product).
    All,
    /// Each mask lists the tag positions rolled up to wildcard; the
    /// exact-match combination is always included.
    Masks(Vec<Vec<usize>>),
}

/// A raw event plus the distinct tag-value combinations it represents after
/// wildcard fan-out. Each combination yields a distinct aggregate map key.
#[derive(Debug, Clone, PartialEq)]
pub struct RolledUpStatisticEvent {
    pub event: StatisticEvent,
    combinations: Vec<Vec<TagValue>>,
}

impl RolledUpStatisticEvent {
    /// The distinct tag-value combinations, exact-match first.
    pub fn combinations(&self) -> &[Vec<TagValue>] {
        &self.combinations
    }
}

/// Expands a raw event into its rolled-up combinations per the policy.
///
/// The expansion is a plain iterative walk over tag positions: each position
/// is either the literal event value or the wildcard marker. The exact-match
/// combination is always present and always first.
pub fn roll_up_event(
    event: StatisticEvent,
    policy: &RollupPolicy,
) -> Result<RolledUpStatisticEvent, ValidationError> {
    let literal: Vec<TagValue> = event
        .tags
        .iter()
        .map(|pair| TagValue::Literal(pair.value.clone()))
        .collect();

    let combinations = match policy {
        RollupPolicy::None => vec![literal],
        RollupPolicy::All => expand_all(&literal)?,
        RollupPolicy::Masks(masks) => expand_masks(&literal, masks),
    };

    Ok(RolledUpStatisticEvent {
        event,
        combinations,
    })
}

/// Every subset of positions wildcarded, enumerated by bitmask. Subset 0 is
/// the exact-match combination.
fn expand_all(literal: &[TagValue]) -> Result<Vec<Vec<TagValue>>, ValidationError> {
    let positions = literal.len();
    if positions > MAX_ROLLUP_TAGS {
        return Err(ValidationError::TooManyRollupTags {
            tags: positions,
            max: MAX_ROLLUP_TAGS,
        });
    }

    let total = 1u32 << positions;
    let mut combinations = Vec::with_capacity(total as usize);

    for mask in 0..total {
        let combo = literal
            .iter()
            .enumerate()
            .map(|(pos, value)| {
                if mask & (1 << pos) != 0 {
                    TagValue::Wildcard
                } else {
                    value.clone()
                }
            })
            .collect();
        combinations.push(combo);
    }

    Ok(combinations)
}

/// The exact-match combination plus one combination per mask, deduplicated.
/// Positions beyond the tag list are ignored rather than rejected; the
/// definition store validates masks against the tag schema at load time.
fn expand_masks(literal: &[TagValue], masks: &[Vec<usize>]) -> Vec<Vec<TagValue>> {
    let mut seen: HashSet<Vec<TagValue>> = HashSet::new();
    let mut combinations = Vec::with_capacity(masks.len() + 1);

    seen.insert(literal.to_vec());
    combinations.push(literal.to_vec());

    for mask in masks {
        let combo: Vec<TagValue> = literal
            .iter()
            .enumerate()
            .map(|(pos, value)| {
                if mask.contains(&pos) {
                    TagValue::Wildcard
                } else {
                    value.clone()
                }
            })
            .collect();
        if seen.insert(combo.clone()) {
            combinations.push(combo);
        }
    }

    combinations
}
