use thiserror::Error;

/// Maximum byte length of a statistic name (staging/key column width).
pub const MAX_NAME_LEN: usize = 255;

/// Maximum byte length of a single tag value.
pub const MAX_TAG_VALUE_LEN: usize = 255;

/// Maximum byte length of a full aggregate key string (key table column width).
pub const MAX_KEY_LEN: usize = 766;

/// Delimiter between the statistic name and tag values in a key string.
pub const KEY_DELIMITER: char = '¬';

/// Marker stored for a tag position that has been rolled up to "any value".
pub const WILDCARD: &str = "*";

/// Validation failure for an event or staging row that would not fit the
/// database column widths. Never silently truncated; always surfaced to the
/// caller with the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("statistic name '{name}' is {len} bytes, exceeds maximum of {max}")]
    NameTooLong { name: String, len: usize, max: usize },

    #[error("value for tag '{tag}' is {len} bytes, exceeds maximum of {max}")]
    TagValueTooLong { tag: String, len: usize, max: usize },

    #[error("aggregate key for '{name}' is {len} bytes, exceeds maximum of {max}")]
    KeyTooLong { name: String, len: usize, max: usize },

    #[error("rollup over {tags} tags exceeds the supported maximum of {max}")]
    TooManyRollupTags { tags: usize, max: usize },
}

/// Whether a statistic records event counts or sampled values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatisticType {
    /// The count field is the observation; the value field is unused.
    Count,
    /// The value field is the observation sum; the count field is the number
    /// of observations (for averaging).
    Value,
}

impl StatisticType {
    /// Returns the canonical string representation for logging.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Value => "value",
        }
    }
}

/// A single (tag name, tag value) pair on a raw event. Order is significant
/// for key construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagPair {
    pub tag: String,
    pub value: String,
}

impl TagPair {
    pub fn new(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            value: value.into(),
        }
    }
}

/// A tag position in an aggregate key: either the literal event value or the
/// wildcard marker produced by rollup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagValue {
    Literal(String),
    Wildcard,
}

impl TagValue {
    /// Returns the string stored in the key for this position.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal(v) => v,
            Self::Wildcard => WILDCARD,
        }
    }
}

/// The observation carried by an event, tagged by statistic type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// COUNT statistic: a number of occurrences.
    Count(i64),
    /// VALUE statistic: a sampled measurement.
    Value(f64),
}

/// An immutable raw statistic event as received from an event source.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticEvent {
    /// Event time in epoch milliseconds.
    pub time_ms: i64,
    /// Statistic name.
    pub name: String,
    /// Ordered tag pairs.
    pub tags: Vec<TagPair>,
    /// The observation.
    pub observation: Observation,
}

impl StatisticEvent {
    /// Creates a COUNT-type event.
    pub fn count(time_ms: i64, name: impl Into<String>, tags: Vec<TagPair>, count: i64) -> Self {
        Self {
            time_ms,
            name: name.into(),
            tags,
            observation: Observation::Count(count),
        }
    }

    /// Creates a VALUE-type event.
    pub fn value(time_ms: i64, name: impl Into<String>, tags: Vec<TagPair>, value: f64) -> Self {
        Self {
            time_ms,
            name: name.into(),
            tags,
            observation: Observation::Value(value),
        }
    }

    /// The statistic type implied by the observation.
    pub fn statistic_type(&self) -> StatisticType {
        match self.observation {
            Observation::Count(_) => StatisticType::Count,
            Observation::Value(_) => StatisticType::Value,
        }
    }

    /// Contribution to the aggregate count column.
    pub fn count_part(&self) -> i64 {
        match self.observation {
            Observation::Count(n) => n,
            // One observation, for averaging on the read side.
            Observation::Value(_) => 1,
        }
    }

    /// Contribution to the aggregate value column.
    pub fn value_part(&self) -> f64 {
        match self.observation {
            Observation::Count(_) => 0.0,
            Observation::Value(v) => v,
        }
    }

    /// Validates name and tag value lengths against the column widths.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.name)?;
        for pair in &self.tags {
            validate_tag_value(&pair.tag, &pair.value)?;
        }
        Ok(())
    }
}

/// Checks a statistic name against the name column width.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

/// Checks a single tag value against the tag value column width.
pub fn validate_tag_value(tag: &str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_TAG_VALUE_LEN {
        return Err(ValidationError::TagValueTooLong {
            tag: tag.to_string(),
            len: value.len(),
            max: MAX_TAG_VALUE_LEN,
        });
    }
    Ok(())
}

/// Builds the flat key string stored in the staging and key tables:
/// the name followed by each tag value, `¬`-delimited, wildcards as `*`.
pub fn build_key_string(name: &str, tag_values: &[TagValue]) -> String {
    let mut key = String::with_capacity(name.len() + tag_values.len() * 12);
    key.push_str(name);
    for value in tag_values {
        key.push(KEY_DELIMITER);
        key.push_str(value.as_str());
    }
    key
}
