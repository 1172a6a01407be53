use chrono::{DateTime, Datelike, TimeZone, Utc};

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_HOUR: i64 = 3_600 * MILLIS_PER_SECOND;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// A time-bucket granularity used to progressively coarsen stored aggregates.
///
/// Tiers are strictly ordered by increasing bucket width. Rollup only ever
/// moves data from a finer tier to the next coarser one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Precision {
    /// Finest tier: second buckets. Staging rows land here.
    Default,
    /// UTC hour buckets.
    Hour,
    /// UTC day buckets.
    Day,
    /// UTC calendar month buckets.
    Month,
}

impl Precision {
    /// All tiers, finest first.
    pub const ALL: [Precision; 4] = [
        Precision::Default,
        Precision::Hour,
        Precision::Day,
        Precision::Month,
    ];

    /// The numeric code stored in the precision column.
    pub const fn code(self) -> i64 {
        match self {
            Self::Default => 0,
            Self::Hour => 1,
            Self::Day => 2,
            Self::Month => 3,
        }
    }

    /// The tier for a stored precision code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Default),
            1 => Some(Self::Hour),
            2 => Some(Self::Day),
            3 => Some(Self::Month),
            _ => None,
        }
    }

    /// The finest tier.
    pub const fn finest() -> Self {
        Self::Default
    }

    /// The next coarser tier, or `None` for the coarsest.
    pub const fn next_coarser(self) -> Option<Self> {
        match self {
            Self::Default => Some(Self::Hour),
            Self::Hour => Some(Self::Day),
            Self::Day => Some(Self::Month),
            Self::Month => None,
        }
    }

    /// (finer, coarser) rollup pairs in the order stage 2 processes them.
    pub fn rollup_pairs() -> impl Iterator<Item = (Precision, Precision)> {
        Self::ALL
            .iter()
            .filter_map(|p| p.next_coarser().map(|c| (*p, c)))
    }

    /// Truncates an epoch-milliseconds instant to the start of its bucket at
    /// this tier.
    pub fn truncate(self, time_ms: i64) -> i64 {
        match self {
            Self::Default => time_ms.div_euclid(MILLIS_PER_SECOND) * MILLIS_PER_SECOND,
            Self::Hour => time_ms.div_euclid(MILLIS_PER_HOUR) * MILLIS_PER_HOUR,
            Self::Day => time_ms.div_euclid(MILLIS_PER_DAY) * MILLIS_PER_DAY,
            Self::Month => truncate_to_month(time_ms),
        }
    }

    /// Returns the canonical string representation for logging.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }
}

/// Truncates to the first instant of the UTC calendar month.
fn truncate_to_month(time_ms: i64) -> i64 {
    let dt: DateTime<Utc> = match Utc.timestamp_millis_opt(time_ms).single() {
        Some(dt) => dt,
        // Out of chrono's representable range; callers never feed such
        // instants from real events, fall back to the raw value.
        None => return time_ms,
    };

    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .map(|start| start.timestamp_millis())
        .unwrap_or(time_ms)
}
