//! Aggregation periods and their calendar arithmetic.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ErrorCode, RollupError};

/// Taken off every period's minimum length to get its lease TTL, so a lease
/// is always gone before the next firing of the same period.
pub const LEASE_SAFETY_MARGIN: Duration = Duration::from_secs(60);

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Calendar granularity a rollup is computed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregationPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl AggregationPeriod {
    pub const ALL: [AggregationPeriod; 5] = [
        Self::Hourly,
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
        Self::Yearly,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "HOURLY",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Yearly => "YEARLY",
        }
    }

    /// strftime-style format a timestamp is truncated with to find its bucket.
    pub const fn bucket_format(&self) -> &'static str {
        match self {
            Self::Hourly => "%Y-%m-%d-%H",
            Self::Daily => "%Y-%m-%d",
            Self::Weekly => "%Y-%U-1",
            Self::Monthly => "%Y-%m-01",
            Self::Yearly => "%Y-01-01",
        }
    }

    /// Shortest wall-clock length the period can have.
    pub const fn min_duration(&self) -> Duration {
        match self {
            Self::Hourly => Duration::from_secs(HOUR),
            Self::Daily => Duration::from_secs(DAY),
            Self::Weekly => Duration::from_secs(7 * DAY),
            Self::Monthly => Duration::from_secs(28 * DAY),
            Self::Yearly => Duration::from_secs(365 * DAY),
        }
    }

    /// TTL for the lease guarding one firing of this period.
    pub fn lease_ttl(&self) -> Duration {
        self.min_duration().saturating_sub(LEASE_SAFETY_MARGIN)
    }

    /// `now` minus one period, in calendar terms.
    ///
    /// Month arithmetic clamps to the end of shorter months (31 March minus a
    /// month is 28 or 29 February). `None` if the result cannot be
    /// represented in the timezone.
    pub fn lookback<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let now = now.clone();
        match self {
            Self::Hourly => now.checked_sub_signed(chrono::Duration::hours(1)),
            Self::Daily => now.checked_sub_days(Days::new(1)),
            Self::Weekly => now.checked_sub_days(Days::new(7)),
            Self::Monthly => now.checked_sub_months(Months::new(1)),
            Self::Yearly => now.checked_sub_months(Months::new(12)),
        }
    }

    /// The first boundary of this period strictly after `after`, in `after`'s
    /// timezone.
    ///
    /// Boundaries are the top of the hour, local midnight, Sunday midnight,
    /// the first of the month and the first of January. A boundary falling in
    /// a daylight-saving gap moves to the first valid local time after it; an
    /// ambiguous one resolves to its earlier instant.
    pub fn next_boundary<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let local = after.naive_local();
        let date = local.date();

        let next = match self {
            Self::Hourly => date
                .and_hms_opt(local.hour(), 0, 0)?
                .checked_add_signed(chrono::Duration::hours(1))?,
            Self::Daily => midnight(date.succ_opt()?)?,
            Self::Weekly => {
                let days = 7 - u64::from(date.weekday().num_days_from_sunday());
                midnight(date.checked_add_days(Days::new(days))?)?
            }
            Self::Monthly => {
                let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?;
                midnight(first.checked_add_months(Months::new(1))?)?
            }
            Self::Yearly => midnight(NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?)?,
        };

        resolve_local(&after.timezone(), next)
    }
}

fn midnight(date: NaiveDate) -> Option<NaiveDateTime> {
    date.and_hms_opt(0, 0, 0)
}

/// Map a local wall-clock time to an instant, stepping forward a minute at a
/// time out of a DST gap.
fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    let mut candidate = local;
    // Gaps are at most a few hours long.
    for _ in 0..(24 * 60) {
        if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
            return Some(resolved);
        }
        candidate = candidate.checked_add_signed(chrono::Duration::minutes(1))?;
    }
    None
}

impl fmt::Display for AggregationPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationPeriod {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|period| period.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                RollupError::new(
                    ErrorCode::InvalidSchedule,
                    format!("unknown aggregation period: {}", s),
                )
            })
    }
}
