//! Handling of caller-supplied timestamps.

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};

/// Precision every stored timestamp is truncated to (microseconds).
pub const STORED_SUBSEC_DIGITS: u16 = 6;

/// Current time at storage precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(STORED_SUBSEC_DIGITS)
}

/// Whether `ts` is a "zero" placeholder rather than a real instant.
///
/// Clients that serialise an unset time send either the year-1 zero instant
/// (`0001-01-01T00:00:00Z`) or the Unix epoch.
pub fn is_zero(ts: DateTime<Utc>) -> bool {
    ts <= zero_instant() || (ts.timestamp() == 0 && ts.timestamp_subsec_nanos() == 0)
}

/// Keep `ts` only when it is present and not zero, at storage precision.
pub fn supplied(ts: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    ts.filter(|t| !is_zero(*t))
        .map(|t| t.trunc_subsecs(STORED_SUBSEC_DIGITS))
}

fn zero_instant() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn zero_placeholders_are_ignored() {
        let year_one = "0001-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(supplied(Some(year_one)), None);
        assert_eq!(supplied(Some(Utc.timestamp_opt(0, 0).unwrap())), None);
        assert_eq!(supplied(None), None);
    }

    #[test]
    fn real_instants_are_kept_at_microsecond_precision() {
        let at = Utc.timestamp_opt(1_714_555_800, 123_456_789).unwrap();
        let kept = supplied(Some(at)).unwrap();
        assert_eq!(kept.timestamp_subsec_nanos(), 123_456_000);
    }
}
