use chrono::{DateTime, Local, TimeZone};

/// Convert epoch milliseconds into an instant shown in `tz`.
pub fn millis_to_datetime<Tz: TimeZone>(millis: i64, tz: &Tz) -> Option<DateTime<Tz>> {
    tz.timestamp_millis_opt(millis).single()
}

/// Epoch milliseconds as an instant in the machine's local time zone.
pub fn millis_to_local_datetime(millis: i64) -> Option<DateTime<Local>> {
    millis_to_datetime(millis, &Local)
}

pub fn millis_to_seconds(millis: i64) -> f64 {
    millis as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate, Utc};

    #[test]
    fn converts_in_given_zone() {
        let cest = FixedOffset::east_opt(2 * 3600).unwrap();
        let expected = NaiveDate::from_ymd_opt(2023, 5, 4)
            .unwrap()
            .and_hms_milli_opt(12, 50, 18, 954)
            .unwrap();
        let dt = millis_to_datetime(1683197418954, &cest).unwrap();
        assert_eq!(dt.naive_local(), expected);
    }

    #[test]
    fn utc_conversion_keeps_milliseconds() {
        let dt = millis_to_datetime(1683197418954, &Utc).unwrap();
        assert_eq!(dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(), "2023-05-04T10:50:18.954");
    }

    #[test]
    fn local_conversion_keeps_the_instant() {
        // 2023-10-29 01:30 UTC falls in the repeated hour of several European zones.
        for millis in [1683197418954, 1698543000000] {
            let dt = millis_to_local_datetime(millis).unwrap();
            assert_eq!(dt.timestamp_millis(), millis);
        }
    }

    #[test]
    fn seconds_keep_fraction() {
        assert_eq!(millis_to_seconds(1683197418954), 1683197418.954);
    }
}
