//! Civil-time arithmetic for a fixed UTC offset.
//!
//! Schedules are written in wall-clock time ("09:00", weekday 1) for one
//! configured timezone. Everything stored or compared is a UTC instant, so
//! every conversion between the two goes through [`CivilClock`].

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};

use crate::config::MAX_UTC_OFFSET_MINUTES;
use crate::error::{Result, SchedulerError};

/// Half-open range `[start, end)` of absolute instants covering one civil day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayBounds {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Converts between UTC instants and wall-clock time in a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilClock {
    offset: FixedOffset,
}

impl CivilClock {
    pub fn new(offset_minutes: i32) -> Result<Self> {
        if offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(SchedulerError::InvalidConfig(format!(
                "utc offset {offset_minutes} minutes is out of range"
            )));
        }
        let offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            SchedulerError::InvalidConfig(format!("invalid utc offset {offset_minutes}"))
        })?;
        Ok(Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Wall-clock time at `now`.
    pub fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.offset)
    }

    pub fn civil_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local(now).date_naive()
    }

    /// Civil weekday of `now`, 0 = Sunday.
    pub fn weekday_index(&self, now: DateTime<Utc>) -> u8 {
        weekday_of(self.civil_date(now))
    }

    /// Instants covering the civil day that contains `now`.
    pub fn day_bounds(&self, now: DateTime<Utc>) -> DayBounds {
        let date = self.civil_date(now);
        let start = self.to_utc(date.and_time(NaiveTime::MIN));
        DayBounds {
            start,
            end: start + Duration::days(1),
        }
    }

    /// Next firing of a daily window at `hour:00` local, plus `jitter_minutes`.
    ///
    /// The top of the hour is compared against `now` before jitter is added:
    /// once it has passed, the window belongs to tomorrow.
    pub fn daily_trigger(
        &self,
        now: DateTime<Utc>,
        hour: u32,
        jitter_minutes: u32,
    ) -> Result<DateTime<Utc>> {
        let at = NaiveTime::from_hms_opt(hour, 0, 0)
            .ok_or_else(|| SchedulerError::InvalidConfig(format!("invalid trigger hour {hour}")))?;

        let mut base = self.to_utc(self.civil_date(now).and_time(at));
        if base <= now {
            base += Duration::days(1);
        }
        Ok(base + Duration::minutes(i64::from(jitter_minutes)))
    }

    /// First instant after `now` at local time `slot` on one of `days` (0 = Sunday).
    ///
    /// Returns `None` when `days` names no valid weekday.
    pub fn next_slot_occurrence(
        &self,
        now: DateTime<Utc>,
        slot: NaiveTime,
        days: &[u8],
    ) -> Option<DateTime<Utc>> {
        let today = self.civil_date(now);
        (0..=7).find_map(|offset| {
            let date = today + Duration::days(offset);
            if !days.contains(&weekday_of(date)) {
                return None;
            }
            let candidate = self.to_utc(date.and_time(slot));
            (candidate > now).then_some(candidate)
        })
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }
}

/// Parse a wall-clock "HH:MM" slot.
pub fn parse_slot(slot: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(slot.trim(), "%H:%M")
        .map_err(|e| SchedulerError::InvalidSchedule(format!("bad time slot {slot:?}: {e}")))
}

fn weekday_of(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ist() -> CivilClock {
        CivilClock::new(330).unwrap()
    }

    /// Build the UTC instant for a wall-clock time in UTC+5:30.
    fn at_ist(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    // === Unit Tests ===

    #[test]
    fn test_offset_bounds() {
        assert!(CivilClock::new(18 * 60).is_ok());
        assert!(CivilClock::new(-18 * 60).is_ok());
        assert!(CivilClock::new(18 * 60 + 1).is_err());
    }

    #[test]
    fn test_analytics_trigger_before_hour_fires_same_day() {
        let now = at_ist(2024, 3, 4, 22, 0);
        let fire = ist().daily_trigger(now, 23, 0).unwrap();
        assert_eq!(fire, at_ist(2024, 3, 4, 23, 0));
    }

    #[test]
    fn test_analytics_trigger_after_hour_rolls_to_tomorrow() {
        let now = at_ist(2024, 3, 4, 23, 30);
        let fire = ist().daily_trigger(now, 23, 0).unwrap();
        assert_eq!(fire, at_ist(2024, 3, 5, 23, 0));
    }

    #[test]
    fn test_trigger_exactly_on_the_hour_rolls() {
        let now = at_ist(2024, 3, 4, 23, 0);
        let fire = ist().daily_trigger(now, 23, 0).unwrap();
        assert_eq!(fire, at_ist(2024, 3, 5, 23, 0));
    }

    #[test]
    fn test_midnight_trigger_with_jitter() {
        let now = at_ist(2024, 3, 4, 10, 0);
        let fire = ist().daily_trigger(now, 0, 17).unwrap();
        assert_eq!(fire, at_ist(2024, 3, 5, 0, 17));
    }

    #[test]
    fn test_civil_date_differs_from_utc_date() {
        // 20:00 UTC on a Sunday is already Monday 01:30 in UTC+5:30.
        let now = Utc.with_ymd_and_hms(2024, 3, 3, 20, 0, 0).unwrap();
        assert_eq!(ist().civil_date(now), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(ist().weekday_index(now), 1);
    }

    #[test]
    fn test_day_bounds() {
        let now = at_ist(2024, 3, 4, 15, 45);
        let bounds = ist().day_bounds(now);
        assert_eq!(bounds.start, at_ist(2024, 3, 4, 0, 0));
        assert_eq!(bounds.end, at_ist(2024, 3, 5, 0, 0));
        assert!(bounds.contains(now));
        assert!(!bounds.contains(bounds.end));
    }

    #[test]
    fn test_next_slot_same_day() {
        // 2024-03-04 is a Monday.
        let now = at_ist(2024, 3, 4, 7, 0);
        let slot = parse_slot("09:00").unwrap();
        let next = ist().next_slot_occurrence(now, slot, &[1, 3, 5]).unwrap();
        assert_eq!(next, at_ist(2024, 3, 4, 9, 0));
    }

    #[test]
    fn test_next_slot_skips_to_next_allowed_day() {
        let now = at_ist(2024, 3, 4, 10, 0);
        let slot = parse_slot("09:00").unwrap();
        let next = ist().next_slot_occurrence(now, slot, &[1, 3, 5]).unwrap();
        assert_eq!(next, at_ist(2024, 3, 6, 9, 0));
    }

    #[test]
    fn test_next_slot_single_day_wraps_a_week() {
        let now = at_ist(2024, 3, 4, 10, 0);
        let slot = parse_slot("09:00").unwrap();
        let next = ist().next_slot_occurrence(now, slot, &[1]).unwrap();
        assert_eq!(next, at_ist(2024, 3, 11, 9, 0));
    }

    #[test]
    fn test_next_slot_no_days() {
        let now = at_ist(2024, 3, 4, 10, 0);
        let slot = parse_slot("09:00").unwrap();
        assert!(ist().next_slot_occurrence(now, slot, &[]).is_none());
        assert!(ist().next_slot_occurrence(now, slot, &[9]).is_none());
    }

    #[test]
    fn test_parse_slot() {
        assert_eq!(parse_slot("14:30").unwrap(), NaiveTime::from_hms_opt(14, 30, 0).unwrap());
        assert!(matches!(parse_slot("25:00"), Err(SchedulerError::InvalidSchedule(_))));
        assert!(parse_slot("noon").is_err());
    }

    // === Property Tests ===

    proptest! {
        #[test]
        fn daily_trigger_is_next_occurrence_of_hour(
            secs in 1_600_000_000i64..1_900_000_000,
            offset in -MAX_UTC_OFFSET_MINUTES..=MAX_UTC_OFFSET_MINUTES,
            hour in 0u32..24,
            jitter in 0u32..60,
        ) {
            let clock = CivilClock::new(offset).unwrap();
            let now = Utc.timestamp_opt(secs, 0).unwrap();
            let fire = clock.daily_trigger(now, hour, jitter).unwrap();
            let base = fire - Duration::minutes(i64::from(jitter));

            prop_assert!(base > now);
            prop_assert!(base - now <= Duration::days(1));
            let local = clock.local(base);
            prop_assert_eq!(local.time(), NaiveTime::from_hms_opt(hour, 0, 0).unwrap());
        }

        #[test]
        fn next_slot_lands_on_allowed_day(
            secs in 1_600_000_000i64..1_900_000_000,
            offset in -MAX_UTC_OFFSET_MINUTES..=MAX_UTC_OFFSET_MINUTES,
            h in 0u32..24,
            m in 0u32..60,
            days in prop::collection::btree_set(0u8..7, 1..=7),
        ) {
            let clock = CivilClock::new(offset).unwrap();
            let now = Utc.timestamp_opt(secs, 0).unwrap();
            let slot = NaiveTime::from_hms_opt(h, m, 0).unwrap();
            let days: Vec<u8> = days.into_iter().collect();

            let next = clock.next_slot_occurrence(now, slot, &days).unwrap();
            prop_assert!(next > now);
            prop_assert!(next - now <= Duration::days(8));
            prop_assert!(days.contains(&clock.weekday_index(next)));
            prop_assert_eq!(clock.local(next).time(), slot);
        }
    }
}
