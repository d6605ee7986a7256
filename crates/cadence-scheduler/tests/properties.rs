//! Property-based tests for dispatch ordering, civil time and rate limiting.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use proptest::prelude::*;

use cadence_scheduler::{
    CivilClock, Job, JobKind, JobPriority, JobStatus, NewJob, RateLimit, RateLimitConfig,
    RateLimiter, select_batch,
};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap()
}

fn priority() -> impl Strategy<Value = JobPriority> {
    prop_oneof![
        Just(JobPriority::Low),
        Just(JobPriority::Medium),
        Just(JobPriority::High),
    ]
}

fn status() -> impl Strategy<Value = JobStatus> {
    prop_oneof![
        4 => Just(JobStatus::Pending),
        1 => Just(JobStatus::Processing),
        1 => Just(JobStatus::Completed),
        1 => Just(JobStatus::Failed),
    ]
}

// Jobs scheduled up to an hour either side of `base_time`.
fn job() -> impl Strategy<Value = Job> {
    (priority(), status(), -60i64..60).prop_map(|(priority, status, offset)| {
        let mut job = Job::from_new(
            NewJob::new(JobKind::ContentPosting, "alice")
                .priority(priority)
                .at(base_time() + Duration::minutes(offset)),
            3,
            base_time() - Duration::hours(2),
        );
        job.status = status;
        job
    })
}

// Offsets inside the supported range, in whole minutes.
fn offset_minutes() -> impl Strategy<Value = i32> {
    -1080i32..=1080
}

fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..(366 * 24 * 60)).prop_map(|m| base_time() + Duration::minutes(m))
}

proptest! {
    #[test]
    fn select_batch_respects_cap_and_eligibility(
        jobs in prop::collection::vec(job(), 0..20),
        cap in 0usize..8,
    ) {
        let now = base_time();
        let selected = select_batch(&jobs, now, cap);
        let by_id: HashMap<&str, &Job> = jobs.iter().map(|j| (j.id.as_str(), j)).collect();

        prop_assert!(selected.len() <= cap);
        let unique: HashSet<&String> = selected.iter().collect();
        prop_assert_eq!(unique.len(), selected.len());

        for id in &selected {
            let job = by_id[id.as_str()];
            prop_assert_eq!(job.status, JobStatus::Pending);
            prop_assert!(job.scheduled_time <= now);
        }

        let due = jobs.iter().filter(|j| j.is_due(now)).count();
        prop_assert_eq!(selected.len(), due.min(cap));
    }

    #[test]
    fn select_batch_never_skips_higher_priority(
        jobs in prop::collection::vec(job(), 0..20),
        cap in 1usize..8,
    ) {
        let now = base_time();
        let selected: HashSet<String> = select_batch(&jobs, now, cap).into_iter().collect();
        let lowest_selected = jobs
            .iter()
            .filter(|j| selected.contains(&j.id))
            .map(|j| j.priority)
            .min();

        if let Some(lowest) = lowest_selected {
            for job in jobs.iter().filter(|j| j.is_due(now) && !selected.contains(&j.id)) {
                prop_assert!(job.priority <= lowest);
            }
        }
    }

    #[test]
    fn daily_trigger_is_future_and_on_the_hour(
        offset in offset_minutes(),
        now in instant(),
        hour in 0u32..24,
        jitter in 0u32..60,
    ) {
        let clock = CivilClock::new(offset).unwrap();
        let fire = clock.daily_trigger(now, hour, jitter).unwrap();
        let top_of_hour = fire - Duration::minutes(i64::from(jitter));

        prop_assert!(top_of_hour > now);
        prop_assert!(top_of_hour <= now + Duration::hours(24));
        let local = clock.local(top_of_hour);
        prop_assert_eq!(local.hour(), hour);
        prop_assert_eq!(local.minute(), 0);
    }

    #[test]
    fn next_slot_lands_on_an_allowed_day_at_the_slot(
        offset in offset_minutes(),
        now in instant(),
        h in 0u32..24,
        m in 0u32..60,
        days in prop::collection::btree_set(0u8..7, 1..7),
    ) {
        let clock = CivilClock::new(offset).unwrap();
        let slot = NaiveTime::from_hms_opt(h, m, 0).unwrap();
        let days: Vec<u8> = days.into_iter().collect();

        let at = clock.next_slot_occurrence(now, slot, &days).unwrap();
        prop_assert!(at > now);
        prop_assert!(at <= now + Duration::days(8));
        prop_assert_eq!(clock.local(at).time(), slot);
        prop_assert!(days.contains(&clock.weekday_index(at)));
    }

    #[test]
    fn rate_limiter_never_exceeds_budget(
        max_requests in 1u32..10,
        attempts in 1usize..30,
    ) {
        let limiter = RateLimiter::new(RateLimitConfig {
            default: RateLimit { max_requests, window_secs: 3600 },
            overrides: HashMap::new(),
        });
        let allowed = (0..attempts)
            .filter(|_| limiter.check_limit("alice", Some("devto")).allowed)
            .count();
        prop_assert_eq!(allowed, attempts.min(max_requests as usize));
    }
}

#[test]
fn test_day_bounds_cover_exactly_one_civil_day() {
    let clock = CivilClock::new(330).unwrap();
    let now = base_time();
    let bounds = clock.day_bounds(now);

    assert_eq!(bounds.end - bounds.start, Duration::days(1));
    assert!(bounds.contains(now));
    assert!(bounds.contains(bounds.start));
    assert!(!bounds.contains(bounds.end));
    assert_eq!(clock.local(bounds.start).time(), NaiveTime::MIN);
}
