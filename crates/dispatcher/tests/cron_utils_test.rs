use chrono::{TimeZone, Timelike, Utc};
use snowcast_dispatcher::cron_utils::CronScheduler;

#[test]
fn test_cron_scheduler_creation() {
    assert!(CronScheduler::new("0 0 4 * * * *").is_ok());
    assert!(CronScheduler::new("invalid").is_err());
    assert!(CronScheduler::new("0 0 0 32 * *").is_err());
    assert!(CronScheduler::new("").is_err());
}

#[test]
fn test_matching_minute_is_stable_within_the_minute() {
    let scheduler = CronScheduler::new("0 0 4 * * * *").unwrap();
    let minute = Utc.with_ymd_and_hms(2025, 1, 1, 4, 0, 0).unwrap();

    assert_eq!(scheduler.matching_minute(minute), Some(minute));
    assert_eq!(
        scheduler.matching_minute(Utc.with_ymd_and_hms(2025, 1, 1, 4, 0, 45).unwrap()),
        Some(minute)
    );
    assert_eq!(
        scheduler.matching_minute(Utc.with_ymd_and_hms(2025, 1, 1, 4, 1, 0).unwrap()),
        None
    );
    assert_eq!(
        scheduler.matching_minute(Utc.with_ymd_and_hms(2025, 1, 1, 3, 59, 59).unwrap()),
        None
    );
}

#[test]
fn test_next_execution_time() {
    let scheduler = CronScheduler::new("0 0 16 * * * *").unwrap();
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 17, 0, 0).unwrap();
    let next = scheduler.next_execution_time(now).unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 2, 16, 0, 0).unwrap());
    assert_eq!(next.hour(), 16);
    assert_eq!(next - now, chrono::Duration::hours(23));
}
