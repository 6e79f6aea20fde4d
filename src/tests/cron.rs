use chrono::NaiveDate;

use crate::scheduler::{CronError, CronExpression};

fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, s)
        .unwrap()
}

#[test]
fn test_hourly_macro_expansion_and_next_run() {
    let cron = CronExpression::parse("@hourly").unwrap();
    assert_eq!(cron.minutes().iter().copied().collect::<Vec<u32>>(), vec![0]);
    assert_eq!(cron.hours().len(), 24);
    assert_eq!(cron.days().len(), 31);
    assert_eq!(cron.months().len(), 12);
    assert_eq!(cron.weekdays().len(), 7);

    let next = cron.next_run_time(&at(2024, 3, 15, 10, 17, 5)).unwrap();
    assert_eq!(next, at(2024, 3, 15, 11, 0, 0));
}

#[test]
fn test_macros_match_their_expansions() {
    for (macro_name, expansion) in [
        ("@yearly", "0 0 1 1 *"),
        ("@annually", "0 0 1 1 *"),
        ("@monthly", "0 0 1 * *"),
        ("@weekly", "0 0 * * 0"),
        ("@daily", "0 0 * * *"),
        ("@midnight", "0 0 * * *"),
        ("@hourly", "0 * * * *"),
    ] {
        let a = CronExpression::parse(macro_name).unwrap();
        let b = CronExpression::parse(expansion).unwrap();
        assert_eq!(a.minutes(), b.minutes(), "{macro_name}");
        assert_eq!(a.hours(), b.hours(), "{macro_name}");
        assert_eq!(a.days(), b.days(), "{macro_name}");
        assert_eq!(a.months(), b.months(), "{macro_name}");
        assert_eq!(a.weekdays(), b.weekdays(), "{macro_name}");
    }
}

#[test]
fn test_lists_ranges_and_steps() {
    let cron = CronExpression::parse("*/15 1-3 1,15 * *").unwrap();
    assert_eq!(
        cron.minutes().iter().copied().collect::<Vec<u32>>(),
        vec![0, 15, 30, 45]
    );
    assert_eq!(
        cron.hours().iter().copied().collect::<Vec<u32>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        cron.days().iter().copied().collect::<Vec<u32>>(),
        vec![1, 15]
    );

    // a bare base with a step runs to the end of the range
    let cron = CronExpression::parse("50/4 * * * *").unwrap();
    assert_eq!(
        cron.minutes().iter().copied().collect::<Vec<u32>>(),
        vec![50, 54, 58]
    );

    // a range with a step
    let cron = CronExpression::parse("10-30/10 * * * *").unwrap();
    assert_eq!(
        cron.minutes().iter().copied().collect::<Vec<u32>>(),
        vec![10, 20, 30]
    );
}

#[test]
fn test_month_and_weekday_names() {
    let cron = CronExpression::parse("0 0 * jan,JUL sun-sat").unwrap();
    assert_eq!(
        cron.months().iter().copied().collect::<Vec<u32>>(),
        vec![1, 7]
    );
    assert_eq!(cron.weekdays().len(), 7);

    let cron = CronExpression::parse("0 0 * * MON-FRI").unwrap();
    assert_eq!(
        cron.weekdays().iter().copied().collect::<Vec<u32>>(),
        vec![1, 2, 3, 4, 5]
    );
}

#[test]
fn test_parse_errors() {
    match CronExpression::parse("0 0 * *") {
        Err(CronError::FieldCount(4)) => {}
        other => panic!("expected FieldCount, got {other:?}"),
    }
    match CronExpression::parse("@fortnightly") {
        Err(CronError::UnknownMacro(_)) => {}
        other => panic!("expected UnknownMacro, got {other:?}"),
    }
    match CronExpression::parse("61 * * * *") {
        Err(CronError::OutOfRange { value: 61, .. }) => {}
        other => panic!("expected OutOfRange, got {other:?}"),
    }
    match CronExpression::parse("x * * * *") {
        Err(CronError::BadValue(_)) => {}
        other => panic!("expected BadValue, got {other:?}"),
    }
    match CronExpression::parse("*/0 * * * *") {
        Err(CronError::BadStep(_)) => {}
        other => panic!("expected BadStep, got {other:?}"),
    }
}

#[test]
fn test_matches_honors_all_five_fields() {
    let cron = CronExpression::parse("30 14 15 3 5").unwrap();
    // 2024-03-15 is a Friday (weekday 5)
    assert!(cron.matches(&at(2024, 3, 15, 14, 30, 0)));
    assert!(!cron.matches(&at(2024, 3, 15, 14, 31, 0)));
    assert!(!cron.matches(&at(2024, 3, 15, 13, 30, 0)));
    assert!(!cron.matches(&at(2024, 3, 16, 14, 30, 0)));
    assert!(!cron.matches(&at(2024, 4, 15, 14, 30, 0)));
}

/// `next_run_time` returns the first matching minute and nothing earlier.
#[test]
fn test_next_run_time_is_the_first_match() {
    let cron = CronExpression::parse("*/20 * * * *").unwrap();
    let start = at(2024, 6, 1, 9, 3, 42);
    let next = cron.next_run_time(&start).unwrap();
    assert_eq!(next, at(2024, 6, 1, 9, 20, 0));
    assert!(cron.matches(&next));
    let mut probe = at(2024, 6, 1, 9, 4, 0);
    while probe < next {
        assert!(!cron.matches(&probe));
        probe += chrono::Duration::minutes(1);
    }
}

#[test]
fn test_next_run_time_spans_month_boundary() {
    let cron = CronExpression::parse("@monthly").unwrap();
    let next = cron.next_run_time(&at(2024, 1, 31, 23, 59, 0)).unwrap();
    assert_eq!(next, at(2024, 2, 1, 0, 0, 0));
}

#[test]
fn test_impossible_schedule_gives_up() {
    // February 31st never arrives; the search is bounded at ten years
    let cron = CronExpression::parse("0 0 31 2 *").unwrap();
    assert!(cron.next_run_time(&at(2024, 1, 1, 0, 0, 0)).is_none());
}
