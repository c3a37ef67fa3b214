use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveTime, TimeZone};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use crate::models::{transponder_key, DaySpec, Timer};

// ---------------------------------------------------------------------------
// Overlap classification
// ---------------------------------------------------------------------------
//
// Given a set of timers and the number of tuners, decide which timers can
// actually be recorded. Timers on the same transponder share a tuner, so
// the interesting quantity at any instant is the number of DISTINCT
// transponder keys among the timers active at that instant:
//
//   K == 1          -> no contention, everything is OK
//   2 <= K <= tuners -> concurrent recordings, but they fit: COLLISION
//   K > tuners       -> impossible to serve: CRITICAL
//
// A timer's final classification is the worst it experiences anywhere in
// the window.

/// Worst contention a timer experiences inside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Collision,
    Critical,
}

/// The two non-OK sets, keyed by timer id.
#[derive(Debug, Default, Clone)]
pub struct Classification {
    pub collision: HashSet<u32>,
    pub critical: HashSet<u32>,
}

impl Classification {
    pub fn severity(&self, timer_id: u32) -> Severity {
        if self.critical.contains(&timer_id) {
            Severity::Critical
        } else if self.collision.contains(&timer_id) {
            Severity::Collision
        } else {
            Severity::Ok
        }
    }
}

/// One concrete recording interval, annotated with the timer it came from.
/// Recurring timers expand to several of these.
struct Occurrence {
    timer_id: u32,
    start: DateTime<Local>,
    stop: DateTime<Local>,
    key: String,
}

/// Classify `timers` against `tuners` available tuners.
///
/// `window` restricts the instants considered; when `None`, it is derived
/// from the one-shot timers present, falling back to
/// [now − 24 h, now + 8 d] when there are none. `key_fn` maps a timer to
/// its tuning-resource key.
pub fn classify<F>(
    timers: &[Timer],
    tuners: u32,
    window: Option<(DateTime<Local>, DateTime<Local>)>,
    key_fn: F,
) -> Classification
where
    F: Fn(&Timer) -> String,
{
    let (from, to) = window.unwrap_or_else(|| derive_window(timers));
    if from >= to {
        return Classification::default();
    }

    let occurrences = expand(timers, from, to, &key_fn);

    // Sweep over every instant at which the active set changes.
    let boundaries: BTreeSet<DateTime<Local>> = occurrences
        .iter()
        .flat_map(|o| [o.start, o.stop])
        .collect();

    let mut result = Classification::default();

    for instant in boundaries {
        let active: Vec<&Occurrence> = occurrences
            .iter()
            .filter(|o| o.start <= instant && instant < o.stop)
            .collect();
        if active.len() < 2 {
            continue;
        }

        let distinct: HashSet<&str> = active.iter().map(|o| o.key.as_str()).collect();
        let k = distinct.len() as u32;

        if k > tuners {
            for occ in &active {
                result.critical.insert(occ.timer_id);
            }
        } else if k >= 2 {
            for occ in &active {
                result.collision.insert(occ.timer_id);
            }
        }
    }

    // Severity is the maximum observed: critical wins over collision.
    result.collision = &result.collision - &result.critical;
    result
}

/// Classify with the default key: the channel id minus its service id.
pub fn classify_timers(
    timers: &[Timer],
    tuners: u32,
    window: Option<(DateTime<Local>, DateTime<Local>)>,
) -> Classification {
    classify(timers, tuners, window, |t| {
        transponder_key(&t.channel_id).to_string()
    })
}

fn derive_window(timers: &[Timer]) -> (DateTime<Local>, DateTime<Local>) {
    let mut from: Option<DateTime<Local>> = None;
    let mut to: Option<DateTime<Local>> = None;

    for timer in timers {
        if let DaySpec::OneShot { start, stop } = &timer.day {
            from = Some(from.map_or(*start, |f| f.min(*start)));
            to = Some(to.map_or(*stop, |t| t.max(*stop)));
        }
    }

    match (from, to) {
        (Some(from), Some(to)) if from < to => (from, to),
        _ => {
            let now = Local::now();
            (now - Duration::hours(24), now + Duration::days(8))
        }
    }
}

fn expand<F>(
    timers: &[Timer],
    from: DateTime<Local>,
    to: DateTime<Local>,
    key_fn: &F,
) -> Vec<Occurrence>
where
    F: Fn(&Timer) -> String,
{
    let mut occurrences = Vec::new();

    for timer in timers {
        if !timer.active {
            continue;
        }
        let key = key_fn(timer);

        match &timer.day {
            DaySpec::OneShot { start, stop } => {
                if stop <= start || start.timestamp() == 0 {
                    continue;
                }
                if *stop > from && *start < to {
                    occurrences.push(Occurrence {
                        timer_id: timer.id,
                        start: *start,
                        stop: *stop,
                        key: key.clone(),
                    });
                }
            }
            DaySpec::Recurring {
                days,
                start_min,
                stop_min,
            } => {
                // Equal minutes would read as a 24h midnight-crossing
                // occurrence; a zero-duration timer records nothing.
                if start_min == stop_min {
                    continue;
                }
                // Start one day early so occurrences that cross midnight
                // into the window are not lost.
                let mut date = (from - Duration::days(1)).date_naive();
                let last = to.date_naive();

                while date <= last {
                    let weekday = date.weekday().num_days_from_monday() as usize;
                    if days[weekday] {
                        if let Some((start, stop)) =
                            recurring_occurrence(date, *start_min, *stop_min)
                        {
                            if stop > from && start < to && stop > start {
                                occurrences.push(Occurrence {
                                    timer_id: timer.id,
                                    start,
                                    stop,
                                    key: key.clone(),
                                });
                            }
                        }
                    }
                    date = match date.succ_opt() {
                        Some(next) => next,
                        None => break,
                    };
                }
            }
        }
    }

    occurrences
}

fn recurring_occurrence(
    date: NaiveDate,
    start_min: u16,
    stop_min: u16,
) -> Option<(DateTime<Local>, DateTime<Local>)> {
    let start_t = NaiveTime::from_hms_opt(start_min as u32 / 60, start_min as u32 % 60, 0)?;
    let stop_t = NaiveTime::from_hms_opt(stop_min as u32 / 60, stop_min as u32 % 60, 0)?;

    let start = Local.from_local_datetime(&date.and_time(start_t)).earliest()?;
    // stop <= start means the recording crosses midnight.
    let stop_date = if stop_min <= start_min {
        date.succ_opt()?
    } else {
        date
    };
    let stop = Local
        .from_local_datetime(&stop_date.and_time(stop_t))
        .earliest()?;

    Some((start, stop))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn one_shot(id: u32, channel: &str, day: (i32, u32, u32), start: (u32, u32), mins: i64) -> Timer {
        let start_dt = Local
            .with_ymd_and_hms(day.0, day.1, day.2, start.0, start.1, 0)
            .unwrap();
        Timer {
            id,
            active: true,
            channel_id: channel.to_string(),
            day: DaySpec::OneShot {
                start: start_dt,
                stop: start_dt + Duration::minutes(mins),
            },
            priority: 50,
            lifetime: 99,
            title: format!("timer-{id}"),
            aux: String::new(),
            event_id: None,
        }
    }

    fn recurring(id: u32, channel: &str, days: [bool; 7], start_min: u16, stop_min: u16) -> Timer {
        Timer {
            id,
            active: true,
            channel_id: channel.to_string(),
            day: DaySpec::Recurring {
                days,
                start_min,
                stop_min,
            },
            priority: 50,
            lifetime: 99,
            title: format!("timer-{id}"),
            aux: String::new(),
            event_id: None,
        }
    }

    #[test]
    fn shared_transponder_fits_one_tuner() {
        // Scenario: two overlapping timers on the same transponder,
        // one tuner — both OK.
        let timers = vec![
            one_shot(1, "S19.2E-1-100-10", (2026, 1, 10), (20, 0), 60),
            one_shot(2, "S19.2E-1-100-11", (2026, 1, 10), (20, 40), 60),
        ];
        let c = classify_timers(&timers, 1, None);
        assert!(c.critical.is_empty());
        assert!(c.collision.is_empty());
        assert_eq!(c.severity(1), Severity::Ok);
        assert_eq!(c.severity(2), Severity::Ok);
    }

    #[test]
    fn different_transponders_exceed_one_tuner() {
        // Scenario: same timings, second timer on another transponder —
        // both CRITICAL.
        let timers = vec![
            one_shot(1, "S19.2E-1-100-10", (2026, 1, 10), (20, 0), 60),
            one_shot(2, "S19.2E-1-200-20", (2026, 1, 10), (20, 40), 60),
        ];
        let c = classify_timers(&timers, 1, None);
        assert_eq!(c.severity(1), Severity::Critical);
        assert_eq!(c.severity(2), Severity::Critical);
        assert!(c.collision.is_empty());
    }

    #[test]
    fn two_tuners_downgrade_to_collision() {
        let timers = vec![
            one_shot(1, "S19.2E-1-100-10", (2026, 1, 10), (20, 0), 60),
            one_shot(2, "S19.2E-1-200-20", (2026, 1, 10), (20, 40), 60),
        ];
        let c = classify_timers(&timers, 2, None);
        assert_eq!(c.severity(1), Severity::Collision);
        assert_eq!(c.severity(2), Severity::Collision);
        assert!(c.critical.is_empty());
    }

    #[test]
    fn non_overlapping_timers_are_ok() {
        let timers = vec![
            one_shot(1, "S19.2E-1-100-10", (2026, 1, 10), (20, 0), 30),
            one_shot(2, "S19.2E-1-200-20", (2026, 1, 10), (21, 0), 30),
        ];
        let c = classify_timers(&timers, 1, None);
        assert_eq!(c.severity(1), Severity::Ok);
        assert_eq!(c.severity(2), Severity::Ok);
    }

    #[test]
    fn critical_wins_over_collision() {
        // Timer 1 overlaps timer 2 (two transponders, two tuners: fits)
        // and later also timer 3 (three transponders, two tuners: not).
        let timers = vec![
            one_shot(1, "S-1-100-1", (2026, 1, 10), (20, 0), 120),
            one_shot(2, "S-1-200-1", (2026, 1, 10), (20, 10), 30),
            one_shot(3, "S-1-300-1", (2026, 1, 10), (21, 0), 120),
            one_shot(4, "S-1-400-1", (2026, 1, 10), (21, 10), 30),
        ];
        let c = classify_timers(&timers, 2, None);
        assert_eq!(c.severity(1), Severity::Critical);
        assert_eq!(c.severity(3), Severity::Critical);
        assert_eq!(c.severity(4), Severity::Critical);
        // Timer 2 only ever shared the window with timer 1.
        assert_eq!(c.severity(2), Severity::Collision);
    }

    #[test]
    fn more_tuners_never_increase_severity() {
        // Monotonicity: raising the tuner count can only lower severities.
        let timers = vec![
            one_shot(1, "S-1-100-1", (2026, 1, 10), (20, 0), 90),
            one_shot(2, "S-1-200-1", (2026, 1, 10), (20, 15), 90),
            one_shot(3, "S-1-300-1", (2026, 1, 10), (20, 30), 90),
            one_shot(4, "S-1-100-2", (2026, 1, 10), (20, 45), 90),
            one_shot(5, "S-1-400-1", (2026, 1, 10), (22, 0), 30),
        ];

        let mut previous: Option<Classification> = None;
        for tuners in 1..=4 {
            let current = classify_timers(&timers, tuners, None);
            if let Some(prev) = previous {
                for timer in &timers {
                    assert!(
                        current.severity(timer.id) <= prev.severity(timer.id),
                        "severity of timer {} increased with {} tuners",
                        timer.id,
                        tuners
                    );
                }
            }
            previous = Some(current);
        }
    }

    #[test]
    fn inactive_and_zero_duration_timers_are_ignored() {
        let mut inactive = one_shot(1, "S-1-100-1", (2026, 1, 10), (20, 0), 60);
        inactive.active = false;
        let zero = one_shot(2, "S-1-200-1", (2026, 1, 10), (20, 0), 0);
        let real = one_shot(3, "S-1-300-1", (2026, 1, 10), (20, 0), 60);

        let c = classify_timers(&[inactive, zero, real], 1, None);
        assert_eq!(c.severity(1), Severity::Ok);
        assert_eq!(c.severity(2), Severity::Ok);
        assert_eq!(c.severity(3), Severity::Ok);
    }

    #[test]
    fn zero_duration_recurring_timer_is_ignored() {
        // Equal start and stop minutes must not expand into a bogus
        // 24h occurrence that collides with everything.
        let zero = recurring(1, "S-1-100-1", [true; 7], 20 * 60, 20 * 60);
        let single = one_shot(2, "S-1-200-1", (2026, 1, 10), (20, 30), 60);

        let window = (
            Local.with_ymd_and_hms(2026, 1, 9, 0, 0, 0).unwrap(),
            Local.with_ymd_and_hms(2026, 1, 12, 0, 0, 0).unwrap(),
        );
        let c = classify_timers(&[zero, single], 1, Some(window));
        assert_eq!(c.severity(1), Severity::Ok);
        assert_eq!(c.severity(2), Severity::Ok);
        assert!(c.collision.is_empty());
        assert!(c.critical.is_empty());
    }

    #[test]
    fn recurring_timer_expands_into_window() {
        // A daily timer colliding with a one-shot on another transponder.
        let daily = recurring(1, "S-1-100-1", [true; 7], 20 * 60, 21 * 60);
        let single = one_shot(2, "S-1-200-1", (2026, 1, 10), (20, 30), 60);

        let window = (
            Local.with_ymd_and_hms(2026, 1, 9, 0, 0, 0).unwrap(),
            Local.with_ymd_and_hms(2026, 1, 12, 0, 0, 0).unwrap(),
        );
        let c = classify_timers(&[daily, single], 1, Some(window));
        assert_eq!(c.severity(1), Severity::Critical);
        assert_eq!(c.severity(2), Severity::Critical);
    }

    #[test]
    fn recurring_occurrence_crosses_midnight() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let (start, stop) = recurring_occurrence(date, 23 * 60 + 30, 30).unwrap();
        assert_eq!(start.date_naive().day(), 10);
        assert_eq!(stop.date_naive().day(), 11);
        assert!(stop > start);
    }

    #[test]
    fn weekday_mask_limits_occurrences() {
        // 2026-01-10 is a Saturday; a weekday-only recurring timer must
        // not collide with a Saturday one-shot.
        let weekdays = recurring(1, "S-1-100-1", [true, true, true, true, true, false, false],
            20 * 60, 21 * 60);
        let saturday = one_shot(2, "S-1-200-1", (2026, 1, 10), (20, 0), 60);

        let window = (
            Local.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap(),
            Local.with_ymd_and_hms(2026, 1, 11, 0, 0, 0).unwrap(),
        );
        let c = classify_timers(&[weekdays, saturday], 1, Some(window));
        assert_eq!(c.severity(1), Severity::Ok);
        assert_eq!(c.severity(2), Severity::Ok);
    }

    #[test]
    fn empty_input_yields_empty_classification() {
        let c = classify_timers(&[], 1, None);
        assert!(c.collision.is_empty());
        assert!(c.critical.is_empty());
    }
}
