//! Schedule expressions for the auto-refresh driver.
//!
//! The textual grammar:
//!
//! ```text
//! eventlist  = eventset *( ".." eventset )
//! eventset   = wdaylist / timelist / wdaylist "," timelist
//! wday       = ( "sun" / "mon" / ... / "sat" ) [ 1..5 ]
//! wdayspan   = wday "-" wday
//! time       = 2DIGIT ":" 2DIGIT
//! timespan   = time ( "-" / "~" ) time [ "/" 1*DIGIT ]
//! ```
//!
//! `-` spans are deterministic (the event fires at the span start); `~`
//! spans fire at a uniformly sampled instant inside. `/N` splits a span
//! into N equal sub-spans, each producing one event. A weekday suffix
//! `1..4` picks the Nth occurrence in the month; `5` picks the last.

use std::time::Duration;

use chrono::{DateTime, Datelike, Utc, Weekday};
use rand::Rng;
use snaplite_shared::errors::{SnapError, SnapResult};

/// Minutes in a day; "24:00" is a valid end-of-day clock value.
const DAY_MINUTES: u32 = 24 * 60;

/// How far ahead `next` searches for a matching day. Covers the sparsest
/// valid expression (a single fifth-occurrence weekday).
const LOOKAHEAD_DAYS: i64 = 366;

// ============================================================================
// TYPES
// ============================================================================

/// A wall-clock time of day; `24:00` marks the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Clock {
    pub hour: u8,
    pub minute: u8,
}

impl Clock {
    pub fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    fn minutes(&self) -> u32 {
        u32::from(self.hour) * 60 + u32::from(self.minute)
    }

    fn from_minutes(minutes: u32) -> Self {
        Self {
            hour: (minutes / 60) as u8,
            minute: (minutes % 60) as u8,
        }
    }
}

impl std::fmt::Display for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// A span of wall-clock time, optionally split and optionally randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSpan {
    pub start: Clock,
    pub end: Clock,
    /// Number of equal sub-spans; 0 or 1 means no split.
    pub split: u32,
    /// True for `~` spans: the fire instant is sampled inside the span.
    pub spread: bool,
}

impl ClockSpan {
    /// Expand the `/N` split into the concrete sub-spans, each inheriting
    /// the randomness flag.
    pub fn subspans(&self) -> Vec<ClockSpan> {
        let n = self.split.max(1);
        if n == 1 {
            return vec![ClockSpan {
                split: 0,
                ..*self
            }];
        }
        let start = self.start.minutes();
        let len = self.end.minutes().saturating_sub(start);
        (0..n)
            .map(|i| ClockSpan {
                start: Clock::from_minutes(start + i * len / n),
                end: Clock::from_minutes(start + (i + 1) * len / n),
                split: 0,
                spread: self.spread,
            })
            .collect()
    }
}

impl std::fmt::Display for ClockSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)?;
        } else {
            let sep = if self.spread { '~' } else { '-' };
            write!(f, "{}{}{}", self.start, sep, self.end)?;
        }
        if self.split > 1 {
            write!(f, "/{}", self.split)?;
        }
        Ok(())
    }
}

/// A weekday with an optional week-of-month constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Week {
    pub day: Weekday,
    /// 0 = every week, 1..4 = Nth occurrence in the month, 5 = last
    /// occurrence (which may be the 4th or 5th calendar week).
    pub num: u8,
}

impl Week {
    fn matches(&self, date: chrono::NaiveDate) -> bool {
        if date.weekday() != self.day {
            return false;
        }
        match self.num {
            0 => true,
            5 => {
                // Last occurrence: no same weekday later in the month.
                date.checked_add_days(chrono::Days::new(7))
                    .map(|next| next.month() != date.month())
                    .unwrap_or(true)
            }
            n => (date.day() - 1) / 7 + 1 == u32::from(n),
        }
    }
}

impl std::fmt::Display for Week {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.day {
            Weekday::Sun => "sun",
            Weekday::Mon => "mon",
            Weekday::Tue => "tue",
            Weekday::Wed => "wed",
            Weekday::Thu => "thu",
            Weekday::Fri => "fri",
            Weekday::Sat => "sat",
        };
        write!(f, "{}", name)?;
        if self.num > 0 {
            write!(f, "{}", self.num)?;
        }
        Ok(())
    }
}

/// An inclusive weekday range; `start == end` names a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekSpan {
    pub start: Week,
    pub end: Week,
}

impl WeekSpan {
    fn matches(&self, date: chrono::NaiveDate) -> bool {
        if self.start == self.end {
            return self.start.matches(date);
        }
        // Cyclic range over weekday numbers (mon=0 .. sun=6), so
        // "fri-mon" covers the weekend.
        let from = self.start.day.num_days_from_monday();
        let to = self.end.day.num_days_from_monday();
        let day = date.weekday().num_days_from_monday();
        let in_range = if from <= to {
            (from..=to).contains(&day)
        } else {
            day >= from || day <= to
        };
        if !in_range {
            return false;
        }
        // A week-of-month constraint on either endpoint applies to the
        // whole span.
        let num = if self.start.num > 0 {
            self.start.num
        } else {
            self.end.num
        };
        num == 0
            || Week {
                day: date.weekday(),
                num,
            }
            .matches(date)
    }
}

impl std::fmt::Display for WeekSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One event set: weekday filters plus time spans. An empty weekday list
/// matches every day; an empty time list means the whole day.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schedule {
    pub weekdays: Vec<WeekSpan>,
    pub times: Vec<ClockSpan>,
}

impl Schedule {
    fn matches_day(&self, date: chrono::NaiveDate) -> bool {
        self.weekdays.is_empty() || self.weekdays.iter().any(|w| w.matches(date))
    }

    fn clock_spans(&self) -> Vec<ClockSpan> {
        if self.times.is_empty() {
            return vec![ClockSpan {
                start: Clock::new(0, 0),
                end: Clock::new(24, 0),
                split: 0,
                spread: false,
            }];
        }
        self.times.iter().flat_map(|t| t.subspans()).collect()
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for w in &self.weekdays {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", w)?;
            first = false;
        }
        for t in &self.times {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", t)?;
            first = false;
        }
        Ok(())
    }
}

/// A concrete fire window computed from a schedule.
///
/// The window bounds are deterministic for a given (schedule, last) pair;
/// only the fire instant inside a spread window is randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub spread: bool,
}

impl Window {
    /// The instant the event fires: the window start for deterministic
    /// windows, a uniformly sampled instant for spread windows.
    pub fn fire_time<R: Rng>(&self, rng: &mut R) -> DateTime<Utc> {
        if !self.spread || self.end <= self.start {
            return self.start;
        }
        let len = (self.end - self.start).num_seconds();
        self.start + chrono::Duration::seconds(rng.random_range(0..=len))
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

// ============================================================================
// PARSER
// ============================================================================

/// Parse a full schedule expression (event sets separated by `..`).
///
/// # Errors
///
/// Returns [`SnapError::Schedule`] naming the offending token.
pub fn parse_schedule(expr: &str) -> SnapResult<Vec<Schedule>> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(SnapError::Schedule("empty expression".to_string()));
    }
    expr.split("..").map(parse_event_set).collect()
}

/// Render schedules back to the textual grammar.
pub fn format_schedule(schedules: &[Schedule]) -> String {
    schedules
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("..")
}

fn parse_event_set(set: &str) -> SnapResult<Schedule> {
    let mut schedule = Schedule::default();
    for token in set.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(SnapError::Schedule(format!(
                "empty element in event set {:?}",
                set
            )));
        }
        if token.starts_with(|c: char| c.is_ascii_alphabetic()) {
            if !schedule.times.is_empty() {
                return Err(SnapError::Schedule(format!(
                    "weekday {:?} after time list",
                    token
                )));
            }
            schedule.weekdays.push(parse_week_span(token)?);
        } else {
            schedule.times.push(parse_clock_span(token)?);
        }
    }
    Ok(schedule)
}

fn parse_week_span(token: &str) -> SnapResult<WeekSpan> {
    match token.split_once('-') {
        Some((start, end)) => Ok(WeekSpan {
            start: parse_week(start)?,
            end: parse_week(end)?,
        }),
        None => {
            let day = parse_week(token)?;
            Ok(WeekSpan {
                start: day,
                end: day,
            })
        }
    }
}

fn parse_week(token: &str) -> SnapResult<Week> {
    let (name, num) = token.split_at(token.len().min(3));
    let day = match name {
        "sun" => Weekday::Sun,
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        _ => {
            return Err(SnapError::Schedule(format!(
                "cannot parse weekday {:?}",
                token
            )));
        }
    };
    let num = if num.is_empty() {
        0
    } else {
        let n: u8 = num
            .parse()
            .map_err(|_| SnapError::Schedule(format!("cannot parse week number {:?}", token)))?;
        if !(1..=5).contains(&n) {
            return Err(SnapError::Schedule(format!(
                "week number out of range in {:?}",
                token
            )));
        }
        n
    };
    Ok(Week { day, num })
}

fn parse_clock_span(token: &str) -> SnapResult<ClockSpan> {
    let (span, split) = match token.split_once('/') {
        Some((span, n)) => {
            let n: u32 = n
                .parse()
                .map_err(|_| SnapError::Schedule(format!("cannot parse split count {:?}", token)))?;
            if n == 0 {
                return Err(SnapError::Schedule(format!(
                    "split count must be positive in {:?}",
                    token
                )));
            }
            (span, n)
        }
        None => (token, 0),
    };

    let (start, end, spread) = if let Some((a, b)) = span.split_once('~') {
        (parse_clock(a)?, parse_clock(b)?, true)
    } else if let Some((a, b)) = split_span_dash(span) {
        (parse_clock(a)?, parse_clock(b)?, false)
    } else {
        let at = parse_clock(span)?;
        (at, at, false)
    };

    if end < start {
        return Err(SnapError::Schedule(format!(
            "span end before start in {:?}",
            token
        )));
    }
    Ok(ClockSpan {
        start,
        end,
        split,
        spread,
    })
}

/// Split a deterministic span on its dash. Times never contain dashes, so
/// a plain `split_once` is enough; kept separate for symmetry with `~`.
fn split_span_dash(span: &str) -> Option<(&str, &str)> {
    span.split_once('-')
}

fn parse_clock(token: &str) -> SnapResult<Clock> {
    let err = || SnapError::Schedule(format!("cannot parse time {:?}", token));
    let (h, m) = token.trim().split_once(':').ok_or_else(err)?;
    let hour: u8 = h.parse().map_err(|_| err())?;
    let minute: u8 = m.parse().map_err(|_| err())?;
    if hour > 24 || minute > 59 || (hour == 24 && minute != 0) {
        return Err(err());
    }
    Ok(Clock { hour, minute })
}

// ============================================================================
// NEXT-WINDOW COMPUTATION
// ============================================================================

/// Compute the earliest window starting strictly after `last` across all
/// event sets. The result is deterministic; randomness only affects
/// [`Window::fire_time`].
pub fn next(schedules: &[Schedule], last: DateTime<Utc>) -> Option<Window> {
    let mut best: Option<Window> = None;
    for schedule in schedules {
        for offset in 0..=LOOKAHEAD_DAYS {
            let date = (last + chrono::Duration::days(offset)).date_naive();
            if !schedule.matches_day(date) {
                continue;
            }
            let mut found = None;
            for span in schedule.clock_spans() {
                let start = day_time(date, span.start);
                if start <= last {
                    continue;
                }
                let window = Window {
                    start,
                    end: day_time(date, span.end),
                    spread: span.spread,
                };
                match found {
                    None => found = Some(window),
                    Some(prev) if window.start < prev.start => found = Some(window),
                    Some(_) => {}
                }
            }
            if let Some(window) = found {
                match best {
                    None => best = Some(window),
                    Some(prev) if window.start < prev.start => best = Some(window),
                    Some(_) => {}
                }
                break;
            }
        }
    }
    best
}

fn day_time(date: chrono::NaiveDate, clock: Clock) -> DateTime<Utc> {
    let base = date.and_hms_opt(0, 0, 0).expect("midnight exists");
    DateTime::<Utc>::from_naive_utc_and_offset(base, Utc)
        + chrono::Duration::minutes(i64::from(clock.minutes()))
}

/// Duration from `now` until the window opens; zero when already inside.
pub fn until(window: &Window, now: DateTime<Utc>) -> Duration {
    (window.start - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_single_span() {
        let s = parse_schedule("10:00-11:00").unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(
            s[0].times,
            vec![ClockSpan {
                start: Clock::new(10, 0),
                end: Clock::new(11, 0),
                split: 0,
                spread: false,
            }]
        );
        assert!(s[0].weekdays.is_empty());
    }

    #[test]
    fn test_parse_spread_and_split() {
        let s = parse_schedule("00:00~24:00/4").unwrap();
        let span = s[0].times[0];
        assert!(span.spread);
        assert_eq!(span.split, 4);
        let subs = span.subspans();
        assert_eq!(subs.len(), 4);
        assert_eq!(subs[0].start, Clock::new(0, 0));
        assert_eq!(subs[0].end, Clock::new(6, 0));
        assert_eq!(subs[3].start, Clock::new(18, 0));
        assert_eq!(subs[3].end, Clock::new(24, 0));
        assert!(subs.iter().all(|s| s.spread));
    }

    #[test]
    fn test_parse_weekdays_and_times() {
        let s = parse_schedule("mon-wed,fri,9:00,21:00-22:00").unwrap();
        assert_eq!(s[0].weekdays.len(), 2);
        assert_eq!(s[0].times.len(), 2);
        assert_eq!(s[0].times[0].start, s[0].times[0].end);
    }

    #[test]
    fn test_parse_event_set_union() {
        let s = parse_schedule("mon,10:00..fri,15:00").unwrap();
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_parse_week_numbers() {
        let s = parse_schedule("mon2,10:00").unwrap();
        assert_eq!(s[0].weekdays[0].start.num, 2);
        assert!(parse_schedule("mon6,10:00").is_err());
        assert!(parse_schedule("mon0,10:00").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("10:00-9:00").is_err());
        assert!(parse_schedule("25:00").is_err());
        assert!(parse_schedule("10:61").is_err());
        assert!(parse_schedule("noday,10:00").is_err());
        assert!(parse_schedule("10:00/0").is_err());
        assert!(parse_schedule("10:00,mon").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for expr in [
            "10:00-11:00",
            "00:00~24:00/4",
            "mon,10:00~11:00",
            "mon-wed,fri,09:00,21:00-22:00",
            "mon,10:00..fri,15:00",
            "sat5,08:00-09:00",
        ] {
            let parsed = parse_schedule(expr).unwrap();
            let formatted = format_schedule(&parsed);
            let reparsed = parse_schedule(&formatted).unwrap();
            assert_eq!(parsed, reparsed, "round trip for {:?}", expr);
            // Equivalent next-fire behavior.
            let last = utc(2023, 1, 1, 0, 0);
            assert_eq!(next(&parsed, last), next(&reparsed, last));
        }
    }

    #[test]
    fn test_next_simple_weekday_window() {
        // 2023-01-01 is a Sunday; next monday window is 2023-01-02.
        let s = parse_schedule("mon,10:00~11:00").unwrap();
        let window = next(&s, utc(2023, 1, 1, 0, 0)).unwrap();
        assert_eq!(window.start, utc(2023, 1, 2, 10, 0));
        assert_eq!(window.end, utc(2023, 1, 2, 11, 0));
        assert!(window.spread);

        // Deterministic bounds on repeated computation.
        let again = next(&s, utc(2023, 1, 1, 0, 0)).unwrap();
        assert_eq!(window, again);

        // The sampled instant stays inside the window.
        let mut rng = rand::rng();
        for _ in 0..50 {
            let fire = window.fire_time(&mut rng);
            assert!(window.contains(fire));
        }
    }

    #[test]
    fn test_next_is_strictly_after_last() {
        let s = parse_schedule("10:00-11:00").unwrap();
        // Exactly at the window start: the next window is tomorrow's.
        let window = next(&s, utc(2023, 1, 1, 10, 0)).unwrap();
        assert_eq!(window.start, utc(2023, 1, 2, 10, 0));
        // Just before: today's window.
        let window = next(&s, utc(2023, 1, 1, 9, 59)).unwrap();
        assert_eq!(window.start, utc(2023, 1, 1, 10, 0));
    }

    #[test]
    fn test_next_picks_earliest_across_sets() {
        let s = parse_schedule("tue,09:00..mon,10:00").unwrap();
        // From Sunday, Monday 10:00 beats Tuesday 09:00.
        let window = next(&s, utc(2023, 1, 1, 0, 0)).unwrap();
        assert_eq!(window.start, utc(2023, 1, 2, 10, 0));
    }

    #[test]
    fn test_next_split_subwindows() {
        let s = parse_schedule("00:00-24:00/4").unwrap();
        // Mid-morning: the next sub-window starts at 12:00.
        let window = next(&s, utc(2023, 1, 1, 7, 30)).unwrap();
        assert_eq!(window.start, utc(2023, 1, 1, 12, 0));
        assert_eq!(window.end, utc(2023, 1, 1, 18, 0));
    }

    #[test]
    fn test_week_of_month_constraints() {
        // First monday of 2023-02 is Feb 6.
        let s = parse_schedule("mon1,10:00").unwrap();
        let window = next(&s, utc(2023, 1, 30, 12, 0)).unwrap();
        assert_eq!(window.start, utc(2023, 2, 6, 10, 0));

        // Last monday of January 2023 is Jan 30.
        let s = parse_schedule("mon5,10:00").unwrap();
        let window = next(&s, utc(2023, 1, 2, 12, 0)).unwrap();
        assert_eq!(window.start, utc(2023, 1, 30, 10, 0));
    }

    #[test]
    fn test_cyclic_weekday_span() {
        // fri-mon covers the weekend.
        let s = parse_schedule("fri-mon,10:00").unwrap();
        // 2023-01-07 is a Saturday: matches.
        let window = next(&s, utc(2023, 1, 7, 0, 0)).unwrap();
        assert_eq!(window.start, utc(2023, 1, 7, 10, 0));
        // From Tuesday the 3rd, next match is Friday the 6th.
        let window = next(&s, utc(2023, 1, 3, 12, 0)).unwrap();
        assert_eq!(window.start, utc(2023, 1, 6, 10, 0));
    }

    #[test]
    fn test_weekday_only_set_covers_whole_day() {
        let s = parse_schedule("mon").unwrap();
        let window = next(&s, utc(2023, 1, 1, 0, 0)).unwrap();
        assert_eq!(window.start, utc(2023, 1, 2, 0, 0));
        assert_eq!(window.end, utc(2023, 1, 3, 0, 0));
    }

    #[test]
    fn test_deterministic_window_fires_at_start() {
        let s = parse_schedule("mon,10:00-11:00").unwrap();
        let window = next(&s, utc(2023, 1, 1, 0, 0)).unwrap();
        let mut rng = rand::rng();
        assert_eq!(window.fire_time(&mut rng), window.start);
    }
}
