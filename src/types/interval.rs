//! The interval literal: `N year[s] M mon[s] D day[s] [±]HH:MM:SS[.frac]`.
//!
//! Internally an interval is (months, days, ticks) where a tick is 100 ns.
//! Total-value conversions assume 30 days per month and 24 hours per day.

use std::fmt;
use std::str::FromStr;

pub const TICKS_PER_SECOND: i64 = 10_000_000;
pub const TICKS_PER_MINUTE: i64 = 60 * TICKS_PER_SECOND;
pub const TICKS_PER_HOUR: i64 = 60 * TICKS_PER_MINUTE;
pub const TICKS_PER_DAY: i64 = 24 * TICKS_PER_HOUR;
pub const TICKS_PER_MONTH: i64 = 30 * TICKS_PER_DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub ticks: i64,
}

impl Interval {
    pub const fn new(months: i32, days: i32, ticks: i64) -> Interval {
        Interval {
            months,
            days,
            ticks,
        }
    }

    /// Total 100 ns ticks under the 30-day-month, 24-hour-day convention.
    pub fn total_ticks(&self) -> i64 {
        self.months as i64 * TICKS_PER_MONTH + self.days as i64 * TICKS_PER_DAY + self.ticks
    }

    /// Months folded away and ticks normalized into days:
    /// `months == 0` and `|ticks| < TICKS_PER_DAY`.
    pub fn canonicalize(&self) -> Interval {
        let total = self.total_ticks();
        Interval {
            months: 0,
            days: (total / TICKS_PER_DAY) as i32,
            ticks: total % TICKS_PER_DAY,
        }
    }

    /// Fold ticks into days and days into months so every component carries
    /// the sign of the whole. Idempotent.
    pub fn justify(&self) -> Interval {
        let total = self.total_ticks();
        let months = total / TICKS_PER_MONTH;
        let rem = total % TICKS_PER_MONTH;
        Interval {
            months: months as i32,
            days: (rem / TICKS_PER_DAY) as i32,
            ticks: rem % TICKS_PER_DAY,
        }
    }

    /// Collapse everything into the ticks component.
    pub fn unjustify(&self) -> Interval {
        Interval {
            months: 0,
            days: 0,
            ticks: self.total_ticks(),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let years = self.months / 12;
        let months = self.months % 12;
        let mut wrote = false;

        if years != 0 {
            write!(f, "{years} year{}", plural(years as i64))?;
            wrote = true;
        }
        if months != 0 {
            if wrote {
                f.write_str(" ")?;
            }
            write!(f, "{months} mon{}", plural(months as i64))?;
            wrote = true;
        }
        if self.days != 0 {
            if wrote {
                f.write_str(" ")?;
            }
            write!(f, "{} day{}", self.days, plural(self.days as i64))?;
            wrote = true;
        }
        if self.ticks != 0 || !wrote {
            if wrote {
                f.write_str(" ")?;
            }
            let sign = if self.ticks < 0 { "-" } else { "" };
            let ticks = self.ticks.unsigned_abs();
            let hours = ticks / TICKS_PER_HOUR as u64;
            let minutes = ticks / TICKS_PER_MINUTE as u64 % 60;
            let seconds = ticks / TICKS_PER_SECOND as u64 % 60;
            let frac = ticks % TICKS_PER_SECOND as u64;
            write!(f, "{sign}{hours:02}:{minutes:02}:{seconds:02}")?;
            if frac != 0 {
                let digits = format!("{frac:07}");
                write!(f, ".{}", digits.trim_end_matches('0'))?;
            }
        }
        Ok(())
    }
}

fn plural(n: i64) -> &'static str {
    if n.abs() == 1 {
        ""
    } else {
        "s"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed interval literal")]
pub struct ParseIntervalError;

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Interval, ParseIntervalError> {
        let mut months: i64 = 0;
        let mut days: i64 = 0;
        let mut ticks: i64 = 0;
        let mut saw_any = false;
        let mut saw_time = false;

        let mut tokens = s.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            if let Ok(quantity) = token.parse::<i64>() {
                let unit = tokens.next().ok_or(ParseIntervalError)?;
                match unit {
                    "year" | "years" => months += quantity * 12,
                    "mon" | "mons" => months += quantity,
                    "day" | "days" => days += quantity,
                    _ => return Err(ParseIntervalError),
                }
                saw_any = true;
            } else {
                // The only non-unit token is the trailing time-of-day part.
                if saw_time {
                    return Err(ParseIntervalError);
                }
                ticks = parse_time(token)?;
                saw_time = true;
                saw_any = true;
            }
        }

        if !saw_any {
            return Err(ParseIntervalError);
        }
        if months > i32::MAX as i64
            || months < i32::MIN as i64
            || days > i32::MAX as i64
            || days < i32::MIN as i64
        {
            return Err(ParseIntervalError);
        }
        Ok(Interval {
            months: months as i32,
            days: days as i32,
            ticks,
        })
    }
}

fn parse_time(token: &str) -> Result<i64, ParseIntervalError> {
    let (negative, rest) = match token.as_bytes().first() {
        Some(b'-') => (true, &token[1..]),
        Some(b'+') => (false, &token[1..]),
        _ => (false, token),
    };

    let mut parts = rest.split(':');
    let hours: i64 = next_number(&mut parts)?;
    let minutes: i64 = next_number(&mut parts)?;
    let seconds_part = parts.next().ok_or(ParseIntervalError)?;
    if parts.next().is_some() || minutes >= 60 {
        return Err(ParseIntervalError);
    }

    let (seconds_str, frac_str) = match seconds_part.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (seconds_part, None),
    };
    let seconds: i64 = seconds_str.parse().map_err(|_| ParseIntervalError)?;
    if seconds >= 60 {
        return Err(ParseIntervalError);
    }

    let mut ticks = hours * TICKS_PER_HOUR + minutes * TICKS_PER_MINUTE + seconds * TICKS_PER_SECOND;

    if let Some(frac) = frac_str {
        if frac.is_empty() || frac.len() > 7 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseIntervalError);
        }
        let mut frac_ticks: i64 = frac.parse().map_err(|_| ParseIntervalError)?;
        for _ in frac.len()..7 {
            frac_ticks *= 10;
        }
        ticks += frac_ticks;
    }

    Ok(if negative { -ticks } else { ticks })
}

fn next_number(parts: &mut std::str::Split<'_, char>) -> Result<i64, ParseIntervalError> {
    parts
        .next()
        .ok_or(ParseIntervalError)?
        .parse()
        .map_err(|_| ParseIntervalError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_all_components() {
        let interval = Interval::new(14, 3, 4 * TICKS_PER_HOUR + 5 * TICKS_PER_MINUTE + 6 * TICKS_PER_SECOND);
        assert_eq!(interval.to_string(), "1 year 2 mons 3 days 04:05:06");
    }

    #[test]
    fn formats_zero_as_time() {
        assert_eq!(Interval::default().to_string(), "00:00:00");
    }

    #[test]
    fn formats_singular_units() {
        assert_eq!(Interval::new(13, 1, 0).to_string(), "1 year 1 mon 1 day");
    }

    #[test]
    fn formats_fractional_seconds_without_trailing_zeros() {
        let interval = Interval::new(0, 0, 7_890_000);
        assert_eq!(interval.to_string(), "00:00:00.789");
    }

    #[test]
    fn formats_negative_time() {
        let interval = Interval::new(0, 2, -(3 * TICKS_PER_HOUR));
        assert_eq!(interval.to_string(), "2 days -03:00:00");
    }

    #[test]
    fn parses_what_it_formats() {
        let cases = [
            Interval::new(14, 3, 4 * TICKS_PER_HOUR + 5 * TICKS_PER_MINUTE + 6 * TICKS_PER_SECOND),
            Interval::new(0, 0, 0),
            Interval::new(-25, -1, -TICKS_PER_SECOND),
            Interval::new(0, 0, 7_890_123),
            Interval::new(1, 0, 0),
        ];
        for interval in cases {
            let rendered = interval.to_string();
            assert_eq!(rendered.parse::<Interval>().unwrap(), interval, "{rendered}");
        }
    }

    #[test]
    fn parses_partial_literals() {
        assert_eq!("5 days".parse::<Interval>().unwrap(), Interval::new(0, 5, 0));
        assert_eq!(
            "2 mons 12:00:00".parse::<Interval>().unwrap(),
            Interval::new(2, 0, 12 * TICKS_PER_HOUR)
        );
        assert_eq!(
            "-08:30:00".parse::<Interval>().unwrap(),
            Interval::new(0, 0, -(8 * TICKS_PER_HOUR + 30 * TICKS_PER_MINUTE))
        );
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!("".parse::<Interval>().is_err());
        assert!("5".parse::<Interval>().is_err());
        assert!("5 fortnights".parse::<Interval>().is_err());
        assert!("12:99:00".parse::<Interval>().is_err());
        assert!("1:2".parse::<Interval>().is_err());
        assert!("00:00:00 00:00:01".parse::<Interval>().is_err());
    }

    #[test]
    fn canonicalize_flattens_months_and_bounds_ticks() {
        let interval = Interval::new(1, 2, 30 * TICKS_PER_HOUR);
        let canonical = interval.canonicalize();
        assert_eq!(canonical.months, 0);
        assert!(canonical.ticks.abs() < TICKS_PER_DAY);
        assert_eq!(canonical.total_ticks(), interval.total_ticks());
        assert_eq!(canonical.days, 33);
        assert_eq!(canonical.ticks, 6 * TICKS_PER_HOUR);
    }

    #[test]
    fn justify_is_idempotent() {
        let cases = [
            Interval::new(0, 45, 26 * TICKS_PER_HOUR),
            Interval::new(3, -10, -TICKS_PER_DAY * 2),
            Interval::new(-1, 61, TICKS_PER_MINUTE),
        ];
        for interval in cases {
            let once = interval.justify();
            assert_eq!(once.justify(), once);
            assert!(once.ticks.abs() < TICKS_PER_DAY);
            assert!((once.days as i64 * TICKS_PER_DAY).abs() < TICKS_PER_MONTH);
        }
    }

    #[test]
    fn unjustify_of_justify_preserves_total_ticks() {
        let cases = [
            Interval::new(2, 5, 11 * TICKS_PER_HOUR + 99),
            Interval::new(-7, 400, -123_456_789),
            Interval::new(0, 0, 1),
        ];
        for interval in cases {
            assert_eq!(interval.justify().unjustify().ticks, interval.total_ticks());
        }
    }
}
