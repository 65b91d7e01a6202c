//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Supports `*`, single values, ranges (`a-b`), steps (`*/n`, `a-b/n`, `a/n`),
//! comma lists, month and weekday names, `7` as Sunday and the usual `@daily`
//! style macros. When both day fields are restricted a day matches if either
//! of them does, as in Vixie cron.

use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};

use crate::error::{Result, SchedulerError};

/// How far ahead `next_after` searches before declaring an expression dead.
/// Eight years always contains a 29 February.
const SEARCH_HORIZON_DAYS: i64 = 8 * 366;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    days_restricted: bool,
    weekdays_restricted: bool,
}

struct FieldSpec {
    label: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first entry in `names`.
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    label: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    label: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};
const DAY: FieldSpec = FieldSpec {
    label: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    label: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_base: 1,
};
// 7 is accepted as a second spelling of Sunday and folded onto bit 0.
const WEEKDAY: FieldSpec = FieldSpec {
    label: "day-of-week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    names_base: 0,
};

impl FromStr for CronExpr {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: String| SchedulerError::InvalidExpression {
            expression: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_macro(trimmed).ok_or_else(|| invalid(format!("unknown macro {trimmed}")))?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let (minutes, _) = parse_field(fields[0], &MINUTE).map_err(invalid)?;
        let (hours, _) = parse_field(fields[1], &HOUR).map_err(invalid)?;
        let (days, days_restricted) = parse_field(fields[2], &DAY).map_err(invalid)?;
        let (months, _) = parse_field(fields[3], &MONTH).map_err(invalid)?;
        let (mut weekdays, weekdays_restricted) = parse_field(fields[4], &WEEKDAY).map_err(invalid)?;
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes,
            hours,
            days,
            months,
            weekdays,
            days_restricted,
            weekdays_restricted,
        })
    }
}

fn expand_macro(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

/// Parse one field into a bitset. The flag is false when the field starts
/// with `*`, which matters for the day-of-month / day-of-week rule.
fn parse_field(text: &str, spec: &FieldSpec) -> std::result::Result<(u64, bool), String> {
    let mut bits = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field", spec.label));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad step '{step}' in {} field", spec.label))?;
                if step == 0 {
                    return Err(format!("zero step in {} field", spec.label));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `a/n` means "from a to the end of the range, every n".
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if low > high {
            return Err(format!(
                "range {low}-{high} is reversed in {} field",
                spec.label
            ));
        }

        for value in (low..=high).step_by(step.unwrap_or(1) as usize) {
            bits |= 1 << value;
        }
    }
    Ok((bits, !text.starts_with('*')))
}

fn parse_value(text: &str, spec: &FieldSpec) -> std::result::Result<u32, String> {
    let value = match text.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .map(|i| i as u32 + spec.names_base)
            .ok_or_else(|| format!("bad value '{text}' in {} field", spec.label))?,
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{value} is outside {}-{} in {} field",
            spec.min, spec.max, spec.label
        ));
    }
    Ok(value)
}

fn has(bits: u64, value: u32) -> bool {
    bits & (1 << value) != 0
}

impl CronExpr {
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days, date.day());
        let dow = has(self.weekdays, date.weekday().num_days_from_sunday());
        if self.days_restricted && self.weekdays_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Earliest instant strictly after `from` that matches, in `from`'s time zone.
    ///
    /// Returns `None` when nothing matches within the search horizon
    /// (e.g. `0 0 30 2 *`). The scan walks local wall-clock minutes, so a
    /// minute already behind `from` is not revisited when clocks fall back.
    pub fn next_after<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = from.timezone();
        let local = from.naive_local();
        let limit = local + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        while t <= limit {
            if !has(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            // Gaps (spring-forward) have no instant and are skipped.
            match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) if dt > *from => return Some(dt),
                LocalResult::Ambiguous(early, late) => {
                    if early > *from {
                        return Some(early);
                    }
                    if late > *from {
                        return Some(late);
                    }
                }
                _ => {}
            }
            t += Duration::minutes(1);
        }
        None
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Next instant after `reference` matching `expression`.
pub fn next<Tz: TimeZone>(expression: &str, reference: &DateTime<Tz>) -> Result<DateTime<Tz>> {
    let expr: CronExpr = expression.parse()?;
    expr.next_after(reference)
        .ok_or_else(|| SchedulerError::InvalidExpression {
            expression: expression.to_string(),
            reason: "expression never matches".to_string(),
        })
}

/// Reject expressions that do not parse or never fire.
pub fn validate(expression: &str) -> Result<()> {
    next(expression, &Utc::now()).map(|_| ())
}
