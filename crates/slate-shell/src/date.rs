use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::error::ShellError;

/// Calendar date, optional time of day, optional `Z`.
static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(\d{4})-(\d{2})-(\d{2})(?:[T ](\d{2}):(\d{2})(?::(\d{2})(?:\.(\d{1,9}))?)?)?(Z)?$",
    )
    .expect("timestamp pattern is valid")
});

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// How the date helper was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateMode {
    /// `Date.new(...)` / `ISODate(...)`: produce a date value.
    Construct,
    /// `Date(...)`: produce the canonical text of the same instant.
    Call,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DateArg {
    Text(String),
    Integer(i64),
    Number(f64),
    Instant(bson::DateTime),
    /// Any other script value, described by its type name.
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DateOutput {
    Date(bson::DateTime),
    Text(String),
}

/// Normalize date constructor arguments into one instant.
///
/// No arguments means now; one argument is a timestamp string or epoch
/// milliseconds; two to seven are year, month (1-based), day, hours,
/// minutes, seconds and milliseconds, all in UTC.
pub fn coerce(mode: DateMode, args: &[DateArg]) -> Result<DateOutput, ShellError> {
    let instant = match args {
        [] => bson::DateTime::now(),
        [single] => from_single(single)?,
        _ if args.len() <= 7 => from_components(args)?,
        _ => {
            return Err(ShellError::Argument(format!(
                "date accepts at most 7 arguments, got {}",
                args.len()
            )));
        }
    };
    Ok(match mode {
        DateMode::Construct => DateOutput::Date(instant),
        DateMode::Call => DateOutput::Text(format_date(instant)?),
    })
}

fn from_single(arg: &DateArg) -> Result<bson::DateTime, ShellError> {
    match arg {
        DateArg::Text(text) => parse_date(text),
        DateArg::Integer(ms) => Ok(bson::DateTime::from_millis(*ms)),
        DateArg::Number(ms) if ms.is_finite() && ms.abs() < 9.0e15 => {
            Ok(bson::DateTime::from_millis(ms.trunc() as i64))
        }
        DateArg::Number(ms) => Err(ShellError::Argument(format!(
            "{ms} is not a valid epoch millisecond value"
        ))),
        DateArg::Instant(d) => Ok(*d),
        DateArg::Other(kind) => Err(ShellError::Argument(format!(
            "date expects a string or a number, got {kind}"
        ))),
    }
}

fn from_components(args: &[DateArg]) -> Result<bson::DateTime, ShellError> {
    let mut parts = [0_i32, 1, 1, 0, 0, 0, 0];
    for (slot, arg) in parts.iter_mut().zip(args) {
        *slot = component(arg)?;
    }
    let [year, month, day, hour, minute, second, milli] = parts;
    let invalid = || {
        ShellError::Argument(format!(
            "{year}-{month}-{day} {hour}:{minute}:{second}.{milli} is not a valid date"
        ))
    };
    let unsigned = |n: i32| u32::try_from(n).map_err(|_| invalid());

    let date = NaiveDate::from_ymd_opt(year, unsigned(month)?, unsigned(day)?).ok_or_else(invalid)?;
    let datetime = date
        .and_hms_milli_opt(unsigned(hour)?, unsigned(minute)?, unsigned(second)?, unsigned(milli)?)
        .ok_or_else(invalid)?;
    Ok(to_bson(datetime))
}

fn component(arg: &DateArg) -> Result<i32, ShellError> {
    let out_of_range = || ShellError::Argument(format!("date component {arg:?} is not a 32-bit integer"));
    match arg {
        DateArg::Integer(n) => i32::try_from(*n).map_err(|_| out_of_range()),
        DateArg::Number(n) if n.fract() == 0.0 && *n >= f64::from(i32::MIN) && *n <= f64::from(i32::MAX) => {
            Ok(*n as i32)
        }
        _ => Err(out_of_range()),
    }
}

/// Parse `YYYY-MM-DD[THH:MM[:SS[.fff]]][Z]`, case-insensitively. Times
/// without a marker are read as UTC.
pub fn parse_date(text: &str) -> Result<bson::DateTime, ShellError> {
    let invalid = || ShellError::Argument(format!("invalid date string {text:?}"));
    let caps = TIMESTAMP.captures(text).ok_or_else(invalid)?;

    let number = |i: usize| -> Result<u32, ShellError> {
        caps.get(i)
            .map_or(Ok(0), |m| m.as_str().parse::<u32>().map_err(|_| invalid()))
    };
    let year = caps[1].parse::<i32>().map_err(|_| invalid())?;
    let millis = match caps.get(7) {
        // Keep millisecond precision; extra fraction digits are dropped.
        Some(frac) => {
            let digits: String = frac.as_str().chars().chain("00".chars()).take(3).collect();
            digits.parse::<u32>().map_err(|_| invalid())?
        }
        None => 0,
    };

    let (month, day) = (number(2)?, number(3)?);
    let (hour, minute, second) = (number(4)?, number(5)?, number(6)?);
    let datetime = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_milli_opt(hour, minute, second, millis))
        .ok_or_else(invalid)?;
    Ok(to_bson(datetime))
}

/// Render an instant as `YYYY-MM-DDTHH:MM:SS.fffZ`.
pub fn format_date(date: bson::DateTime) -> Result<String, ShellError> {
    chrono::DateTime::from_timestamp_millis(date.timestamp_millis())
        .map(|d| d.format(ISO_FORMAT).to_string())
        .ok_or_else(|| {
            ShellError::Argument(format!(
                "{} ms is outside the printable date range",
                date.timestamp_millis()
            ))
        })
}

fn to_bson(datetime: NaiveDateTime) -> bson::DateTime {
    bson::DateTime::from_millis(datetime.and_utc().timestamp_millis())
}
