use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use cron::Schedule;

use crate::config::Timezone;
use crate::error::{Error, Result};

/// A parsed cron expression.
///
/// Accepts the classic five fields (`minute hour day-of-month month day-of-week`)
/// as well as the six and seven field forms with a leading seconds field
/// (and trailing year).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized: String = match fields.len() {
            5 => format!(
                "0 {} {}",
                fields[..4].join(" "),
                translate_day_of_week(expression, fields[4])?
            ),
            6 | 7 => fields.join(" "),
            _ => {
                return Err(Error::config(format!(
                    "invalid cron expression '{}': expected 5, 6 or 7 fields",
                    expression
                )))
            }
        };
        match Schedule::from_str(normalized.as_str()) {
            Ok(schedule) => Ok(Self {
                expression: expression.trim().to_string(),
                schedule,
            }),
            Err(error) => Err(Error::config(format!("invalid cron expression '{}': {}", expression, error))),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first trigger strictly after `datetime`.
    pub fn get_upcoming<Z: TimeZone>(&self, datetime: &DateTime<Z>) -> Option<DateTime<Z>> {
        self.schedule.after(datetime).next()
    }

    /// Next trigger after now, evaluated in `timezone`, converted to UTC.
    pub fn next_run(&self, timezone: Timezone) -> Result<DateTime<Utc>> {
        let upcoming: Option<DateTime<Utc>> = match timezone {
            Timezone::Utc => self.get_upcoming(&Utc::now()),
            Timezone::Local => self.get_upcoming(&Local::now()).map(|dt| dt.with_timezone(&Utc)),
            Timezone::Fixed(offset) => self
                .get_upcoming(&Utc::now().with_timezone(&offset))
                .map(|dt| dt.with_timezone(&Utc)),
        };
        upcoming.ok_or_else(|| Error::config(format!("cron expression '{}' has no upcoming trigger", self.expression)))
    }

    /// Time left until the next trigger.
    pub fn seconds_until_next(&self, timezone: Timezone) -> Result<Duration> {
        let next: DateTime<Utc> = self.next_run(timezone)?;
        Ok((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Maps a classic day-of-week field (`0`-`7`, Sunday being `0` or `7`) onto
/// the `cron` crate's numbering (`1`-`7`, Sunday being `1`).
///
/// Numeric ranges and lists are expanded into a list; `*`, `*/n` and day
/// names already mean the same in both and are kept.
fn translate_day_of_week(expression: &str, field: &str) -> Result<String> {
    let invalid = || Error::config(format!("invalid cron expression '{}': bad day-of-week field '{}'", expression, field));
    let parse_day = |value: &str| -> Result<u32> {
        match value.parse::<u32>() {
            Ok(day) if day <= 7 => Ok(day),
            _ => Err(invalid()),
        }
    };
    let mut kept: Vec<&str> = Vec::new();
    let mut days: BTreeSet<u32> = BTreeSet::new();
    for element in field.split(',') {
        let (range, step) = match element.split_once('/') {
            Some((range, step)) => (range, Some(step.parse::<usize>().ok().filter(|step| *step > 0).ok_or_else(invalid)?)),
            None => (element, None),
        };
        if range == "*" || range == "?" || range.chars().any(|c| c.is_ascii_alphabetic()) {
            kept.push(element);
            continue;
        }
        let (start, end): (u32, u32) = match range.split_once('-') {
            Some((start, end)) => (parse_day(start)?, parse_day(end)?),
            None if step.is_some() => (parse_day(range)?, 7),
            None => {
                let day: u32 = parse_day(range)?;
                (day, day)
            }
        };
        if start > end {
            return Err(invalid());
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(day % 7 + 1);
        }
    }
    let mut translated: Vec<String> = kept.into_iter().map(str::to_string).collect();
    translated.extend(days.into_iter().map(|day| day.to_string()));
    Ok(translated.join(","))
}

/// Save-time check of a cron expression.
pub fn validate_cron(expression: &str) -> Result<()> {
    CronSchedule::parse(expression).map(|_| ())
}

/// Parses `expression` and returns the time left until its next trigger.
pub fn seconds_until_next(expression: &str, timezone: Timezone) -> Result<Duration> {
    CronSchedule::parse(expression)?.seconds_until_next(timezone)
}
