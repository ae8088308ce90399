//! Translation of user search text into FTS5 match expressions and date
//! bounds

use crate::error::{ChatvaultError, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\w+\*?").expect("Invalid regex pattern"))
}

/// Build an FTS5 match expression from free text
///
/// Every word is quoted so FTS5 syntax in user input is matched literally.
/// A `*` directly after a word keeps prefix matching. Words are joined with
/// implicit AND. Returns `None` when the text has no searchable words.
///
/// # Examples
///
/// ```
/// use chatvault::search::build_match_expression;
///
/// assert_eq!(
///     build_match_expression("database conn*").as_deref(),
///     Some("\"database\" \"conn\"*")
/// );
/// assert_eq!(build_match_expression("AND OR NOT").as_deref(), Some("\"AND\" \"OR\" \"NOT\""));
/// assert_eq!(build_match_expression("!!!"), None);
/// ```
pub fn build_match_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = token_regex()
        .find_iter(text)
        .map(|m| {
            let token = m.as_str();
            match token.strip_suffix('*') {
                Some(word) => format!("\"{word}\"*"),
                None => format!("\"{token}\""),
            }
        })
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Which end of a date range a bound closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateBound {
    /// Date-only input means the first instant of the day
    Start,
    /// Date-only input means the last microsecond of the day
    End,
}

/// Parse a `YYYY-MM-DD` or RFC 3339 date filter
pub fn parse_date_bound(input: &str, bound: DateBound) -> Result<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|_| {
        ChatvaultError::Validation(format!(
            "invalid date {input:?}: expected YYYY-MM-DD or RFC 3339"
        ))
    })?;

    let time = match bound {
        DateBound::Start => NaiveTime::MIN,
        DateBound::End => NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)
            .unwrap_or(NaiveTime::MIN),
    };
    Ok(date.and_time(time).and_utc())
}
