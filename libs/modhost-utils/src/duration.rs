//! Duration parsing and serde support.
//!
//! Two textual forms are accepted wherever a duration is configured:
//!
//! - humantime strings: `"15s"`, `"10m 10s"`, `"250ms"`
//! - ISO-8601 durations: `"PT15S"`, `"P1DT2H"`, `"PT0.5S"`, `"P2W"`
//!
//! Calendar units (years, months) are rejected because they have no fixed length.
//! Serialization always produces the humantime form.
//!
//! # Example
//! ```
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Foo {
//!     #[serde(with = "modhost_utils::duration")]
//!     timeout: Duration,
//!     #[serde(default, with = "modhost_utils::duration::option")]
//!     uptime_limit: Option<Duration>,
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserializer, Serializer, de};

/// Error returned when a string is neither a humantime nor an ISO-8601 duration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration '{input}': {reason}")]
pub struct DurationParseError {
    input: String,
    reason: String,
}

impl DurationParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Parse a humantime or ISO-8601 duration string.
///
/// # Errors
/// Returns [`DurationParseError`] when the input matches neither form.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.starts_with(['P', 'p']) {
        return parse_iso8601(trimmed).map_err(|reason| DurationParseError::new(input, reason));
    }
    humantime::parse_duration(trimmed).map_err(|e| DurationParseError::new(input, e.to_string()))
}

fn parse_iso8601(input: &str) -> Result<Duration, String> {
    let rest = &input[1..];
    let (date, time) = match rest.split_once(['T', 't']) {
        Some((date, time)) => {
            if time.is_empty() {
                return Err("time designator without components".to_owned());
            }
            (date, Some(time))
        }
        None => (rest, None),
    };
    if date.is_empty() && time.is_none() {
        return Err("no duration components".to_owned());
    }

    let mut seconds = 0.0_f64;
    seconds += sum_components(date, |unit| match unit {
        'W' | 'w' => Ok(604_800.0),
        'D' | 'd' => Ok(86_400.0),
        'Y' | 'y' | 'M' | 'm' => Err(format!("calendar unit '{unit}' is not supported")),
        other => Err(format!("unknown date unit '{other}'")),
    })?;
    if let Some(time) = time {
        seconds += sum_components(time, |unit| match unit {
            'H' | 'h' => Ok(3_600.0),
            'M' | 'm' => Ok(60.0),
            'S' | 's' => Ok(1.0),
            other => Err(format!("unknown time unit '{other}'")),
        })?;
    }

    Duration::try_from_secs_f64(seconds).map_err(|e| e.to_string())
}

fn sum_components(
    part: &str,
    unit_seconds: impl Fn(char) -> Result<f64, String>,
) -> Result<f64, String> {
    let mut total = 0.0_f64;
    let mut number = String::new();
    for ch in part.chars() {
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            number.push(if ch == ',' { '.' } else { ch });
            continue;
        }
        if number.is_empty() {
            return Err(format!("unit '{ch}' without a value"));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number '{number}'"))?;
        total += value * unit_seconds(ch)?;
        number.clear();
    }
    if !number.is_empty() {
        return Err(format!("value '{number}' without a unit"));
    }
    Ok(total)
}

struct DurationVisitor;

impl de::Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("a humantime or ISO-8601 duration, or a number of seconds")
    }

    fn visit_str<E>(self, v: &str) -> Result<Duration, E>
    where
        E: de::Error,
    {
        parse_duration(v).map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Duration, E>
    where
        E: de::Error,
    {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
    where
        E: de::Error,
    {
        u64::try_from(v)
            .map(Duration::from_secs)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
    where
        E: de::Error,
    {
        Duration::try_from_secs_f64(v).map_err(|_| E::invalid_value(de::Unexpected::Float(v), &self))
    }
}

/// Serializes a `Duration` in humantime form.
///
/// # Errors
/// Propagates serializer errors.
pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.collect_str(&humantime::format_duration(*d))
}

/// Deserializes a `Duration` from either accepted textual form.
///
/// # Errors
/// Fails when the value is not a valid duration.
pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    d.deserialize_any(DurationVisitor)
}

pub mod option {
    //! `Option<Duration>` variant for `#[serde(with = "modhost_utils::duration::option")]`.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "super::deserialize")] Duration);

    /// Serializes an `Option<Duration>`.
    ///
    /// # Errors
    /// Propagates serializer errors.
    #[allow(clippy::ref_option)]
    pub fn serialize<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match d {
            Some(d) => s.collect_str(&humantime::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    /// Deserializes an `Option<Duration>`; `null` maps to `None`.
    ///
    /// # Errors
    /// Fails when a present value is not a valid duration.
    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Wrapped>::deserialize(d)?.map(|w| w.0))
    }
}
