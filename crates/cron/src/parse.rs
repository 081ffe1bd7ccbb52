//! Cron expression parsing.
//!
//! An expression is five whitespace-separated fields:
//!
//! ```text
//!  +------------------ Minute (0-59)       : [5]
//!  | +---------------- Hour (0-23)         : [0, 1, 2, ..., 23]
//!  | |   +------------ Day of month (1-31) : [5, 10, 15, 20, 30]
//!  | |   |    +------- Month (1-12)        : [1, 3, 5, ..., 11]
//!  | |   |    |     +- Day of week (0-6)   : [Sun, Mon, Tue, Wed]
//!  5 *  */5 1-12/2 0-3
//! ```
//!
//! Macros (`@daily` etc.) are not supported.

use chrono_tz::Tz;

use crate::{
    error::{Error, Result},
    field::Field,
    types::Entry,
};

/// Parse a 5-field cron expression into an [`Entry`] tagged with `name`.
///
/// When `timezone` is `None` the process-local timezone is used: a valid IANA
/// zone named by the `TZ` environment variable, else UTC.
pub fn parse(expression: &str, timezone: Option<Tz>, name: &str) -> Result<Entry> {
    let timezone = timezone.unwrap_or_else(local_timezone);

    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::FieldCount {
            got: fields.len(),
            want: 5,
        });
    }

    let minute = compile_named(fields[0], 0, 59, "minute")?;
    let hour = compile_named(fields[1], 0, 23, "hour")?;
    let dom = compile_named(fields[2], 1, 31, "day of month")?;
    let month = compile_named(fields[3], 1, 12, "month")?;
    let dow = compile_named(fields[4], 0, 6, "day of week")?;

    Ok(Entry {
        name: name.to_string(),
        timezone,
        expression: expression.to_string(),
        meta: None,
        minute,
        hour,
        dom,
        month,
        dow,
    })
}

fn compile_named(text: &str, min: u32, max: u32, field: &'static str) -> Result<Field> {
    Field::compile(text, min, max).map_err(|source| Error::Field {
        field,
        value: text.to_string(),
        source: Box::new(source),
    })
}

/// Best effort at the process-local timezone: `TZ` when it names a valid IANA
/// zone, else UTC.
#[must_use]
pub fn local_timezone() -> Tz {
    std::env::var("TZ")
        .ok()
        .and_then(|name| name.parse().ok())
        .unwrap_or(Tz::UTC)
}
