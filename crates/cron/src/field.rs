//! Bitmask representation of one cron field.
//!
//! Bit `i` set means value `i` is permitted, e.g. minutes `1,3,5`:
//!
//! ```text
//! bit            7654 3210
//! possible value  654 3210
//! bit value      0010 1010
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// All 64 bits set, the canonical representation of `*` and `?`.
const STAR: Field = Field(u64::MAX);

/// Set of permitted values for one cron field, one bit per value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Field(u64);

impl Field {
    /// Compile one textual field (e.g. `"*/5"`, `"1-30/2"`, `"1,3,5"`) into a
    /// bitmask. `min` and `max` are the legal value bounds for the field.
    pub fn compile(text: &str, min: u32, max: u32) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::EmptyField);
        }

        if text == "*" || text == "?" {
            return Ok(STAR);
        }

        let mut bits = 0u64;
        // Each comma-separated part contributes its own start/end/step walk;
        // the result is the union of all parts.
        for part in text.split(',') {
            let mut step: i64 = 1;
            let mut start = i64::from(min);
            let mut end = i64::from(max);

            // Strip an optional '/step' suffix (e.g. '*/5', '1-30/2'). A bare
            // single value with a step would silently mean "start only", so it
            // is rejected instead.
            let mut range = part;
            if let Some(i) = part.find('/') {
                let prefix = &part[..i];
                if prefix != "*" && prefix != "?" && !prefix.contains('-') {
                    return Err(Error::StepWithoutRange {
                        expression: text.to_string(),
                    });
                }
                let raw = &part[i + 1..];
                step = raw.parse().map_err(|_| Error::InvalidStep {
                    step: raw.to_string(),
                })?;
                if step <= 0 {
                    return Err(Error::NonPositiveStep { step });
                }
                range = prefix;
            }

            // Split an optional 'start-end' range; without a dash both sides
            // are the same single value.
            let (from, to) = match range.find('-') {
                Some(i) => (&range[..i], &range[i + 1..]),
                None => (range, range),
            };

            // '*' or '?' as the start keeps the full [min, max] span. An
            // open-ended 'N-' keeps max as the end.
            if from != "*" && from != "?" {
                start = from.parse().map_err(|_| Error::InvalidValue {
                    expression: text.to_string(),
                })?;
                if to.is_empty() {
                    end = i64::from(max);
                } else {
                    end = to.parse().map_err(|_| Error::InvalidValue {
                        expression: text.to_string(),
                    })?;
                }
            }

            if start < i64::from(min) || end > i64::from(max) || start > end {
                return Err(Error::OutOfRange {
                    min,
                    max,
                    value: range.to_string(),
                });
            }

            let mut i = start;
            while i <= end {
                bits |= 1u64 << (i as u32);
                i += step;
            }
        }

        Ok(Self(bits))
    }

    /// Whether `value` is permitted.
    #[must_use]
    pub fn matches(self, value: u32) -> bool {
        self.0 & (1u64 << value) != 0
    }

    /// Whether this field is the `*`/`?` wildcard.
    #[must_use]
    pub fn is_wildcard(self) -> bool {
        self == STAR
    }

    /// Render for diagnostics: `*` for the wildcard, otherwise an ascending
    /// comma-joined list of the set values.
    #[must_use]
    pub fn format(self) -> String {
        if self.is_wildcard() {
            return "*".to_string();
        }

        let values: Vec<String> = (0..64u32)
            .filter(|&i| self.matches(i))
            .map(|i| i.to_string())
            .collect();
        values.join(",")
    }
}
