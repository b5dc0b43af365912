//! ISO-8601 event timestamps.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An ISO-8601 timestamp assigned by the originating device.
///
/// Ordering is lexical on the string form. Timestamps produced by
/// [`Timestamp::from_datetime`] are always UTC with millisecond precision
/// (`2024-03-01T10:15:30.123Z`), so lexical order equals time order for
/// every timestamp this crate generates. Clock skew between devices is not
/// corrected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Formats a UTC instant in the canonical millisecond form.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Validates a timestamp received from another device.
    ///
    /// The original text is kept as-is.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        DateTime::parse_from_rfc3339(text)
            .map_err(|_| ProtocolError::InvalidTimestamp(text.to_string()))?;
        Ok(Self(text.to_string()))
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
