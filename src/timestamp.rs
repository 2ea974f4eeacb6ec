//! Canonical timestamps stamped onto saved documents
//!
//! Stored documents carry `datetime: {"$date": "<ISO-8601>"}`. Existing data
//! was written with a fixed `+02:00` offset, so that stays the default.

use chrono::{DateTime, FixedOffset, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{BusError, Result};

/// Field name of the canonical timestamp on every saved document
pub const DATETIME_FIELD: &str = "datetime";

/// Offset of the legacy wire format, in seconds east of UTC
const LEGACY_OFFSET_SECS: i32 = 2 * 3600;

/// How canonical timestamps are rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    /// `yyyy-MM-ddTHH:mm:ss.sss+02:00` regardless of the host timezone
    #[default]
    Legacy,
    /// `yyyy-MM-ddTHH:mm:ss.sssZ`
    Utc,
}

impl TimestampFormat {
    /// Render an instant in this format
    pub fn format(&self, instant: DateTime<Utc>) -> String {
        match self {
            Self::Legacy => match FixedOffset::east_opt(LEGACY_OFFSET_SECS) {
                Some(offset) => instant
                    .with_timezone(&offset)
                    .to_rfc3339_opts(SecondsFormat::Millis, false),
                None => instant.to_rfc3339_opts(SecondsFormat::Millis, true),
            },
            Self::Utc => instant.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Render the current instant
    pub fn now(&self) -> String {
        self.format(Utc::now())
    }

    /// Render an epoch-millisecond instant
    pub fn from_epoch_millis(&self, millis: i64) -> Result<String> {
        let instant = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| BusError::BadRequest(format!("Epoch millis out of range: {}", millis)))?;
        Ok(self.format(instant))
    }
}

/// Parse any RFC 3339 timestamp (either format above, or `Z`-suffixed driver output)
pub fn parse(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BusError::BadRequest(format!("Invalid timestamp '{}': {}", raw, e)))
}

/// Wrap a canonical string in the extended-JSON date form
pub fn date_value(canonical: &str) -> Value {
    json!({ "$date": canonical })
}
