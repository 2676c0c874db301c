//! Timestamp formatting shared by the store and the API surface.
//!
//! All timestamps cross the wire as RFC 3339 with millisecond precision
//! and a UTC offset (`2026-08-01T12:00:00.123Z`). The store persists the
//! same format so that lexicographic ordering matches chronological
//! ordering.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp as RFC 3339 with millisecond precision.
pub fn fmt_millis(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time, pre-formatted for API responses.
pub fn now_millis() -> String {
    fmt_millis(Utc::now())
}

/// Serde adapter for `DateTime<Utc>` fields.
pub mod ts_millis {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::fmt_millis(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<DateTime<Utc>>` fields.
pub mod ts_millis_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Option<DateTime<Utc>>, ser: S) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => ser.serialize_some(&super::fmt_millis(*ts)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
