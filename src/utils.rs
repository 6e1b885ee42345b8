//! Shared helpers: URL normalization and timestamp serialization.

use crate::error::Result;
use crate::bad_request;

/// Normalize a protocol or schema URL so that equivalent spellings index and
/// compare identically: scheme and host are lowercased and any trailing
/// slash is dropped.
pub(crate) fn clean_url(url: &str) -> Result<String> {
    if url.is_empty() || url.contains(char::is_whitespace) {
        return Err(bad_request!("invalid URL: {url}"));
    }

    let trimmed = url.trim_end_matches('/');
    let Some((scheme, rest)) = trimmed.split_once("://") else {
        // bare URIs (e.g. `example/protocol`) are allowed as-is
        return Ok(trimmed.to_string());
    };

    let (host, path) = rest.split_once('/').map_or((rest, None), |(h, p)| (h, Some(p)));
    let mut cleaned = format!("{}://{}", scheme.to_lowercase(), host.to_lowercase());
    if let Some(path) = path {
        cleaned.push('/');
        cleaned.push_str(path);
    }

    Ok(cleaned)
}

/// Serialize a `DateTime<Utc>` as RFC 3339 with microsecond precision.
/// Microsecond precision keeps encodings byte-stable for CID computation.
pub(crate) mod rfc3339_micros {
    use chrono::{DateTime, SecondsFormat::Micros, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        date: &DateTime<Utc>, serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.to_rfc3339_opts(Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// As [`rfc3339_micros`], for optional dates.
pub(crate) mod rfc3339_micros_opt {
    use chrono::{DateTime, SecondsFormat::Micros, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        date: &Option<DateTime<Utc>>, serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match date {
            Some(date) => serializer.serialize_str(&date.to_rfc3339_opts(Micros, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| s.parse().map_err(serde::de::Error::custom)).transpose()
    }
}
