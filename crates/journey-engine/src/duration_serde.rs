//! Serde helpers for human-readable durations: `"500ms"`, `"30s"`, `"5m"`, `"1h"`, `"1d"`.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration_str(&s).map_err(serde::de::Error::custom)
}

/// Format using the largest unit that represents the duration exactly.
pub fn format_duration(duration: &Duration) -> String {
    let ms = duration.as_millis();
    if ms == 0 || ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = duration.as_secs();
    for (unit, size) in [("d", 86_400), ("h", 3600), ("m", 60)] {
        if secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}

pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let number = |val: &str| -> Result<u64, String> {
        val.trim()
            .parse()
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    };
    let scaled = |val: &str, factor: u64| -> Result<Duration, String> {
        number(val)?
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration too large: {s}"))
    };
    if let Some(val) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(number(val)?))
    } else if let Some(val) = s.strip_suffix('s') {
        scaled(val, 1)
    } else if let Some(val) = s.strip_suffix('m') {
        scaled(val, 60)
    } else if let Some(val) = s.strip_suffix('h') {
        scaled(val, 3600)
    } else if let Some(val) = s.strip_suffix('d') {
        scaled(val, 86_400)
    } else {
        Err(format!("unknown duration format: {s}"))
    }
}

/// Same format for `BTreeMap<String, Duration>` values.
pub mod map {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(map: &BTreeMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, duration) in map {
            out.serialize_entry(key, &super::format_duration(duration))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, s)| {
                super::parse_duration_str(&s)
                    .map(|d| (key, d))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
