use serde::{Deserialize, Deserializer};
use std::str::FromStr;
use tokio::time::Duration;

/// Parses a duration string in the format "90s", "10m", "2h".
///
/// Supported units:
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let unit_char = s.chars().last().unwrap();
    let value_str = &s[0..s.len() - 1];

    let value = match u64::from_str(value_str) {
        Ok(v) => v,
        Err(_) => return Err(format!("Invalid numeric value in duration: '{}'", value_str)),
    };

    match unit_char {
        's' => Ok(Duration::from_secs(value)),
        'm' => Ok(Duration::from_secs(value * 60)),
        'h' => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "Unknown duration unit: '{}'. Use 's', 'm', or 'h'.",
            unit_char
        )),
    }
}

/// Serde adapter: deserialize a `"90s"`-style string into a [`Duration`].
pub fn duration_from_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration_string(&raw).map_err(serde::de::Error::custom)
}

/// Serde adapter for optional duration-string fields.
pub fn opt_duration_from_str<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_duration_string(&s).map_err(serde::de::Error::custom))
        .transpose()
}
