//! Result schemas the output guard decodes into, plus lenient field decoders
//! for the shapes models commonly drift into.

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;

/// A model result type with a prompt-facing description of its JSON shape.
pub trait StructuredOutput: DeserializeOwned + Send {
    /// Short name used in logs and errors
    const NAME: &'static str;
    /// JSON shape shown to the model when asking for a repair
    const SCHEMA: &'static str;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

/// Accept `"text"` or `["a", "b"]`, and `null` as empty.
pub(crate) fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<StringOrList>::deserialize(deserializer)?;
    Ok(match value {
        None => Vec::new(),
        Some(StringOrList::One(s)) if s.trim().is_empty() => Vec::new(),
        Some(StringOrList::One(s)) => vec![s],
        Some(StringOrList::Many(items)) => items,
    })
}

/// Accept `["a"]` or `"a"` and join into one string.
pub(crate) fn list_or_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<StringOrList>::deserialize(deserializer)?;
    Ok(match value {
        None => String::new(),
        Some(StringOrList::One(s)) => s,
        Some(StringOrList::Many(items)) => items.join(" "),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolLike {
    Bool(bool),
    Text(String),
}

/// Accept `true`, `"TRUE"`, `"yes"`; anything else is false.
pub(crate) fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match BoolLike::deserialize(deserializer)? {
        BoolLike::Bool(b) => b,
        BoolLike::Text(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "y"),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScoreLike {
    Number(f64),
    Text(String),
}

/// Critique scores: a number (or numeric string) clamped to 0..=2.
pub(crate) fn score_0_to_2<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match Option::<ScoreLike>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(ScoreLike::Number(n)) => n,
        Some(ScoreLike::Text(s)) => match s.trim().parse::<f64>() {
            Ok(n) => n,
            Err(_) => return Ok(None),
        },
    };
    if raw.is_nan() {
        return Ok(None);
    }
    Ok(Some(raw.round().clamp(0.0, 2.0) as u8))
}
