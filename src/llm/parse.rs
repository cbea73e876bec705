//! Local, model-free cleanup of model output before schema decoding.

use serde::de::DeserializeOwned;

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Drop a leading `<think>...</think>` block emitted by reasoning models.
fn strip_reasoning(text: &str) -> &str {
    match text.rfind("</think>") {
        Some(end) => &text[end + "</think>".len()..],
        None => text,
    }
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Extract the JSON object from a model response, handling fences, reasoning and noise
pub(crate) fn extract_json_object(response: &str) -> Option<&str> {
    let clean = strip_markdown_fences(strip_reasoning(response));
    extract_json_fragment(clean, '{', '}')
}

/// Try to fix common JSON issues from LLM responses
pub(crate) fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    // Remove trailing commas before ] or }
    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");
    fixed = fixed.replace(",\n]", "\n]");
    fixed = fixed.replace(",\n}", "\n}");

    // Smart quotes to regular quotes
    fixed = fixed.replace(['\u{201C}', '\u{201D}'], "\"");
    fixed = fixed.replace(['\u{2018}', '\u{2019}'], "'");

    // Remove any control characters that might have slipped in
    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Decode `T` from a raw response without calling a model.
///
/// Tries the extracted object as-is, then once more after sanitizing. The
/// error string is what the repair prompt shows the model.
pub(crate) fn parse_json_strict<T: DeserializeOwned>(response: &str) -> Result<T, String> {
    if response.trim().is_empty() {
        return Err("empty response".to_string());
    }
    let json_str = extract_json_object(response).ok_or_else(|| "no JSON object found".to_string())?;
    match serde_json::from_str::<T>(json_str) {
        Ok(parsed) => Ok(parsed),
        Err(initial_error) => {
            let fixed = fix_json_issues(json_str);
            if fixed != json_str {
                if let Ok(parsed) = serde_json::from_str::<T>(&fixed) {
                    return Ok(parsed);
                }
            }
            Err(initial_error.to_string())
        }
    }
}
