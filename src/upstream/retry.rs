use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static DURATION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)(ms|s|m|h)").expect("duration regex"));

/// Parses a Google duration literal such as "1h16m0.667s" or "331.167ms"
/// into whole milliseconds. Returns None when the string is not entirely
/// made of unit-suffixed components.
pub fn parse_duration_ms(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut consumed = 0usize;
    let mut total_ms = 0f64;
    for caps in DURATION_TOKEN.captures_iter(trimmed) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        let unit_ms = match &caps[2] {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return None,
        };
        total_ms += value * unit_ms;
    }

    if consumed != trimmed.len() || consumed == 0 {
        return None;
    }
    Some(total_ms as u64)
}

/// Extracts the retry hint from an upstream 429 body: every
/// `RetryInfo.retryDelay` and `metadata.quotaResetDelay` found under
/// `error.details[]` is parsed and summed. Absent or malformed hints yield
/// None.
pub fn parse_retry_delay(body: &str) -> Option<u64> {
    let json: Value = serde_json::from_str(body).ok()?;
    let details = json.get("error")?.get("details")?.as_array()?;

    let mut found = false;
    let mut total = 0u64;
    for detail in details {
        if let Some(delay) = detail.get("retryDelay").and_then(|v| v.as_str()) {
            total += parse_duration_ms(delay)?;
            found = true;
        }
        if let Some(delay) = detail
            .get("metadata")
            .and_then(|m| m.get("quotaResetDelay"))
            .and_then(|v| v.as_str())
        {
            total += parse_duration_ms(delay)?;
            found = true;
        }
    }

    found.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_compound_duration() {
        assert_eq!(parse_duration_ms("1h16m0.667s"), Some(4_560_667));
    }

    #[test]
    fn parses_fractional_milliseconds() {
        assert_eq!(parse_duration_ms("331.167ms"), Some(331));
    }

    #[test]
    fn parses_fractional_seconds() {
        assert_eq!(parse_duration_ms("1.203s"), Some(1_203));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(parse_duration_ms(""), None);
        assert_eq!(parse_duration_ms("12"), None);
        assert_eq!(parse_duration_ms("soon"), None);
        assert_eq!(parse_duration_ms("5s extra"), None);
        assert_eq!(parse_duration_ms("5x"), None);
    }

    #[test]
    fn extracts_retry_info_from_error_details() {
        let body = json!({
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "details": [
                    {
                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                        "retryDelay": "2s"
                    }
                ]
            }
        })
        .to_string();
        assert_eq!(parse_retry_delay(&body), Some(2_000));
    }

    #[test]
    fn sums_retry_info_and_quota_reset_delay() {
        let body = json!({
            "error": {
                "details": [
                    { "retryDelay": "1.5s" },
                    { "metadata": { "quotaResetDelay": "500ms" } }
                ]
            }
        })
        .to_string();
        assert_eq!(parse_retry_delay(&body), Some(2_000));
    }

    #[test]
    fn missing_or_malformed_hint_yields_none() {
        assert_eq!(parse_retry_delay("not json"), None);
        assert_eq!(
            parse_retry_delay(&json!({"error": {"details": []}}).to_string()),
            None
        );
        assert_eq!(
            parse_retry_delay(
                &json!({"error": {"details": [{"retryDelay": "later"}]}}).to_string()
            ),
            None
        );
    }
}
