use chrono::{DateTime, Utc};

use crate::attr::parse_attribute_list;

pub const EXTINF_TAG: &str = "#EXTINF:";
pub const PREFETCH_TAG: &str = "#EXT-X-TWITCH-PREFETCH:";
pub const TWITCH_INFO_TAG: &str = "#EXT-X-TWITCH-INFO:";
pub const SESSION_DATA_TAG: &str = "#EXT-X-SESSION-DATA:";

pub fn is_extinf(line: &str) -> bool {
    line.trim_start().starts_with(EXTINF_TAG)
}

/// Extracts the target URL of a prefetch hint tag, if the line is one.
pub fn prefetch_url(line: &str) -> Option<&str> {
    let url = line.trim().strip_prefix(PREFETCH_TAG)?.trim();
    (!url.is_empty()).then_some(url)
}

/// Replaces the value of one attribute in a tag line, leaving every other
/// byte untouched. Quoted values keep their quotes; a missing attribute
/// leaves the line unchanged. Replacing with the value already present is a
/// no-op, which keeps rewrite passes idempotent.
pub fn rewrite_attribute(line: &str, key: &str, new_value: &str) -> String {
    let Some(pos) = find_attribute(line, key) else {
        return line.to_string();
    };
    let value_start = pos + key.len() + 1;
    let bytes = line.as_bytes();

    let (start, end) = if bytes.get(value_start) == Some(&b'"') {
        let inner = value_start + 1;
        match line[inner..].find('"') {
            Some(close) => (inner, inner + close),
            None => (inner, line.len()),
        }
    } else {
        let end = line[value_start..]
            .find(',')
            .map_or(line.len(), |c| value_start + c);
        (value_start, end)
    };

    format!("{}{}{}", &line[..start], new_value, &line[end..])
}

/// Locates `KEY=` at an attribute boundary (start of list, after the tag
/// colon, or after a comma), so that a key never matches inside a longer key
/// or inside a quoted value.
fn find_attribute(line: &str, key: &str) -> Option<usize> {
    let pattern = format!("{key}=");
    let mut from = 0;
    while let Some(rel) = line[from..].find(&pattern) {
        let pos = from + rel;
        if pos == 0 || matches!(line.as_bytes()[pos - 1], b':' | b',') {
            return Some(pos);
        }
        from = pos + pattern.len();
    }
    None
}

/// Reads the server-time field a playlist may carry, in either API form:
/// a `SERVER-TIME` attribute on the stream-info tag, or a session-data tag
/// with `DATA-ID="SERVER-TIME"`. The value is fractional unix seconds.
pub fn server_time(text: &str) -> Option<DateTime<Utc>> {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(TWITCH_INFO_TAG) {
            let attrs = parse_attribute_list(rest);
            if let Some(ts) = attrs.get("SERVER-TIME").and_then(|v| v.parse::<f64>().ok()) {
                return timestamp_from_unix(ts);
            }
        } else if let Some(rest) = line.strip_prefix(SESSION_DATA_TAG) {
            let attrs = parse_attribute_list(rest);
            if attrs.get("DATA-ID").map(String::as_str) == Some("SERVER-TIME")
                && let Some(ts) = attrs.get("VALUE").and_then(|v| v.parse::<f64>().ok())
            {
                return timestamp_from_unix(ts);
            }
        }
    }
    None
}

fn timestamp_from_unix(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() || ts < 0.0 {
        return None;
    }
    DateTime::from_timestamp(ts.trunc() as i64, (ts.fract() * 1e9) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefetch_url() {
        assert_eq!(
            prefetch_url("#EXT-X-TWITCH-PREFETCH:https://edge.example.com/next.ts"),
            Some("https://edge.example.com/next.ts")
        );
        assert_eq!(prefetch_url("#EXT-X-TWITCH-PREFETCH:"), None);
        assert_eq!(prefetch_url("#EXTINF:2.000,live"), None);
    }

    #[test]
    fn test_rewrite_quoted_attribute() {
        let line = "#EXT-X-DATERANGE:ID=\"ad-1\",X-TV-TWITCH-AD-URL=\"https://ads.example.com/x\",DURATION=30";
        let rewritten = rewrite_attribute(line, "X-TV-TWITCH-AD-URL", "about:blank");
        assert_eq!(
            rewritten,
            "#EXT-X-DATERANGE:ID=\"ad-1\",X-TV-TWITCH-AD-URL=\"about:blank\",DURATION=30"
        );
    }

    #[test]
    fn test_rewrite_unquoted_attribute() {
        let line = "#EXT-X-TWITCH-INFO:NODE=node1,SERVER-TIME=123,ORIGIN=o";
        assert_eq!(
            rewrite_attribute(line, "SERVER-TIME", "456"),
            "#EXT-X-TWITCH-INFO:NODE=node1,SERVER-TIME=456,ORIGIN=o"
        );
    }

    #[test]
    fn test_rewrite_missing_attribute_is_noop() {
        let line = "#EXT-X-DATERANGE:ID=\"x\"";
        assert_eq!(rewrite_attribute(line, "NOPE", "v"), line);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let line = "#EXT-X-DATERANGE:X-TV-TWITCH-AD-URL=\"about:blank\"";
        assert_eq!(
            rewrite_attribute(line, "X-TV-TWITCH-AD-URL", "about:blank"),
            line
        );
    }

    #[test]
    fn test_key_does_not_match_inside_longer_key() {
        let line = "#TAG:PREFIX-URL=\"a\",URL=\"b\"";
        assert_eq!(
            rewrite_attribute(line, "URL", "z"),
            "#TAG:PREFIX-URL=\"a\",URL=\"z\""
        );
    }

    #[test]
    fn test_server_time_from_twitch_info() {
        let text = "#EXTM3U\n#EXT-X-TWITCH-INFO:NODE=\"n\",SERVER-TIME=\"1700000000.50\"\n";
        let ts = server_time(text).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_server_time_from_session_data() {
        let text = "#EXT-X-SESSION-DATA:DATA-ID=\"SERVER-TIME\",VALUE=\"1700000001\"\n";
        let ts = server_time(text).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_001);
    }

    #[test]
    fn test_server_time_absent() {
        assert!(server_time("#EXTM3U\n#EXTINF:2.0,live\nseg.ts\n").is_none());
    }
}
