//! Common utilities and helper functions

pub mod retry;

use url::form_urlencoded;

/// Percent-encode a single path segment so it never contains `/`
pub fn encode_segment(segment: &str) -> String {
    form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

/// Reverse of [`encode_segment`]
pub fn decode_segment(segment: &str) -> String {
    form_urlencoded::parse(segment.as_bytes())
        .next()
        .map(|(decoded, _)| decoded.into_owned())
        .unwrap_or_default()
}

/// Truncate text to a maximum number of characters
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_encoding() {
        let name = "HTTP-http://10.0.0.1:8080/healthz";
        let encoded = encode_segment(name);
        assert!(!encoded.contains('/'));
        assert_eq!(decode_segment(&encoded), name);

        assert_eq!(decode_segment(&encode_segment("TCP-10.0.0.1:9100")), "TCP-10.0.0.1:9100");
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("very long text here", 10), "very lo...");
    }
}
