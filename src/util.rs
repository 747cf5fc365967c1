use chrono::Utc;
use uuid::Uuid;

/// Generate a new opaque identifier.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as an RFC 3339 string, the format used across the database.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Truncate to at most `max_len` characters without splitting a char.
pub fn truncate(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn now_iso_parses_back() {
        let ts = now_iso();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("hi", 10), "hi");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
