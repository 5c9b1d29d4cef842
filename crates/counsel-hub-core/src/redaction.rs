//! Confidentiality redaction applied at save time.
//!
//! Redaction is one-way: once the flag is set the original observation is never written.

/// Stored in place of the raw observation for confidential records.
pub const REDACTED_PLACEHOLDER: &str = "[機密內容已遮蔽]";

pub fn redact_observation(text: String, confidential: bool) -> String {
    if confidential {
        REDACTED_PLACEHOLDER.to_string()
    } else {
        text
    }
}

pub fn is_redacted(stored: &str) -> bool {
    stored == REDACTED_PLACEHOLDER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidential_text_never_survives() {
        let out = redact_observation("student disclosed family violence".into(), true);
        assert_eq!(out, REDACTED_PLACEHOLDER);
        assert!(is_redacted(&out));
    }

    #[test]
    fn open_text_unchanged() {
        assert_eq!(redact_observation("late to class".into(), false), "late to class");
    }
}
