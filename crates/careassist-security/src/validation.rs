use careassist_common::{Error, Result};

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_ID_LEN: usize = 128;

/// Request-level checks shared by the HTTP handlers.
#[derive(Debug, Clone, Copy)]
pub struct InputValidator {
    max_message_chars: usize,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new(4000)
    }
}

impl InputValidator {
    pub fn new(max_message_chars: usize) -> Self {
        Self { max_message_chars }
    }

    pub fn max_message_chars(&self) -> usize {
        self.max_message_chars
    }

    /// 1..=255 printable ASCII characters, no whitespace.
    pub fn idempotency_key(&self, key: Option<&str>) -> Result<String> {
        let key = key.ok_or_else(|| Error::Validation("missing Idempotency-Key header".into()))?;
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(Error::Validation(format!(
                "Idempotency-Key must be 1 to {MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
        if !key.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::Validation(
                "Idempotency-Key must be printable ASCII without whitespace".into(),
            ));
        }
        Ok(key.to_string())
    }

    /// Trimmed message text. Control characters other than newline and tab
    /// are stripped.
    pub fn message_text(&self, text: &str) -> Result<String> {
        let cleaned: String = text
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();
        let trimmed = cleaned.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("message must not be empty".into()));
        }
        let chars = trimmed.chars().count();
        if chars > self.max_message_chars {
            return Err(Error::Validation(format!(
                "message is {chars} characters, limit is {}",
                self.max_message_chars
            )));
        }
        Ok(trimmed.to_string())
    }

    pub fn title(&self, title: &str) -> Result<String> {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("title must not be empty".into()));
        }
        if trimmed.chars().count() > MAX_TITLE_CHARS {
            return Err(Error::Validation(format!(
                "title must be at most {MAX_TITLE_CHARS} characters"
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(Error::Validation("title contains control characters".into()));
        }
        Ok(trimmed.to_string())
    }

    /// Session, subject and context ids travel in paths and query strings.
    pub fn identifier(&self, field: &str, value: &str) -> Result<()> {
        if value.is_empty() || value.len() > MAX_ID_LEN {
            return Err(Error::Validation(format!(
                "{field} must be 1 to {MAX_ID_LEN} characters"
            )));
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
        {
            return Err(Error::Validation(format!(
                "{field} contains invalid characters"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_rules() {
        let v = InputValidator::default();
        assert_eq!(v.idempotency_key(Some("abc-123")).unwrap(), "abc-123");
        assert!(v.idempotency_key(None).is_err());
        assert!(v.idempotency_key(Some("")).is_err());
        assert!(v.idempotency_key(Some("has space")).is_err());
        assert!(v.idempotency_key(Some("tab\tkey")).is_err());
        assert!(v.idempotency_key(Some("ключ")).is_err());
        assert!(v.idempotency_key(Some(&"k".repeat(255))).is_ok());
        assert!(v.idempotency_key(Some(&"k".repeat(256))).is_err());
    }

    #[test]
    fn message_is_trimmed_and_bounded() {
        let v = InputValidator::new(10);
        assert_eq!(v.message_text("  hello \n").unwrap(), "hello");
        assert_eq!(v.message_text("a\u{0}b").unwrap(), "ab");
        assert!(v.message_text("   ").is_err());
        assert!(v.message_text("\u{7}").is_err());
        assert!(v.message_text(&"x".repeat(10)).is_ok());
        let err = v.message_text(&"x".repeat(11)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn message_limit_counts_chars_not_bytes() {
        let v = InputValidator::new(3);
        assert!(v.message_text("äöü").is_ok());
    }

    #[test]
    fn title_rules() {
        let v = InputValidator::default();
        assert_eq!(v.title("  Lab results ").unwrap(), "Lab results");
        assert!(v.title("").is_err());
        assert!(v.title(&"t".repeat(201)).is_err());
        assert!(v.title("line\nbreak").is_err());
    }

    #[test]
    fn identifiers() {
        let v = InputValidator::default();
        assert!(v.identifier("session_id", "3f2a-99_b").is_ok());
        assert!(v.identifier("session_id", "").is_err());
        assert!(v.identifier("session_id", "../etc").is_err());
        assert!(v.identifier("session_id", &"a".repeat(129)).is_err());
    }
}
