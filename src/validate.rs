//! Input sanitisation and validation for user-supplied text.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{field} must be at least {min} characters long")]
    TooShort { field: &'static str, min: usize },
    #[error("{field} must be less than {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: &'static str, min: u32, max: u32 },
    #[error("{0} contains potentially dangerous content")]
    Dangerous(&'static str),
    #[error("{0} contains invalid characters")]
    InvalidCharacters(&'static str),
    #[error("{0}")]
    Invalid(String),
}

pub const TOPIC_MAX_CHARS: usize = 300;
pub const MATH_MAX_CHARS: usize = 1000;
pub const TTS_MAX_CHARS: usize = 5000;

static DANGEROUS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)<script[^>]*>",
        r"(?i)javascript:",
        r#"(?i)\bon[a-z]+\s*=\s*["']"#,
        r"(?i)data:text/html",
        r"(?i)vbscript:",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("built-in dangerous-content pattern"))
    .collect()
});

static MATH_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\s+\-*/=().,^{}\[\]\\]+$").expect("built-in math charset pattern"));

static SESSION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_:\-]{1,100}$").expect("built-in session id pattern"));

/// Strip markup and control characters and collapse whitespace.
pub fn sanitize_text(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '<' | '>'))
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn reject_dangerous(field: &'static str, text: &str) -> Result<(), ValidationError> {
    if DANGEROUS.iter().any(|re| re.is_match(text)) {
        return Err(ValidationError::Dangerous(field));
    }
    Ok(())
}

fn check_length(field: &'static str, text: &str, min: usize, max: usize) -> Result<(), ValidationError> {
    let n = text.chars().count();
    if n == 0 {
        return Err(ValidationError::Empty(field));
    }
    if n < min {
        return Err(ValidationError::TooShort { field, min });
    }
    if n > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

/// Validate a lesson topic and return its sanitised form.
pub fn validate_topic(topic: &str) -> Result<String, ValidationError> {
    if topic.trim().is_empty() {
        return Err(ValidationError::Empty("topic"));
    }
    reject_dangerous("topic", topic)?;
    let topic = sanitize_text(topic);
    check_length("topic", &topic, 2, TOPIC_MAX_CHARS)?;
    Ok(topic)
}

pub fn validate_age(age: Option<u32>) -> Result<Option<u32>, ValidationError> {
    match age {
        Some(a) if !(5..=100).contains(&a) => Err(ValidationError::OutOfRange { field: "age", min: 5, max: 100 }),
        other => Ok(other),
    }
}

pub fn validate_math_question(question: &str) -> Result<String, ValidationError> {
    let question = sanitize_text(question);
    check_length("math question", &question, 1, MATH_MAX_CHARS)?;
    if !MATH_CHARS.is_match(&question) {
        return Err(ValidationError::InvalidCharacters("math question"));
    }
    Ok(question)
}

/// Validate TTS text; runs of more than ten identical characters are cut to three.
pub fn validate_tts_text(text: &str) -> Result<String, ValidationError> {
    let text = sanitize_text(text);
    check_length("tts text", &text, 1, TTS_MAX_CHARS)?;
    Ok(collapse_repeats(&text, 10, 3))
}

fn collapse_repeats(text: &str, threshold: usize, keep: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let emit = if run > threshold { keep } else { run };
        out.extend(std::iter::repeat_n(c, emit));
        i += run;
    }
    out
}

/// Session ids are user-scoped (`uid` or `uid:suffix`) and carry no markup.
pub fn validate_session_id(sid: &str) -> Result<String, ValidationError> {
    let sid = sid.trim();
    if sid.is_empty() {
        return Err(ValidationError::Empty("sid"));
    }
    if !SESSION_ID.is_match(sid) {
        return Err(ValidationError::Invalid("invalid session id format".into()));
    }
    Ok(sid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_patterns_compile() {
        assert_eq!(DANGEROUS.len(), 5);
        assert!(MATH_CHARS.is_match("2x + 3 = 11"));
        assert!(SESSION_ID.is_match("uid:abc"));
    }

    #[test]
    fn sanitize_strips_markup_and_collapses_whitespace() {
        assert_eq!(sanitize_text("  <b>photo\tsynthesis</b>\n "), "bphoto synthesis/b");
        assert_eq!(sanitize_text("a\u{0}b"), "a b");
    }

    #[test]
    fn topic_bounds() {
        assert_eq!(validate_topic("   "), Err(ValidationError::Empty("topic")));
        assert_eq!(validate_topic("a"), Err(ValidationError::TooShort { field: "topic", min: 2 }));
        assert!(matches!(validate_topic(&"x".repeat(301)), Err(ValidationError::TooLong { .. })));
        assert_eq!(validate_topic("  the   water cycle ").unwrap(), "the water cycle");
    }

    #[test]
    fn topic_rejects_script_patterns() {
        assert_eq!(validate_topic("<script>alert(1)</script>"), Err(ValidationError::Dangerous("topic")));
        assert_eq!(validate_topic("JavaScript:void(0)"), Err(ValidationError::Dangerous("topic")));
        assert_eq!(validate_topic(r#"img onerror="x""#), Err(ValidationError::Dangerous("topic")));
        // plain words starting with "on" are fine
        assert!(validate_topic("one = 1").is_ok());
    }

    #[test]
    fn age_range() {
        assert_eq!(validate_age(None), Ok(None));
        assert_eq!(validate_age(Some(10)), Ok(Some(10)));
        assert!(validate_age(Some(4)).is_err());
        assert!(validate_age(Some(101)).is_err());
    }

    #[test]
    fn math_question_charset() {
        assert_eq!(validate_math_question(" 2x + 3 = 7 ").unwrap(), "2x + 3 = 7");
        assert_eq!(
            validate_math_question("2 + 2 ; drop table"),
            Err(ValidationError::InvalidCharacters("math question"))
        );
        assert_eq!(validate_math_question(""), Err(ValidationError::Empty("math question")));
    }

    #[test]
    fn tts_text_collapses_long_runs() {
        assert_eq!(validate_tts_text("wooooooooooooow").unwrap(), "wooow");
        assert_eq!(validate_tts_text("soooo").unwrap(), "soooo");
        assert!(matches!(validate_tts_text(&"a b".repeat(2000)), Err(ValidationError::TooLong { .. })));
    }

    #[test]
    fn session_ids() {
        assert_eq!(validate_session_id("user-1:abc").unwrap(), "user-1:abc");
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a b").is_err());
    }
}
