//! Prompts, canned replies, and cache keys for lesson generation.

use sha2::{Digest, Sha256};

use super::{QuizQuestion, Section, StructuredLesson};

pub const SOCIAL_REPLY: &str = "Hey dear! 👋 I'm Lana, what would you like to learn today?";

const AGE_PLACEHOLDER: &str = "@age";

const LESSON_SYSTEM_PROMPT: &str = r#"Generate JSON lesson for topic. Structure:
{
  "introduction": {"definition": "Brief definition", "relevance": "Why important"},
  "sections": [{"title": "Title", "content": "• Point 1\n• Point 2\n• Point 3"}],
  "classifications": [{"type": "Type", "description": "Description"}],
  "diagram_description": "One paragraph describing a helpful diagram",
  "quiz_questions": [{"question": "Q?", "options": ["A) opt1", "B) opt2", "C) opt3", "D) opt4"], "correct_answer": "B) opt2", "explanation": "Why"}]
}
Rules: 3 sections, 3-5 bullets each, 4 quiz questions, correct_answer copied exactly from options, plain text, <600 tokens. Adapt content for age @age years.
Section order: 1) Introduction, 2) Classifications/Types (if applicable), 3) Detailed sections, 4) Importance/Applications."#;

pub const MATH_SYSTEM_PROMPT: &str = r#"Return strictly JSON in this shape:
{
  "steps": [
    {"explanation": "", "expression": "", "result": ""}
  ],
  "final_answer": ""
}
Rules:
- Show clear, correct, minimal steps.
- Prefer numeric computations and exact forms where appropriate.
- Keep expressions parseable; avoid prose in fields.
- If word problem: define variables, set up equation(s), solve, and verify.
- Output only valid JSON (no markdown, no commentary)."#;

const SOCIAL_WORDS: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "thank",
    "thanks",
    "thank you",
    "good morning",
    "good afternoon",
    "good evening",
    "how are you",
];

/// System prompt adapted to the learner's age.
pub fn lesson_system_prompt(age: Option<u32>) -> String {
    let audience = age.map(|a| a.to_string()).unwrap_or_else(|| "general audience".to_string());
    LESSON_SYSTEM_PROMPT.replace(AGE_PLACEHOLDER, &audience)
}

pub fn lesson_user_prompt(topic: &str) -> String {
    format!("Topic: {topic}")
}

pub fn is_social_greeting(topic: &str) -> bool {
    let t = topic.trim().trim_end_matches(['!', '.', '?']).to_lowercase();
    SOCIAL_WORDS.contains(&t.as_str())
}

/// Lesson returned for greetings; the model is not called.
pub fn social_lesson() -> StructuredLesson {
    let options = vec!["A) Science".to_string(), "B) History".to_string(), "C) Anything".to_string()];
    let quiz = QuizQuestion::new("What would you like to learn next?", options, "C) Anything")
        .map(|q| vec![q])
        .unwrap_or_default();
    StructuredLesson {
        introduction: Some(SOCIAL_REPLY.to_string()),
        classifications: vec![],
        sections: vec![Section { title: "Friendly Note".into(), content: SOCIAL_REPLY.into() }],
        diagram: "No diagram needed for a friendly chat.".into(),
        quiz,
    }
}

/// `lesson:` + 16 hex chars of SHA-256 over the normalised topic (and age).
pub fn lesson_cache_key(topic: &str, age: Option<u32>) -> String {
    let normalised = topic.trim().to_lowercase();
    let digest = Sha256::digest(normalised.as_bytes());
    let short = &hex::encode(digest)[..16];
    match age {
        Some(a) => format!("lesson:{short}:{a}"),
        None => format!("lesson:{short}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_placeholder_replaced() {
        let p = lesson_system_prompt(Some(9));
        assert!(p.contains("age 9 years"));
        assert!(!p.contains("@age"));
        assert!(lesson_system_prompt(None).contains("general audience"));
    }

    #[test]
    fn greetings_detected() {
        assert!(is_social_greeting("Hello!"));
        assert!(is_social_greeting("  good morning "));
        assert!(!is_social_greeting("hello world history"));
    }

    #[test]
    fn social_lesson_has_valid_quiz() {
        let l = social_lesson();
        assert_eq!(l.quiz.len(), 1);
        assert_eq!(l.quiz[0].answer(), "C) Anything");
    }

    #[test]
    fn cache_key_is_normalised() {
        assert_eq!(lesson_cache_key("Photosynthesis", None), lesson_cache_key("  photosynthesis ", None));
        assert_ne!(lesson_cache_key("photosynthesis", Some(8)), lesson_cache_key("photosynthesis", None));
        let k = lesson_cache_key("x", None);
        assert!(k.starts_with("lesson:"));
        assert_eq!(k.len(), "lesson:".len() + 16);
    }
}
