//! Structured lessons: the JSON shape the UI renders as sections plus a quiz.
//!
//! Lessons are transient: generated per request, cached, never persisted.

pub mod parse;
pub mod prompt;
pub mod service;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use service::LessonService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredLesson {
    pub introduction: Option<String>,
    #[serde(default)]
    pub classifications: Vec<Classification>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub diagram: String,
    #[serde(default)]
    pub quiz: Vec<QuizQuestion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuizError {
    #[error("quiz question needs a prompt")]
    EmptyPrompt,
    #[error("quiz question needs at least two options")]
    TooFewOptions,
    #[error("answer '{0}' is not one of the options")]
    AnswerNotInOptions(String),
}

/// A multiple-choice question whose answer is always one of its options.
///
/// Fields are private so the invariant cannot be broken after construction;
/// deserialisation goes through [`QuizQuestion::new`] as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireQuizQuestion")]
pub struct QuizQuestion {
    #[serde(rename = "q")]
    prompt: String,
    options: Vec<String>,
    answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    explanation: Option<String>,
}

#[derive(Deserialize)]
struct WireQuizQuestion {
    q: String,
    options: Vec<String>,
    answer: String,
    #[serde(default)]
    explanation: Option<String>,
}

impl TryFrom<WireQuizQuestion> for QuizQuestion {
    type Error = QuizError;

    fn try_from(w: WireQuizQuestion) -> Result<Self, Self::Error> {
        QuizQuestion::new(w.q, w.options, w.answer).map(|q| q.with_explanation(w.explanation))
    }
}

impl QuizQuestion {
    pub fn new(
        prompt: impl Into<String>,
        options: Vec<String>,
        answer: impl Into<String>,
    ) -> Result<Self, QuizError> {
        let prompt = prompt.into();
        let answer = answer.into();
        if prompt.trim().is_empty() {
            return Err(QuizError::EmptyPrompt);
        }
        if options.len() < 2 {
            return Err(QuizError::TooFewOptions);
        }
        if !options.contains(&answer) {
            return Err(QuizError::AnswerNotInOptions(answer));
        }
        Ok(Self { prompt, options, answer, explanation: None })
    }

    pub fn with_explanation(mut self, explanation: Option<String>) -> Self {
        self.explanation = explanation.filter(|e| !e.trim().is_empty());
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    pub fn is_correct(&self, choice: &str) -> bool {
        self.answer == choice
    }
}

impl StructuredLesson {
    /// Text read aloud by TTS. Quiz content is never included.
    pub fn speech_text(&self, mode: SpeechMode) -> String {
        let mut parts: Vec<&str> = Vec::new();
        match mode {
            SpeechMode::Summary => {
                parts.extend(self.introduction.as_deref());
                parts.extend(self.sections.iter().map(|s| s.title.as_str()));
            }
            SpeechMode::Section(i) => {
                if let Some(s) = self.sections.get(i) {
                    parts.push(&s.title);
                    parts.push(&s.content);
                }
            }
            SpeechMode::Full => {
                parts.extend(self.introduction.as_deref());
                for c in &self.classifications {
                    parts.push(&c.kind);
                    parts.push(&c.description);
                }
                for s in &self.sections {
                    parts.push(&s.title);
                    parts.push(&s.content);
                }
                if !self.diagram.is_empty() {
                    parts.push(&self.diagram);
                }
            }
        }
        parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect::<Vec<_>>().join(". ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechMode {
    Full,
    Summary,
    Section(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn answer_must_be_an_option() {
        assert!(QuizQuestion::new("2+2?", opts(&["3", "4"]), "4").is_ok());
        assert_eq!(
            QuizQuestion::new("2+2?", opts(&["3", "4"]), "5"),
            Err(QuizError::AnswerNotInOptions("5".into()))
        );
        assert_eq!(QuizQuestion::new("2+2?", opts(&["4"]), "4"), Err(QuizError::TooFewOptions));
        assert_eq!(QuizQuestion::new(" ", opts(&["3", "4"]), "4"), Err(QuizError::EmptyPrompt));
    }

    #[test]
    fn quiz_wire_uses_q_and_enforces_invariant() {
        let q: QuizQuestion = serde_json::from_str(r#"{"q":"Sky?","options":["Blue","Green"],"answer":"Blue"}"#).unwrap();
        assert_eq!(q.prompt(), "Sky?");
        assert!(q.is_correct("Blue"));
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["q"], "Sky?");
        assert!(json.get("explanation").is_none());

        let bad = serde_json::from_str::<QuizQuestion>(r#"{"q":"Sky?","options":["Blue","Green"],"answer":"Red"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn classification_serialises_kind_as_type() {
        let c = Classification { kind: "Renewable".into(), description: "Solar".into() };
        assert_eq!(serde_json::to_value(&c).unwrap()["type"], "Renewable");
    }

    #[test]
    fn speech_text_modes_exclude_quiz() {
        let lesson = StructuredLesson {
            introduction: Some("Intro".into()),
            classifications: vec![],
            sections: vec![
                Section { title: "One".into(), content: "First body".into() },
                Section { title: "Two".into(), content: "Second body".into() },
            ],
            diagram: String::new(),
            quiz: vec![QuizQuestion::new("Secret question", opts(&["a", "b"]), "a").unwrap()],
        };
        assert_eq!(lesson.speech_text(SpeechMode::Summary), "Intro. One. Two");
        assert_eq!(lesson.speech_text(SpeechMode::Section(1)), "Two. Second body");
        assert_eq!(lesson.speech_text(SpeechMode::Section(9)), "");
        let full = lesson.speech_text(SpeechMode::Full);
        assert!(full.contains("First body") && full.contains("Second body"));
        assert!(!full.contains("Secret"));
    }
}
