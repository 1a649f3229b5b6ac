//! Turning raw model output into a [`StructuredLesson`].
//!
//! Models wrap JSON in markdown fences, add commentary around it, leave
//! trailing commas, or put raw newlines inside strings. Extraction strips
//! fences and keeps the outermost `{…}`; if that does not parse, one repair
//! pass runs before giving up.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Classification, QuizQuestion, Section, StructuredLesson};

static TRAILING_COMMA: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r",(\s*[}\]])").ok());

/// Strip markdown fences and surrounding prose, keeping the outermost object.
pub fn extract_json(content: &str) -> &str {
    let mut s = content.trim();

    if let Some(start) = s.find("```json") {
        let body = &s[start + 7..];
        if let Some(end) = body.find("```") {
            s = body[..end].trim();
        }
    } else if let Some(start) = s.find("```") {
        let body = &s[start + 3..];
        if let Some(end) = body.find("```") {
            s = body[..end].trim();
        }
    }

    if !(s.starts_with('{') && s.ends_with('}')) {
        if let (Some(a), Some(b)) = (s.find('{'), s.rfind('}')) {
            if b > a {
                s = &s[a..=b];
            }
        }
    }
    s
}

/// Replace control characters with spaces and drop trailing commas.
pub fn repair_json(content: &str) -> String {
    let cleaned: String = content.chars().map(|c| if c.is_control() { ' ' } else { c }).collect();
    match TRAILING_COMMA.as_ref() {
        Some(re) => re.replace_all(&cleaned, "$1").into_owned(),
        None => cleaned,
    }
}

/// Extract, parse, and on failure repair-then-parse.
pub fn parse_json_lenient<T: DeserializeOwned>(content: &str) -> Option<T> {
    let extracted = extract_json(content);
    match serde_json::from_str(extracted) {
        Ok(v) => Some(v),
        Err(first) => {
            debug!(error = %first, "model JSON did not parse, attempting repair");
            serde_json::from_str(&repair_json(extracted))
                .map_err(|e| warn!(error = %e, "model JSON unparseable after repair"))
                .ok()
        }
    }
}

// ── Model output shape ────────────────────────────────────────────────────────

/// What the model is asked to produce. Every field is optional and items are
/// kept as raw values so one malformed entry does not sink the lesson.
#[derive(Debug, Default, Deserialize)]
struct ModelLesson {
    #[serde(default)]
    introduction: Value,
    #[serde(default)]
    sections: Vec<Value>,
    #[serde(default)]
    classifications: Vec<Value>,
    #[serde(default, alias = "quiz")]
    quiz_questions: Vec<Value>,
    #[serde(default, alias = "diagram")]
    diagram_description: Option<String>,
}

fn str_field<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn introduction(v: &Value) -> Option<String> {
    let text = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Object(_) => {
            let definition = str_field(v, &["definition"]).unwrap_or_default();
            let relevance = str_field(v, &["relevance"]).unwrap_or_default();
            format!("{definition}\n{relevance}").trim().to_string()
        }
        _ => String::new(),
    };
    (!text.is_empty()).then_some(text)
}

/// Map a model answer onto the exact option string it refers to.
///
/// Accepts the option verbatim, a bare letter (`"B"`, `"b)"`), or the
/// option text without its letter label, case-insensitively.
pub fn resolve_answer(options: &[String], answer: &str) -> Option<String> {
    let answer = answer.trim();
    if let Some(exact) = options.iter().find(|o| o.as_str() == answer) {
        return Some(exact.clone());
    }

    let letter = answer.trim_end_matches([')', '.', ':']).trim();
    if letter.len() == 1 {
        if let Some(o) = options.iter().find(|o| label(o).is_some_and(|l| l.eq_ignore_ascii_case(letter))) {
            return Some(o.clone());
        }
    }

    let bare = strip_label(answer).to_lowercase();
    options.iter().find(|o| strip_label(o).to_lowercase() == bare).cloned()
}

/// `"B) opt2"` → `Some("B")`.
fn label(option: &str) -> Option<&str> {
    let (head, _) = option.split_once([')', '.', ':'])?;
    let head = head.trim();
    (head.len() == 1 && head.chars().all(|c| c.is_ascii_alphabetic())).then_some(head)
}

fn strip_label(option: &str) -> &str {
    match (label(option), option.split_once([')', '.', ':'])) {
        (Some(_), Some((_, rest))) => rest.trim(),
        _ => option.trim(),
    }
}

fn quiz_item(v: &Value) -> Option<QuizQuestion> {
    let prompt = str_field(v, &["question", "q"])?;
    let options: Vec<String> = v
        .get("options")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let raw_answer = str_field(v, &["correct_answer", "answer"])?;
    let answer = resolve_answer(&options, raw_answer)?;
    let explanation = str_field(v, &["explanation"]).map(str::to_string);
    QuizQuestion::new(prompt, options, answer)
        .map(|q| q.with_explanation(explanation))
        .map_err(|e| debug!(error = %e, "dropping invalid quiz question"))
        .ok()
}

fn into_lesson(m: ModelLesson) -> StructuredLesson {
    StructuredLesson {
        introduction: introduction(&m.introduction),
        classifications: m
            .classifications
            .iter()
            .filter_map(|c| {
                Some(Classification {
                    kind: str_field(c, &["type"])?.to_string(),
                    description: str_field(c, &["description"])?.to_string(),
                })
            })
            .collect(),
        sections: m
            .sections
            .iter()
            .filter_map(|s| {
                Some(Section {
                    title: str_field(s, &["title"])?.to_string(),
                    content: str_field(s, &["content"])?.to_string(),
                })
            })
            .collect(),
        diagram: m.diagram_description.map(|d| d.trim().to_string()).unwrap_or_default(),
        quiz: m.quiz_questions.iter().filter_map(quiz_item).collect(),
    }
}

/// Minimal lesson used when the model output cannot be parsed at all.
pub fn fallback_lesson(topic: &str) -> StructuredLesson {
    StructuredLesson {
        introduction: Some(format!("Learn about {topic}")),
        classifications: vec![],
        sections: vec![Section {
            title: format!("Introduction to {topic}"),
            content: format!("Overview of {topic}."),
        }],
        diagram: String::new(),
        quiz: vec![],
    }
}

/// Parse model output into a lesson, falling back to [`fallback_lesson`].
///
/// A lesson that parses but has no sections also falls back, keeping any
/// introduction the model did produce.
pub fn parse_lesson(content: &str, topic: &str) -> StructuredLesson {
    match parse_json_lenient::<ModelLesson>(content).map(into_lesson) {
        Some(lesson) if !lesson.sections.is_empty() => lesson,
        Some(partial) => {
            warn!(%topic, "model lesson had no usable sections, using fallback");
            let mut fb = fallback_lesson(topic);
            if partial.introduction.is_some() {
                fb.introduction = partial.introduction;
            }
            fb
        }
        None => {
            warn!(%topic, "model lesson unparseable, using fallback");
            fallback_lesson(topic)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL_OUTPUT: &str = r#"Sure! Here is your lesson:
```json
{
  "introduction": {"definition": "Photosynthesis turns light into sugar.", "relevance": "It feeds almost all life."},
  "sections": [
    {"title": "Inputs", "content": "• Light\n• Water\n• CO2"},
    {"title": "broken"}
  ],
  "classifications": [{"type": "C3", "description": "Most plants"}, {"type": "C4"}],
  "diagram_description": "A leaf with arrows.",
  "quiz_questions": [
    {"question": "What gas is absorbed?", "options": ["A) Oxygen", "B) CO2"], "correct_answer": "B) CO2"},
    {"question": "Letter answer?", "options": ["A) Roots", "B) Leaves"], "correct_answer": "b"},
    {"question": "Bad answer", "options": ["A) x", "B) y"], "correct_answer": "Z) nope"}
  ]
}
```
Hope this helps!"#;

    #[test]
    fn extract_json_strips_fences_and_prose() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("noise {\"a\":{\"b\":2}} tail"), "{\"a\":{\"b\":2}}");
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn repair_drops_trailing_commas_and_control_chars() {
        let fixed = repair_json("{\"a\": [1, 2,],\n \"b\": \"x\ty\",}");
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["a"], serde_json::json!([1, 2]));
        assert_eq!(v["b"], "x y");
    }

    #[test]
    fn parses_full_model_output() {
        let lesson = parse_lesson(MODEL_OUTPUT, "photosynthesis");
        assert_eq!(
            lesson.introduction.as_deref(),
            Some("Photosynthesis turns light into sugar.\nIt feeds almost all life.")
        );
        assert_eq!(lesson.sections.len(), 1);
        assert_eq!(lesson.classifications.len(), 1);
        assert_eq!(lesson.diagram, "A leaf with arrows.");
        assert_eq!(lesson.quiz.len(), 2);
        assert_eq!(lesson.quiz[1].answer(), "B) Leaves");
        for q in &lesson.quiz {
            assert!(q.options().iter().any(|o| o == q.answer()));
        }
    }

    #[test]
    fn raw_newlines_inside_strings_are_repaired() {
        let raw = "{\"sections\": [{\"title\": \"T\", \"content\": \"line one\nline two\"},]}";
        let lesson = parse_lesson(raw, "t");
        assert_eq!(lesson.sections[0].content, "line one line two");
    }

    #[test]
    fn garbage_falls_back() {
        let lesson = parse_lesson("I cannot help with that", "volcanoes");
        assert_eq!(lesson, fallback_lesson("volcanoes"));
    }

    #[test]
    fn no_sections_keeps_introduction() {
        let lesson = parse_lesson(r#"{"introduction": "Lava is hot."}"#, "volcanoes");
        assert_eq!(lesson.introduction.as_deref(), Some("Lava is hot."));
        assert_eq!(lesson.sections, fallback_lesson("volcanoes").sections);
    }

    #[test]
    fn resolve_answer_variants() {
        let options = vec!["A) Red".to_string(), "B) Blue".to_string()];
        assert_eq!(resolve_answer(&options, "B) Blue").as_deref(), Some("B) Blue"));
        assert_eq!(resolve_answer(&options, "A").as_deref(), Some("A) Red"));
        assert_eq!(resolve_answer(&options, "blue").as_deref(), Some("B) Blue"));
        assert_eq!(resolve_answer(&options, "Green"), None);
        let plain = vec!["Red".to_string(), "Blue".to_string()];
        assert_eq!(resolve_answer(&plain, "blue").as_deref(), Some("Blue"));
    }
}
