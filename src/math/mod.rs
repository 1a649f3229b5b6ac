//! Step-by-step math answers.
//!
//! Arithmetic and linear equations in one variable are solved locally.
//! Anything else goes to the LLM with a JSON-only prompt.

pub mod expr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cache::{CacheSnapshot, SharedCache};
use crate::config::CacheLimits;
use crate::error::AppError;
use crate::lesson::parse::parse_json_lenient;
use crate::lesson::prompt::MATH_SYSTEM_PROMPT;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::validate::validate_math_question;
use expr::{Linear, MathError, format_number};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MathStep {
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub result: String,
}

impl MathStep {
    fn new(explanation: &str, expression: impl Into<String>, result: impl Into<String>) -> Self {
        Self { explanation: explanation.to_string(), expression: expression.into(), result: result.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathSolution {
    #[serde(default = "no_answer")]
    pub final_answer: String,
    #[serde(default)]
    pub steps: Vec<MathStep>,
}

fn no_answer() -> String {
    "No answer provided".to_string()
}

const LEADING_PHRASES: &[&str] = &["what is", "calculate", "evaluate", "compute", "simplify", "solve for x", "solve"];

/// Drop a leading instruction phrase so `"solve 2x = 4"` parses.
fn strip_instruction(question: &str) -> &str {
    let q = question.trim();
    let lower = q.to_ascii_lowercase();
    for phrase in LEADING_PHRASES {
        if lower.starts_with(phrase) && q.is_char_boundary(phrase.len()) {
            return q[phrase.len()..].trim_start_matches([' ', ',']).trim();
        }
    }
    q
}

/// Solve locally, or explain why the question is out of reach.
pub fn solve_local(question: &str) -> Result<MathSolution, MathError> {
    let q = strip_instruction(question);
    match q.split_once('=') {
        Some((lhs, rhs)) => solve_equation(lhs.trim(), rhs.trim()),
        None => evaluate(q),
    }
}

fn evaluate(q: &str) -> Result<MathSolution, MathError> {
    let (value, var) = expr::parse(q, None)?;
    if var.is_some() {
        // a bare expression with a variable has no single answer
        return Err(MathError::Parse("expression contains a variable and no equation".into()));
    }
    let answer = format_number(value.constant);
    Ok(MathSolution {
        final_answer: answer.clone(),
        steps: vec![
            MathStep::new("Parse the expression", q, ""),
            MathStep::new("Evaluate", q, answer),
        ],
    })
}

fn render_linear(l: Linear, var: char) -> String {
    let coef = match l.coef {
        c if c == 1.0 => String::new(),
        c if c == -1.0 => "-".to_string(),
        c => format_number(c),
    };
    match l.constant {
        k if k == 0.0 => format!("{coef}{var}"),
        k if k < 0.0 => format!("{coef}{var} - {}", format_number(-k)),
        k => format!("{coef}{var} + {}", format_number(k)),
    }
}

fn solve_equation(lhs: &str, rhs: &str) -> Result<MathSolution, MathError> {
    if rhs.contains('=') {
        return Err(MathError::Parse("more than one '='".into()));
    }
    let (mut left, var) = expr::parse(lhs, None)?;
    let (mut right, mut var) = expr::parse(rhs, var)?;
    if var.is_none() && (expr::mentions(lhs, "e") || expr::mentions(rhs, "e")) {
        // `2e = 4` asks for e, it does not compare against Euler's number
        (left, _) = expr::parse(lhs, Some('e'))?;
        (right, _) = expr::parse(rhs, Some('e'))?;
        var = Some('e');
    }
    let combined = Linear { coef: left.coef - right.coef, constant: left.constant - right.constant };
    // thresholds scale with the inputs so tiny but real coefficients survive
    let coef_eps = 1e-12 * left.coef.abs().max(right.coef.abs());
    let constant_eps = 1e-9 * left.constant.abs().max(right.constant.abs()).max(1.0);

    let Some(var) = var else {
        let holds = combined.constant.abs() <= constant_eps;
        return Ok(MathSolution {
            final_answer: if holds { "True" } else { "False" }.to_string(),
            steps: vec![MathStep::new(
                "Compare both sides",
                format!("{lhs} = {rhs}"),
                format!("{} = {}", format_number(left.constant), format_number(right.constant)),
            )],
        });
    };

    let parse_step = MathStep::new("Parse the equation", format!("{lhs} = {rhs}"), "");

    if combined.coef.abs() <= coef_eps {
        let answer = if combined.constant.abs() <= constant_eps { "Infinitely many solutions" } else { "No solution" };
        return Ok(MathSolution {
            final_answer: answer.to_string(),
            steps: vec![parse_step, MathStep::new("Collect terms", "", format!("{} = 0", format_number(combined.constant)))],
        });
    }

    let value = -combined.constant / combined.coef;
    if !value.is_finite() {
        return Err(MathError::NotFinite);
    }
    let answer = format!("{var} = {}", format_number(value));
    Ok(MathSolution {
        final_answer: answer.clone(),
        steps: vec![
            parse_step,
            MathStep::new("Move all terms to one side", format!("{lhs} - ({rhs}) = 0"), format!("{} = 0", render_linear(combined, var))),
            MathStep::new(
                "Solve for the variable",
                format!("{var} = {} / {}", format_number(-combined.constant), format_number(combined.coef)),
                answer,
            ),
        ],
    })
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct MathService {
    llm: LlmProvider,
    cache: SharedCache<MathSolution>,
}

impl MathService {
    pub fn new(llm: LlmProvider, limits: CacheLimits) -> Self {
        Self { llm, cache: SharedCache::new("math", limits) }
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    pub async fn solve(&self, question: &str) -> Result<MathSolution, AppError> {
        let question = validate_math_question(question)?;
        let key = format!("math:{}", &hex::encode(Sha256::digest(question.to_lowercase().as_bytes()))[..16]);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let solution = match solve_local(&question) {
            Ok(s) => s,
            Err(e) => {
                info!(reason = %e, provider = self.llm.name(), "local solver declined, asking model");
                self.ask_model(&question).await?
            }
        };
        self.cache.set(key, solution.clone());
        Ok(solution)
    }

    async fn ask_model(&self, question: &str) -> Result<MathSolution, AppError> {
        let request = CompletionRequest::new(MATH_SYSTEM_PROMPT, question).temperature(0.1).max_tokens(800);
        let reply = self.llm.complete(&request).await?;
        Ok(match parse_json_lenient::<MathSolution>(&reply.text) {
            Some(s) => s,
            None => {
                debug!("math reply was not JSON, returning it verbatim");
                let text = reply.text.trim().to_string();
                MathSolution { final_answer: text.clone(), steps: vec![MathStep::new("Model response", "", text)] }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::providers::dummy::DummyProvider;

    #[test]
    fn arithmetic() {
        let s = solve_local("what is 2 + 3 * 4").unwrap();
        assert_eq!(s.final_answer, "14");
        assert_eq!(s.steps.len(), 2);
    }

    #[test]
    fn linear_equation() {
        let s = solve_local("solve 2x + 3 = 11").unwrap();
        assert_eq!(s.final_answer, "x = 4");
        assert_eq!(s.steps[1].result, "2x - 8 = 0");
    }

    #[test]
    fn variable_on_both_sides() {
        let s = solve_local("3(y - 1) = y + 5").unwrap();
        assert_eq!(s.final_answer, "y = 4");
    }

    #[test]
    fn degenerate_equations() {
        assert_eq!(solve_local("x + 1 = x + 1").unwrap().final_answer, "Infinitely many solutions");
        assert_eq!(solve_local("x + 1 = x + 2").unwrap().final_answer, "No solution");
        assert_eq!(solve_local("2 + 2 = 4").unwrap().final_answer, "True");
    }

    #[test]
    fn large_results_print_every_digit() {
        assert_eq!(solve_local("10^20").unwrap().final_answer, "100000000000000000000");
        assert_eq!(solve_local("x = 2^70").unwrap().final_answer, "x = 1180591620717411303424");
    }

    #[test]
    fn tiny_coefficient_is_still_solvable() {
        let s = solve_local("0.0000000000001x = 1").unwrap();
        assert_eq!(s.final_answer, "x = 10000000000000");
        assert_eq!(solve_local("0.1x + 0.2x = 0.3x").unwrap().final_answer, "Infinitely many solutions");
    }

    #[test]
    fn lone_e_is_the_unknown() {
        assert_eq!(solve_local("solve 2e = 4").unwrap().final_answer, "e = 2");
        assert_eq!(solve_local("x + e = e + 1").unwrap().final_answer, "x = 1");
    }

    #[test]
    fn out_of_reach() {
        assert_eq!(solve_local("x^2 = 4").unwrap_err(), MathError::Nonlinear);
        assert!(solve_local("x + 1").is_err());
        assert!(solve_local("a = b = c").is_err());
    }

    #[test]
    fn model_json_shape() {
        let s: MathSolution = serde_json::from_str(r#"{"steps":[{"explanation":"e"}],"final_answer":"5"}"#).unwrap();
        assert_eq!(s.final_answer, "5");
        assert_eq!(s.steps[0].result, "");
        let s: MathSolution = serde_json::from_str(r#"{"steps":[]}"#).unwrap();
        assert_eq!(s.final_answer, "No answer provided");
    }

    #[tokio::test]
    async fn service_uses_model_fallback_and_caches() {
        let cfg = Config::test_default();
        let svc = MathService::new(LlmProvider::Dummy(DummyProvider), cfg.cache.math);
        let s = svc.solve("integrate x dx").await.unwrap();
        assert_eq!(s.final_answer, "[echo] integrate x dx");
        assert_eq!(svc.solve("1 + 1").await.unwrap().final_answer, "2");
        svc.solve("1 + 1").await.unwrap();
        assert_eq!(svc.cache_snapshot().stats.hits, 1);
    }

    #[tokio::test]
    async fn invalid_question_rejected() {
        let cfg = Config::test_default();
        let svc = MathService::new(LlmProvider::Dummy(DummyProvider), cfg.cache.math);
        assert!(matches!(svc.solve("2 + 2 ; drop").await, Err(AppError::Validation(_))));
    }
}
