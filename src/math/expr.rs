//! Arithmetic and single-variable linear expressions.
//!
//! Every sub-expression evaluates to `coef * x + constant`. Products and
//! quotients that would make the result non-linear are rejected, which keeps
//! equation solving a single division.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MathError {
    #[error("cannot parse expression: {0}")]
    Parse(String),
    #[error("only linear equations in one variable are supported")]
    Nonlinear,
    #[error("more than one variable: {0} and {1}")]
    MultipleVariables(char, char),
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NotFinite,
}

/// `coef * var + constant`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Linear {
    pub coef: f64,
    pub constant: f64,
}

impl Linear {
    fn constant(v: f64) -> Self {
        Self { coef: 0.0, constant: v }
    }

    fn var() -> Self {
        Self { coef: 1.0, constant: 0.0 }
    }

    pub fn is_constant(&self) -> bool {
        self.coef == 0.0
    }

    fn add(self, o: Self) -> Self {
        Self { coef: self.coef + o.coef, constant: self.constant + o.constant }
    }

    fn sub(self, o: Self) -> Self {
        Self { coef: self.coef - o.coef, constant: self.constant - o.constant }
    }

    fn scale(self, k: f64) -> Self {
        Self { coef: self.coef * k, constant: self.constant * k }
    }

    fn mul(self, o: Self) -> Result<Self, MathError> {
        match (self.is_constant(), o.is_constant()) {
            (true, _) => Ok(o.scale(self.constant)),
            (_, true) => Ok(self.scale(o.constant)),
            _ => Err(MathError::Nonlinear),
        }
    }

    fn div(self, o: Self) -> Result<Self, MathError> {
        if !o.is_constant() {
            return Err(MathError::Nonlinear);
        }
        if o.constant == 0.0 {
            return Err(MathError::DivisionByZero);
        }
        Ok(self.scale(1.0 / o.constant))
    }

    fn pow(self, o: Self) -> Result<Self, MathError> {
        match (self.is_constant(), o.is_constant()) {
            (true, true) => Ok(Self::constant(self.constant.powf(o.constant))),
            (false, true) if o.constant == 1.0 => Ok(self),
            (false, true) if o.constant == 0.0 => Ok(Self::constant(1.0)),
            _ => Err(MathError::Nonlinear),
        }
    }
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, MathError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| MathError::Parse(format!("bad number '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            'a'..='z' | 'A'..='Z' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' | '-' | '/' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '*' => {
                // `**` is accepted as power
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Op('^'));
                    i += 2;
                } else {
                    tokens.push(Token::Op('*'));
                    i += 1;
                }
            }
            '(' | '[' | '{' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' | ']' | '}' => {
                tokens.push(Token::Close);
                i += 1;
            }
            other => return Err(MathError::Parse(format!("unexpected '{other}'"))),
        }
    }
    Ok(tokens)
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    var: Option<char>,
}

impl Parser {
    fn new(tokens: Vec<Token>, var: Option<char>) -> Self {
        Self { tokens, pos: 0, var }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<Linear, MathError> {
        let mut acc = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            acc = if op == '+' { acc.add(rhs) } else { acc.sub(rhs) };
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<Linear, MathError> {
        let mut acc = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Op('*')) => {
                    self.pos += 1;
                    acc = acc.mul(self.unary()?)?;
                }
                Some(Token::Op('/')) => {
                    self.pos += 1;
                    acc = acc.div(self.unary()?)?;
                }
                // implicit multiplication: `2x`, `3(x+1)`, `(a)(b)`
                Some(Token::Num(_) | Token::Ident(_) | Token::Open) => {
                    acc = acc.mul(self.power()?)?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn unary(&mut self) -> Result<Linear, MathError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(self.unary()?.scale(-1.0))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Linear, MathError> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exp = self.unary()?;
            return base.pow(exp);
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Linear, MathError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Linear::constant(n)),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(MathError::Parse("missing closing bracket".into())),
                }
            }
            Some(Token::Ident(name)) => self.ident(&name),
            Some(t) => Err(MathError::Parse(format!("unexpected {t:?}"))),
            None => Err(MathError::Parse("unexpected end of input".into())),
        }
    }

    fn ident(&mut self, name: &str) -> Result<Linear, MathError> {
        match name {
            "pi" => Ok(Linear::constant(std::f64::consts::PI)),
            // `e` is Euler's number unless the caller picked it as the unknown
            "e" if self.var != Some('e') => Ok(Linear::constant(std::f64::consts::E)),
            "sqrt" | "abs" => {
                let arg = self.primary()?;
                if !arg.is_constant() {
                    return Err(MathError::Nonlinear);
                }
                Ok(Linear::constant(if name == "sqrt" { arg.constant.sqrt() } else { arg.constant.abs() }))
            }
            _ => {
                let mut chars = name.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => self.variable(c),
                    _ => Err(MathError::Parse(format!("unknown name '{name}'"))),
                }
            }
        }
    }

    fn variable(&mut self, c: char) -> Result<Linear, MathError> {
        match self.var {
            Some(v) if v != c => Err(MathError::MultipleVariables(v, c)),
            _ => {
                self.var = Some(c);
                Ok(Linear::var())
            }
        }
    }
}

/// Parse one side; returns the value and the variable seen, if any.
pub fn parse(input: &str, var: Option<char>) -> Result<(Linear, Option<char>), MathError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(MathError::Parse("empty expression".into()));
    }
    let mut p = Parser::new(tokens, var);
    let value = p.expr()?;
    if p.pos < p.tokens.len() {
        return Err(MathError::Parse("trailing input".into()));
    }
    if !(value.coef.is_finite() && value.constant.is_finite()) {
        return Err(MathError::NotFinite);
    }
    Ok((value, p.var))
}

/// Largest magnitude an `f64` integer survives a round trip through `i64`.
const EXACT_INT_LIMIT: f64 = 9.0e15;

/// Whether `input` uses `name` as a standalone identifier.
pub fn mentions(input: &str, name: &str) -> bool {
    tokenize(input).is_ok_and(|tokens| tokens.iter().any(|t| matches!(t, Token::Ident(n) if n == name)))
}

/// Render without float noise: integers plain, others to six decimals.
pub fn format_number(v: f64) -> String {
    let v = if v == 0.0 { 0.0 } else { v };
    if v.abs() >= EXACT_INT_LIMIT {
        // every float this large is already integral
        return format!("{v:.0}");
    }
    if (v - v.round()).abs() < 1e-9 {
        return format!("{}", v.round() as i64);
    }
    let s = format!("{v:.6}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(s: &str) -> f64 {
        let (v, var) = parse(s, None).unwrap();
        assert!(var.is_none());
        v.constant
    }

    #[test]
    fn precedence_and_brackets() {
        assert_eq!(eval("2 + 3 * 4"), 14.0);
        assert_eq!(eval("(2 + 3) * 4"), 20.0);
        assert_eq!(eval("2^3^2"), 512.0);
        assert_eq!(eval("-2^2"), -4.0);
        assert_eq!(eval("[1 + {2 * 3}] / 7"), 1.0);
        assert_eq!(eval("2**3"), 8.0);
        assert_eq!(eval("sqrt(16) + abs(-2)"), 6.0);
    }

    #[test]
    fn implicit_multiplication_and_variables() {
        let (v, var) = parse("3x + 2(x - 1)", None).unwrap();
        assert_eq!(var, Some('x'));
        assert_eq!(v, Linear { coef: 5.0, constant: -2.0 });
    }

    #[test]
    fn rejects_nonlinear_and_mixed_variables() {
        assert_eq!(parse("x * x", None).unwrap_err(), MathError::Nonlinear);
        assert_eq!(parse("x^2", None).unwrap_err(), MathError::Nonlinear);
        assert_eq!(parse("1 / x", None).unwrap_err(), MathError::Nonlinear);
        assert_eq!(parse("x + y", None).unwrap_err(), MathError::MultipleVariables('x', 'y'));
        assert_eq!(parse("x", Some('y')).unwrap_err(), MathError::MultipleVariables('y', 'x'));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(parse("1 / 0", None).unwrap_err(), MathError::DivisionByZero);
        assert!(matches!(parse("(1 + 2", None), Err(MathError::Parse(_))));
        assert!(matches!(parse("what is love", None), Err(MathError::Parse(_))));
        assert!(matches!(parse("", None), Err(MathError::Parse(_))));
        assert!(matches!(parse("2 = 3", None), Err(MathError::Parse(_))));
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(1.0 / 3.0), "0.333333");
        assert_eq!(format_number(1e20), "100000000000000000000");
        assert_eq!(format_number(-2f64.powi(60)), "-1152921504606846976");
        assert_eq!(format_number(8_999_999_999_999_999.0), "8999999999999999");
    }

    #[test]
    fn e_is_a_constant_unless_chosen_as_variable() {
        assert!((eval("2e") - 2.0 * std::f64::consts::E).abs() < 1e-12);
        let (v, var) = parse("2e + 1", Some('e')).unwrap();
        assert_eq!(var, Some('e'));
        assert_eq!(v, Linear { coef: 2.0, constant: 1.0 });
        assert!(mentions("3 * e", "e"));
        assert!(!mentions("exp = 6", "e"));
    }
}
