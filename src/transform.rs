//! Value transforms authored in site configs.
//!
//! A transform is a pipeline of operations from a closed vocabulary, e.g.
//! `split(",", -3) | normalize_whitespace`. Alternatives are separated by `||`
//! and tried left to right; the first one that yields a non-empty value wins.
//! Configs may come from untrusted authors, so evaluation is limited to
//! string and regex manipulation of the input value.

use regex::{Regex, RegexBuilder};

/// Upper bound for compiled regex programs coming from site configs.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

const OPERATIONS: &[&str] = &[
    "trim",
    "normalize_whitespace",
    "remove_whitespace",
    "digits",
    "remove",
    "replace",
    "extract",
    "first_of",
    "split",
    "grep",
    "line",
    "nonempty_lines",
    "require",
    "scale",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transform `{expr}` failed: {message}")]
pub struct TransformError {
    pub expr: String,
    pub message: String,
}

impl TransformError {
    fn new(expr: &str, message: impl Into<String>) -> Self {
        Self {
            expr: expr.to_owned(),
            message: message.into(),
        }
    }
}

/// Applies `expr` to `raw`. A missing or blank expression returns the input unchanged.
///
/// `Ok(None)` is the "no value" signal; callers treat it like an error.
pub fn apply_transform(raw: &str, expr: Option<&str>) -> Result<Option<String>, TransformError> {
    match expr.filter(|expr| !expr.trim().is_empty()) {
        None => Ok(Some(raw.to_owned())),
        Some(expr) => Transform::parse(expr)?.apply(raw),
    }
}

#[derive(Debug, Clone)]
pub struct Transform {
    source: String,
    alternatives: Vec<Vec<Op>>,
}

impl Transform {
    pub fn parse(expr: &str) -> Result<Self, TransformError> {
        let tokens = tokenize(expr).map_err(|message| TransformError::new(expr, message))?;
        let alternatives = Parser { tokens, pos: 0 }
            .parse_expr()
            .map_err(|message| TransformError::new(expr, message))?;
        Ok(Self {
            source: expr.to_owned(),
            alternatives,
        })
    }

    pub fn apply(&self, value: &str) -> Result<Option<String>, TransformError> {
        let mut last = Ok(None);
        for chain in &self.alternatives {
            match run_chain(chain, value) {
                Ok(Some(out)) if !out.is_empty() => return Ok(Some(out)),
                other => last = other,
            }
        }
        last.map_err(|message| TransformError::new(&self.source, message))
    }
}

fn run_chain(chain: &[Op], value: &str) -> Result<Option<String>, String> {
    let mut current = value.to_owned();
    for op in chain {
        match op.apply(current)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

#[derive(Debug, Clone)]
enum Op {
    Trim,
    NormalizeWhitespace,
    RemoveWhitespace,
    Digits,
    Remove(Regex),
    Replace(Regex, String),
    Extract(Regex, usize),
    FirstOf(Vec<char>),
    Split(String, i64),
    Grep(Regex),
    Line(i64),
    NonemptyLines,
    Require(Regex),
    Scale(f64),
}

impl Op {
    fn apply(&self, value: String) -> Result<Option<String>, String> {
        let out = match self {
            Op::Trim => value.trim().to_owned(),
            Op::NormalizeWhitespace => value.split_whitespace().collect::<Vec<_>>().join(" "),
            Op::RemoveWhitespace => value.chars().filter(|c| !c.is_whitespace()).collect(),
            Op::Digits => value.chars().filter(|c| c.is_ascii_digit()).collect(),
            Op::Remove(re) => re.replace_all(&value, "").into_owned(),
            Op::Replace(re, with) => re.replace_all(&value, with.as_str()).into_owned(),
            Op::Extract(re, group) => {
                return Ok(re
                    .captures(&value)
                    .and_then(|caps| caps.get(*group))
                    .map(|m| m.as_str().to_owned()));
            }
            Op::FirstOf(set) => return Ok(value.chars().find(|c| set.contains(c)).map(String::from)),
            Op::Split(sep, index) => {
                let pieces = value.split(sep.as_str()).collect::<Vec<_>>();
                pick(&pieces, *index)
                    .ok_or_else(|| {
                        format!(
                            "split index {index} out of range ({} pieces)",
                            pieces.len()
                        )
                    })?
                    .to_owned()
            }
            Op::Grep(re) => value
                .lines()
                .filter(|line| re.is_match(line))
                .collect::<Vec<_>>()
                .join("\n"),
            Op::Line(index) => {
                let lines = value.lines().collect::<Vec<_>>();
                pick(&lines, *index)
                    .ok_or_else(|| format!("line index {index} out of range ({} lines)", lines.len()))?
                    .to_owned()
            }
            Op::NonemptyLines => value
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            Op::Require(re) => {
                if !re.is_match(&value) {
                    return Ok(None);
                }
                value
            }
            Op::Scale(factor) => {
                let trimmed = value.trim();
                let number = trimmed
                    .parse::<f64>()
                    .map_err(|_| format!("`{trimmed}` is not a number"))?;
                format_number(number * factor)
            }
        };
        Ok(Some(out))
    }
}

fn pick<'a>(items: &[&'a str], index: i64) -> Option<&'a str> {
    let len = items.len() as i64;
    let idx = if index < 0 { len + index } else { index };
    if idx < 0 || idx >= len {
        return None;
    }
    Some(items[idx as usize])
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    LParen,
    RParen,
    Comma,
    Pipe,
    OrOr,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::OrOr);
                } else {
                    tokens.push(Token::Pipe);
                }
            }
            '"' | '\'' => {
                let quote = ch;
                chars.next();
                let mut literal = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    if c == '\\' {
                        match chars.peek().copied() {
                            Some(next) if next == quote => {
                                literal.push(next);
                                chars.next();
                                continue;
                            }
                            Some('\\') => {
                                literal.push_str("\\\\");
                                chars.next();
                                continue;
                            }
                            _ => {}
                        }
                    }
                    literal.push(c);
                }
                if !closed {
                    return Err("unterminated string literal".to_owned());
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let mut number = String::new();
                number.push(c);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if !(c.is_ascii_digit() || c == '.') {
                        break;
                    }
                    number.push(c);
                    chars.next();
                }
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if !(c.is_alphanumeric() || c == '_') {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Arg {
    Str(String),
    Num(String),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_expr(&mut self) -> Result<Vec<Vec<Op>>, String> {
        if self.tokens.is_empty() {
            return Err("empty expression".to_owned());
        }
        let mut alternatives = vec![self.parse_chain()?];
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            alternatives.push(self.parse_chain()?);
        }
        if let Some(token) = self.peek() {
            return Err(format!("unexpected token {token:?}"));
        }
        Ok(alternatives)
    }

    fn parse_chain(&mut self) -> Result<Vec<Op>, String> {
        let mut chain = vec![self.parse_call()?];
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            chain.push(self.parse_call()?);
        }
        Ok(chain)
    }

    fn parse_call(&mut self) -> Result<Op, String> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            Some(token) => return Err(format!("expected operation name, found {token:?}")),
            None => return Err("expected operation name, found end of expression".to_owned()),
        };

        let mut args = Vec::new();
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            if self.peek() == Some(&Token::RParen) {
                self.pos += 1;
            } else {
                loop {
                    match self.next() {
                        Some(Token::Str(value)) => args.push(Arg::Str(value)),
                        Some(Token::Num(value)) => args.push(Arg::Num(value)),
                        other => {
                            return Err(format!("expected argument for `{name}`, found {other:?}"));
                        }
                    }
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        other => {
                            return Err(format!(
                                "expected `,` or `)` after argument of `{name}`, found {other:?}"
                            ));
                        }
                    }
                }
            }
        }

        build_op(&name, &args)
    }
}

fn build_op(name: &str, args: &[Arg]) -> Result<Op, String> {
    let op = match (name, args) {
        ("trim", []) => Op::Trim,
        ("normalize_whitespace", []) => Op::NormalizeWhitespace,
        ("remove_whitespace", []) => Op::RemoveWhitespace,
        ("digits", []) => Op::Digits,
        ("remove", [Arg::Str(pattern)]) => Op::Remove(compile_regex(pattern)?),
        ("replace", [Arg::Str(pattern), Arg::Str(with)]) => {
            Op::Replace(compile_regex(pattern)?, with.clone())
        }
        ("extract", [Arg::Str(pattern)]) => Op::Extract(compile_regex(pattern)?, 0),
        ("extract", [Arg::Str(pattern), Arg::Num(group)]) => {
            let re = compile_regex(pattern)?;
            let group = parse_index(group)?;
            if group < 0 || group as usize >= re.captures_len() {
                return Err(format!("capture group {group} does not exist in `{pattern}`"));
            }
            Op::Extract(re, group as usize)
        }
        ("first_of", [Arg::Str(set)]) => {
            if set.is_empty() {
                return Err("first_of needs a non-empty character set".to_owned());
            }
            Op::FirstOf(set.chars().collect())
        }
        ("split", [Arg::Str(sep), Arg::Num(index)]) => {
            if sep.is_empty() {
                return Err("split needs a non-empty separator".to_owned());
            }
            Op::Split(sep.clone(), parse_index(index)?)
        }
        ("grep", [Arg::Str(pattern)]) => Op::Grep(compile_regex(pattern)?),
        ("line", [Arg::Num(index)]) => Op::Line(parse_index(index)?),
        ("nonempty_lines", []) => Op::NonemptyLines,
        ("require", [Arg::Str(pattern)]) => Op::Require(compile_regex(pattern)?),
        ("scale", [Arg::Num(factor)]) => Op::Scale(
            factor
                .parse::<f64>()
                .map_err(|_| format!("invalid scale factor `{factor}`"))?,
        ),
        (name, _) if OPERATIONS.contains(&name) => {
            return Err(format!("wrong arguments for `{name}`"));
        }
        (name, _) => return Err(format!("unknown operation `{name}`")),
    };
    Ok(op)
}

fn parse_index(raw: &str) -> Result<i64, String> {
    raw.parse::<i64>()
        .map_err(|_| format!("expected an integer, found `{raw}`"))
}

fn compile_regex(pattern: &str) -> Result<Regex, String> {
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|err| format!("invalid regex `{pattern}`: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(raw: &str, expr: &str) -> Result<Option<String>, TransformError> {
        apply_transform(raw, Some(expr))
    }

    #[test]
    fn missing_expression_returns_input_unchanged() {
        assert_eq!(
            apply_transform("  as is ", None).unwrap(),
            Some("  as is ".to_owned())
        );
        assert_eq!(
            apply_transform("x", Some("   ")).unwrap(),
            Some("x".to_owned())
        );
    }

    #[test]
    fn digits_strips_everything_else() {
        assert_eq!(run("1 234 €", "digits").unwrap(), Some("1234".to_owned()));
    }

    #[test]
    fn regex_escapes_pass_through_string_literals() {
        assert_eq!(
            run("Beds: 4", r#"remove("\D")"#).unwrap(),
            Some("4".to_owned())
        );
        assert_eq!(
            run("12 500 000 RUB", r"remove('[0-9.,\s]') | trim").unwrap(),
            Some("RUB".to_owned())
        );
    }

    #[test]
    fn first_of_picks_currency_symbol_or_no_value() {
        assert_eq!(
            run("$ 1,200,000", "first_of('€$£¥')").unwrap(),
            Some("$".to_owned())
        );
        assert_eq!(run("1,200,000", "first_of('€$£¥')").unwrap(), None);
    }

    #[test]
    fn split_supports_negative_indexes() {
        let location = "12 Main St, Old Town, Lisbon, Portugal";
        assert_eq!(
            run(location, "split(',', -3) | normalize_whitespace").unwrap(),
            Some("Old Town".to_owned())
        );
    }

    #[test]
    fn split_out_of_range_is_an_error() {
        let err = run("no separator here", "split(',', 3)").unwrap_err();
        assert_eq!(err.expr, "split(',', 3)");
        assert!(err.message.contains("out of range"), "{}", err.message);
    }

    #[test]
    fn map_style_coordinates_are_extracted() {
        let style = "background: url(https://maps.example/static?center=38.7%2C-9.1&zoom=14)";
        assert_eq!(
            run(
                style,
                r#"split("center=", 1) | split("&", 0) | replace("%2C", ",")"#
            )
            .unwrap(),
            Some("38.7,-9.1".to_owned())
        );
    }

    #[test]
    fn alternatives_choose_between_unit_derivations() {
        let expr = r#"require("sqm") | digits || require("ha") | split(" ", 0) | scale(10000)"#;
        assert_eq!(run("850 sqm lot", expr).unwrap(), Some("850".to_owned()));
        assert_eq!(run("2.5 ha", expr).unwrap(), Some("25000".to_owned()));
        assert_eq!(run("3 acres", expr).unwrap(), None);
    }

    #[test]
    fn grep_and_line_pick_matching_fragment() {
        let raw = "4 Beds\n3 Baths\n250 sqm";
        assert_eq!(
            run(raw, "grep('Baths') | line(0) | digits").unwrap(),
            Some("3".to_owned())
        );
        assert!(run(raw, "grep('Garage') | line(0)").is_err());
    }

    #[test]
    fn nonempty_lines_drops_blank_lines() {
        assert_eq!(
            run("  first \n\n   \n second", "nonempty_lines").unwrap(),
            Some("first\nsecond".to_owned())
        );
    }

    #[test]
    fn extract_returns_capture_group() {
        assert_eq!(
            run("Year built: 1998", r"extract('(\d{4})', 1)").unwrap(),
            Some("1998".to_owned())
        );
        assert_eq!(run("unknown", r"extract('\d{4}')").unwrap(), None);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expr in [
            "re.sub(r'\\s+', '', value)",
            "digits(",
            "split(',')",
            "remove('(')",
            "trim | | digits",
            "'unterminated",
            "__import__('os')",
            "extract('a', 2)",
        ] {
            let err = Transform::parse(expr).unwrap_err();
            assert_eq!(err.expr, expr);
        }
    }

    #[test]
    fn repeated_application_is_deterministic() {
        let transform = Transform::parse("normalize_whitespace | split(' ', -1)").unwrap();
        let first = transform.apply("  a  b   c ").unwrap();
        for _ in 0..5 {
            assert_eq!(transform.apply("  a  b   c ").unwrap(), first);
        }
        assert_eq!(first, Some("c".to_owned()));
    }

    #[test]
    fn escaped_quotes_stay_literal() {
        assert_eq!(
            run(r#"say "hi""#, r#"replace("\"", "")"#).unwrap(),
            Some("say hi".to_owned())
        );
    }
}
