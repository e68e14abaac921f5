//! Typed filter predicates and their engine-native rendering.
//!
//! Every literal (field names included) is escaped before interpolation:
//! `\` becomes `\\` and `'` becomes `\'`. Rendered forms:
//!
//! ```text
//! 'field' = 'value'
//! 'field' IN ['v1','v2']
//! 'field' >= 'value'
//! 'field' <= 'value'
//! <a> AND <b>
//! ```
//!
//! [`parse`] reads the same grammar back; the in-memory search index uses
//! it so filters take the same string round trip a remote engine sees.

use std::cmp::Ordering;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,
    #[error("unexpected token at byte {pos}: {found}")]
    Unexpected { pos: usize, found: String },
    #[error("unterminated string literal starting at byte {0}")]
    Unterminated(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    In(String, Vec<String>),
    Gte(String, String),
    Lte(String, String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn is_in<I, S>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Lte(field.into(), value.into())
    }

    /// Conjunction; nested `And`s are flattened.
    pub fn and(self, other: Filter) -> Self {
        let mut parts = match self {
            Filter::And(parts) => parts,
            f => vec![f],
        };
        match other {
            Filter::And(more) => parts.extend(more),
            f => parts.push(f),
        }
        Filter::And(parts)
    }

    pub fn render(&self) -> String {
        match self {
            Filter::Eq(f, v) => format!("{} = {}", quote(f), quote(v)),
            Filter::Gte(f, v) => format!("{} >= {}", quote(f), quote(v)),
            Filter::Lte(f, v) => format!("{} <= {}", quote(f), quote(v)),
            Filter::In(f, vs) => format!(
                "{} IN [{}]",
                quote(f),
                vs.iter().map(|v| quote(v)).collect::<Vec<_>>().join(",")
            ),
            Filter::And(parts) => parts
                .iter()
                .map(Filter::render)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }

    /// Evaluate against a flat document. Array-valued attributes match when
    /// any element matches.
    pub fn matches(&self, doc: &Map<String, Value>) -> bool {
        match self {
            Filter::And(parts) => parts.iter().all(|p| p.matches(doc)),
            Filter::Eq(f, v) => scalars(doc.get(f)).any(|s| s == *v),
            Filter::In(f, vs) => scalars(doc.get(f)).any(|s| vs.contains(&s)),
            Filter::Gte(f, v) => scalars(doc.get(f)).any(|s| compare(&s, v) != Ordering::Less),
            Filter::Lte(f, v) => {
                scalars(doc.get(f)).any(|s| compare(&s, v) != Ordering::Greater)
            }
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

pub fn escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            c => out.push(c),
        }
    }
    out
}

fn quote(s: &str) -> String {
    format!("'{}'", escape_literal(s))
}

fn scalars(value: Option<&Value>) -> Box<dyn Iterator<Item = String> + '_> {
    match value {
        None | Some(Value::Null) => Box::new(std::iter::empty()),
        Some(Value::Array(items)) => Box::new(items.iter().filter_map(scalar)),
        Some(v) => Box::new(scalar(v).into_iter()),
    }
}

fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn compare(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Eq,
    Gte,
    Lte,
    In,
    And,
    Open,
    Close,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut lit = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => lit.push(escaped),
                            None => return Err(FilterError::Unterminated(pos)),
                        },
                        '\'' => {
                            closed = true;
                            break;
                        }
                        c => lit.push(c),
                    }
                }
                if !closed {
                    return Err(FilterError::Unterminated(pos));
                }
                tokens.push((pos, Token::Literal(lit)));
            }
            '=' => {
                chars.next();
                tokens.push((pos, Token::Eq));
            }
            '>' | '<' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => {
                        tokens.push((pos, if c == '>' { Token::Gte } else { Token::Lte }))
                    }
                    _ => {
                        return Err(FilterError::Unexpected {
                            pos,
                            found: c.to_string(),
                        })
                    }
                }
            }
            '[' => {
                chars.next();
                tokens.push((pos, Token::Open));
            }
            ']' => {
                chars.next();
                tokens.push((pos, Token::Close));
            }
            ',' => {
                chars.next();
                tokens.push((pos, Token::Comma));
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphabetic() {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "IN" => tokens.push((pos, Token::In)),
                    "AND" => tokens.push((pos, Token::And)),
                    _ => {
                        return Err(FilterError::Unexpected {
                            pos,
                            found: if word.is_empty() { c.to_string() } else { word },
                        })
                    }
                }
            }
        }
    }
    Ok(tokens)
}

/// Parse a rendered filter expression.
pub fn parse(input: &str) -> Result<Filter, FilterError> {
    let tokens = tokenize(input)?;
    let mut iter = tokens.into_iter().peekable();
    let mut parts = vec![parse_predicate(&mut iter)?];
    while let Some((pos, tok)) = iter.next() {
        if tok != Token::And {
            return Err(FilterError::Unexpected {
                pos,
                found: format!("{:?}", tok),
            });
        }
        parts.push(parse_predicate(&mut iter)?);
    }
    Ok(if parts.len() == 1 {
        parts.remove(0)
    } else {
        Filter::And(parts)
    })
}

fn parse_predicate<I>(iter: &mut std::iter::Peekable<I>) -> Result<Filter, FilterError>
where
    I: Iterator<Item = (usize, Token)>,
{
    let field = expect_literal(iter)?;
    let (pos, op) = iter.next().ok_or(FilterError::UnexpectedEnd)?;
    match op {
        Token::Eq => Ok(Filter::Eq(field, expect_literal(iter)?)),
        Token::Gte => Ok(Filter::Gte(field, expect_literal(iter)?)),
        Token::Lte => Ok(Filter::Lte(field, expect_literal(iter)?)),
        Token::In => {
            match iter.next() {
                Some((_, Token::Open)) => {}
                Some((pos, t)) => {
                    return Err(FilterError::Unexpected {
                        pos,
                        found: format!("{:?}", t),
                    })
                }
                None => return Err(FilterError::UnexpectedEnd),
            }
            let mut values = Vec::new();
            if matches!(iter.peek(), Some((_, Token::Close))) {
                iter.next();
                return Ok(Filter::In(field, values));
            }
            loop {
                values.push(expect_literal(iter)?);
                match iter.next() {
                    Some((_, Token::Comma)) => continue,
                    Some((_, Token::Close)) => break,
                    Some((pos, t)) => {
                        return Err(FilterError::Unexpected {
                            pos,
                            found: format!("{:?}", t),
                        })
                    }
                    None => return Err(FilterError::UnexpectedEnd),
                }
            }
            Ok(Filter::In(field, values))
        }
        other => Err(FilterError::Unexpected {
            pos,
            found: format!("{:?}", other),
        }),
    }
}

fn expect_literal<I>(iter: &mut std::iter::Peekable<I>) -> Result<String, FilterError>
where
    I: Iterator<Item = (usize, Token)>,
{
    match iter.next() {
        Some((_, Token::Literal(s))) => Ok(s),
        Some((pos, t)) => Err(FilterError::Unexpected {
            pos,
            found: format!("{:?}", t),
        }),
        None => Err(FilterError::UnexpectedEnd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_render_forms() {
        assert_eq!(Filter::eq("ownerId", "U1").render(), "'ownerId' = 'U1'");
        assert_eq!(
            Filter::is_in("tags", ["a", "b"]).render(),
            "'tags' IN ['a','b']"
        );
        assert_eq!(Filter::gte("n", "3").render(), "'n' >= '3'");
        assert_eq!(Filter::lte("n", "9").render(), "'n' <= '9'");
        assert_eq!(
            Filter::eq("a", "1").and(Filter::eq("b", "2")).render(),
            "'a' = '1' AND 'b' = '2'"
        );
    }

    #[test]
    fn test_escapes_quote_and_backslash() {
        let rendered = Filter::eq("title", r"it's C:\tmp").render();
        assert_eq!(rendered, r"'title' = 'it\'s C:\\tmp'");
    }

    #[test]
    fn test_injection_attempt_stays_literal() {
        let hostile = "x' OR 'a' = 'a";
        let f = Filter::eq("ownerId", hostile);
        let parsed = parse(&f.render()).unwrap();
        assert_eq!(parsed, f);
        assert!(!parsed.matches(&doc(json!({"ownerId": "x"}))));
        assert!(!parsed.matches(&doc(json!({"ownerId": "a"}))));
        assert!(parsed.matches(&doc(json!({"ownerId": hostile}))));
    }

    #[test]
    fn test_escaped_round_trip_matches_only_literal() {
        let literal = r"O'Brien\notes";
        let parsed = parse(&Filter::eq("title", literal).render()).unwrap();
        assert!(parsed.matches(&doc(json!({"title": literal}))));
        assert!(!parsed.matches(&doc(json!({"title": "O'Brien\\\\notes"}))));
        assert!(!parsed.matches(&doc(json!({"title": "OBriennotes"}))));
    }

    #[test]
    fn test_parse_round_trip_all_forms() {
        let f = Filter::eq("a", "1")
            .and(Filter::is_in("b", ["x", "y'z"]))
            .and(Filter::gte("c", "2024-01-01"))
            .and(Filter::lte("d", "5"))
            .and(Filter::is_in("e", Vec::<String>::new()));
        assert_eq!(parse(&f.render()).unwrap(), f);
    }

    #[test]
    fn test_matches_arrays_and_ranges() {
        let d = doc(json!({"tags": ["x", "y"], "n": 10, "day": "2024-03-01"}));
        assert!(Filter::eq("tags", "y").matches(&d));
        assert!(Filter::is_in("tags", ["q", "x"]).matches(&d));
        assert!(Filter::gte("n", "9").matches(&d));
        assert!(!Filter::lte("n", "9").matches(&d));
        assert!(Filter::lte("day", "2024-03-01").matches(&d));
        assert!(!Filter::eq("missing", "x").matches(&d));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("'a' = 'b"), Err(FilterError::Unterminated(6)));
        assert!(parse("'a' =").is_err());
        assert!(parse("'a' = 'b' OR 'c' = 'd'").is_err());
        assert!(parse("'a' IN 'b'").is_err());
    }
}
