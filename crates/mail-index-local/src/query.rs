//! Query language of the local backends.
//!
//! ```text
//! query   := or
//! or      := and ( "OR" and )*
//! and     := unary ( ["AND"] unary )*
//! unary   := ("NOT" | "-") unary | primary
//! primary := "(" or ")" | field ":" value | value
//! value   := word | "\"" phrase "\""
//! ```
//!
//! Matching is case-insensitive substring matching; there is no stemming and
//! no ranking.

use chrono::NaiveDate;
use mail_index_core::{IndexError, Message, MessageId, Person, SourceId};

/// A parsed query, ready to be matched against indexed messages.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    text: String,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    All,
    Term(Term),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Text(String),
    From(String),
    To(String),
    Subject(String),
    Label(String),
    Id(MessageId),
    Source(SourceId),
    /// Strictly before the day
    Before(NaiveDate),
    /// On or after the day
    After(NaiveDate),
}

impl SearchQuery {
    /// Parse a user query.
    pub fn parse(text: &str) -> Result<Self, IndexError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(IndexError::parse("empty query", text));
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(IndexError::parse("unexpected token", token.raw()));
        }

        Ok(Self {
            text: text.to_string(),
            expr,
        })
    }

    /// A query matching every message.
    pub fn all() -> Self {
        Self {
            text: String::new(),
            expr: Expr::All,
        }
    }

    /// The text the query was parsed from.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.expr.matches(message)
    }
}

impl Expr {
    fn matches(&self, m: &Message) -> bool {
        match self {
            Expr::All => true,
            Expr::Term(term) => term.matches(m),
            Expr::Not(inner) => !inner.matches(m),
            Expr::And(items) => items.iter().all(|e| e.matches(m)),
            Expr::Or(items) => items.iter().any(|e| e.matches(m)),
        }
    }
}

fn contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

fn person_matches(person: &Person, needle: &str) -> bool {
    contains(&person.email, needle) || person.name.as_deref().is_some_and(|n| contains(n, needle))
}

impl Term {
    fn matches(&self, m: &Message) -> bool {
        match self {
            Term::Text(t) => {
                contains(&m.subject, t)
                    || contains(&m.snippet, t)
                    || person_matches(&m.from, t)
                    || m.recipients().any(|p| person_matches(p, t))
            }
            Term::From(t) => person_matches(&m.from, t),
            Term::To(t) => m.recipients().any(|p| person_matches(p, t)),
            Term::Subject(t) => contains(&m.subject, t),
            Term::Label(l) => m.has_label(l),
            Term::Id(id) => &m.id == id,
            Term::Source(s) => m.source == *s,
            Term::Before(d) => m.date.date_naive() < *d,
            Term::After(d) => m.date.date_naive() >= *d,
        }
    }

    fn from_field(field: &str, value: &str, raw: &str) -> Result<Self, IndexError> {
        let lowered = value.to_lowercase();
        let term = match field {
            "from" => Term::From(lowered),
            "to" => Term::To(lowered),
            "subject" => Term::Subject(lowered),
            "label" | "is" => Term::Label(lowered),
            "id" | "msgid" => {
                Term::Id(MessageId::new(value.trim_start_matches('<').trim_end_matches('>')))
            }
            "source" => value
                .parse::<u64>()
                .map(|n| Term::Source(SourceId(n)))
                .map_err(|_| IndexError::parse("invalid source id", raw))?,
            "before" | "after" => {
                let day = NaiveDate::parse_from_str(value, "%Y-%m-%d")
                    .map_err(|_| IndexError::parse("invalid date, expected YYYY-MM-DD", raw))?;
                if field == "before" {
                    Term::Before(day)
                } else {
                    Term::After(day)
                }
            }
            _ => return Err(IndexError::parse(format!("unknown field {:?}", field), raw)),
        };
        Ok(term)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not(String),
    And,
    Or,
    Atom {
        field: Option<String>,
        value: String,
        raw: String,
    },
}

impl Token {
    fn raw(&self) -> &str {
        match self {
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Not(raw) => raw,
            Token::And => "AND",
            Token::Or => "OR",
            Token::Atom { raw, .. } => raw,
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, IndexError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '-' if chars.get(i + 1).is_some_and(|n| !n.is_whitespace()) => {
                tokens.push(Token::Not("-".to_string()));
                i += 1;
            }
            '"' => {
                let (phrase, next) = read_quoted(&chars, i)?;
                tokens.push(Token::Atom {
                    field: None,
                    raw: chars[i..next].iter().collect(),
                    value: phrase,
                });
                i = next;
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | '"')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();

                let token = match word.split_once(':') {
                    Some((field, value)) => {
                        let value = if value.is_empty() && chars.get(i) == Some(&'"') {
                            let (phrase, next) = read_quoted(&chars, i)?;
                            i = next;
                            phrase
                        } else {
                            value.to_string()
                        };
                        let raw: String = chars[start..i].iter().collect();
                        if field.is_empty() || value.is_empty() {
                            return Err(IndexError::parse("missing field name or value", raw));
                        }
                        Token::Atom {
                            field: Some(field.to_lowercase()),
                            value,
                            raw,
                        }
                    }
                    None => match word.as_str() {
                        "AND" => Token::And,
                        "OR" => Token::Or,
                        "NOT" => Token::Not("NOT".to_string()),
                        _ => Token::Atom {
                            field: None,
                            value: word.clone(),
                            raw: word.clone(),
                        },
                    },
                };
                tokens.push(token);
            }
        }
    }

    Ok(tokens)
}

/// Read a quoted phrase starting at the opening quote `start`. Returns the
/// phrase and the index just past the closing quote.
fn read_quoted(chars: &[char], start: usize) -> Result<(String, usize), IndexError> {
    match chars[start + 1..].iter().position(|&c| c == '"') {
        Some(len) => {
            let phrase: String = chars[start + 1..start + 1 + len].iter().collect();
            Ok((phrase, start + len + 2))
        }
        None => Err(IndexError::parse(
            "unterminated quote",
            chars[start..].iter().collect::<String>(),
        )),
    }
}

/// Deepest nesting of parentheses and negations accepted.
const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn descend(&mut self, raw: &str) -> Result<(), IndexError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(IndexError::parse("query nested too deeply", raw));
        }
        Ok(())
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, IndexError> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, IndexError> {
        let mut items = vec![self.parse_unary()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    items.push(self.parse_unary()?);
                }
                Some(Token::Atom { .. } | Token::LParen | Token::Not(_)) => {
                    items.push(self.parse_unary()?);
                }
                _ => break,
            }
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, IndexError> {
        if let Some(Token::Not(raw)) = self.peek() {
            let raw = raw.clone();
            self.pos += 1;
            self.descend(&raw)?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, IndexError> {
        let last = self
            .pos
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map(|t| t.raw().to_string())
            .unwrap_or_default();

        match self.next() {
            Some(Token::LParen) => {
                self.descend("(")?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(IndexError::parse("unbalanced parenthesis", "(")),
                }
            }
            Some(Token::Atom { field: None, value, .. }) => {
                Ok(Expr::Term(Term::Text(value.to_lowercase())))
            }
            Some(Token::Atom {
                field: Some(field),
                value,
                raw,
            }) => Ok(Expr::Term(Term::from_field(&field, &value, &raw)?)),
            Some(token @ (Token::And | Token::Or | Token::RParen)) => {
                Err(IndexError::parse("unexpected operator", token.raw()))
            }
            Some(Token::Not(raw)) => Err(IndexError::parse("unexpected operator", raw)),
            None => Err(IndexError::parse("operator without operand", last)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message() -> Message {
        let mut m = Message::new(
            "abc@example.org",
            chrono::Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
            Person::new(Some("Ann Smith"), "ann@example.org"),
            SourceId(2),
        );
        m.to.push(Person::new(None, "bob@example.org"));
        m.subject = "Quarterly Report".to_string();
        m.snippet = "numbers attached".to_string();
        m.labels.insert("inbox".to_string());
        m
    }

    fn parse_err(text: &str) -> (String, String) {
        match SearchQuery::parse(text) {
            Err(IndexError::Parse { message, fragment }) => (message, fragment),
            other => panic!("expected parse error for {:?}, got {:?}", text, other),
        }
    }

    #[test]
    fn test_boolean_query() {
        let q = SearchQuery::parse("subject:report AND NOT label:spam").unwrap();
        assert!(q.matches(&message()));
        assert_eq!(q.text(), "subject:report AND NOT label:spam");

        let q = SearchQuery::parse("subject:report AND NOT label:inbox").unwrap();
        assert!(!q.matches(&message()));
    }

    #[test]
    fn test_implicit_and_or_and_grouping() {
        assert!(SearchQuery::parse("ann report").unwrap().matches(&message()));
        assert!(!SearchQuery::parse("ann holiday").unwrap().matches(&message()));
        assert!(SearchQuery::parse("holiday OR attached").unwrap().matches(&message()));
        assert!(SearchQuery::parse("(from:carol OR from:ann) to:bob").unwrap().matches(&message()));
        assert!(!SearchQuery::parse("-from:ann").unwrap().matches(&message()));
    }

    #[test]
    fn test_fields() {
        let m = message();
        assert!(SearchQuery::parse("from:\"ann smith\"").unwrap().matches(&m));
        assert!(SearchQuery::parse("is:inbox").unwrap().matches(&m));
        assert!(SearchQuery::parse("id:<abc@example.org>").unwrap().matches(&m));
        assert!(SearchQuery::parse("source:2").unwrap().matches(&m));
        assert!(SearchQuery::parse("after:2024-03-10 before:2024-03-11").unwrap().matches(&m));
        assert!(!SearchQuery::parse("before:2024-03-10").unwrap().matches(&m));
    }

    #[test]
    fn test_quoted_keywords_are_literals() {
        let mut m = message();
        m.subject = "this AND that".to_string();
        assert!(SearchQuery::parse("\"and that\"").unwrap().matches(&m));
    }

    #[test]
    fn test_malformed_queries() {
        assert_eq!(parse_err("subject:foo AND NOT").0, "operator without operand");
        assert_eq!(parse_err("subject:foo AND (label:spam").0, "unbalanced parenthesis");
        assert_eq!(parse_err("label:spam)").1, ")");
        assert_eq!(parse_err("OR foo").1, "OR");
        assert_eq!(parse_err("bogus:x").1, "bogus:x");
        assert_eq!(parse_err("subject:").1, "subject:");
        assert_eq!(parse_err("from:ann \"open").1, "\"open");
        assert_eq!(parse_err("before:yesterday").1, "before:yesterday");
        assert_eq!(parse_err("source:mbox").1, "source:mbox");
        assert_eq!(parse_err("   ").0, "empty query");
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let deep = 100_000;
        assert_eq!(parse_err(&"(".repeat(deep)).0, "query nested too deeply");
        assert_eq!(parse_err(&format!("{}x", "NOT ".repeat(deep))).1, "NOT");
        assert_eq!(parse_err(&format!("{}x", "-".repeat(deep))).1, "-");

        let nested = format!("{}subject:report{}", "(".repeat(64), ")".repeat(64));
        assert!(SearchQuery::parse(&nested).unwrap().matches(&message()));
        let negated = format!("{}x", "NOT NOT ".repeat(32));
        assert!(SearchQuery::parse(&negated).is_ok());
    }

    #[test]
    fn test_all_matches_everything() {
        assert!(SearchQuery::all().matches(&message()));
    }
}
