//! Guard condition language: parser and evaluator.
//!
//! Grammar:
//! ```text
//! ConditionExpr  ::= Clause ( '&&' Clause )*
//! Clause         ::= '!' Key | Key | Key Operator Literal
//! Key            ::= identifier ( '.' identifier )*
//! Operator       ::= '=' | '!='
//! Literal        ::= QuotedString | BareWord | Integer | Boolean
//! ```
//!
//! Keys are data-bag paths. A bare key tests that the value is present and
//! non-empty; `!key` tests that it is missing or empty.

use std::fmt;

use journey_types::{DataBag, EngineError};

/// A parsed condition expression consisting of one or more clauses joined by `&&`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub clauses: Vec<Clause>,
}

/// A single test against one data-bag path.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Present,
    Absent,
}

impl ConditionExpr {
    /// Data-bag paths this expression reads.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.clauses.iter().map(|c| c.key.as_str()).collect();
        keys.dedup();
        keys
    }
}

impl fmt::Display for ConditionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" && ")?;
            }
            match clause.operator {
                Operator::Eq => write!(f, "{}={}", clause.key, clause.value)?,
                Operator::NotEq => write!(f, "{}!={}", clause.key, clause.value)?,
                Operator::Present => write!(f, "{}", clause.key)?,
                Operator::Absent => write!(f, "!{}", clause.key)?,
            }
        }
        Ok(())
    }
}

/// Parse a condition string into a [`ConditionExpr`].
///
/// An empty or whitespace-only input produces an expression with zero clauses,
/// which [`evaluate_condition`] treats as always true.
pub fn parse_condition(input: &str) -> Result<ConditionExpr, EngineError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ConditionExpr {
            clauses: Vec::new(),
        });
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        let clause = parse_clause(part.trim())?;
        clauses.push(clause);
    }

    Ok(ConditionExpr { clauses })
}

fn parse_clause(input: &str) -> Result<Clause, EngineError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }

    let Some((key_end, operator, op_len)) = find_operator(input) else {
        // No comparison: presence test, optionally negated.
        let (operator, key) = match input.strip_prefix('!') {
            Some(rest) => (Operator::Absent, rest.trim()),
            None => (Operator::Present, input),
        };
        validate_key(key)?;
        return Ok(Clause {
            key: key.to_string(),
            operator,
            value: String::new(),
        });
    };

    let key = input[..key_end].trim();
    if key.is_empty() {
        return Err(make_error("missing key before operator"));
    }
    validate_key(key)?;

    let raw_value = input[key_end + op_len..].trim();
    if raw_value.is_empty() {
        return Err(make_error(&format!("missing value after operator in '{input}'")));
    }

    Ok(Clause {
        key: key.to_string(),
        operator,
        value: strip_quotes(raw_value),
    })
}

fn validate_key(key: &str) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(make_error("missing key"));
    }
    for seg in key.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(make_error(&format!("invalid key segment: '{seg}'")));
        }
    }
    Ok(())
}

fn find_operator(input: &str) -> Option<(usize, Operator, usize)> {
    // Scan for `!=` or `=`, skipping quoted regions.
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                return Some((i, Operator::NotEq, 2));
            }
            b'=' => return Some((i, Operator::Eq, 1)),
            _ => i += 1,
        }
    }
    None
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn make_error(msg: &str) -> EngineError {
    EngineError::ConditionParse(msg.to_string())
}

/// Evaluate a condition expression against the data bag.
///
/// Comparisons use [`DataBag::resolve_string`], so missing keys compare as an
/// empty string. An expression with zero clauses evaluates to `true`.
pub fn evaluate_condition(expr: &ConditionExpr, data: &DataBag) -> bool {
    expr.clauses.iter().all(|clause| match clause.operator {
        Operator::Eq => data.resolve_string(&clause.key) == clause.value,
        Operator::NotEq => data.resolve_string(&clause.key) != clause.value,
        Operator::Present => data.is_present(&clause.key),
        Operator::Absent => !data.is_present(&clause.key),
    })
}
