//! Tag expression predicates

use super::Predicate;
use crate::{series_and_field, Result, SeriesKey, TsmError, FIELD_TAG_KEY};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Boolean connective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

/// Tag comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Equal,
    NotEqual,
    RegexMatch,
    NotRegexMatch,
}

/// Wire form of a predicate expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Logical {
        op: LogicalOp,
        children: Vec<Node>,
    },
    Comparison {
        op: ComparisonOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    TagRef(String),
    StringLiteral(String),
    RegexLiteral(String),
}

impl Node {
    /// `tag = value`
    pub fn tag_eq(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(ComparisonOp::Equal, tag, Node::StringLiteral(value.into()))
    }

    /// `tag != value`
    pub fn tag_neq(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(ComparisonOp::NotEqual, tag, Node::StringLiteral(value.into()))
    }

    /// `tag =~ /pattern/`
    pub fn tag_regex(tag: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(ComparisonOp::RegexMatch, tag, Node::RegexLiteral(pattern.into()))
    }

    /// `tag !~ /pattern/`
    pub fn tag_not_regex(tag: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(
            ComparisonOp::NotRegexMatch,
            tag,
            Node::RegexLiteral(pattern.into()),
        )
    }

    pub fn and(children: Vec<Node>) -> Self {
        Node::Logical {
            op: LogicalOp::And,
            children,
        }
    }

    pub fn or(children: Vec<Node>) -> Self {
        Node::Logical {
            op: LogicalOp::Or,
            children,
        }
    }

    fn compare(op: ComparisonOp, tag: impl Into<String>, right: Node) -> Self {
        Node::Comparison {
            op,
            left: Box::new(Node::TagRef(tag.into())),
            right: Box::new(right),
        }
    }
}

/// Compiled matcher
#[derive(Debug)]
enum Matcher {
    All(Vec<Matcher>),
    Any(Vec<Matcher>),
    Equal { tag: String, value: String, negate: bool },
    Regex { tag: String, re: Regex, negate: bool },
}

impl Matcher {
    fn compile(node: &Node) -> Result<Self> {
        match node {
            Node::Logical { op, children } => {
                if children.is_empty() {
                    return Err(TsmError::Predicate("logical node without children".into()));
                }
                let compiled = children
                    .iter()
                    .map(Matcher::compile)
                    .collect::<Result<Vec<_>>>()?;
                Ok(match op {
                    LogicalOp::And => Matcher::All(compiled),
                    LogicalOp::Or => Matcher::Any(compiled),
                })
            }
            Node::Comparison { op, left, right } => {
                let tag = match left.as_ref() {
                    Node::TagRef(tag) => tag.clone(),
                    other => {
                        return Err(TsmError::Predicate(format!(
                            "left side of comparison must be a tag, got {:?}",
                            other
                        )))
                    }
                };
                match (op, right.as_ref()) {
                    (ComparisonOp::Equal | ComparisonOp::NotEqual, Node::StringLiteral(value)) => {
                        Ok(Matcher::Equal {
                            tag,
                            value: value.clone(),
                            negate: *op == ComparisonOp::NotEqual,
                        })
                    }
                    (
                        ComparisonOp::RegexMatch | ComparisonOp::NotRegexMatch,
                        Node::RegexLiteral(pattern),
                    ) => {
                        let re = Regex::new(pattern)
                            .map_err(|e| TsmError::Predicate(format!("bad regex: {}", e)))?;
                        Ok(Matcher::Regex {
                            tag,
                            re,
                            negate: *op == ComparisonOp::NotRegexMatch,
                        })
                    }
                    (op, right) => Err(TsmError::Predicate(format!(
                        "invalid operand {:?} for {:?}",
                        right, op
                    ))),
                }
            }
            other => Err(TsmError::Predicate(format!(
                "expected logical or comparison node, got {:?}",
                other
            ))),
        }
    }

    fn eval(&self, series: &SeriesKey, field: &str) -> bool {
        match self {
            Matcher::All(ms) => ms.iter().all(|m| m.eval(series, field)),
            Matcher::Any(ms) => ms.iter().any(|m| m.eval(series, field)),
            Matcher::Equal { tag, value, negate } => {
                (lookup(series, field, tag) == value) != *negate
            }
            Matcher::Regex { tag, re, negate } => re.is_match(lookup(series, field, tag)) != *negate,
        }
    }
}

fn lookup<'a>(series: &'a SeriesKey, field: &'a str, tag: &str) -> &'a str {
    if tag == FIELD_TAG_KEY {
        return field;
    }
    series.tag(tag).unwrap_or("")
}

/// A predicate over tags, the measurement and the field of a key
#[derive(Debug)]
pub struct ExprPredicate {
    node: Node,
    matcher: Matcher,
}

impl ExprPredicate {
    /// Validate and compile an expression
    pub fn new(node: Node) -> Result<Self> {
        let matcher = Matcher::compile(&node)?;
        Ok(Self { node, matcher })
    }

    /// Decode and compile a wire-form expression
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let node: Node = bincode::deserialize(bytes)
            .map_err(|e| TsmError::Predicate(format!("invalid predicate encoding: {}", e)))?;
        Self::new(node)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Predicate for ExprPredicate {
    fn matches(&self, key: &[u8]) -> bool {
        let (series, field) = series_and_field(key);
        let series = match SeriesKey::parse(series) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let field = String::from_utf8_lossy(field);
        self.matcher.eval(&series, &field)
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.node)?)
    }
}
