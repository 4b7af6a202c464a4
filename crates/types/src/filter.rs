//! Search filters.
//!
//! [`Filter`] is the already-parsed filter tree a protocol layer hands to the
//! query evaluator. [`Filter::parse`] reads the RFC 4515 string form and
//! `Display` writes it back. [`Filter::matches`] evaluates a filter against a
//! materialized entry and is the post-filter applied to every search candidate.

use std::{cmp::Ordering, fmt, str::FromStr};

use snafu::Snafu;

use crate::{
    entry::Entry,
    matching::{RuleSet, approximate_key},
};

/// Error parsing a filter string.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum FilterError {
    /// The string is not a valid filter.
    #[snafu(display("invalid filter at byte {position}: {reason}"))]
    Syntax {
        /// Byte offset of the problem.
        position: usize,
        /// What is wrong.
        reason: String,
    },
}

/// A search filter tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// All children match. An empty list is absolute true.
    And(Vec<Filter>),
    /// Any child matches. An empty list is absolute false.
    Or(Vec<Filter>),
    /// The child does not match.
    Not(Box<Filter>),
    /// `(attr=value)`
    Equality {
        /// Attribute name.
        attribute: String,
        /// Assertion value.
        value: Vec<u8>,
    },
    /// `(attr=initial*any*final)`
    Substring {
        /// Attribute name.
        attribute: String,
        /// Leading fragment.
        sub_initial: Option<Vec<u8>>,
        /// Middle fragments, in order.
        sub_any: Vec<Vec<u8>>,
        /// Trailing fragment.
        sub_final: Option<Vec<u8>>,
    },
    /// `(attr>=value)`
    GreaterOrEqual {
        /// Attribute name.
        attribute: String,
        /// Assertion value.
        value: Vec<u8>,
    },
    /// `(attr<=value)`
    LessOrEqual {
        /// Attribute name.
        attribute: String,
        /// Assertion value.
        value: Vec<u8>,
    },
    /// `(attr=*)`
    Present {
        /// Attribute name.
        attribute: String,
    },
    /// `(attr~=value)`
    Approximate {
        /// Attribute name.
        attribute: String,
        /// Assertion value.
        value: Vec<u8>,
    },
}

impl Filter {
    /// Parses the RFC 4515 string form. A single item may omit its parentheses.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Syntax`] on malformed input.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let trimmed = input.trim();
        let owned;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            owned = format!("({trimmed})");
            &owned
        };
        let mut parser = Parser { bytes: text.as_bytes(), pos: 0 };
        let filter = parser.filter()?;
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }

    /// `(attribute=value)`
    pub fn equality(attribute: &str, value: &str) -> Self {
        Self::Equality { attribute: attribute.to_string(), value: value.as_bytes().to_vec() }
    }

    /// `(attribute=*)`
    pub fn present(attribute: &str) -> Self {
        Self::Present { attribute: attribute.to_string() }
    }

    /// The attribute a leaf filter tests, `None` for AND/OR/NOT.
    pub fn attribute(&self) -> Option<&str> {
        match self {
            Self::And(_) | Self::Or(_) | Self::Not(_) => None,
            Self::Equality { attribute, .. }
            | Self::Substring { attribute, .. }
            | Self::GreaterOrEqual { attribute, .. }
            | Self::LessOrEqual { attribute, .. }
            | Self::Present { attribute }
            | Self::Approximate { attribute, .. } => Some(attribute),
        }
    }

    /// Evaluates the filter against an entry.
    pub fn matches(&self, entry: &Entry, rules: &RuleSet) -> bool {
        match self {
            Self::And(children) => children.iter().all(|f| f.matches(entry, rules)),
            Self::Or(children) => children.iter().any(|f| f.matches(entry, rules)),
            Self::Not(child) => !child.matches(entry, rules),
            Self::Equality { attribute, value } => {
                let rule = rules.rule_for(attribute);
                entry.values(attribute).iter().any(|v| rule.values_match(v, value))
            },
            Self::Substring { attribute, sub_initial, sub_any, sub_final } => {
                let rule = rules.rule_for(attribute);
                entry.values(attribute).iter().any(|v| {
                    rule.substring_matches(v, sub_initial.as_deref(), sub_any, sub_final.as_deref())
                })
            },
            Self::GreaterOrEqual { attribute, value } => {
                let rule = rules.rule_for(attribute);
                entry.values(attribute).iter().any(|v| rule.compare(v, value) != Ordering::Less)
            },
            Self::LessOrEqual { attribute, value } => {
                let rule = rules.rule_for(attribute);
                entry.values(attribute).iter().any(|v| rule.compare(v, value) != Ordering::Greater)
            },
            Self::Present { attribute } => entry.has(attribute),
            Self::Approximate { attribute, value } => {
                let rule = rules.rule_for(attribute);
                let wanted = approximate_key(value);
                entry.values(attribute).iter().any(|v| {
                    if wanted.is_empty() {
                        rule.values_match(v, value)
                    } else {
                        approximate_key(v) == wanted
                    }
                })
            },
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
    for &b in value {
        match b {
            b'*' | b'(' | b')' | b'\\' => write!(f, "\\{b:02x}")?,
            0x20..=0x7e => write!(f, "{}", b as char)?,
            _ => write!(f, "\\{b:02x}")?,
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(children) | Self::Or(children) => {
                f.write_str(if matches!(self, Self::And(_)) { "(&" } else { "(|" })?;
                for child in children {
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            },
            Self::Not(child) => write!(f, "(!{child})"),
            Self::Equality { attribute, value } => {
                write!(f, "({attribute}=")?;
                write_value(f, value)?;
                f.write_str(")")
            },
            Self::Substring { attribute, sub_initial, sub_any, sub_final } => {
                write!(f, "({attribute}=")?;
                if let Some(initial) = sub_initial {
                    write_value(f, initial)?;
                }
                f.write_str("*")?;
                for any in sub_any {
                    write_value(f, any)?;
                    f.write_str("*")?;
                }
                if let Some(last) = sub_final {
                    write_value(f, last)?;
                }
                f.write_str(")")
            },
            Self::GreaterOrEqual { attribute, value } => {
                write!(f, "({attribute}>=")?;
                write_value(f, value)?;
                f.write_str(")")
            },
            Self::LessOrEqual { attribute, value } => {
                write!(f, "({attribute}<=")?;
                write_value(f, value)?;
                f.write_str(")")
            },
            Self::Present { attribute } => write!(f, "({attribute}=*)"),
            Self::Approximate { attribute, value } => {
                write!(f, "({attribute}~=")?;
                write_value(f, value)?;
                f.write_str(")")
            },
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> FilterError {
        FilterError::Syntax { position: self.pos, reason: reason.to_string() }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, b: u8) -> Result<(), FilterError> {
        if self.peek() != Some(b) {
            return Err(self.error(&format!("expected '{}'", b as char)));
        }
        self.pos += 1;
        Ok(())
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn filter(&mut self) -> Result<Filter, FilterError> {
        self.skip_spaces();
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            },
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            },
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            },
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.skip_spaces();
        self.expect(b')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut children = Vec::new();
        loop {
            self.skip_spaces();
            if self.peek() != Some(b'(') {
                return Ok(children);
            }
            children.push(self.filter()?);
        }
    }

    fn item(&mut self) -> Result<Filter, FilterError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b';' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let attribute = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.error("attribute is not UTF-8"))?
            .to_string();
        if attribute.is_empty() {
            return Err(self.error("missing attribute description"));
        }

        let op = match (self.peek(), self.bytes.get(self.pos + 1).copied()) {
            (Some(b'='), _) => {
                self.pos += 1;
                b'='
            },
            (Some(op @ (b'~' | b'>' | b'<')), Some(b'=')) => {
                self.pos += 2;
                op
            },
            _ => return Err(self.error("expected a filter operator")),
        };

        let segments = self.value_segments()?;
        if op != b'=' {
            let [value] = <[Vec<u8>; 1]>::try_from(segments)
                .map_err(|_| self.error("unescaped '*' is only allowed in equality filters"))?;
            return Ok(match op {
                b'~' => Filter::Approximate { attribute, value },
                b'>' => Filter::GreaterOrEqual { attribute, value },
                _ => Filter::LessOrEqual { attribute, value },
            });
        }

        match segments.len() {
            1 => {
                let value = segments.into_iter().next().unwrap_or_default();
                Ok(Filter::Equality { attribute, value })
            },
            2 if segments.iter().all(Vec::is_empty) => Ok(Filter::Present { attribute }),
            _ => {
                let mut segments = segments;
                let last = segments.pop().filter(|s| !s.is_empty());
                let mut rest = segments.into_iter();
                let first = rest.next().filter(|s| !s.is_empty());
                let any: Vec<Vec<u8>> = rest.collect();
                if any.iter().any(Vec::is_empty) {
                    return Err(self.error("empty substring fragment"));
                }
                Ok(Filter::Substring { attribute, sub_initial: first, sub_any: any, sub_final: last })
            },
        }
    }

    /// Reads an assertion value up to the closing parenthesis, splitting on unescaped `*`.
    fn value_segments(&mut self) -> Result<Vec<Vec<u8>>, FilterError> {
        let mut segments = vec![Vec::new()];
        loop {
            let Some(b) = self.peek() else {
                return Err(self.error("unterminated assertion value"));
            };
            match b {
                b')' => return Ok(segments),
                b'(' => return Err(self.error("unescaped '(' in assertion value")),
                b'*' => {
                    segments.push(Vec::new());
                    self.pos += 1;
                },
                b'\\' => {
                    let hi = self.bytes.get(self.pos + 1).copied().and_then(hex);
                    let lo = self.bytes.get(self.pos + 2).copied().and_then(hex);
                    let (Some(hi), Some(lo)) = (hi, lo) else {
                        return Err(self.error("escape must be two hex digits"));
                    };
                    if let Some(current) = segments.last_mut() {
                        current.push(hi << 4 | lo);
                    }
                    self.pos += 3;
                },
                _ => {
                    if let Some(current) = segments.last_mut() {
                        current.push(b);
                    }
                    self.pos += 1;
                },
            }
        }
    }
}

fn hex(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
