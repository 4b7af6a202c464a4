//! Distinguished names.
//!
//! A [`Dn`] is a sequence of RDNs ordered leaf first, as in the string form
//! `uid=alice,ou=people,dc=example,dc=com`. Each RDN is one or more
//! attribute-value assertions joined by `+`.
//!
//! Equality, hashing and ordering use the normalized form: attribute types
//! are lower-cased, values are compared case-insensitively with whitespace
//! collapsed, and the AVAs of a multi-valued RDN are sorted.

use std::{fmt, hash::Hash, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::matching::MatchingRule;

/// Error parsing a distinguished name.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum DnError {
    /// The string is not a valid DN.
    #[snafu(display("invalid DN {input:?}: {reason}"))]
    Syntax {
        /// The rejected input.
        input: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn syntax(input: &str, reason: impl Into<String>) -> DnError {
    DnError::Syntax { input: input.to_string(), reason: reason.into() }
}

// ============================================================================
// AVA
// ============================================================================

/// One `type=value` assertion inside an RDN.
#[derive(Debug, Clone)]
pub struct Ava {
    attr_type: String,
    value: String,
}

impl Ava {
    /// Creates an assertion from a type and an unescaped value.
    pub fn new(attr_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self { attr_type: attr_type.into(), value: value.into() }
    }

    /// The attribute type as written.
    pub fn attr_type(&self) -> &str {
        &self.attr_type
    }

    /// The unescaped value as written.
    pub fn value(&self) -> &str {
        &self.value
    }

    fn normalized(&self) -> String {
        let value = MatchingRule::CaseIgnore.normalize(self.value.as_bytes());
        let mut out = self.attr_type.to_ascii_lowercase();
        out.push('=');
        escape_value(&String::from_utf8_lossy(&value), &mut out);
        out
    }
}

// ============================================================================
// RDN
// ============================================================================

/// A relative distinguished name: the naming component of one entry.
#[derive(Debug, Clone)]
pub struct Rdn {
    avas: Vec<Ava>,
    normalized: String,
}

impl Rdn {
    /// Creates a single-valued RDN.
    pub fn new(attr_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self::from_avas(vec![Ava::new(attr_type, value)])
    }

    fn from_avas(avas: Vec<Ava>) -> Self {
        let mut parts: Vec<String> = avas.iter().map(Ava::normalized).collect();
        parts.sort();
        Self { avas, normalized: parts.join("+") }
    }

    /// Parses an RDN such as `cn=Alice+sn=Smith`.
    ///
    /// # Errors
    ///
    /// Returns [`DnError::Syntax`] if the string is empty or malformed, or
    /// contains more than one RDN.
    pub fn parse(input: &str) -> Result<Self, DnError> {
        let mut rdns = parse_rdns(input)?;
        if rdns.len() != 1 {
            return Err(syntax(input, "expected exactly one RDN"));
        }
        rdns.pop().ok_or_else(|| syntax(input, "expected exactly one RDN"))
    }

    /// The assertions of this RDN, in written order.
    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// The normalized form used for comparison and storage keys.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Rdn {}

impl Hash for Rdn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                out.push('+');
            }
            out.push_str(&ava.attr_type);
            out.push('=');
            escape_value(&ava.value, &mut out);
        }
        f.write_str(&out)
    }
}

// ============================================================================
// DN
// ============================================================================

/// A distinguished name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Dn {
    /// Leaf first.
    rdns: Vec<Rdn>,
    normalized: String,
}

impl Dn {
    /// The empty DN (the root of the naming hierarchy).
    pub fn root() -> Self {
        Self { rdns: Vec::new(), normalized: String::new() }
    }

    /// Builds a DN from RDNs ordered leaf first.
    pub fn from_rdns(rdns: Vec<Rdn>) -> Self {
        let normalized = rdns.iter().map(Rdn::normalized).collect::<Vec<_>>().join(",");
        Self { rdns, normalized }
    }

    /// Parses the string form of a DN.
    ///
    /// # Errors
    ///
    /// Returns [`DnError::Syntax`] if the string is malformed.
    pub fn parse(input: &str) -> Result<Self, DnError> {
        parse_rdns(input).map(Self::from_rdns)
    }

    /// Whether this is the empty DN.
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDNs.
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// RDNs ordered leaf first.
    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// The leaf RDN, or `None` for the root DN.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// The parent DN, or `None` for the root DN.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(Self::from_rdns(self.rdns[1..].to_vec()))
    }

    /// The DN of a child of this entry.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Self::from_rdns(rdns)
    }

    /// Whether `self` equals `base` or lies below it.
    pub fn is_within(&self, base: &Dn) -> bool {
        let Some(offset) = self.rdns.len().checked_sub(base.rdns.len()) else {
            return false;
        };
        self.rdns[offset..].iter().zip(&base.rdns).all(|(a, b)| a == b)
    }

    /// Whether `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.rdns.len() > ancestor.rdns.len() && self.is_within(ancestor)
    }

    /// The RDNs of `self` that lie below `base`, leaf first.
    ///
    /// Returns `None` if `self` is not within `base`.
    pub fn rdns_below(&self, base: &Dn) -> Option<&[Rdn]> {
        if !self.is_within(base) {
            return None;
        }
        Some(&self.rdns[..self.rdns.len() - base.rdns.len()])
    }

    /// Replaces the `old_base` suffix of `self` with `new_base`.
    ///
    /// Returns `None` if `self` is not within `old_base`.
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        let below = self.rdns_below(old_base)?;
        let mut rdns = below.to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        Some(Self::from_rdns(rdns))
    }

    /// The normalized string form used for comparison.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{rdn}")?;
        }
        Ok(())
    }
}

impl FromStr for Dn {
    type Err = DnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Dn> for String {
    fn from(dn: Dn) -> Self {
        dn.to_string()
    }
}

impl TryFrom<String> for Dn {
    type Error = DnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

// ============================================================================
// Parsing and escaping
// ============================================================================

fn escape_value(value: &str, out: &mut String) {
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let special = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (i == 0 && (c == '#' || c == ' '))
            || (i == last && c == ' ');
        if c == '\0' {
            out.push_str("\\00");
        } else {
            if special {
                out.push('\\');
            }
            out.push(c);
        }
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn valid_attr_type(attr_type: &str) -> bool {
    !attr_type.is_empty()
        && attr_type.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

/// Accumulates one AVA value, tracking which trailing bytes were escaped so
/// that only unescaped trailing spaces are trimmed.
#[derive(Default)]
struct ValueBuf {
    bytes: Vec<u8>,
    protected: usize,
}

impl ValueBuf {
    fn push_plain(&mut self, b: u8) {
        if b == b' ' && self.bytes.is_empty() {
            return;
        }
        self.bytes.push(b);
    }

    fn push_escaped(&mut self, b: u8) {
        self.bytes.push(b);
        self.protected = self.bytes.len();
    }

    fn take(&mut self) -> Vec<u8> {
        while self.bytes.len() > self.protected && self.bytes.last() == Some(&b' ') {
            self.bytes.pop();
        }
        self.protected = 0;
        std::mem::take(&mut self.bytes)
    }
}

fn finish_ava(
    input: &str,
    attr: &mut Option<String>,
    buf: &mut ValueBuf,
    avas: &mut Vec<Ava>,
) -> Result<(), DnError> {
    let attr_type = attr.take().ok_or_else(|| syntax(input, "missing '=' in RDN"))?;
    let value = String::from_utf8(buf.take()).map_err(|_| syntax(input, "value is not UTF-8"))?;
    avas.push(Ava { attr_type, value });
    Ok(())
}

fn parse_rdns(input: &str) -> Result<Vec<Rdn>, DnError> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    let bytes = input.as_bytes();
    let mut rdns = Vec::new();
    let mut avas = Vec::new();
    let mut attr: Option<String> = None;
    let mut buf = ValueBuf::default();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\\' => {
                let next = *bytes.get(i + 1).ok_or_else(|| syntax(input, "dangling escape"))?;
                let pair = bytes.get(i + 2).and_then(|lo| Some((hex_digit(next)?, hex_digit(*lo)?)));
                if let Some((hi, lo)) = pair {
                    buf.push_escaped(hi << 4 | lo);
                    i += 3;
                } else {
                    buf.push_escaped(next);
                    i += 2;
                }
                continue;
            },
            b'=' if attr.is_none() => {
                let raw = String::from_utf8(buf.take()).map_err(|_| syntax(input, "bad type"))?;
                let attr_type = raw.trim().to_string();
                if !valid_attr_type(&attr_type) {
                    return Err(syntax(input, format!("invalid attribute type {attr_type:?}")));
                }
                attr = Some(attr_type);
            },
            b'+' => finish_ava(input, &mut attr, &mut buf, &mut avas)?,
            b',' | b';' => {
                finish_ava(input, &mut attr, &mut buf, &mut avas)?;
                rdns.push(Rdn::from_avas(std::mem::take(&mut avas)));
            },
            _ => buf.push_plain(b),
        }
        i += 1;
    }
    finish_ava(input, &mut attr, &mut buf, &mut avas)?;
    rdns.push(Rdn::from_avas(avas));
    Ok(rdns)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).expect("valid DN")
    }

    #[test]
    fn test_parse_simple_dn() {
        let d = dn("uid=alice,ou=people,dc=example,dc=com");
        assert_eq!(d.depth(), 4);
        assert_eq!(d.rdn().unwrap().avas()[0].attr_type(), "uid");
        assert_eq!(d.rdn().unwrap().avas()[0].value(), "alice");
        assert_eq!(d.to_string(), "uid=alice,ou=people,dc=example,dc=com");
    }

    #[test]
    fn test_equality_is_normalized() {
        assert_eq!(dn("UID=Alice, OU=People,dc=Example,DC=com"), dn("uid=alice,ou=people,dc=example,dc=com"));
        let mut set = HashSet::new();
        set.insert(dn("cn=A  B,dc=x"));
        assert!(set.contains(&dn("CN=a b,DC=X")));
    }

    #[test]
    fn test_multi_valued_rdn_order_insensitive() {
        assert_eq!(dn("cn=a+sn=b,dc=x"), dn("sn=B+cn=A,dc=x"));
        assert_eq!(dn("cn=a+sn=b,dc=x").rdn().unwrap().avas().len(), 2);
    }

    #[test]
    fn test_escapes_roundtrip() {
        let d = dn(r"cn=Smith\, John,dc=x");
        assert_eq!(d.rdn().unwrap().avas()[0].value(), "Smith, John");
        assert_eq!(d.to_string(), r"cn=Smith\, John,dc=x");
        assert_eq!(dn(&d.to_string()), d);
    }

    #[test]
    fn test_hex_escape() {
        let d = dn(r"cn=a\2Cb,dc=x");
        assert_eq!(d.rdn().unwrap().avas()[0].value(), "a,b");
    }

    #[test]
    fn test_escaped_trailing_space_kept() {
        let d = dn(r"cn=a\ ,dc=x");
        assert_eq!(d.rdn().unwrap().avas()[0].value(), "a ");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Dn::parse("uid").is_err());
        assert!(Dn::parse("=alice").is_err());
        assert!(Dn::parse("uid=alice,").is_err());
        assert!(Dn::parse(r"cn=a\").is_err());
        assert!(Dn::parse("c n=a").is_err());
    }

    #[test]
    fn test_root_dn() {
        let root = dn("");
        assert!(root.is_root());
        assert!(root.parent().is_none());
        assert!(dn("dc=com").is_within(&root));
    }

    #[test]
    fn test_parent_child() {
        let d = dn("uid=alice,ou=people,dc=example");
        assert_eq!(d.parent().unwrap(), dn("ou=people,dc=example"));
        assert_eq!(dn("ou=people,dc=example").child(Rdn::new("uid", "alice")), d);
    }

    #[test]
    fn test_ancestry() {
        let base = dn("dc=example,dc=com");
        let d = dn("uid=a,ou=people,dc=example,dc=com");
        assert!(d.is_within(&base));
        assert!(d.is_descendant_of(&base));
        assert!(base.is_within(&base));
        assert!(!base.is_descendant_of(&base));
        assert!(!dn("dc=other,dc=com").is_within(&base));
        assert!(!base.is_within(&d));
    }

    #[test]
    fn test_rebase() {
        let d = dn("uid=a,ou=people,dc=example");
        let moved = d.rebase(&dn("ou=people,dc=example"), &dn("ou=persons,dc=example")).unwrap();
        assert_eq!(moved, dn("uid=a,ou=persons,dc=example"));
        assert!(d.rebase(&dn("ou=other,dc=example"), &dn("dc=x")).is_none());
    }

    #[test]
    fn test_rdns_below() {
        let d = dn("uid=a,ou=people,dc=example");
        let below = d.rdns_below(&dn("dc=example")).unwrap();
        assert_eq!(below.len(), 2);
        assert_eq!(below[1], Rdn::new("ou", "People"));
    }

    #[test]
    fn test_rdn_parse_rejects_multiple() {
        assert!(Rdn::parse("cn=a").is_ok());
        assert!(Rdn::parse("cn=a,dc=b").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let d = dn("cn=x,dc=y");
        let s: String = d.clone().into();
        assert_eq!(Dn::try_from(s).unwrap(), d);
    }
}
