//! Matching rules: value normalization for equality, ordering, substring and
//! approximate comparison.
//!
//! The same functions derive index keys and evaluate filters against
//! materialized entries, so an index lookup and a post-filter always agree on
//! what "equal" means.

use std::{cmp::Ordering, collections::HashMap};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How values of an attribute are compared.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum MatchingRule {
    /// Unicode text, whitespace-insensitive at the ends, collapsed inside, case-folded.
    #[default]
    CaseIgnore,
    /// Unicode text, whitespace-insensitive at the ends, collapsed inside, case-sensitive.
    CaseExact,
    /// Raw bytes.
    Octet,
    /// Signed 64-bit decimal integers.
    Integer,
}

impl MatchingRule {
    /// Normalizes a value for equality comparison and equality index keys.
    pub fn normalize(self, value: &[u8]) -> Vec<u8> {
        match self {
            Self::CaseIgnore => normalize_text(value, true),
            Self::CaseExact => normalize_text(value, false),
            Self::Octet => value.to_vec(),
            Self::Integer => integer_key(value),
        }
    }

    /// A byte string whose lexicographic order is the rule's value order.
    ///
    /// For the text rules the normalized form already sorts correctly.
    pub fn ordering_key(self, value: &[u8]) -> Vec<u8> {
        self.normalize(value)
    }

    /// Normalizes a value or assertion fragment for substring matching.
    ///
    /// Integers are matched on their trimmed decimal text, not their order key.
    pub fn substring_form(self, value: &[u8]) -> Vec<u8> {
        match self {
            Self::Integer => normalize_text(value, false),
            other => other.normalize(value),
        }
    }

    /// Whether two values are equal under this rule.
    pub fn values_match(self, a: &[u8], b: &[u8]) -> bool {
        self.normalize(a) == self.normalize(b)
    }

    /// Orders two values under this rule.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        self.ordering_key(a).cmp(&self.ordering_key(b))
    }

    /// Whether `value` matches the substring assertion `initial*any*...*final`.
    pub fn substring_matches(
        self,
        value: &[u8],
        initial: Option<&[u8]>,
        any: &[Vec<u8>],
        last: Option<&[u8]>,
    ) -> bool {
        let value = self.substring_form(value);
        let mut rest: &[u8] = &value;

        if let Some(initial) = initial {
            let initial = self.substring_form(initial);
            if !rest.starts_with(&initial) {
                return false;
            }
            rest = &rest[initial.len()..];
        }

        let last = last.map(|l| self.substring_form(l));
        // The final fragment is anchored at the end; reserve it before matching the middle.
        if let Some(last) = &last {
            if rest.len() < last.len() || !rest.ends_with(last) {
                return false;
            }
            rest = &rest[..rest.len() - last.len()];
        }

        for fragment in any {
            let fragment = self.substring_form(fragment);
            match find(rest, &fragment) {
                Some(pos) => rest = &rest[pos + fragment.len()..],
                None => return false,
            }
        }
        true
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Trims, collapses internal whitespace runs to one space and optionally case-folds.
///
/// Values that are not valid UTF-8 are compared as raw bytes.
fn normalize_text(value: &[u8], fold_case: bool) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(value) else {
        return value.to_vec();
    };
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        if fold_case {
            out.extend(word.chars().flat_map(char::to_lowercase));
        } else {
            out.push_str(word);
        }
    }
    out.into_bytes()
}

/// Order-preserving key for integer values.
///
/// Valid integers become `0x00` followed by the sign-flipped big-endian value,
/// so negative numbers sort first. Unparsable values become `0x01` followed by
/// the raw bytes and sort after every integer.
fn integer_key(value: &[u8]) -> Vec<u8> {
    let parsed = std::str::from_utf8(value).ok().and_then(|s| s.trim().parse::<i64>().ok());
    match parsed {
        Some(n) => {
            let mut key = Vec::with_capacity(9);
            key.push(0x00);
            key.extend_from_slice(&((n as u64) ^ (1 << 63)).to_be_bytes());
            key
        },
        None => {
            let mut key = Vec::with_capacity(value.len() + 1);
            key.push(0x01);
            key.extend_from_slice(value);
            key
        },
    }
}

/// Phonetic reduction used for approximate matching and approximate index keys.
///
/// The first letter is kept, the remaining consonants are mapped to sound
/// classes, vowels and `h`/`w`/`y` are dropped, and adjacent repeats of the same
/// class collapse. Non-letters separate words and are otherwise ignored.
pub fn approximate_key(value: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(value);
    let mut key = Vec::new();
    let mut last_class: Option<u8> = None;
    for c in text.chars() {
        if !c.is_ascii_alphabetic() {
            last_class = None;
            continue;
        }
        let upper = c.to_ascii_uppercase() as u8;
        let class = sound_class(upper);
        if key.is_empty() {
            key.push(upper);
            last_class = class;
            continue;
        }
        match class {
            Some(cl) if last_class != Some(cl) => {
                key.push(cl);
                last_class = Some(cl);
            },
            Some(_) => {},
            // Vowels separate repeated consonant sounds.
            None if matches!(upper, b'A' | b'E' | b'I' | b'O' | b'U') => last_class = None,
            None => {},
        }
    }
    key
}

fn sound_class(letter: u8) -> Option<u8> {
    match letter {
        b'B' | b'F' | b'P' | b'V' => Some(b'1'),
        b'C' | b'G' | b'J' | b'K' | b'Q' | b'S' | b'X' | b'Z' => Some(b'2'),
        b'D' | b'T' => Some(b'3'),
        b'L' => Some(b'4'),
        b'M' | b'N' => Some(b'5'),
        b'R' => Some(b'6'),
        _ => None,
    }
}

/// Matching rules per attribute, with a default for everything unlisted.
///
/// Attribute names are compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    default: MatchingRule,
    by_attribute: HashMap<String, MatchingRule>,
}

impl RuleSet {
    /// Creates a rule set where every attribute uses `default`.
    pub fn new(default: MatchingRule) -> Self {
        Self { default, by_attribute: HashMap::new() }
    }

    /// Assigns a rule to one attribute.
    pub fn set(&mut self, attribute: &str, rule: MatchingRule) {
        self.by_attribute.insert(attribute.to_ascii_lowercase(), rule);
    }

    /// Builder-style variant of [`RuleSet::set`].
    #[must_use]
    pub fn with(mut self, attribute: &str, rule: MatchingRule) -> Self {
        self.set(attribute, rule);
        self
    }

    /// The rule for `attribute`.
    pub fn rule_for(&self, attribute: &str) -> MatchingRule {
        if let Some(rule) = self.by_attribute.get(attribute) {
            return *rule;
        }
        self.by_attribute
            .get(&attribute.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_case_ignore_normalization() {
        let rule = MatchingRule::CaseIgnore;
        assert_eq!(rule.normalize(b"  Alice   Smith "), b"alice smith");
        assert!(rule.values_match(b"ALICE@Example.COM", b"alice@example.com"));
    }

    #[test]
    fn test_case_exact_keeps_case() {
        let rule = MatchingRule::CaseExact;
        assert_eq!(rule.normalize(b" Alice  Smith"), b"Alice Smith");
        assert!(!rule.values_match(b"Alice", b"alice"));
    }

    #[test]
    fn test_octet_is_identity() {
        let rule = MatchingRule::Octet;
        assert_eq!(rule.normalize(&[0xFF, 0x00, b' ']), vec![0xFF, 0x00, b' ']);
    }

    #[test]
    fn test_non_utf8_text_falls_back_to_bytes() {
        assert_eq!(MatchingRule::CaseIgnore.normalize(&[0xC3, 0x28]), vec![0xC3, 0x28]);
    }

    #[test]
    fn test_integer_ordering_key_sorts_numerically() {
        let rule = MatchingRule::Integer;
        let values: [&[u8]; 6] = [b"-100", b"-2", b"0", b"7", b" 10 ", b"9000"];
        for pair in values.windows(2) {
            assert_eq!(rule.compare(pair[0], pair[1]), Ordering::Less, "{pair:?}");
        }
        assert!(rule.values_match(b"007", b"7"));
    }

    #[test]
    fn test_integer_garbage_sorts_last() {
        let rule = MatchingRule::Integer;
        assert_eq!(rule.compare(b"abc", &i64::MAX.to_string().into_bytes()), Ordering::Greater);
    }

    #[test]
    fn test_substring_matches() {
        let rule = MatchingRule::CaseIgnore;
        let value = b"Alice Wonderland";
        assert!(rule.substring_matches(value, Some(b"ali"), &[], None));
        assert!(rule.substring_matches(value, None, &[b"WONDER".to_vec()], None));
        assert!(rule.substring_matches(value, Some(b"alice"), &[b"nde".to_vec()], Some(b"land")));
        assert!(!rule.substring_matches(value, Some(b"bob"), &[], None));
        assert!(!rule.substring_matches(value, None, &[], Some(b"alice")));
        // Fragments must not overlap the anchored ends.
        assert!(!rule.substring_matches(b"abc", Some(b"ab"), &[], Some(b"bc")));
    }

    #[test]
    fn test_substring_any_fragments_in_order() {
        let rule = MatchingRule::CaseIgnore;
        assert!(rule.substring_matches(b"one two three", None, &[b"one".to_vec(), b"three".to_vec()], None));
        assert!(!rule.substring_matches(b"one two three", None, &[b"three".to_vec(), b"one".to_vec()], None));
    }

    #[test]
    fn test_approximate_key_groups_similar_spellings() {
        assert_eq!(approximate_key(b"Smith"), approximate_key(b"Smyth"));
        assert_eq!(approximate_key(b"Smith"), b"S53");
        assert_ne!(approximate_key(b"Smith"), approximate_key(b"Jones"));
        assert!(approximate_key(b"1234").is_empty());
    }

    #[test]
    fn test_rule_set_lookup_is_case_insensitive() {
        let rules = RuleSet::new(MatchingRule::CaseIgnore).with("uidNumber", MatchingRule::Integer);
        assert_eq!(rules.rule_for("UIDNUMBER"), MatchingRule::Integer);
        assert_eq!(rules.rule_for("cn"), MatchingRule::CaseIgnore);
    }
}
