//! Index key derivation.
//!
//! Every index kind turns an attribute's values into a set of byte keys
//! through the attribute's matching rule. The write path diffs the keys of an
//! entry's old and new values; the planner derives lookup keys from filter
//! assertions with the same functions, so both sides agree on every key.

use std::collections::BTreeSet;

use dirstore_types::{MatchingRule, config::IndexKind, matching::approximate_key};

/// Keys longer than this are truncated. Truncation preserves order, so
/// lookups on truncated keys return a superset that the post-filter narrows.
pub const MAX_INDEX_KEY_LEN: usize = 512;

/// The single key of a presence index.
pub const PRESENCE_KEY: &[u8] = b"+";

/// Derives index keys for one attribute's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDeriver {
    /// Matching rule of the attribute.
    pub rule: MatchingRule,
    /// Window length of substring keys.
    pub substring_length: usize,
}

impl KeyDeriver {
    /// Every key `values` produce for an index of `kind`.
    pub fn keys(&self, kind: IndexKind, values: &[Vec<u8>]) -> BTreeSet<Vec<u8>> {
        let mut keys = BTreeSet::new();
        match kind {
            IndexKind::Presence => {
                if !values.is_empty() {
                    keys.insert(PRESENCE_KEY.to_vec());
                }
            },
            IndexKind::Equality => {
                keys.extend(values.iter().map(|v| self.equality_key(v)));
            },
            IndexKind::Ordering => {
                keys.extend(values.iter().map(|v| self.ordering_key(v)));
            },
            IndexKind::Approximate => {
                keys.extend(values.iter().filter_map(|v| self.approximate_key(v)));
            },
            IndexKind::Substring => {
                for value in values {
                    let form = self.rule.substring_form(value);
                    for start in 0..form.len() {
                        let end = (start + self.substring_length).min(form.len());
                        keys.insert(form[start..end].to_vec());
                    }
                }
            },
        }
        keys
    }

    /// Equality key of a value or assertion.
    pub fn equality_key(&self, value: &[u8]) -> Vec<u8> {
        truncate(self.rule.normalize(value))
    }

    /// Ordering key of a value or assertion.
    pub fn ordering_key(&self, value: &[u8]) -> Vec<u8> {
        truncate(self.rule.ordering_key(value))
    }

    /// Approximate key, or `None` when the value has no phonetic content.
    pub fn approximate_key(&self, value: &[u8]) -> Option<Vec<u8>> {
        let key = approximate_key(value);
        (!key.is_empty()).then(|| truncate(key))
    }

    /// The substring windows a fragment of at least `substring_length`
    /// bytes must all be indexed under.
    pub fn substring_windows(&self, fragment: &[u8]) -> Vec<Vec<u8>> {
        if fragment.len() < self.substring_length {
            return Vec::new();
        }
        fragment.windows(self.substring_length).map(<[u8]>::to_vec).collect()
    }

    /// Whether a key derived from this assertion may have been truncated.
    pub fn is_truncated(key: &[u8]) -> bool {
        key.len() >= MAX_INDEX_KEY_LEN
    }
}

fn truncate(mut key: Vec<u8>) -> Vec<u8> {
    key.truncate(MAX_INDEX_KEY_LEN);
    key
}

/// Keys added and removed when an attribute's values change.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyDiff {
    /// Keys only the new values produce.
    pub added: Vec<Vec<u8>>,
    /// Keys only the old values produced.
    pub removed: Vec<Vec<u8>>,
}

/// Diffs the keys of `old` and `new` values.
pub fn diff_keys(
    deriver: &KeyDeriver,
    kind: IndexKind,
    old: &[Vec<u8>],
    new: &[Vec<u8>],
) -> KeyDiff {
    let before = deriver.keys(kind, old);
    let after = deriver.keys(kind, new);
    KeyDiff {
        added: after.difference(&before).cloned().collect(),
        removed: before.difference(&after).cloned().collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn values(vs: &[&str]) -> Vec<Vec<u8>> {
        vs.iter().map(|v| v.as_bytes().to_vec()).collect()
    }

    fn deriver(rule: MatchingRule) -> KeyDeriver {
        KeyDeriver { rule, substring_length: 3 }
    }

    fn strings(keys: BTreeSet<Vec<u8>>) -> Vec<String> {
        keys.into_iter().map(|k| String::from_utf8(k).unwrap()).collect()
    }

    #[test]
    fn test_equality_keys_are_normalized() {
        let keys = deriver(MatchingRule::CaseIgnore)
            .keys(IndexKind::Equality, &values(&["  Alice   Smith ", "alice smith"]));
        assert_eq!(strings(keys), ["alice smith"]);
    }

    #[test]
    fn test_substring_windows_cover_every_position() {
        let keys = deriver(MatchingRule::CaseIgnore).keys(IndexKind::Substring, &values(&["Smith"]));
        assert_eq!(strings(keys), ["h", "ith", "mit", "smi", "th"]);
    }

    #[test]
    fn test_presence_only_for_nonempty() {
        let d = deriver(MatchingRule::CaseIgnore);
        assert_eq!(d.keys(IndexKind::Presence, &values(&["x", "y"])).len(), 1);
        assert!(d.keys(IndexKind::Presence, &[]).is_empty());
    }

    #[test]
    fn test_integer_ordering_keys_sort_numerically() {
        let d = deriver(MatchingRule::Integer);
        let nine = d.ordering_key(b"9");
        let ten = d.ordering_key(b"10");
        let negative = d.ordering_key(b"-5");
        assert!(negative < nine && nine < ten);
    }

    #[test]
    fn test_approximate_skips_non_letters() {
        let d = deriver(MatchingRule::CaseIgnore);
        assert_eq!(d.approximate_key(b"Smith"), d.approximate_key(b"smyth"));
        assert!(d.approximate_key(b"1234").is_none());
    }

    #[test]
    fn test_long_values_are_truncated() {
        let d = deriver(MatchingRule::Octet);
        let long = vec![b'a'; MAX_INDEX_KEY_LEN * 2];
        let key = d.equality_key(&long);
        assert_eq!(key.len(), MAX_INDEX_KEY_LEN);
        assert!(KeyDeriver::is_truncated(&key));
    }

    #[test]
    fn test_diff_reports_only_changed_keys() {
        let d = deriver(MatchingRule::CaseIgnore);
        let diff = diff_keys(&d, IndexKind::Equality, &values(&["a", "b"]), &values(&["B", "c"]));
        assert_eq!(diff.added, vec![b"c".to_vec()]);
        assert_eq!(diff.removed, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_substring_windows_for_probe() {
        let d = deriver(MatchingRule::CaseIgnore);
        assert_eq!(d.substring_windows(b"smith").len(), 3);
        assert!(d.substring_windows(b"sm").is_empty());
    }
}
