//! Key encoding for the entry container trees.
//!
//! ## DN keys
//!
//! A DN key lists the normalized RDNs below the container base, most
//! significant first, separated by `0x00`. Inside one RDN the bytes `0x00` and
//! `0x01` are escaped as `0x01 0x01` and `0x01 0x02`, so the separator never
//! occurs within a component. The base entry itself has the empty key.
//!
//! With this layout every descendant of an entry with key `K` lies in the
//! half-open range `[K‖00, K‖01)`, and a parent's key always sorts before its
//! children's, so a forward scan of `dn2id` visits parents first.
//!
//! ## Id keys
//!
//! Entry ids are 8-byte big-endian, so byte order matches numeric order.

use std::ops::Bound;

use dirstore_substrate::KeyRange;
use dirstore_types::{Dn, EntryId};

/// Separator between RDN components.
pub const SEPARATOR: u8 = 0x00;

const ESCAPE: u8 = 0x01;

/// Keys in the `state` tree.
pub mod state {
    /// Highest entry id that may have been handed out.
    pub const ID_CEILING: &[u8] = b"id_ceiling";
    /// Number of entries in the container.
    pub const ENTRY_COUNT: &[u8] = b"entry_count";
    /// Prefix of attribute index descriptors.
    pub const INDEX_PREFIX: &str = "index:";
    /// Prefix of VLV index descriptors.
    pub const VLV_PREFIX: &str = "vlv:";
}

/// Encodes the key of `dn` relative to `base`.
///
/// Returns `None` when `dn` is not within `base`.
pub fn dn_key(base: &Dn, dn: &Dn) -> Option<Vec<u8>> {
    let below = dn.rdns_below(base)?;
    let mut key = Vec::with_capacity(dn.normalized().len());
    for (i, rdn) in below.iter().rev().enumerate() {
        if i > 0 {
            key.push(SEPARATOR);
        }
        escape_into(rdn.normalized().as_bytes(), &mut key);
    }
    Some(key)
}

fn escape_into(component: &[u8], out: &mut Vec<u8>) {
    for &b in component {
        match b {
            0x00 => out.extend_from_slice(&[ESCAPE, 0x01]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, 0x02]),
            other => out.push(other),
        }
    }
}

/// Range holding every strict descendant of the entry keyed `key`.
pub fn subtree_range(key: &[u8]) -> KeyRange {
    if key.is_empty() {
        // Every non-empty key lies below the base.
        return KeyRange { start: Bound::Excluded(Vec::new()), end: Bound::Unbounded };
    }
    let mut start = key.to_vec();
    start.push(SEPARATOR);
    let mut end = key.to_vec();
    end.push(SEPARATOR + 1);
    KeyRange::half_open(&start, &end)
}

/// Number of RDN components below the base.
#[cfg(test)]
pub fn key_depth(key: &[u8]) -> usize {
    if key.is_empty() {
        return 0;
    }
    1 + key.iter().filter(|&&b| b == SEPARATOR).count()
}

/// The key of the parent of the entry keyed `key`; `None` for the base.
pub fn parent_key(key: &[u8]) -> Option<&[u8]> {
    if key.is_empty() {
        return None;
    }
    match key.iter().rposition(|&b| b == SEPARATOR) {
        Some(split) => Some(&key[..split]),
        None => Some(&[]),
    }
}

/// Whether `key` names a direct child of the entry keyed `parent`.
pub fn is_child_key(parent: &[u8], key: &[u8]) -> bool {
    let rest = if parent.is_empty() {
        key
    } else {
        match key.strip_prefix(parent).and_then(|r| r.strip_prefix(&[SEPARATOR])) {
            Some(rest) => rest,
            None => return false,
        }
    };
    !rest.is_empty() && !rest.contains(&SEPARATOR)
}

/// The key of the direct child of `parent` that `key` lies within.
///
/// Returns `None` if `key` is not a strict descendant of `parent`.
pub fn child_component<'k>(parent: &[u8], key: &'k [u8]) -> Option<&'k [u8]> {
    if !subtree_range(parent).contains(key) {
        return None;
    }
    let offset = if parent.is_empty() { 0 } else { parent.len() + 1 };
    let end = key[offset..].iter().position(|&b| b == SEPARATOR).map_or(key.len(), |p| offset + p);
    Some(&key[..end])
}

/// Replaces the `old_prefix` of a descendant key with `new_prefix`.
pub fn rebase_key(key: &[u8], old_prefix: &[u8], new_prefix: &[u8]) -> Vec<u8> {
    let rest = &key[old_prefix.len()..];
    let mut out = Vec::with_capacity(new_prefix.len() + rest.len() + 1);
    out.extend_from_slice(new_prefix);
    if old_prefix.is_empty() && !new_prefix.is_empty() {
        out.push(SEPARATOR);
    }
    out.extend_from_slice(rest);
    out
}

/// Id key for the `id2entry`, `id2children` and `id2subtree` trees.
#[inline]
pub fn id_key(id: EntryId) -> [u8; 8] {
    id.to_key()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn base() -> Dn {
        dn("dc=example,dc=com")
    }

    #[test]
    fn test_base_has_empty_key() {
        assert_eq!(dn_key(&base(), &base()), Some(Vec::new()));
        assert_eq!(dn_key(&base(), &dn("dc=other,dc=com")), None);
    }

    #[test]
    fn test_key_lists_most_significant_first() {
        let key = dn_key(&base(), &dn("uid=Alice,ou=People,dc=example,dc=com")).unwrap();
        assert_eq!(key, b"ou=people\x00uid=alice".to_vec());
        assert_eq!(key_depth(&key), 2);
    }

    #[test]
    fn test_subtree_range_is_contiguous() {
        let people = dn_key(&base(), &dn("ou=people,dc=example,dc=com")).unwrap();
        let range = subtree_range(&people);
        let inside = [
            dn("uid=a,ou=people,dc=example,dc=com"),
            dn("cn=x,uid=a,ou=people,dc=example,dc=com"),
        ];
        for d in &inside {
            assert!(range.contains(&dn_key(&base(), d).unwrap()), "{d} should be inside");
        }
        let outside =
            [dn("ou=people,dc=example,dc=com"), dn("ou=peoplex,dc=example,dc=com"), base()];
        for d in &outside {
            assert!(!range.contains(&dn_key(&base(), d).unwrap()), "{d} should be outside");
        }
    }

    #[test]
    fn test_base_subtree_excludes_only_base() {
        let range = subtree_range(&[]);
        assert!(!range.contains(&[]));
        assert!(range.contains(b"ou=people"));
    }

    #[test]
    fn test_parent_key_walks_to_base() {
        let key = dn_key(&base(), &dn("uid=a,ou=people,dc=example,dc=com")).unwrap();
        assert_eq!(parent_key(&key), Some(&b"ou=people"[..]));
        assert_eq!(parent_key(b"ou=people"), Some(&b""[..]));
        assert_eq!(parent_key(b""), None);
        assert_eq!(key_depth(&key), 2);
    }

    #[test]
    fn test_parent_sorts_before_children() {
        let parent = dn_key(&base(), &dn("ou=a,dc=example,dc=com")).unwrap();
        let child = dn_key(&base(), &dn("uid=z,ou=a,dc=example,dc=com")).unwrap();
        let sibling = dn_key(&base(), &dn("ou=a0,dc=example,dc=com")).unwrap();
        assert!(parent < child);
        assert!(child < sibling);
    }

    #[test]
    fn test_separator_bytes_are_escaped() {
        let raw = Dn::from_rdns(vec![dirstore_types::Rdn::new("cn", "a\u{1}b")]);
        let key = dn_key(&Dn::root(), &raw).unwrap();
        assert!(!key.contains(&SEPARATOR));
        assert_eq!(key_depth(&key), 1);
    }

    #[test]
    fn test_child_helpers() {
        let parent = b"ou=people".to_vec();
        assert!(is_child_key(&parent, b"ou=people\x00uid=a"));
        assert!(!is_child_key(&parent, b"ou=people\x00uid=a\x00cn=x"));
        assert!(!is_child_key(&parent, b"ou=peoplex"));
        assert!(is_child_key(&[], b"ou=people"));
        assert_eq!(
            child_component(&parent, b"ou=people\x00uid=a\x00cn=x"),
            Some(&b"ou=people\x00uid=a"[..])
        );
        assert_eq!(child_component(&[], b"ou=people\x00uid=a"), Some(&b"ou=people"[..]));
        assert_eq!(child_component(&parent, b"ou=people"), None);
    }

    #[test]
    fn test_rebase_key() {
        assert_eq!(
            rebase_key(b"ou=a\x00uid=x", b"ou=a", b"ou=b\x00ou=c"),
            b"ou=b\x00ou=c\x00uid=x".to_vec()
        );
        assert_eq!(rebase_key(b"uid=x", b"", b"ou=b"), b"ou=b\x00uid=x".to_vec());
    }
}
