//! Sorted entry id sets stored under every index key.
//!
//! A set is either a sorted list of ids (`Defined`) or, once it grows past
//! the index's entry limit, the `Undefined` marker meaning "too many to
//! track; consider every entry a candidate". An undefined set only keeps an
//! approximate count and never returns to `Defined` except through a rebuild.

use std::cmp::Ordering;

use dirstore_types::{
    EntryId,
    codec::{CodecError, decode, encode},
};
use serde::{Deserialize, Serialize};

/// A set of entry ids, or the undefined marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryIdSet {
    /// Ids in strictly ascending order.
    Defined(Vec<EntryId>),
    /// Too many ids to track.
    Undefined {
        /// Approximate number of ids represented.
        count: u64,
    },
}

/// On-disk form. Defined sets store gaps between consecutive ids, which
/// postcard's varints keep small.
#[derive(Serialize, Deserialize)]
enum StoredIdSet {
    Defined { deltas: Vec<u64> },
    Undefined { count: u64 },
}

impl Default for EntryIdSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl EntryIdSet {
    /// The empty defined set.
    pub const fn empty() -> Self {
        Self::Defined(Vec::new())
    }

    /// An undefined set with no count information.
    pub const fn undefined() -> Self {
        Self::Undefined { count: 0 }
    }

    /// Builds a defined set from ids in any order, dropping duplicates.
    pub fn from_ids(mut ids: Vec<EntryId>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self::Defined(ids)
    }

    /// Whether this set lists its members.
    pub fn is_defined(&self) -> bool {
        matches!(self, Self::Defined(_))
    }

    /// Whether this is a defined set with no members.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Defined(ids) if ids.is_empty())
    }

    /// Number of members, or `None` when undefined.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Defined(ids) => Some(ids.len()),
            Self::Undefined { .. } => None,
        }
    }

    /// Exact or approximate member count, for cost estimates.
    pub fn estimated_len(&self) -> u64 {
        match self {
            Self::Defined(ids) => ids.len() as u64,
            Self::Undefined { count } => *count,
        }
    }

    /// The members of a defined set.
    pub fn ids(&self) -> Option<&[EntryId]> {
        match self {
            Self::Defined(ids) => Some(ids),
            Self::Undefined { .. } => None,
        }
    }

    /// Whether `id` may be a member. Undefined sets may contain anything.
    pub fn may_contain(&self, id: EntryId) -> bool {
        match self {
            Self::Defined(ids) => ids.binary_search(&id).is_ok(),
            Self::Undefined { .. } => true,
        }
    }

    /// Adds `id`. A defined set that grows past `limit` becomes undefined.
    ///
    /// Returns `true` if this call made the set undefined.
    pub fn add(&mut self, id: EntryId, limit: usize) -> bool {
        match self {
            Self::Defined(ids) => {
                if let Err(pos) = ids.binary_search(&id) {
                    ids.insert(pos, id);
                }
                if ids.len() > limit {
                    *self = Self::Undefined { count: ids.len() as u64 };
                    return true;
                }
                false
            },
            Self::Undefined { count } => {
                *count += 1;
                false
            },
        }
    }

    /// Adds many ids at once, with the same limit rule as [`EntryIdSet::add`].
    pub fn add_all(&mut self, new_ids: &[EntryId], limit: usize) -> bool {
        match self {
            Self::Defined(ids) => {
                let merged = merge_union(ids, new_ids);
                if merged.len() > limit {
                    *self = Self::Undefined { count: merged.len() as u64 };
                    return true;
                }
                *ids = merged;
                false
            },
            Self::Undefined { count } => {
                *count += new_ids.len() as u64;
                false
            },
        }
    }

    /// Removes `id`. Undefined sets only lower their count.
    pub fn remove(&mut self, id: EntryId) {
        match self {
            Self::Defined(ids) => {
                if let Ok(pos) = ids.binary_search(&id) {
                    ids.remove(pos);
                }
            },
            Self::Undefined { count } => *count = count.saturating_sub(1),
        }
    }

    /// Intersection. An undefined operand does not narrow the other.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Defined(a), Self::Defined(b)) => Self::Defined(merge_intersect(a, b)),
            (Self::Defined(_), Self::Undefined { .. }) => self.clone(),
            (Self::Undefined { .. }, Self::Defined(_)) => other.clone(),
            (Self::Undefined { count: a }, Self::Undefined { count: b }) => {
                Self::Undefined { count: (*a).min(*b) }
            },
        }
    }

    /// Union. An undefined operand makes the result undefined.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Defined(a), Self::Defined(b)) => Self::Defined(merge_union(a, b)),
            _ => Self::Undefined { count: self.estimated_len() + other.estimated_len() },
        }
    }

    /// Members of `self` not in `other`.
    ///
    /// Subtracting an undefined set cannot be computed, so `self` is kept.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Defined(a), Self::Defined(b)) => {
                Self::Defined(a.iter().copied().filter(|id| b.binary_search(id).is_err()).collect())
            },
            _ => self.clone(),
        }
    }

    /// The members of `universe` not in `self`.
    ///
    /// An undefined `self` cannot be complemented, so the result is undefined.
    #[must_use]
    pub fn negate_within(&self, universe: &Self) -> Self {
        match self {
            Self::Defined(_) => universe.difference(self),
            Self::Undefined { .. } => Self::Undefined { count: universe.estimated_len() },
        }
    }

    /// Serializes for storage.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let stored = match self {
            Self::Defined(ids) => {
                let mut previous = 0u64;
                let deltas = ids
                    .iter()
                    .map(|id| {
                        let delta = id.value() - previous;
                        previous = id.value();
                        delta
                    })
                    .collect();
                StoredIdSet::Defined { deltas }
            },
            Self::Undefined { count } => StoredIdSet::Undefined { count: *count },
        };
        encode(&stored)
    }

    /// Deserializes a stored set.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not a stored set.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(match decode::<StoredIdSet>(bytes)? {
            StoredIdSet::Defined { deltas } => {
                let mut current = 0u64;
                Self::Defined(
                    deltas
                        .into_iter()
                        .map(|delta| {
                            current = current.wrapping_add(delta);
                            EntryId::new(current)
                        })
                        .collect(),
                )
            },
            StoredIdSet::Undefined { count } => Self::Undefined { count },
        })
    }
}

fn merge_intersect(a: &[EntryId], b: &[EntryId]) -> Vec<EntryId> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            },
        }
    }
    out
}

fn merge_union(a: &[EntryId], b: &[EntryId]) -> Vec<EntryId> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len() + b.len());
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => {
                out.push(a[i]);
                i += 1;
            },
            Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            },
            Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            },
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn set(ids: &[u64]) -> EntryIdSet {
        EntryIdSet::from_ids(ids.iter().copied().map(EntryId::new).collect())
    }

    #[test]
    fn test_add_keeps_order_and_ignores_duplicates() {
        let mut s = set(&[5, 1]);
        assert!(!s.add(EntryId::new(3), 10));
        assert!(!s.add(EntryId::new(3), 10));
        assert_eq!(s, set(&[1, 3, 5]));
    }

    #[test]
    fn test_add_past_limit_becomes_undefined() {
        let mut s = set(&[1, 2, 3]);
        assert!(s.add(EntryId::new(4), 3));
        assert_eq!(s, EntryIdSet::Undefined { count: 4 });
        assert!(!s.add(EntryId::new(5), 3));
        s.remove(EntryId::new(1));
        assert_eq!(s.estimated_len(), 4);
        assert!(s.may_contain(EntryId::new(999)));
    }

    #[test]
    fn test_add_all_respects_limit() {
        let mut s = set(&[1]);
        assert!(!s.add_all(&[EntryId::new(2), EntryId::new(3)], 3));
        assert_eq!(s, set(&[1, 2, 3]));
        assert!(s.add_all(&[EntryId::new(4)], 3));
        assert!(!s.is_defined());
    }

    #[test]
    fn test_undefined_is_neutral_for_intersection() {
        let defined = set(&[2, 4]);
        let undefined = EntryIdSet::Undefined { count: 100 };
        assert_eq!(defined.intersect(&undefined), defined);
        assert_eq!(undefined.intersect(&defined), defined);
        assert!(!defined.union(&undefined).is_defined());
        assert_eq!(defined.difference(&undefined), defined);
    }

    #[test]
    fn test_set_algebra() {
        let a = set(&[1, 2, 3, 7]);
        let b = set(&[2, 3, 4]);
        assert_eq!(a.intersect(&b), set(&[2, 3]));
        assert_eq!(a.union(&b), set(&[1, 2, 3, 4, 7]));
        assert_eq!(a.difference(&b), set(&[1, 7]));
        assert_eq!(b.negate_within(&set(&[1, 2, 3, 4, 5])), set(&[1, 5]));
        assert!(!EntryIdSet::undefined().negate_within(&a).is_defined());
    }

    #[test]
    fn test_storage_roundtrip_preserves_undefined() {
        let undefined = EntryIdSet::Undefined { count: 42 };
        assert_eq!(EntryIdSet::from_bytes(&undefined.to_bytes().unwrap()).unwrap(), undefined);
        assert!(EntryIdSet::from_bytes(&[0xFF, 0xFF]).is_err());
    }

    proptest! {
        #[test]
        fn prop_stored_sets_decode_to_same_members(ids in proptest::collection::vec(0u64..1_000_000, 0..200)) {
            let s = set(&ids);
            let back = EntryIdSet::from_bytes(&s.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(back, s);
        }

        #[test]
        fn prop_algebra_matches_btreeset(
            a in proptest::collection::btree_set(0u64..200, 0..50),
            b in proptest::collection::btree_set(0u64..200, 0..50),
        ) {
            let sa = set(&a.iter().copied().collect::<Vec<_>>());
            let sb = set(&b.iter().copied().collect::<Vec<_>>());
            let inter: Vec<u64> = a.intersection(&b).copied().collect();
            let uni: Vec<u64> = a.union(&b).copied().collect();
            let diff: Vec<u64> = a.difference(&b).copied().collect();
            prop_assert_eq!(sa.intersect(&sb), set(&inter));
            prop_assert_eq!(sa.union(&sb), set(&uni));
            prop_assert_eq!(sa.difference(&sb), set(&diff));
        }
    }
}
