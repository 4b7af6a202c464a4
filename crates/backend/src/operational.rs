//! Operational and virtual attributes.
//!
//! `entryUUID`, `createTimestamp` and `modifyTimestamp` are stored with the
//! entry and maintained by the write pipeline. `numSubordinates` and
//! `hasSubordinates` are never stored; they are computed from the
//! `id2children` counter when an entry is read with operational attributes.

use chrono::{DateTime, Utc};
use dirstore_types::Entry;

/// Entry UUID, assigned on add.
pub const ENTRY_UUID: &str = "entryUUID";
/// Generalized time of the add.
pub const CREATE_TIMESTAMP: &str = "createTimestamp";
/// Generalized time of the last change.
pub const MODIFY_TIMESTAMP: &str = "modifyTimestamp";
/// Number of direct children (virtual).
pub const NUM_SUBORDINATES: &str = "numSubordinates";
/// Whether the entry has children (virtual).
pub const HAS_SUBORDINATES: &str = "hasSubordinates";

const VIRTUAL: [&str; 2] = [NUM_SUBORDINATES, HAS_SUBORDINATES];

/// Whether clients may not change `attribute` through modify.
pub fn is_read_only(attribute: &str) -> bool {
    [ENTRY_UUID, CREATE_TIMESTAMP, MODIFY_TIMESTAMP]
        .iter()
        .chain(VIRTUAL.iter())
        .any(|a| a.eq_ignore_ascii_case(attribute))
}

/// Generalized time, UTC, second precision.
pub fn generalized_time(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%SZ").to_string()
}

/// Removes virtual attributes a caller may have supplied.
pub fn strip_virtual(entry: &mut Entry) {
    for name in VIRTUAL {
        entry.remove_attribute(name);
    }
}

/// Fills in the operational attributes of a new entry, keeping any the
/// caller supplied (imports carry them over).
pub fn stamp_new(entry: &mut Entry, now: DateTime<Utc>) {
    strip_virtual(entry);
    if !entry.has(ENTRY_UUID) {
        entry.replace(ENTRY_UUID, vec![uuid::Uuid::new_v4().to_string().into_bytes()]);
    }
    let stamp = generalized_time(now).into_bytes();
    if !entry.has(CREATE_TIMESTAMP) {
        entry.replace(CREATE_TIMESTAMP, vec![stamp.clone()]);
    }
    if !entry.has(MODIFY_TIMESTAMP) {
        entry.replace(MODIFY_TIMESTAMP, vec![stamp]);
    }
}

/// Records a change to an existing entry.
pub fn stamp_modified(entry: &mut Entry, now: DateTime<Utc>) {
    entry.replace(MODIFY_TIMESTAMP, vec![generalized_time(now).into_bytes()]);
}

/// Adds the virtual attributes for an entry with `children` direct children.
pub fn with_virtual(mut entry: Entry, children: u64) -> Entry {
    entry.replace(NUM_SUBORDINATES, vec![children.to_string().into_bytes()]);
    let has = if children > 0 { "TRUE" } else { "FALSE" };
    entry.replace(HAS_SUBORDINATES, vec![has.as_bytes().to_vec()]);
    entry
}
