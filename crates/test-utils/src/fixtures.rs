//! Canonical sample data.
//!
//! The sample tree lives under `dc=example,dc=com`:
//!
//! ```text
//! dc=example,dc=com
//! ├── ou=people
//! │   ├── uid=user0   (cn "User 0", sn "Surname0", mail user0@example.com, employeeNumber 0)
//! │   └── ...
//! └── ou=groups
//! ```

// Fixtures are built from constant inputs; a failure is a bug in the fixture.
#![allow(clippy::expect_used)]

use dirstore_types::{
    Dn, Entry, MatchingRule, Rdn,
    config::{BackendConfig, IndexConfig, IndexKind, SortKey, VlvIndexConfig},
};

/// `dc=example,dc=com`.
pub fn base_dn() -> Dn {
    Dn::from_rdns(vec![Rdn::new("dc", "example"), Rdn::new("dc", "com")])
}

/// `ou=people,dc=example,dc=com`.
pub fn people_dn() -> Dn {
    base_dn().child(Rdn::new("ou", "people"))
}

/// `ou=groups,dc=example,dc=com`.
pub fn groups_dn() -> Dn {
    base_dn().child(Rdn::new("ou", "groups"))
}

/// The suffix entry.
pub fn base_entry() -> Entry {
    Entry::new(base_dn()).with("objectClass", &["top", "domain"]).with("dc", &["example"])
}

/// An organizational unit directly below the suffix.
pub fn org_unit(name: &str) -> Entry {
    Entry::new(base_dn().child(Rdn::new("ou", name)))
        .with("objectClass", &["top", "organizationalUnit"])
        .with("ou", &[name])
}

/// A person below `ou=people`.
pub fn person(uid: &str, cn: &str, sn: &str, mail: &str) -> Entry {
    Entry::new(people_dn().child(Rdn::new("uid", uid)))
        .with("objectClass", &["top", "person", "inetOrgPerson"])
        .with("uid", &[uid])
        .with("cn", &[cn])
        .with("sn", &[sn])
        .with("mail", &[mail])
}

/// The `i`th generated person: `uid=user{i}`.
pub fn numbered_person(i: usize) -> Entry {
    person(
        &format!("user{i}"),
        &format!("User {i}"),
        &format!("Surname{i}"),
        &format!("user{i}@example.com"),
    )
    .with("employeeNumber", &[i.to_string().as_str()])
}

/// Suffix, `ou=people`, `ou=groups`, then `count` people, parents first.
pub fn people_directory(count: usize) -> Vec<Entry> {
    let mut entries = vec![base_entry(), org_unit("people"), org_unit("groups")];
    entries.extend((0..count).map(numbered_person));
    entries
}

/// Index definitions used across backend tests.
pub fn standard_indexes() -> Vec<IndexConfig> {
    let index = |attribute: &str, kinds: &[IndexKind]| {
        IndexConfig::builder()
            .attribute(attribute.to_string())
            .kinds(kinds.to_vec())
            .build()
            .expect("valid index")
    };
    vec![
        index("objectClass", &[IndexKind::Equality, IndexKind::Presence]),
        index("uid", &[IndexKind::Equality]),
        index("cn", &[IndexKind::Equality, IndexKind::Substring, IndexKind::Approximate]),
        index("sn", &[IndexKind::Equality, IndexKind::Ordering]),
        index("mail", &[IndexKind::Equality, IndexKind::Substring, IndexKind::Presence]),
        IndexConfig::builder()
            .attribute("employeeNumber".to_string())
            .kinds(vec![IndexKind::Equality, IndexKind::Ordering])
            .matching_rule(MatchingRule::Integer)
            .build()
            .expect("valid index"),
    ]
}

/// A browse index over `ou=people` sorted by `sn`.
pub fn people_by_surname() -> VlvIndexConfig {
    VlvIndexConfig::builder()
        .name("people-by-sn".to_string())
        .base_dn(people_dn())
        .filter("(objectClass=person)".to_string())
        .sort_keys(vec![SortKey::ascending("sn")])
        .build()
        .expect("valid vlv index")
}

/// A backend rooted at [`base_dn`] with [`standard_indexes`] and
/// [`people_by_surname`].
pub fn standard_config() -> BackendConfig {
    BackendConfig::builder()
        .base_dn(base_dn())
        .indexes(standard_indexes())
        .vlv_indexes(vec![people_by_surname()])
        .matching_rules([("employeenumber".to_string(), MatchingRule::Integer)].into())
        .build()
        .expect("valid backend config")
}
