//! Proptest strategies for dirstore domain types.
//!
//! Generated entries draw from a small vocabulary so that generated filters
//! actually match some of them.
//!
//! # Usage
//!
//! ```no_run
//! use dirstore_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(entries in strategies::arb_people(20)) {
//!         // load entries, then check an invariant
//!     }
//! }
//! ```

use dirstore_types::{Entry, Filter, Rdn};
use proptest::prelude::*;

use crate::fixtures::people_dn;

/// Attributes appearing in generated entries and filters.
pub const ATTRIBUTES: &[&str] = &["cn", "sn", "mail", "description"];

/// Generates a short lowercase word.
pub fn arb_word() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "alice", "alpha", "bob", "beta", "carol", "delta", "dave", "eve", "gamma", "smith",
    ])
    .prop_map(str::to_string)
}

/// Generates an attribute value of one or two words, sometimes capitalised.
pub fn arb_value() -> impl Strategy<Value = String> {
    (arb_word(), proptest::option::of(arb_word()), any::<bool>()).prop_map(|(a, b, upper)| {
        let value = match b {
            Some(b) => format!("{a} {b}"),
            None => a,
        };
        if upper { value.to_uppercase() } else { value }
    })
}

/// Generates a person below `ou=people` with a unique `uid` taken from `index`.
pub fn arb_person(index: usize) -> impl Strategy<Value = Entry> {
    (
        arb_value(),
        arb_value(),
        proptest::option::of(arb_word()),
        proptest::collection::vec(arb_value(), 0..3),
    )
        .prop_map(move |(cn, sn, mail, descriptions)| {
            let uid = format!("p{index}");
            let mut entry = Entry::new(people_dn().child(Rdn::new("uid", uid.as_str())))
                .with("objectClass", &["top", "person"])
                .with("uid", &[uid.as_str()])
                .with("cn", &[cn.as_str()])
                .with("sn", &[sn.as_str()]);
            if let Some(mail) = mail {
                entry.add_value("mail", format!("{mail}@example.com").into_bytes());
            }
            for description in descriptions {
                entry.add_value("description", description.into_bytes());
            }
            entry
        })
}

/// Generates up to `max` people with distinct DNs.
pub fn arb_people(max: usize) -> impl Strategy<Value = Vec<Entry>> {
    (0..=max).prop_flat_map(|n| (0..n).map(arb_person).collect::<Vec<_>>())
}

/// Generates a leaf filter over [`ATTRIBUTES`].
pub fn arb_leaf_filter() -> impl Strategy<Value = Filter> {
    let attribute = prop::sample::select(ATTRIBUTES.to_vec()).prop_map(str::to_string);
    prop_oneof![
        (attribute.clone(), arb_value())
            .prop_map(|(attribute, value)| Filter::Equality { attribute, value: value.into_bytes() }),
        attribute.clone().prop_map(|attribute| Filter::Present { attribute }),
        (attribute.clone(), arb_word()).prop_map(|(attribute, word)| Filter::Substring {
            attribute,
            sub_initial: Some(word[..2].as_bytes().to_vec()),
            sub_any: Vec::new(),
            sub_final: None,
        }),
        (attribute.clone(), arb_word())
            .prop_map(|(attribute, value)| Filter::GreaterOrEqual { attribute, value: value.into_bytes() }),
        (attribute.clone(), arb_word())
            .prop_map(|(attribute, value)| Filter::LessOrEqual { attribute, value: value.into_bytes() }),
        (attribute, arb_word())
            .prop_map(|(attribute, value)| Filter::Approximate { attribute, value: value.into_bytes() }),
    ]
}

/// Generates a filter up to three levels deep.
pub fn arb_filter() -> impl Strategy<Value = Filter> {
    arb_leaf_filter().prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..3).prop_map(Filter::And),
            proptest::collection::vec(inner.clone(), 0..3).prop_map(Filter::Or),
            inner.prop_map(|f| Filter::Not(Box::new(f))),
        ]
    })
}
