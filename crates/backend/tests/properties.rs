//! Property tests: indexed search agrees with evaluating the filter against
//! every stored entry, before and after writes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

mod common;

use common::{memory_backend, sorted_dns};
use dirstore_backend::{Backend, VerifyOptions};
use dirstore_test_utils::{fixtures, strategies};
use dirstore_types::{Entry, Filter, Modification, Scope, SearchRequest, SearchStatus};
use proptest::prelude::*;

fn populated(people: Vec<Entry>) -> Backend {
    let backend = memory_backend();
    let mut entries = vec![fixtures::base_entry(), fixtures::org_unit("people")];
    entries.extend(people);
    let report = backend.bulk_load(entries, None).unwrap();
    assert!(report.rejected.is_empty());
    backend
}

/// DNs matching `filter` by evaluating it against every stored entry.
fn brute_force(backend: &Backend, filter: &Filter) -> Vec<String> {
    let rules = backend.config().rule_set();
    let stored: Vec<Entry> = backend.bulk_export().unwrap().map(Result::unwrap).collect();
    let matched: Vec<Entry> = stored.into_iter().filter(|e| filter.matches(e, &rules)).collect();
    sorted_dns(&matched)
}

fn searched(backend: &Backend, filter: &Filter, scope: Scope) -> Vec<String> {
    let base = match scope {
        Scope::Subtree => fixtures::base_dn(),
        _ => fixtures::people_dn(),
    };
    let request = SearchRequest::builder().base(base).scope(scope).filter(filter.clone()).build();
    let mut results = backend.search(&request).unwrap();
    let entries: Vec<Entry> = results.by_ref().map(Result::unwrap).collect();
    assert_eq!(results.status(), Some(SearchStatus::Success));
    sorted_dns(&entries)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Whatever the planner picks, results equal a full evaluation.
    #[test]
    fn prop_search_matches_full_evaluation(
        people in strategies::arb_people(12),
        filters in proptest::collection::vec(strategies::arb_filter(), 1..6),
    ) {
        let backend = populated(people);
        for filter in &filters {
            let expected = brute_force(&backend, filter);
            prop_assert_eq!(searched(&backend, filter, Scope::Subtree), expected.clone(), "filter {}", filter);
            let request = SearchRequest::builder().base(fixtures::base_dn()).filter(filter.clone()).build();
            prop_assert_eq!(backend.count_matches(&request).unwrap(), expected.len() as u64);
        }
    }

    /// One-level searches below ou=people see exactly the people.
    #[test]
    fn prop_one_level_search_sees_only_children(
        people in strategies::arb_people(10),
        filter in strategies::arb_filter(),
    ) {
        let backend = populated(people);
        let people_key = fixtures::people_dn().normalized().to_string();
        let expected: Vec<String> = brute_force(&backend, &filter)
            .into_iter()
            .filter(|dn| dn != &people_key && dn.as_str() != fixtures::base_dn().normalized())
            .collect();
        prop_assert_eq!(searched(&backend, &filter, Scope::OneLevel), expected);
    }

    /// Indexes stay consistent and exact through modifies and deletes.
    #[test]
    fn prop_indexes_follow_writes(
        people in strategies::arb_people(10),
        replacement in strategies::arb_value(),
        filter in strategies::arb_filter(),
    ) {
        let backend = populated(people.clone());
        for (i, person) in people.iter().enumerate() {
            match i % 3 {
                0 => {
                    backend.delete(person.dn(), false, None).unwrap();
                },
                1 => {
                    let changes = vec![Modification::replace("cn", &[replacement.as_str()])];
                    backend.modify(person.dn(), changes, None).unwrap();
                },
                _ => {
                    let changes = vec![Modification::replace("description", &[])];
                    backend.modify(person.dn(), changes, None).unwrap();
                },
            }
        }
        let findings = backend.verify_index_consistency(VerifyOptions { clean: true }).unwrap();
        prop_assert!(findings.is_empty(), "{:?}", findings);
        prop_assert_eq!(searched(&backend, &filter, Scope::Subtree), brute_force(&backend, &filter));
    }
}
