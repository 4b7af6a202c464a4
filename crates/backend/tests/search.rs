//! Query evaluation: filters, scopes, limits, plans and VLV pages.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

mod common;

use std::time::Duration;

use common::{
    dn, filter, load, loaded_backend, matching, memory_backend_with, person_dn, request, run, sorted_dns,
};
use dirstore_backend::{
    BackendError, HAS_SUBORDINATES, NUM_SUBORDINATES, Resolution, Strategy, VerifyOptions, VlvRequest,
    VlvTarget,
};
use dirstore_test_utils::fixtures;
use dirstore_types::{
    Modification, Scope, SearchRequest, SearchStatus,
    config::{BackendConfig, IndexConfig, IndexKind, SearchConfig},
};

fn people(ids: &[usize]) -> Vec<String> {
    let mut dns: Vec<String> = ids.iter().map(|&i| person_dn(i)).collect();
    dns.sort();
    dns
}

#[test]
fn test_equality_ignores_case() {
    let backend = loaded_backend(5);
    assert_eq!(matching(&backend, "(uid=USER3)"), people(&[3]));
    assert_eq!(matching(&backend, "(sn=surname4)"), people(&[4]));
    assert!(matching(&backend, "(uid=nobody)").is_empty());
}

#[test]
fn test_presence_and_substring() {
    let backend = loaded_backend(12);
    assert_eq!(matching(&backend, "(mail=*)").len(), 12);
    assert_eq!(matching(&backend, "(cn=*ser 1*)"), people(&[1, 10, 11]));
    assert_eq!(matching(&backend, "(mail=user1*)"), people(&[1, 10, 11]));
    assert_eq!(matching(&backend, "(mail=*0@example.com)"), people(&[0, 10]));
}

#[test]
fn test_ordering_uses_the_matching_rule() {
    let backend = loaded_backend(12);
    // employeeNumber compares as an integer, sn as case-folded text.
    assert_eq!(matching(&backend, "(employeeNumber>=10)"), people(&[10, 11]));
    assert_eq!(matching(&backend, "(employeeNumber<=2)"), people(&[0, 1, 2]));
    assert_eq!(matching(&backend, "(sn<=SURNAME1)"), people(&[0, 1]));
}

#[test]
fn test_boolean_composition() {
    let backend = loaded_backend(6);
    assert_eq!(matching(&backend, "(|(uid=user1)(uid=user4))"), people(&[1, 4]));
    assert_eq!(matching(&backend, "(&(objectClass=person)(!(uid=user1)))"), people(&[0, 2, 3, 4, 5]));
    assert_eq!(matching(&backend, "(&(objectClass=person)(|(sn=surname2)(employeeNumber>=5)))"), people(&[2, 5]));

    // A lone NOT matches the suffix and both units too.
    assert_eq!(matching(&backend, "(!(objectClass=person))").len(), 3);
}

#[test]
fn test_approximate_match() {
    let backend = loaded_backend(3);
    backend.add(fixtures::person("jsmith", "John Smith", "Smith", "js@example.com"), None).unwrap();

    let found = matching(&backend, "(cn~=Jon Smith)");
    assert_eq!(found, vec![dn("uid=jsmith,ou=people,dc=example,dc=com").normalized().to_string()]);
}

#[test]
fn test_unindexed_attribute_is_scanned() {
    let backend = loaded_backend(4);
    let target = dn("uid=user2,ou=people,dc=example,dc=com");
    backend.modify(&target, vec![Modification::add("description", &["night shift"])], None).unwrap();

    assert_eq!(matching(&backend, "(description=Night Shift)"), people(&[2]));

    let plan = backend
        .explain(&request(&fixtures::base_dn(), Scope::Subtree, "(description=night shift)"))
        .unwrap();
    assert!(plan.is_unindexed());
    assert_eq!(plan.strategy, Strategy::ScopeScan);
    assert!(matches!(plan.nodes[0].resolution, Resolution::Undefined { .. }));
    assert!(plan.to_string().starts_with("ScopeScan over all entries in scope"));
}

#[test]
fn test_explain_reports_index_use() {
    let backend = loaded_backend(8);
    let plan = backend
        .explain(&request(&fixtures::base_dn(), Scope::Subtree, "(&(uid=user3)(objectClass=person))"))
        .unwrap();

    assert_eq!(plan.strategy, Strategy::CandidateFetch);
    assert_eq!(plan.candidates.len(), Some(1));
    let uid = plan.nodes.iter().find(|n| n.filter == "(uid=user3)").expect("uid node reported");
    match &uid.resolution {
        Resolution::Indexed { index, .. } => assert_eq!(index, "uid.equality"),
        other => panic!("uid resolved as {other:?}"),
    }
    assert_eq!(uid.candidates, Some(1));
    assert!(matches!(plan.nodes.last().unwrap().resolution, Resolution::Composite));
}

#[test]
fn test_entry_limit_degrades_to_a_scan_without_losing_entries() {
    let mut config = fixtures::standard_config();
    config.indexes.push(
        IndexConfig::builder()
            .attribute("departmentNumber".to_string())
            .kinds(vec![IndexKind::Equality])
            .entry_limit(3)
            .build()
            .unwrap(),
    );
    let backend = memory_backend_with(config);
    load(&backend, 12);
    for i in 0..10 {
        let target = dn(&format!("uid=user{i},ou=people,dc=example,dc=com"));
        backend.modify(&target, vec![Modification::add("departmentNumber", &["42"])], None).unwrap();
    }
    let target = dn("uid=user11,ou=people,dc=example,dc=com");
    backend.modify(&target, vec![Modification::add("departmentNumber", &["7"])], None).unwrap();

    let all: Vec<usize> = (0..10).collect();
    assert_eq!(matching(&backend, "(departmentNumber=42)"), people(&all));
    let plan = backend
        .explain(&request(&fixtures::base_dn(), Scope::Subtree, "(departmentNumber=42)"))
        .unwrap();
    assert_eq!(plan.strategy, Strategy::ScopeScan);
    assert!(plan.is_unindexed());
    match &plan.nodes[0].resolution {
        Resolution::Indexed { index, .. } => assert_eq!(index, "departmentnumber.equality"),
        other => panic!("departmentNumber resolved as {other:?}"),
    }
    assert_eq!(plan.nodes[0].candidates, None);

    // A key below the limit is still answered from the index.
    assert_eq!(matching(&backend, "(departmentNumber=7)"), people(&[11]));
    let plan = backend
        .explain(&request(&fixtures::base_dn(), Scope::Subtree, "(departmentNumber=7)"))
        .unwrap();
    assert_eq!(plan.strategy, Strategy::CandidateFetch);
    assert_eq!(plan.candidates.len(), Some(1));

    // Combined with a defined set, the undefined key only costs a post-filter.
    assert_eq!(matching(&backend, "(&(uid=user4)(departmentNumber=42))"), people(&[4]));
    assert!(backend.verify_index_consistency(VerifyOptions { clean: true }).unwrap().is_empty());
}

#[test]
fn test_scopes() {
    let backend = loaded_backend(3);
    let base = fixtures::base_dn();
    let people_dn = fixtures::people_dn();

    let (entries, _) = run(&backend, &request(&base, Scope::Base, "(objectClass=*)"));
    assert_eq!(sorted_dns(&entries), vec![base.normalized().to_string()]);

    let (entries, _) = run(&backend, &request(&base, Scope::OneLevel, "(objectClass=*)"));
    let mut expected =
        vec![people_dn.normalized().to_string(), fixtures::groups_dn().normalized().to_string()];
    expected.sort();
    assert_eq!(sorted_dns(&entries), expected);

    let (entries, _) = run(&backend, &request(&base, Scope::Subtree, "(objectClass=*)"));
    assert_eq!(entries.len(), 6);

    let (entries, _) = run(&backend, &request(&people_dn, Scope::OneLevel, "(uid=user1)"));
    assert_eq!(sorted_dns(&entries), people(&[1]));

    let (entries, _) = run(&backend, &request(&fixtures::groups_dn(), Scope::Subtree, "(uid=user1)"));
    assert!(entries.is_empty());

    let (entries, _) = run(&backend, &request(&base, Scope::Base, "(uid=user1)"));
    assert!(entries.is_empty());
}

#[test]
fn test_search_base_must_exist_inside_the_container() {
    let backend = loaded_backend(1);

    let err = backend.search(&request(&dn("ou=missing,dc=example,dc=com"), Scope::Subtree, "(uid=*)")).unwrap_err();
    assert!(matches!(err, BackendError::NoSuchEntry { .. }), "{err}");

    let err = backend.search(&request(&dn("dc=other,dc=org"), Scope::Subtree, "(uid=*)")).unwrap_err();
    assert!(matches!(err, BackendError::OutsideBase { .. }), "{err}");
}

#[test]
fn test_size_limit() {
    let backend = loaded_backend(12);
    let base = fixtures::base_dn();
    let limited = |limit: usize| SearchRequest {
        size_limit: Some(limit),
        ..request(&base, Scope::Subtree, "(objectClass=person)")
    };

    let (entries, status) = run(&backend, &limited(5));
    assert_eq!(entries.len(), 5);
    assert_eq!(status, SearchStatus::SizeLimitExceeded);

    let (entries, status) = run(&backend, &limited(12));
    assert_eq!(entries.len(), 12);
    assert_eq!(status, SearchStatus::Success);

    // Unindexed searches honour the limit the same way.
    let (entries, status) = run(&backend, &SearchRequest {
        size_limit: Some(2),
        ..request(&base, Scope::Subtree, "(employeeType=*)")
    });
    assert!(entries.is_empty());
    assert_eq!(status, SearchStatus::Success);

    assert_eq!(backend.count_matches(&limited(1)).unwrap(), 12);
}

#[test]
fn test_default_size_limit_from_config() {
    let config = BackendConfig {
        search: SearchConfig { default_size_limit: Some(3), ..SearchConfig::default() },
        ..fixtures::standard_config()
    };
    let backend = memory_backend_with(config);
    common::load(&backend, 10);

    let (entries, status) =
        run(&backend, &request(&fixtures::base_dn(), Scope::Subtree, "(objectClass=person)"));
    assert_eq!(entries.len(), 3);
    assert_eq!(status, SearchStatus::SizeLimitExceeded);

    let (entries, _) = run(&backend, &SearchRequest {
        size_limit: Some(7),
        ..request(&fixtures::base_dn(), Scope::Subtree, "(objectClass=person)")
    });
    assert_eq!(entries.len(), 7);
}

#[test]
fn test_zero_time_limit_stops_before_the_first_entry() {
    let backend = loaded_backend(4);
    let (entries, status) = run(&backend, &SearchRequest {
        time_limit: Some(Duration::ZERO),
        ..request(&fixtures::base_dn(), Scope::Subtree, "(objectClass=*)")
    });
    assert!(entries.is_empty());
    assert_eq!(status, SearchStatus::TimeLimitExceeded);
}

#[test]
fn test_operational_attributes_on_request() {
    let backend = loaded_backend(4);
    let people_dn = fixtures::people_dn();

    let (entries, _) = run(&backend, &SearchRequest {
        include_operational: true,
        ..request(&people_dn, Scope::Base, "(objectClass=*)")
    });
    assert_eq!(entries[0].first_str(NUM_SUBORDINATES), Some("4"));
    assert_eq!(entries[0].first_str(HAS_SUBORDINATES), Some("TRUE"));

    let (entries, _) = run(&backend, &request(&people_dn, Scope::Base, "(objectClass=*)"));
    assert!(!entries[0].has(NUM_SUBORDINATES));

    let (entries, _) = run(&backend, &SearchRequest {
        include_operational: true,
        ..request(&people_dn, Scope::OneLevel, "(uid=user0)")
    });
    assert_eq!(entries[0].first_str(HAS_SUBORDINATES), Some("FALSE"));
}

#[test]
fn test_search_reads_one_snapshot() {
    let backend = loaded_backend(3);
    let mut results =
        backend.search(&request(&fixtures::base_dn(), Scope::Subtree, "(objectClass=person)")).unwrap();
    let first = results.next().unwrap().unwrap();
    assert!(first.has("uid"));

    backend.delete(&dn("uid=user2,ou=people,dc=example,dc=com"), false, None).unwrap();
    backend.add(fixtures::numbered_person(9), None).unwrap();

    let rest: Vec<_> = results.by_ref().map(Result::unwrap).collect();
    assert_eq!(rest.len() + 1, 3);
    assert_eq!(results.returned(), 3);
    assert!(rest.iter().all(|e| e.first_str("uid") != Some("user9")));
}

#[test]
fn test_filter_parse_roundtrip_through_search() {
    let backend = loaded_backend(2);
    let f = filter("(&(objectClass=person)(mail=user0@example.com))");
    let found = backend.count_matches(&SearchRequest::builder().base(fixtures::base_dn()).filter(f).build()).unwrap();
    assert_eq!(found, 1);
}

// ============================================================================
// VLV
// ============================================================================

fn page(target: VlvTarget, before_count: usize, after_count: usize) -> VlvRequest {
    VlvRequest { index: "people-by-sn".to_string(), target, before_count, after_count }
}

fn surnames(entries: &[dirstore_types::Entry]) -> Vec<&str> {
    entries.iter().filter_map(|e| e.first_str("sn")).collect()
}

#[test]
fn test_vlv_offset_pages() {
    let backend = loaded_backend(5);

    let response = backend.vlv_search(&page(VlvTarget::Offset(1), 0, 2)).unwrap();
    assert_eq!(response.content_count, 5);
    assert_eq!(response.target_position, 1);
    assert_eq!(surnames(&response.entries), vec!["Surname0", "Surname1", "Surname2"]);

    let response = backend.vlv_search(&page(VlvTarget::Offset(4), 1, 5)).unwrap();
    assert_eq!(response.target_position, 4);
    assert_eq!(surnames(&response.entries), vec!["Surname2", "Surname3", "Surname4"]);

    let response = backend.vlv_search(&page(VlvTarget::Offset(99), 0, 0)).unwrap();
    assert_eq!(response.target_position, 5);
    assert_eq!(surnames(&response.entries), vec!["Surname4"]);
}

#[test]
fn test_vlv_greater_or_equal_target() {
    let backend = loaded_backend(5);

    let response = backend.vlv_search(&page(VlvTarget::GreaterOrEqual(b"SURNAME3".to_vec()), 1, 0)).unwrap();
    assert_eq!(response.target_position, 4);
    assert_eq!(surnames(&response.entries), vec!["Surname2", "Surname3"]);

    let response = backend.vlv_search(&page(VlvTarget::GreaterOrEqual(b"zzz".to_vec()), 0, 3)).unwrap();
    assert_eq!(response.target_position, 6);
    assert!(response.entries.is_empty());
}

#[test]
fn test_vlv_windows_match_the_full_listing() {
    let backend = loaded_backend(600);
    let full = backend.vlv_search(&page(VlvTarget::Offset(1), 0, 1_000)).unwrap();
    assert_eq!(full.content_count, 600);
    let all = surnames(&full.entries);
    assert_eq!(all.len(), 600);

    let response = backend.vlv_search(&page(VlvTarget::Offset(300), 3, 4)).unwrap();
    assert_eq!(response.target_position, 300);
    assert_eq!(surnames(&response.entries), all[296..304].to_vec());

    let response = backend.vlv_search(&page(VlvTarget::Offset(2), 5, 1)).unwrap();
    assert_eq!(surnames(&response.entries), all[0..3].to_vec());

    // The window before the target spans more than one cursor batch.
    let target = all[450].as_bytes().to_vec();
    let response = backend.vlv_search(&page(VlvTarget::GreaterOrEqual(target), 260, 1)).unwrap();
    assert_eq!(response.content_count, 600);
    assert_eq!(response.target_position, 451);
    assert_eq!(surnames(&response.entries), all[190..452].to_vec());
}

#[test]
fn test_vlv_follows_writes() {
    let backend = loaded_backend(3);
    let target = dn("uid=user0,ou=people,dc=example,dc=com");
    backend.modify(&target, vec![Modification::replace("sn", &["Zulu"])], None).unwrap();
    backend.delete(&dn("uid=user1,ou=people,dc=example,dc=com"), false, None).unwrap();

    let response = backend.vlv_search(&page(VlvTarget::Offset(1), 0, 10)).unwrap();
    assert_eq!(response.content_count, 2);
    assert_eq!(surnames(&response.entries), vec!["Surname2", "Zulu"]);
}

#[test]
fn test_vlv_empty_and_unknown() {
    let backend = loaded_backend(0);
    let response = backend.vlv_search(&page(VlvTarget::Offset(1), 0, 10)).unwrap();
    assert_eq!(response.content_count, 0);
    assert_eq!(response.target_position, 0);
    assert!(response.entries.is_empty());

    let err = backend
        .vlv_search(&VlvRequest { index: "nope".to_string(), ..page(VlvTarget::Offset(1), 0, 0) })
        .unwrap_err();
    assert!(matches!(err, BackendError::UnknownIndex { .. }), "{err}");
}
