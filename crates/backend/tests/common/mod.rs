//! Shared helpers for backend integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::sync::Arc;

use dirstore_backend::Backend;
use dirstore_substrate::MemorySubstrate;
use dirstore_test_utils::fixtures;
use dirstore_types::{Dn, Entry, Filter, Scope, SearchRequest, SearchStatus, config::BackendConfig};

/// Parses a DN literal.
pub fn dn(s: &str) -> Dn {
    Dn::parse(s).expect("valid DN")
}

/// Parses a filter literal.
pub fn filter(s: &str) -> Filter {
    Filter::parse(s).expect("valid filter")
}

/// An empty backend with the standard configuration on a fresh memory engine.
pub fn memory_backend() -> Backend {
    memory_backend_with(fixtures::standard_config())
}

/// An empty backend with `config` on a fresh memory engine.
pub fn memory_backend_with(config: BackendConfig) -> Backend {
    Backend::open(config, Arc::new(MemorySubstrate::new())).expect("open backend")
}

/// A memory backend holding [`fixtures::people_directory`] of `people`.
pub fn loaded_backend(people: usize) -> Backend {
    let backend = memory_backend();
    load(&backend, people);
    backend
}

/// Bulk loads the sample directory with `people` people into `backend`.
pub fn load(backend: &Backend, people: usize) {
    let report = backend.bulk_load(fixtures::people_directory(people), None).expect("bulk load");
    assert!(report.rejected.is_empty(), "unexpected rejections: {:?}", report.rejected);
}

/// A search request.
pub fn request(base: &Dn, scope: Scope, f: &str) -> SearchRequest {
    SearchRequest::builder().base(base.clone()).scope(scope).filter(filter(f)).build()
}

/// Runs `request` to completion.
pub fn run(backend: &Backend, request: &SearchRequest) -> (Vec<Entry>, SearchStatus) {
    let mut results = backend.search(request).expect("start search");
    let entries: Vec<Entry> = results.by_ref().collect::<Result<_, _>>().expect("search");
    (entries, results.status().expect("search finished"))
}

/// Sorted normalized DNs of every entry below the base matching `f`.
pub fn matching(backend: &Backend, f: &str) -> Vec<String> {
    let (entries, status) = run(backend, &request(&fixtures::base_dn(), Scope::Subtree, f));
    assert_eq!(status, SearchStatus::Success);
    sorted_dns(&entries)
}

/// Sorted normalized DNs of `entries`.
pub fn sorted_dns(entries: &[Entry]) -> Vec<String> {
    let mut dns: Vec<String> = entries.iter().map(|e| e.dn().normalized().to_string()).collect();
    dns.sort();
    dns
}

/// Normalized DN of the `i`th sample person.
pub fn person_dn(i: usize) -> String {
    fixtures::numbered_person(i).dn().normalized().to_string()
}
