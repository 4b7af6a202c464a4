//! The same backend behaviour on every substrate engine, persistence across
//! reopen, backup and restore, and sealed entry encodings.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

mod common;

use std::{path::PathBuf, sync::Arc};

use common::{dn, load, matching, person_dn};
use dirstore_backend::{Backend, BackendError, VerifyOptions, restore_substrate};
use dirstore_substrate::{EngineKind, MemorySubstrate, SubstrateConfig};
use dirstore_test_utils::{TestDir, fixtures};
use dirstore_types::{
    ErrorCode, Modification,
    config::{BackendConfig, EntryEncodingConfig},
};

fn substrate_config(engine: EngineKind, path: Option<PathBuf>) -> SubstrateConfig {
    SubstrateConfig::builder().engine(engine).maybe_path(path).build().unwrap()
}

/// Adds, modifies, searches and deletes through `backend`.
fn exercise(backend: &Backend) {
    load(backend, 10);
    assert_eq!(backend.entry_count().unwrap(), 13);
    assert_eq!(matching(backend, "(uid=user7)"), vec![person_dn(7)]);
    assert_eq!(matching(backend, "(employeeNumber>=8)").len(), 2);

    let target = dn("uid=user7,ou=people,dc=example,dc=com");
    backend.modify(&target, vec![Modification::replace("mail", &["seven@example.com"])], None).unwrap();
    assert_eq!(matching(backend, "(mail=seven@*)"), vec![person_dn(7)]);

    let removed = backend.delete(&fixtures::people_dn(), true, None).unwrap();
    assert_eq!(removed, 11);
    assert_eq!(backend.entry_count().unwrap(), 2);
    assert!(backend.verify_index_consistency(VerifyOptions { clean: true }).unwrap().is_empty());
}

#[test]
fn test_memory_engine() {
    let backend =
        Backend::open_with(fixtures::standard_config(), &substrate_config(EngineKind::Memory, None)).unwrap();
    exercise(&backend);
}

#[test]
fn test_embedded_engine() {
    let dir = TestDir::new();
    let config = substrate_config(EngineKind::Embedded, Some(dir.join("store.redb")));
    let backend = Backend::open_with(fixtures::standard_config(), &config).unwrap();
    exercise(&backend);
}

#[test]
fn test_relational_engine() {
    let dir = TestDir::new();
    let config = substrate_config(EngineKind::Relational, Some(dir.join("store.sqlite")));
    let backend = Backend::open_with(fixtures::standard_config(), &config).unwrap();
    exercise(&backend);
}

#[test]
fn test_embedded_engine_persists_across_reopen() {
    let dir = TestDir::new();
    let config = substrate_config(EngineKind::Embedded, Some(dir.join("store.redb")));
    {
        let backend = Backend::open_with(fixtures::standard_config(), &config).unwrap();
        load(&backend, 6);
    }

    let backend = Backend::open_with(fixtures::standard_config(), &config).unwrap();
    assert!(backend.untrusted_indexes().is_empty());
    assert_eq!(backend.entry_count().unwrap(), 9);
    assert_eq!(matching(&backend, "(sn=surname5)"), vec![person_dn(5)]);

    // Ids keep growing after reopen.
    let id = backend.add(fixtures::numbered_person(6), None).unwrap();
    assert!(id.value() > 9);
}

#[test]
fn test_relational_engine_persists_across_reopen() {
    let dir = TestDir::new();
    let config = substrate_config(EngineKind::Relational, Some(dir.join("store.sqlite")));
    {
        let backend = Backend::open_with(fixtures::standard_config(), &config).unwrap();
        load(&backend, 4);
        backend.delete(&dn("uid=user0,ou=people,dc=example,dc=com"), false, None).unwrap();
    }

    let backend = Backend::open_with(fixtures::standard_config(), &config).unwrap();
    assert_eq!(backend.entry_count().unwrap(), 6);
    assert_eq!(backend.children(&fixtures::people_dn()).unwrap().len(), 3);
    assert!(matching(&backend, "(uid=user0)").is_empty());
}

#[test]
fn test_relational_engine_requires_a_path() {
    let err = SubstrateConfig::builder().engine(EngineKind::Relational).build().unwrap_err();
    assert!(err.to_string().contains("path"));
}

#[test]
fn test_backup_and_restore_into_another_engine() {
    let dir = TestDir::new();
    let source = Backend::open_with(
        fixtures::standard_config(),
        &substrate_config(EngineKind::Embedded, Some(dir.join("source.redb"))),
    )
    .unwrap();
    load(&source, 8);
    let backup = dir.join("backup.dump");
    source.backup(&backup).unwrap();

    let target_config = substrate_config(EngineKind::Relational, Some(dir.join("target.sqlite")));
    let substrate = restore_substrate(&target_config, &backup).unwrap();
    let restored = Backend::open(fixtures::standard_config(), substrate).unwrap();

    assert!(restored.untrusted_indexes().is_empty());
    assert_eq!(restored.entry_count().unwrap(), 11);
    assert_eq!(matching(&restored, "(cn=user 3)"), vec![person_dn(3)]);
    let original = source.get_entry(&fixtures::people_dn(), true).unwrap().unwrap();
    let copy = restored.get_entry(&fixtures::people_dn(), true).unwrap().unwrap();
    assert_eq!(original, copy);
    assert!(restored.verify_index_consistency(VerifyOptions { clean: true }).unwrap().is_empty());

    // New ids do not collide with restored ones.
    restored.add(fixtures::numbered_person(8), None).unwrap();
    assert_eq!(matching(&restored, "(objectClass=person)").len(), 9);
}

#[test]
fn test_restore_refuses_a_substrate_holding_data() {
    let dir = TestDir::new();
    let source = common::loaded_backend(2);
    let backup = dir.join("backup.dump");
    source.backup(&backup).unwrap();

    let config = substrate_config(EngineKind::Embedded, Some(dir.join("busy.redb")));
    {
        let busy = Backend::open_with(fixtures::standard_config(), &config).unwrap();
        busy.add(fixtures::base_entry(), None).unwrap();
    }
    let Err(err) = restore_substrate(&config, &backup) else {
        panic!("restore into a populated substrate succeeded");
    };
    assert!(matches!(err, BackendError::InvalidRequest { .. }), "{err}");
}

fn sealed(key: &str) -> BackendConfig {
    BackendConfig {
        encoding: EntryEncodingConfig::builder()
            .compress(true)
            .encryption_key(key.to_string())
            .build()
            .unwrap(),
        ..fixtures::standard_config()
    }
}

#[test]
fn test_sealed_entries_round_trip() {
    let key = "11".repeat(32);
    let substrate = Arc::new(MemorySubstrate::new());
    let backend = Backend::open(sealed(&key), substrate.clone()).unwrap();
    load(&backend, 5);

    let entry = backend.get_entry(&dn("uid=user4,ou=people,dc=example,dc=com"), false).unwrap().unwrap();
    assert_eq!(entry.first_str("mail"), Some("user4@example.com"));
    assert_eq!(matching(&backend, "(cn=*ser 4)"), vec![person_dn(4)]);
    drop(backend);

    let wrong = Backend::open(sealed(&"22".repeat(32)), substrate.clone()).unwrap();
    let err = wrong.get_entry(&fixtures::people_dn(), false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Encryption);
    drop(wrong);

    let plain = Backend::open(fixtures::standard_config(), substrate).unwrap();
    let err = plain.get_entry(&fixtures::people_dn(), false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Encryption);
}

#[test]
fn test_invalid_backend_config_is_rejected() {
    let mut config = fixtures::standard_config();
    config.indexes.push(config.indexes[0].clone());
    let err = Backend::open(config, Arc::new(MemorySubstrate::new())).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Config);
}
