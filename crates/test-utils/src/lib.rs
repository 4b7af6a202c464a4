//! Shared test utilities for dirstore crates.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`TestDir`] - Managed temporary directory with path helpers
//! - [`fixtures`] - Canonical sample directory trees and configurations
//! - [`strategies`] - Proptest generators for DNs, entries and filters

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod test_dir;
pub use test_dir::TestDir;

pub mod fixtures;
pub mod strategies;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // ============================================
    // TestDir tests
    // ============================================

    #[test]
    fn test_dir_creates_temp_directory() {
        let dir = TestDir::new();
        assert!(dir.path().exists(), "temp directory should exist");
        assert!(dir.path().is_dir(), "should be a directory");
    }

    #[test]
    fn test_dir_join_creates_subdirectory_path() {
        let dir = TestDir::new();
        let subpath = dir.join("subdir/store.redb");
        assert!(subpath.starts_with(dir.path()));
        assert!(subpath.ends_with("subdir/store.redb"));
    }

    #[test]
    fn test_dir_cleanup_on_drop() {
        let path = {
            let dir = TestDir::new();
            let p = dir.path().to_path_buf();
            std::fs::write(p.join("file.txt"), "data").expect("write file");
            assert!(p.exists());
            p
        };
        assert!(!path.exists(), "temp directory should be cleaned up on drop");
    }

    // ============================================
    // Fixture tests
    // ============================================

    #[test]
    fn test_people_directory_is_parent_first() {
        let entries = fixtures::people_directory(5);
        assert_eq!(entries.len(), 8);
        for (i, entry) in entries.iter().enumerate() {
            if let Some(parent) = entry.dn().parent() {
                if entry.dn() != &fixtures::base_dn() {
                    assert!(
                        entries[..i].iter().any(|e| e.dn() == &parent),
                        "{} appears before its parent",
                        entry.dn()
                    );
                }
            }
        }
    }

    #[test]
    fn test_standard_config_is_valid() {
        let config = fixtures::standard_config();
        assert!(config.validate().is_ok());
        assert!(config.index_for("mail").is_some());
    }
}
