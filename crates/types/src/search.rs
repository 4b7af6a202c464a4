//! Search request and completion types.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{dn::Dn, filter::Filter};

/// Which entries relative to the base a search considers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// Only the base entry.
    Base,
    /// Direct children of the base, not the base itself.
    OneLevel,
    /// The base and everything below it.
    #[default]
    Subtree,
}

impl Scope {
    /// Whether an entry at `dn` is in scope of `base`.
    pub fn contains(self, base: &Dn, dn: &Dn) -> bool {
        match self {
            Self::Base => dn == base,
            Self::OneLevel => dn.depth() == base.depth() + 1 && dn.is_descendant_of(base),
            Self::Subtree => dn.is_within(base),
        }
    }
}

/// How a finished search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchStatus {
    /// Every matching entry was returned.
    Success,
    /// More entries matched than the size limit allowed.
    SizeLimitExceeded,
    /// The time limit elapsed before the search finished.
    TimeLimitExceeded,
}

/// A search request.
///
/// # Example
///
/// ```
/// # use dirstore_types::{Dn, Filter, Scope, SearchRequest};
/// let request = SearchRequest::builder()
///     .base(Dn::parse("ou=people,dc=example,dc=com").expect("dn"))
///     .scope(Scope::OneLevel)
///     .filter(Filter::parse("(mail=alice@example.com)").expect("filter"))
///     .size_limit(10)
///     .build();
/// assert_eq!(request.size_limit, Some(10));
/// ```
#[derive(Debug, Clone, bon::Builder)]
pub struct SearchRequest {
    /// Search base.
    pub base: Dn,
    /// Search scope.
    #[builder(default)]
    pub scope: Scope,
    /// Filter every returned entry matches.
    #[builder(default = Filter::present("objectClass"))]
    pub filter: Filter,
    /// Maximum number of entries to return.
    pub size_limit: Option<usize>,
    /// Maximum wall-clock time to spend.
    pub time_limit: Option<Duration>,
    /// Add computed attributes (`numSubordinates`, `hasSubordinates`) to results.
    #[builder(default)]
    pub include_operational: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_contains() {
        let base = Dn::parse("ou=people,dc=x").unwrap();
        let child = Dn::parse("uid=a,ou=people,dc=x").unwrap();
        let grandchild = Dn::parse("cn=c,uid=a,ou=people,dc=x").unwrap();

        assert!(Scope::Base.contains(&base, &base));
        assert!(!Scope::Base.contains(&base, &child));

        assert!(!Scope::OneLevel.contains(&base, &base));
        assert!(Scope::OneLevel.contains(&base, &child));
        assert!(!Scope::OneLevel.contains(&base, &grandchild));

        assert!(Scope::Subtree.contains(&base, &base));
        assert!(Scope::Subtree.contains(&base, &grandchild));
        assert!(!Scope::Subtree.contains(&child, &base));
    }

    #[test]
    fn test_request_defaults() {
        let request = SearchRequest::builder().base(Dn::root()).build();
        assert_eq!(request.scope, Scope::Subtree);
        assert_eq!(request.filter, Filter::present("objectClass"));
        assert!(request.size_limit.is_none());
        assert!(!request.include_operational);
    }
}
