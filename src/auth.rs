//! Auth policy (§4.1): decide whether a fingerprint may authenticate.

use std::collections::HashSet;

/// `allow(fingerprint)` is the only operation; there are no other variants
/// to anticipate (§9 design notes).
#[derive(Debug, Clone)]
pub enum AuthPolicy {
    AllowAll,
    AllowList(HashSet<String>),
}

impl AuthPolicy {
    /// Builds the policy from `PUBLIC_KEY_WHITELIST`: empty (or unset) means
    /// allow-all, otherwise a comma-separated set of fingerprints.
    pub fn from_whitelist(raw: &str) -> Self {
        let fingerprints: HashSet<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if fingerprints.is_empty() {
            AuthPolicy::AllowAll
        } else {
            AuthPolicy::AllowList(fingerprints)
        }
    }

    pub fn allow(&self, fingerprint: &str) -> bool {
        match self {
            AuthPolicy::AllowAll => true,
            AuthPolicy::AllowList(set) => set.contains(fingerprint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_whitelist_allows_all() {
        let policy = AuthPolicy::from_whitelist("");
        assert!(matches!(policy, AuthPolicy::AllowAll));
        assert!(policy.allow("anything"));
    }

    #[test]
    fn whitelist_allows_only_listed_fingerprints() {
        let policy = AuthPolicy::from_whitelist("aa:bb, cc:dd ,, ee:ff");
        assert!(policy.allow("aa:bb"));
        assert!(policy.allow("cc:dd"));
        assert!(policy.allow("ee:ff"));
        assert!(!policy.allow("gg:hh"));
    }

    #[test]
    fn whitespace_only_whitelist_allows_all() {
        let policy = AuthPolicy::from_whitelist("   ,  ,");
        assert!(matches!(policy, AuthPolicy::AllowAll));
    }
}
