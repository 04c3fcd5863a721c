//! Canonical identity of a policy: normalized `(domain, path)`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{PolicySpec, RemotePolicy};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn resolve(domain: &str, path: &str) -> Self {
        Self(format!("{}|{}", normalize_domain(domain), normalize_path(path)))
    }

    pub fn for_spec(spec: &PolicySpec) -> Self {
        Self::resolve(&spec.domain, &spec.path)
    }

    pub fn for_remote(remote: &RemotePolicy) -> Self {
        Self::resolve(&remote.domain, &remote.path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('/').to_ascii_lowercase()
}

pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return "/".to_string();
    }
    let with_root = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };
    match with_root.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => with_root,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_case_and_trailing_slash_are_ignored() {
        assert_eq!(
            IdentityKey::resolve("Example.com/", "/"),
            IdentityKey::resolve("example.com", "/")
        );
    }

    #[test]
    fn empty_path_is_root() {
        assert_eq!(
            IdentityKey::resolve("example.com", ""),
            IdentityKey::resolve("example.com", "/")
        );
        assert_eq!(IdentityKey::resolve("example.com", "").as_str(), "example.com|/");
    }

    #[test]
    fn single_trailing_path_slash_is_stripped() {
        assert_eq!(normalize_path("/admin/"), "/admin");
        assert_eq!(normalize_path("/admin"), "/admin");
        assert_eq!(normalize_path("admin"), "/admin");
    }

    #[test]
    fn path_case_is_preserved() {
        assert_ne!(
            IdentityKey::resolve("example.com", "/Admin"),
            IdentityKey::resolve("example.com", "/admin")
        );
    }

    #[test]
    fn different_paths_are_different_identities() {
        assert_ne!(
            IdentityKey::resolve("example.com", "/"),
            IdentityKey::resolve("example.com", "/admin")
        );
    }
}
