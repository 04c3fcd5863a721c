//! Versioned table of the capabilities a tenant credential is checked for.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub name: String,
    /// Provider permission groups, any of which grants the capability.
    pub grants: Vec<String>,
    pub required: bool,
    pub description: String,
}

impl Capability {
    fn new(name: &str, grants: &[&str], required: bool, description: &str) -> Self {
        Self {
            name: name.to_string(),
            grants: grants.iter().map(|g| g.to_string()).collect(),
            required,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityMatrix {
    pub version: u32,
    pub capabilities: Vec<Capability>,
}

impl CapabilityMatrix {
    pub const CURRENT_VERSION: u32 = 2;

    pub fn new(version: u32, capabilities: Vec<Capability>) -> Self {
        Self {
            version,
            capabilities,
        }
    }

    /// Capabilities needed to manage Zero Trust access policies.
    pub fn current() -> Self {
        Self::new(
            Self::CURRENT_VERSION,
            vec![
                Capability::new(
                    "access_apps_write",
                    &["Access: Apps and Policies Write"],
                    true,
                    "Create and update access applications and their policies",
                ),
                Capability::new(
                    "access_apps_read",
                    &["Access: Apps and Policies Read", "Access: Apps and Policies Write"],
                    true,
                    "List existing access applications",
                ),
                Capability::new(
                    "account_settings_read",
                    &["Account Settings Read", "Account Settings Write"],
                    true,
                    "Discover accounts the credential can act on",
                ),
                Capability::new(
                    "zone_read",
                    &["Zone Read", "Zone Write"],
                    false,
                    "Resolve zones for domain-scoped applications",
                ),
                Capability::new(
                    "access_audit_logs_read",
                    &["Access: Audit Logs Read"],
                    false,
                    "Show access audit history",
                ),
            ],
        )
    }

    pub fn required(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter().filter(|c| c.required)
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }
}

impl Default for CapabilityMatrix {
    fn default() -> Self {
        Self::current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_matrix_has_required_write_capability() {
        let matrix = CapabilityMatrix::current();
        let write = matrix.get("access_apps_write").unwrap();
        assert!(write.required);
        assert_eq!(matrix.required().count(), 3);
    }

    #[test]
    fn capability_names_are_unique() {
        let matrix = CapabilityMatrix::current();
        let mut names: Vec<_> = matrix.capabilities.iter().map(|c| &c.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), matrix.capabilities.len());
    }
}
