//! Package/module registry backing `INCLUDE PERFETTO MODULE` (§4.6.4).

use std::collections::{HashMap, HashSet};
use tracedb_core::status::{Result, TraceDbError};

/// A single SQL module: a name and the SQL text to run exactly once.
#[derive(Debug, Clone)]
pub struct Module {
    pub key: String,
    pub sql: String,
}

/// Registry of packages, each owning a flat map of module keys to SQL text.
/// A module key is owned by the package whose name is the longest
/// registered prefix of the key (`foo.bar.baz` belongs to package `foo.bar`
/// if both `foo` and `foo.bar` are registered).
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    packages: HashMap<String, HashMap<String, String>>,
    included: HashSet<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_package(&mut self, package_name: &str, modules: HashMap<String, String>) {
        self.packages.insert(package_name.to_string(), modules);
    }

    fn owning_package(&self, key: &str) -> Option<&str> {
        self.packages
            .keys()
            .filter(|pkg| key == pkg.as_str() || key.starts_with(&format!("{pkg}.")))
            .max_by_key(|pkg| pkg.len())
            .map(String::as_str)
    }

    pub fn is_included(&self, key: &str) -> bool {
        self.included.contains(key)
    }

    pub fn mark_included(&mut self, key: &str) {
        self.included.insert(key.to_string());
    }

    /// Resolves a single (non-wildcard) module key to its SQL text.
    pub fn resolve(&self, key: &str) -> Result<&str> {
        if key.starts_with("common") || key.starts_with("common.") {
            return Err(TraceDbError::UnknownModule {
                key: format!(
                    "{key} (the 'common' package has been removed; use its replacement packages)"
                ),
            });
        }
        let package = self.owning_package(key).ok_or_else(|| TraceDbError::UnknownModule {
            key: key.to_string(),
        })?;
        self.packages
            .get(package)
            .and_then(|mods| mods.get(key))
            .map(String::as_str)
            .ok_or_else(|| TraceDbError::UnknownModule { key: key.to_string() })
    }

    /// Expands a wildcard include key (`*` or `pkg.*`) into the list of
    /// not-yet-included module keys it covers, in a stable order. Already
    /// included modules are silently skipped, matching §4.6.4.
    pub fn expand_wildcard(&self, key: &str) -> Vec<String> {
        let mut keys: Vec<String> = if key == "*" {
            self.packages
                .values()
                .flat_map(|mods| mods.keys().cloned())
                .collect()
        } else if let Some(pkg) = key.strip_suffix(".*") {
            self.packages
                .get(pkg)
                .map(|mods| mods.keys().cloned().collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        keys.retain(|k| !self.is_included(k));
        keys.sort();
        keys
    }

    pub fn is_wildcard(key: &str) -> bool {
        key == "*" || key.ends_with(".*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_two_packages() -> ModuleRegistry {
        let mut reg = ModuleRegistry::new();
        let mut foo = HashMap::new();
        foo.insert("foo.a".to_string(), "SELECT 1 WHERE 0".to_string());
        reg.register_package("foo", foo);
        let mut bar = HashMap::new();
        bar.insert("bar.b".to_string(), "SELECT 1 WHERE 0".to_string());
        reg.register_package("bar", bar);
        reg
    }

    #[test]
    fn resolves_module_by_longest_owning_package() {
        let reg = registry_with_two_packages();
        assert!(reg.resolve("foo.a").is_ok());
    }

    #[test]
    fn wildcard_star_expands_all_packages() {
        let reg = registry_with_two_packages();
        let keys = reg.expand_wildcard("*");
        assert_eq!(keys, vec!["bar.b".to_string(), "foo.a".to_string()]);
    }

    #[test]
    fn already_included_modules_skipped_in_wildcard() {
        let mut reg = registry_with_two_packages();
        reg.mark_included("foo.a");
        let keys = reg.expand_wildcard("*");
        assert_eq!(keys, vec!["bar.b".to_string()]);
    }

    #[test]
    fn common_package_is_rejected() {
        let reg = registry_with_two_packages();
        let err = reg.resolve("common.thing").unwrap_err();
        assert!(matches!(err, TraceDbError::UnknownModule { .. }));
    }
}
