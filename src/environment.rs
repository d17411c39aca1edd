//! Environment Registry: the read-only catalog of sandbox environments.
//!
//! Populated once at startup and never mutated afterward — the same
//! "process-wide singleton, no global" shape the base crate uses for its
//! config structs, but here the data itself is immutable after construction.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// A named runtime image plus its defaults.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Unique name, e.g. `"bash"`.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Grouping label, e.g. `"shell"`, `"language"`.
    pub category: String,
    /// Opaque container image reference. Not exposed via [`EnvironmentRegistry::list`].
    pub container_image: String,
    /// Idle timeout applied to sessions created with this environment, unless overridden.
    pub default_timeout: Duration,
}

/// Public-safe subset of an [`Environment`]: no image reference.
#[derive(Debug, Clone)]
pub struct EnvironmentInfo {
    /// Unique name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Grouping label.
    pub category: String,
    /// Idle timeout applied by default.
    pub default_timeout: Duration,
}

impl From<&Environment> for EnvironmentInfo {
    fn from(env: &Environment) -> Self {
        Self {
            name: env.name.clone(),
            description: env.description.clone(),
            category: env.category.clone(),
            default_timeout: env.default_timeout,
        }
    }
}

/// Environment Registry errors.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// Requested environment name is not in the catalog.
    #[error("unknown environment {name:?}; known environments: {known:?}")]
    NotFound {
        /// The name that was requested.
        name: String,
        /// The full set of known names, for a user-facing error message.
        known: Vec<String>,
    },
}

/// Read-only catalog mapping environment name to container image and defaults.
pub struct EnvironmentRegistry {
    environments: HashMap<String, Environment>,
    default_name: String,
}

impl EnvironmentRegistry {
    /// Build a registry from a list of environments. The first entry named
    /// `default_name` becomes the designated default; panics (a startup
    /// invariant violation, not a runtime error) if it is absent.
    pub fn new(environments: Vec<Environment>, default_name: &str) -> Self {
        let environments: HashMap<String, Environment> = environments
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        assert!(
            environments.contains_key(default_name),
            "default environment {default_name:?} must be present in the catalog"
        );

        Self {
            environments,
            default_name: default_name.to_string(),
        }
    }

    /// The built-in catalog: `bash`, `node`, `python`, with `bash` as default.
    pub fn builtin() -> Self {
        Self::new(
            vec![
                Environment {
                    name: "bash".to_string(),
                    description: "POSIX shell".to_string(),
                    category: "shell".to_string(),
                    container_image: "sandbox/bash:latest".to_string(),
                    default_timeout: Duration::from_secs(15 * 60),
                },
                Environment {
                    name: "node".to_string(),
                    description: "Node.js REPL and shell".to_string(),
                    category: "language".to_string(),
                    container_image: "sandbox/node:latest".to_string(),
                    default_timeout: Duration::from_secs(15 * 60),
                },
                Environment {
                    name: "python".to_string(),
                    description: "Python REPL and shell".to_string(),
                    category: "language".to_string(),
                    container_image: "sandbox/python:latest".to_string(),
                    default_timeout: Duration::from_secs(15 * 60),
                },
            ],
            "bash",
        )
    }

    /// Look up an environment by name.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::NotFound`] carrying the known names.
    pub fn get(&self, name: &str) -> Result<&Environment, EnvironmentError> {
        self.environments
            .get(name)
            .ok_or_else(|| EnvironmentError::NotFound {
                name: name.to_string(),
                known: self.known_names(),
            })
    }

    /// The designated default environment.
    pub fn get_default(&self) -> &Environment {
        self.environments
            .get(&self.default_name)
            .expect("default environment is guaranteed present at construction")
    }

    /// Public-safe listing of every environment.
    pub fn list(&self) -> Vec<EnvironmentInfo> {
        let mut infos: Vec<EnvironmentInfo> = self.environments.values().map(Into::into).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Whether a name is known.
    pub fn has(&self, name: &str) -> bool {
        self.environments.contains_key(name)
    }

    fn known_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.environments.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_has_bash_default() {
        let registry = EnvironmentRegistry::builtin();
        assert_eq!(registry.get_default().name, "bash");
        assert!(registry.has("bash"));
        assert!(registry.has("node"));
        assert!(registry.has("python"));
    }

    #[test]
    fn test_unknown_environment_carries_known_names() {
        let registry = EnvironmentRegistry::builtin();
        let err = registry.get("rust").unwrap_err();
        match err {
            EnvironmentError::NotFound { name, known } => {
                assert_eq!(name, "rust");
                assert!(known.contains(&"bash".to_string()));
            }
        }
    }

    #[test]
    fn test_list_excludes_image_reference() {
        let registry = EnvironmentRegistry::builtin();
        let list = registry.list();
        assert_eq!(list.len(), 3);
        assert!(list.iter().any(|e| e.name == "bash"));
    }

    #[test]
    fn test_list_is_sorted_by_name() {
        let registry = EnvironmentRegistry::builtin();
        let names: Vec<String> = registry.list().into_iter().map(|e| e.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
