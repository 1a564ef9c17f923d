use crate::ConfigError;
use std::fmt;

/// Environment variable consulted when no queue name is passed explicitly.
pub const QUEUE_ENV_VAR: &str = "PACE_QUEUE";

/// Key namespace shared with Resque-style producers.
pub const DEFAULT_NAMESPACE: &str = "resque";

/// A logical queue name and the store key it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName {
    name: String,
    key: String,
}

impl QueueName {
    /// Resolve a queue name, falling back to `fallback` when `name` is absent
    /// or empty.
    pub fn resolve(
        name: Option<&str>,
        fallback: Option<&str>,
        namespace: &str,
    ) -> Result<Self, ConfigError> {
        let name = name
            .filter(|n| !n.is_empty())
            .or_else(|| fallback.filter(|n| !n.is_empty()))
            .ok_or(ConfigError::QueueUnspecified { env: QUEUE_ENV_VAR })?;

        Self::new(name, namespace)
    }

    pub fn new(name: &str, namespace: &str) -> Result<Self, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::QueueUnspecified { env: QUEUE_ENV_VAR });
        }
        if namespace.is_empty() || namespace.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidNamespace(namespace.to_string()));
        }

        Ok(QueueName {
            name: name.to_string(),
            key: format!("{}{}", Self::prefix(namespace), name),
        })
    }

    /// The prefix every key in `namespace` starts with.
    pub fn prefix(namespace: &str) -> String {
        format!("{}:queue:", namespace)
    }

    /// Logical name, as given by the caller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified store key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolve_explicit_name() {
        let queue = QueueName::resolve(Some("normal"), Some("other"), DEFAULT_NAMESPACE).unwrap();
        assert_eq!(queue.name(), "normal");
        assert_eq!(queue.key(), "resque:queue:normal");
        assert_eq!(queue.to_string(), "normal");
    }

    #[test]
    fn test_resolve_uses_fallback() {
        let queue = QueueName::resolve(None, Some("mail"), "pace").unwrap();
        assert_eq!(queue.key(), "pace:queue:mail");

        let queue = QueueName::resolve(Some(""), Some("mail"), "pace").unwrap();
        assert_eq!(queue.name(), "mail");
    }

    #[test]
    fn test_resolve_unspecified() {
        let cases: [(Option<&str>, Option<&str>); 4] =
            [(None, None), (Some(""), None), (None, Some("")), (Some(""), Some(""))];

        for (name, fallback) in cases {
            assert_eq!(
                QueueName::resolve(name, fallback, DEFAULT_NAMESPACE),
                Err(ConfigError::QueueUnspecified { env: QUEUE_ENV_VAR }),
            );
        }
    }

    #[test]
    fn test_invalid_namespace() {
        assert!(matches!(
            QueueName::new("normal", ""),
            Err(ConfigError::InvalidNamespace(_))
        ));
        assert!(matches!(
            QueueName::new("normal", "my ns"),
            Err(ConfigError::InvalidNamespace(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_key_is_prefix_plus_name(name in "\\PC{1,40}") {
            let queue = QueueName::resolve(Some(&name), None, DEFAULT_NAMESPACE).unwrap();
            prop_assert_eq!(queue.key(), format!("{}{}", QueueName::prefix(DEFAULT_NAMESPACE), name));
            prop_assert_eq!(queue.name(), name.as_str());
        }
    }
}
