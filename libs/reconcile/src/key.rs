//! Reconciliation keys.
//!
//! A key names one unit of convergence work: the `(namespace, name)` pair of
//! the authoritative object. Keys are rendered as `namespace/name`.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

/// Errors produced while deriving or parsing a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Object metadata carries no name.
    #[error("object has no name")]
    MissingName,

    /// Object metadata carries no namespace.
    #[error("object {name} has no namespace")]
    MissingNamespace { name: String },

    /// String is not of the form `namespace/name`.
    #[error("malformed key {0:?}: expected namespace/name")]
    Malformed(String),
}

/// Identity of a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key of an object from its metadata.
    pub fn from_meta(meta: &ObjectMeta) -> Result<Self, KeyError> {
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(KeyError::MissingName)?;

        let namespace = meta
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| KeyError::MissingNamespace {
                name: name.to_string(),
            })?;

        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
                Ok(Self::new(ns, name))
            }
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_from_meta() {
        let meta = ObjectMeta {
            name: Some("vm1".to_string()),
            namespace: Some("ns".to_string()),
            ..Default::default()
        };
        let key = ObjectKey::from_meta(&meta).unwrap();
        assert_eq!(key, ObjectKey::new("ns", "vm1"));
        assert_eq!(key.to_string(), "ns/vm1");
    }

    #[test]
    fn test_from_meta_missing_identity() {
        let meta = ObjectMeta {
            namespace: Some("ns".to_string()),
            ..Default::default()
        };
        assert_eq!(ObjectKey::from_meta(&meta), Err(KeyError::MissingName));

        let meta = ObjectMeta {
            name: Some("vm1".to_string()),
            namespace: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(
            ObjectKey::from_meta(&meta),
            Err(KeyError::MissingNamespace {
                name: "vm1".to_string()
            })
        );
    }

    #[rstest]
    #[case("ns/vm1", true)]
    #[case("ns/", false)]
    #[case("/vm1", false)]
    #[case("vm1", false)]
    #[case("a/b/c", false)]
    fn test_parse(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(input.parse::<ObjectKey>().is_ok(), ok);
    }
}
