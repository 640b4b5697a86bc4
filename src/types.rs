use std::{fmt, str::FromStr};

use kube::Resource;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected key format: {0:?}")]
    InvalidKey(String),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

/// `namespace/name` pair identifying a watched object.
///
/// Used both as the unit of work in the queue and as the cache lookup key.
/// Cluster-scoped objects have an empty namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the key of an object from its metadata.
    pub fn for_object<K: Resource>(object: &K) -> Result<Self, Error> {
        let meta = object.meta();
        let name = meta
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let namespace = meta.namespace.clone().unwrap_or_default();
        Ok(Self { namespace, name })
    }

    /// Whether both namespace and name are present
    pub fn is_complete(&self) -> bool {
        !self.namespace.is_empty() && !self.name.is_empty()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Ok(Self::new("", name)),
            (Some(namespace), Some(name), None) => Ok(Self::new(namespace, name)),
            _ => Err(Error::InvalidKey(s.to_string())),
        }
    }
}
