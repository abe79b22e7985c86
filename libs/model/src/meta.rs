//! Object metadata shared by every stored kind.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use vmctl_id::ResourceVersion;

/// Namespaced name of an object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
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
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata common to every object kind.
///
/// `uid`, `resource_version`, `creation_timestamp` and `deletion_timestamp`
/// are owned by the store; values supplied by a client are overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta<U> {
    pub namespace: String,
    pub name: String,

    /// Assigned at creation; never reused.
    #[serde(default)]
    pub uid: U,

    /// Version the object was read at. Updates carrying a stale value are
    /// rejected.
    #[serde(default)]
    pub resource_version: ResourceVersion,

    /// Bumped on every spec change (status writes do not bump it).
    #[serde(default)]
    pub generation: u64,

    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,

    /// Set when deletion was requested while finalizers were present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    /// Grace period requested by the deleter, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_grace_period_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl<U: Default> ObjectMeta<U> {
    /// Metadata for a not-yet-stored object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: U::default(),
            resource_version: ResourceVersion::UNSET,
            generation: 0,
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
            deletion_grace_period_secs: None,
            finalizers: Vec::new(),
        }
    }
}

impl<U> ObjectMeta<U> {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// True once deletion has been requested.
    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// Phase change record, appended on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition<P> {
    pub phase: P,
    pub timestamp: DateTime<Utc>,
}

/// A kind that can live in the versioned store.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Kind name used in logs and error messages.
    const KIND: &'static str;

    type Uid: Copy + Eq + Default + fmt::Display + fmt::Debug + Send + Sync + 'static;
    type Spec: Clone + PartialEq + Send + Sync;
    type Status: Clone + PartialEq + Send + Sync;

    fn meta(&self) -> &ObjectMeta<Self::Uid>;

    fn meta_mut(&mut self) -> &mut ObjectMeta<Self::Uid>;

    fn spec(&self) -> &Self::Spec;

    fn spec_mut(&mut self) -> &mut Self::Spec;

    fn status(&self) -> &Self::Status;

    fn status_mut(&mut self) -> &mut Self::Status;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }

    fn uid(&self) -> Self::Uid {
        self.meta().uid
    }
}
