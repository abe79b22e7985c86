//! In-memory versioned object store.
//!
//! Every stored object carries the global resource version of its last
//! write. Writers must present the version they read; stale writes are
//! rejected with [`StoreError::Conflict`] and the writer is expected to
//! re-read and retry (see [`Store::patch`]).
//!
//! Deletion is two-phase: an object with finalizers is only marked with a
//! `deletion_timestamp` and disappears once its last finalizer is removed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::debug;
use vmctl_id::ResourceVersion;
use vmctl_model::{ApiError, ErrorKind, ObjectKey, Resource};
use vmctl_reconcile::{retry_on_conflict, ConflictRetry, Conflicting};

/// Errors from store operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} was modified: resource version {presented} is stale (current {current})")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        presented: ResourceVersion,
        current: ResourceVersion,
    },

    #[error("{kind} {key} has uid {actual}, expected {expected}")]
    UidMismatch {
        kind: &'static str,
        key: ObjectKey,
        expected: String,
        actual: String,
    },

    /// A read-modify-write was abandoned because a precondition failed.
    #[error(transparent)]
    Rejected(#[from] ApiError),
}

impl Conflicting for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            StoreError::Conflict { .. } | StoreError::UidMismatch { .. } => ErrorKind::Conflict,
            StoreError::Rejected(api) => return api.clone(),
        };
        ApiError::new(kind, err.to_string())
    }
}

/// Global write counter shared by every store of a cluster.
///
/// Each write takes the next value as its resource version and notifies
/// subscribers.
#[derive(Debug, Clone)]
pub struct Revision {
    tx: Arc<watch::Sender<u64>>,
}

impl Revision {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    fn bump(&self) -> ResourceVersion {
        let mut next = 0;
        self.tx.send_modify(|v| {
            *v += 1;
            next = *v;
        });
        ResourceVersion::new(next)
    }

    /// Receiver that observes every write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for [`Store::delete`].
#[derive(Debug, Clone, Copy)]
pub struct DeleteOptions<U> {
    /// Only delete if the stored object still has this uid.
    pub uid: Option<U>,

    /// Grace period recorded on the object for whoever finalizes it.
    pub grace_period_secs: Option<u64>,
}

impl<U> Default for DeleteOptions<U> {
    fn default() -> Self {
        Self {
            uid: None,
            grace_period_secs: None,
        }
    }
}

/// Outcome of a delete.
#[derive(Debug, Clone)]
pub enum Deletion<T> {
    /// The object is gone.
    Removed(T),
    /// The object is terminating and waits for its finalizers.
    Pending(T),
}

/// Objects of one kind, keyed by namespaced name.
pub struct Store<T: Resource> {
    objects: RwLock<BTreeMap<ObjectKey, T>>,
    revision: Revision,
}

impl<T: Resource> Store<T> {
    pub fn new(revision: Revision) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            revision,
        }
    }

    /// Receiver notified on every write to any store sharing this revision.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: T::KIND,
            key: key.clone(),
        }
    }

    /// Stamp a new version on `obj` and store it, or drop it if it is
    /// terminating with no finalizers left.
    fn commit(&self, objects: &mut BTreeMap<ObjectKey, T>, key: ObjectKey, mut obj: T) -> T {
        obj.meta_mut().resource_version = self.revision.bump();
        let meta = obj.meta();
        if meta.is_terminating() && meta.finalizers.is_empty() {
            debug!(kind = T::KIND, key = %key, "Finalized and removed");
            objects.remove(&key);
        } else {
            objects.insert(key, obj.clone());
        }
        obj
    }

    /// Store a new object. Identity, version and timestamps are assigned
    /// here; client-supplied values are ignored.
    pub async fn create(&self, mut obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: T::KIND, key });
        }

        let meta = obj.meta_mut();
        meta.uid = T::Uid::default();
        meta.generation = 1;
        meta.creation_timestamp = Utc::now();
        meta.deletion_timestamp = None;
        meta.deletion_grace_period_secs = None;

        let created = self.commit(&mut objects, key, obj);
        debug!(kind = T::KIND, key = %created.key(), uid = %created.uid(), "Created");
        Ok(created)
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<T, StoreError> {
        self.find(key).await.ok_or_else(|| Self::not_found(key))
    }

    pub async fn find(&self, key: &ObjectKey) -> Option<T> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn find_by_uid(&self, namespace: &str, uid: T::Uid) -> Option<T> {
        self.objects
            .read()
            .await
            .values()
            .find(|o| o.meta().namespace == namespace && o.uid() == uid)
            .cloned()
    }

    /// All objects, optionally restricted to one namespace, ordered by key.
    pub async fn list(&self, namespace: Option<&str>) -> Vec<T> {
        self.objects
            .read()
            .await
            .values()
            .filter(|o| namespace.is_none_or(|ns| o.meta().namespace == ns))
            .cloned()
            .collect()
    }

    fn check_version(current: &T, presented: &T) -> Result<(), StoreError> {
        let current_rv = current.meta().resource_version;
        let presented_rv = presented.meta().resource_version;
        if current_rv != presented_rv {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key: current.key(),
                presented: presented_rv,
                current: current_rv,
            });
        }
        Ok(())
    }

    /// Replace spec and finalizers. Status is left untouched. The
    /// generation is bumped only when the spec actually changes.
    pub async fn update(&self, obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let mut objects = self.objects.write().await;
        let current = objects.get(&key).ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(current, &obj)?;

        let mut next = current.clone();
        if next.spec() != obj.spec() {
            *next.spec_mut() = obj.spec().clone();
            next.meta_mut().generation += 1;
        }
        next.meta_mut().finalizers = obj.meta().finalizers.clone();

        Ok(self.commit(&mut objects, key, next))
    }

    /// Replace status only.
    pub async fn update_status(&self, obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let mut objects = self.objects.write().await;
        let current = objects.get(&key).ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(current, &obj)?;

        let mut next = current.clone();
        *next.status_mut() = obj.status().clone();

        Ok(self.commit(&mut objects, key, next))
    }

    /// Read-modify-write of spec and finalizers, retried on conflict.
    ///
    /// `mutate` is re-run against a fresh read on every attempt and returns
    /// whether it changed anything; nothing is written when it returns
    /// `false`. Returns the object as last read or written.
    pub async fn patch<F>(
        &self,
        key: &ObjectKey,
        retry: &ConflictRetry,
        mutate: F,
    ) -> Result<T, StoreError>
    where
        F: Fn(&mut T) -> Result<bool, StoreError> + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict(retry, move || async move {
            let mut obj = self.get(key).await?;
            if !mutate(&mut obj)? {
                return Ok(obj);
            }
            self.update(obj).await
        })
        .await
    }

    /// Read-modify-write of status, retried on conflict.
    pub async fn patch_status<F>(
        &self,
        key: &ObjectKey,
        retry: &ConflictRetry,
        mutate: F,
    ) -> Result<T, StoreError>
    where
        F: Fn(&mut T) -> Result<bool, StoreError> + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict(retry, move || async move {
            let mut obj = self.get(key).await?;
            if !mutate(&mut obj)? {
                return Ok(obj);
            }
            self.update_status(obj).await
        })
        .await
    }

    /// Delete an object. With finalizers present the object only becomes
    /// terminating; repeated deletes of a terminating object are no-ops.
    pub async fn delete(
        &self,
        key: &ObjectKey,
        options: DeleteOptions<T::Uid>,
    ) -> Result<Deletion<T>, StoreError> {
        let mut objects = self.objects.write().await;
        let current = objects.get(key).ok_or_else(|| Self::not_found(key))?;

        if let Some(expected) = options.uid {
            if current.uid() != expected {
                return Err(StoreError::UidMismatch {
                    kind: T::KIND,
                    key: key.clone(),
                    expected: expected.to_string(),
                    actual: current.uid().to_string(),
                });
            }
        }

        if current.meta().finalizers.is_empty() {
            let removed = objects.remove(key).ok_or_else(|| Self::not_found(key))?;
            self.revision.bump();
            debug!(kind = T::KIND, key = %key, uid = %removed.uid(), "Removed");
            return Ok(Deletion::Removed(removed));
        }

        if current.meta().is_terminating() {
            return Ok(Deletion::Pending(current.clone()));
        }

        let mut next = current.clone();
        next.meta_mut().deletion_timestamp = Some(Utc::now());
        next.meta_mut().deletion_grace_period_secs = options.grace_period_secs;
        debug!(kind = T::KIND, key = %key, "Marked for deletion");
        Ok(Deletion::Pending(self.commit(&mut objects, key.clone(), next)))
    }

    /// Add a finalizer unless present. Terminating objects are rejected.
    pub async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<T, StoreError> {
        let mut objects = self.objects.write().await;
        let current = objects.get(key).ok_or_else(|| Self::not_found(key))?;
        if current.meta().has_finalizer(finalizer) {
            return Ok(current.clone());
        }
        if current.meta().is_terminating() {
            return Err(ApiError::conflict(format!(
                "{} {key} is terminating",
                T::KIND
            ))
            .into());
        }

        let mut next = current.clone();
        next.meta_mut().finalizers.push(finalizer.to_string());
        Ok(self.commit(&mut objects, key.clone(), next))
    }

    /// Remove a finalizer. Removing the last finalizer of a terminating
    /// object removes the object.
    pub async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        let current = objects.get(key).ok_or_else(|| Self::not_found(key))?;
        if !current.meta().has_finalizer(finalizer) {
            return Ok(());
        }

        let mut next = current.clone();
        next.meta_mut().finalizers.retain(|f| f != finalizer);
        self.commit(&mut objects, key.clone(), next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vmctl_model::{Instance, InstanceTemplate, Phase, RunMode, RunPolicy, INSTANCE_FINALIZER};

    use super::*;

    fn policy_store() -> Store<RunPolicy> {
        Store::new(Revision::new())
    }

    #[tokio::test]
    async fn test_create_assigns_identity_and_version() {
        let store = policy_store();
        let submitted = RunPolicy::new("default", "vm1", RunMode::Always);
        let submitted_uid = submitted.meta.uid;

        let created = store.create(submitted).await.unwrap();
        assert_ne!(created.meta.uid, submitted_uid);
        assert_eq!(created.meta.generation, 1);
        assert!(created.meta.resource_version > ResourceVersion::UNSET);

        let err = store
            .create(RunPolicy::new("default", "vm1", RunMode::Halted))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected() {
        let store = policy_store();
        let created = store
            .create(RunPolicy::new("default", "vm1", RunMode::Always))
            .await
            .unwrap();

        let mut first = created.clone();
        first.spec.run_mode = Some(RunMode::Halted);
        let updated = store.update(first).await.unwrap();
        assert_eq!(updated.meta.generation, 2);

        let mut second = created;
        second.spec.run_mode = Some(RunMode::Manual);
        let err = store.update(second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(ApiError::from(err).kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_status_write_keeps_spec_and_generation() {
        let store = policy_store();
        let created = store
            .create(RunPolicy::new("default", "vm1", RunMode::Always))
            .await
            .unwrap();

        let mut obj = created.clone();
        obj.status.created = true;
        obj.spec.run_mode = Some(RunMode::Halted);
        let written = store.update_status(obj).await.unwrap();

        assert!(written.status.created);
        assert_eq!(written.spec.run_mode, Some(RunMode::Always));
        assert_eq!(written.meta.generation, 1);
        assert!(written.meta.resource_version > created.meta.resource_version);
    }

    #[tokio::test]
    async fn test_patch_skips_write_when_unchanged() {
        let store = policy_store();
        let created = store
            .create(RunPolicy::new("default", "vm1", RunMode::Always))
            .await
            .unwrap();
        let key = created.key();

        let same = store
            .patch(&key, &ConflictRetry::default(), |_| Ok(false))
            .await
            .unwrap();
        assert_eq!(same.meta.resource_version, created.meta.resource_version);

        let halted = store
            .patch(&key, &ConflictRetry::default(), |p| {
                p.spec.run_mode = Some(RunMode::Halted);
                Ok(true)
            })
            .await
            .unwrap();
        assert_eq!(halted.run_mode(), RunMode::Halted);
    }

    #[tokio::test]
    async fn test_patch_surfaces_rejection() {
        let store = policy_store();
        let created = store
            .create(RunPolicy::new("default", "vm1", RunMode::Always))
            .await
            .unwrap();

        let err = store
            .patch(&created.key(), &ConflictRetry::default(), |_| {
                Err(ApiError::not_running().into())
            })
            .await
            .unwrap_err();
        assert_eq!(ApiError::from(err).kind, ErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn test_two_phase_delete() {
        let store: Store<Instance> = Store::new(Revision::new());
        let created = store
            .create(Instance::new("default", "vm1", InstanceTemplate::default()))
            .await
            .unwrap();
        let key = created.key();
        store.add_finalizer(&key, INSTANCE_FINALIZER).await.unwrap();

        let deletion = store
            .delete(
                &key,
                DeleteOptions {
                    uid: Some(created.meta.uid),
                    grace_period_secs: Some(0),
                },
            )
            .await
            .unwrap();
        let Deletion::Pending(terminating) = deletion else {
            panic!("expected pending deletion");
        };
        assert!(terminating.meta.is_terminating());
        assert_eq!(terminating.meta.deletion_grace_period_secs, Some(0));
        assert_eq!(terminating.status.phase, Phase::Pending);

        assert!(store.add_finalizer(&key, "other").await.is_err());

        store.remove_finalizer(&key, INSTANCE_FINALIZER).await.unwrap();
        assert!(store.find(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_with_stale_uid_is_rejected() {
        let store: Store<Instance> = Store::new(Revision::new());
        let created = store
            .create(Instance::new("default", "vm1", InstanceTemplate::default()))
            .await
            .unwrap();

        let err = store
            .delete(
                &created.key(),
                DeleteOptions {
                    uid: Some(vmctl_id::InstanceUid::new()),
                    grace_period_secs: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UidMismatch { .. }));
        assert!(store.find(&created.key()).await.is_some());
    }

    #[tokio::test]
    async fn test_writes_notify_subscribers() {
        let store = policy_store();
        let mut rx = store.subscribe();
        let before = *rx.borrow_and_update();

        store
            .create(RunPolicy::new("default", "vm1", RunMode::Always))
            .await
            .unwrap();

        rx.changed().await.unwrap();
        assert!(*rx.borrow() > before);
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() {
        let store = policy_store();
        for (ns, name) in [("a", "vm1"), ("b", "vm1"), ("a", "vm2")] {
            store
                .create(RunPolicy::new(ns, name, RunMode::Halted))
                .await
                .unwrap();
        }

        let names: Vec<_> = store
            .list(Some("a"))
            .await
            .into_iter()
            .map(|p| p.meta.name)
            .collect();
        assert_eq!(names, vec!["vm1", "vm2"]);
        assert_eq!(store.list(None).await.len(), 3);
    }
}
