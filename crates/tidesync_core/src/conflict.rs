//! Conflict resolution.
//!
//! [`reconcile`] decides what to do when a remote write meets a local write
//! of the same key that has not been acknowledged yet. Pairs where exactly
//! one side is deleted are settled by [`DeletePolicy`]; only two live
//! versions reach the [`ConflictResolver`].

use crate::error::{CoreError, CoreResult};
use crate::types::StoredObject;

/// Merges two concurrently modified versions of one object.
///
/// Implementations must be commutative (`merge(a, b) == merge(b, a)`) and
/// idempotent (merging the result with either input again yields the
/// result). The returned object must keep the inputs' key.
pub trait ConflictResolver: Send + Sync {
    /// Returns the resolved version.
    fn merge(
        &self,
        local: &StoredObject,
        remote: &StoredObject,
        type_name: &str,
    ) -> CoreResult<StoredObject>;
}

/// Keeps the version with the greater `(version, origin)` pair. Equal pairs
/// fall back to the deletion marker and then the payload bytes, so every
/// pair has one winner.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriterWins;

fn precedence(object: &StoredObject) -> (u64, uuid::Uuid, bool, &[u8]) {
    let (version, origin) = object.write_order();
    (version, origin, object.tombstone, &object.payload)
}

impl ConflictResolver for LastWriterWins {
    fn merge(
        &self,
        local: &StoredObject,
        remote: &StoredObject,
        _type_name: &str,
    ) -> CoreResult<StoredObject> {
        if precedence(remote) > precedence(local) {
            Ok(remote.clone())
        } else {
            Ok(local.clone())
        }
    }
}

/// Decides a conflict between a deletion and a live version.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// The deletion wins.
    #[default]
    KeepDeleted,
    /// The live version wins and the object comes back.
    Resurrect,
}

/// Outcome of [`reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Write the remote version as is.
    ApplyRemote,
    /// Keep the local version; it will be propagated.
    KeepLocal,
    /// Write the resolver's result and propagate it.
    Merged(StoredObject),
    /// Both sides already agree.
    Identical,
}

/// Decides how a conflicting remote write is applied.
///
/// # Errors
///
/// Returns [`CoreError::ConflictPolicy`] if the resolver fails or returns an
/// object with a different key. Transient resolver errors are returned as is
/// so the caller can retry the batch.
pub fn reconcile(
    local: &StoredObject,
    remote: &StoredObject,
    resolver: &dyn ConflictResolver,
    policy: DeletePolicy,
) -> CoreResult<Reconciliation> {
    if local.same_content(remote) {
        return Ok(Reconciliation::Identical);
    }

    match (local.tombstone, remote.tombstone) {
        (true, true) => Ok(if remote.write_order() > local.write_order() {
            Reconciliation::ApplyRemote
        } else {
            Reconciliation::KeepLocal
        }),
        (false, true) => Ok(match policy {
            DeletePolicy::KeepDeleted => Reconciliation::ApplyRemote,
            DeletePolicy::Resurrect => Reconciliation::KeepLocal,
        }),
        (true, false) => Ok(match policy {
            DeletePolicy::KeepDeleted => Reconciliation::KeepLocal,
            DeletePolicy::Resurrect => Reconciliation::ApplyRemote,
        }),
        (false, false) => {
            let merged = resolver
                .merge(local, remote, &local.key.type_name)
                .map_err(|err| match err {
                    CoreError::ConflictPolicy(_) => err,
                    other if other.is_transient() => other,
                    other => CoreError::conflict_policy(format!(
                        "resolver failed for {}: {other}",
                        local.key
                    )),
                })?;
            if merged.key != local.key {
                return Err(CoreError::conflict_policy(format!(
                    "resolver returned {} while merging {}",
                    merged.key, local.key
                )));
            }
            Ok(Reconciliation::Merged(merged))
        }
    }
}
