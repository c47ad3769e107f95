//! Applying a peer's change batch to the local tables.

use crate::conflict::{reconcile, ConflictResolver, DeletePolicy, Reconciliation};
use crate::error::CoreResult;
use crate::types::{ChangeEvent, ChangeRecord, StoreEvent, StoredObject};
use tidesync_storage::{RowWrite, WriteTxn};
use uuid::Uuid;

/// Counts of what happened to the records of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Records written as received.
    pub applied: usize,
    /// Records whose conflict was settled by the resolver.
    pub merged: usize,
    /// Records that were stale, identical, or lost to the local version.
    pub skipped: usize,
}

pub(crate) struct BatchContext<'a> {
    pub setup: &'a str,
    pub resolver: &'a dyn ConflictResolver,
    pub policy: DeletePolicy,
}

fn write(txn: &WriteTxn<'_>, object: &StoredObject, pending: bool) -> CoreResult<u64> {
    Ok(txn.put(RowWrite {
        type_name: &object.key.type_name,
        key: &object.key.id,
        payload: &object.payload,
        version: object.version,
        origin: *object.origin.as_bytes(),
        tombstone: object.tombstone,
        pending,
    })?)
}

fn changed(object: &StoredObject) -> StoreEvent {
    StoreEvent::Changed(ChangeEvent {
        key: object.key.clone(),
        deleted: object.tombstone,
    })
}

/// Applies `records` and moves the peer's cursor to `last_seq`, all inside
/// `txn`.
///
/// A record only counts as a conflict when the local row holds a write
/// `peer` has not seen: committed after the peer's last acknowledgement and
/// not authored by the peer. Otherwise the newer `(version, origin)` wins.
pub(crate) fn apply_records(
    txn: &WriteTxn<'_>,
    ctx: &BatchContext<'_>,
    peer: Uuid,
    records: &[ChangeRecord],
    last_seq: u64,
) -> CoreResult<(ApplyOutcome, Vec<StoreEvent>)> {
    let mut outcome = ApplyOutcome::default();
    let mut events = Vec::new();
    let acknowledged = txn.peer_state(peer.as_bytes())?.acknowledged;

    for record in records {
        let remote = record.to_object(ctx.setup);
        let local = txn.get(&record.key.type_name, &record.key.id)?.map(|row| {
            let unseen = row.seq > acknowledged && row.origin != *peer.as_bytes();
            (unseen, StoredObject::from_row(row, ctx.setup))
        });

        let Some((unseen, local)) = local else {
            write(txn, &remote, false)?;
            if !remote.tombstone {
                events.push(changed(&remote));
            }
            outcome.applied += 1;
            continue;
        };

        if !unseen {
            if remote.write_order() > local.write_order() {
                write(txn, &remote, false)?;
                if !(local.tombstone && remote.tombstone) {
                    events.push(changed(&remote));
                }
                outcome.applied += 1;
            } else {
                outcome.skipped += 1;
            }
            continue;
        }

        match reconcile(&local, &remote, ctx.resolver, ctx.policy)? {
            Reconciliation::Identical | Reconciliation::KeepLocal => outcome.skipped += 1,
            Reconciliation::ApplyRemote => {
                write(txn, &remote, false)?;
                events.push(changed(&remote));
                outcome.applied += 1;
            }
            Reconciliation::Merged(merged) => {
                outcome.merged += 1;
                if !merged.same_content(&local) {
                    write(txn, &merged, true)?;
                    events.push(changed(&merged));
                }
                tracing::debug!(key = %merged.key, version = merged.version, "merged conflicting write");
            }
        }
    }

    txn.set_cursor(peer.as_bytes(), Some(last_seq))?;
    Ok((outcome, events))
}
