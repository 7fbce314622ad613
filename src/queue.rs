use crate::bus::{Notification, NotificationBus};
use crate::models::{ChangeStatus, Entity, Operation, PendingChange};
use crate::store::PersistentStore;
use chrono::Utc;
use std::sync::MutexGuard;

pub const QUEUE_KEY: &str = "pending_changes";

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub change: PendingChange,
    /// Entries removed to restore the cap that had not been applied remotely.
    pub at_risk: Vec<PendingChange>,
    pub persisted: bool,
}

/// Durable, bounded, insertion-ordered queue of local writes.
#[derive(Clone)]
pub struct MutationQueue {
    store: PersistentStore,
    bus: NotificationBus,
    capacity: usize,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue").field("capacity", &self.capacity).finish()
    }
}

impl MutationQueue {
    pub fn new(store: PersistentStore, bus: NotificationBus, capacity: usize) -> Self {
        Self {
            store,
            bus,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.store.lock_queue()
    }

    fn read_all(&self) -> Vec<PendingChange> {
        self.store.load(QUEUE_KEY).unwrap_or_default()
    }

    fn write_all(&self, changes: &[PendingChange]) -> bool {
        self.store.save(QUEUE_KEY, changes)
    }

    /// Appends a `Pending` change. Never touches the network.
    pub fn enqueue(&self, operation: Operation, entity: Entity, payload: serde_json::Value) -> EnqueueOutcome {
        let outcome = {
            let _guard = self.guard();
            let mut changes = self.read_all();
            let change = PendingChange {
                id: generate_change_id(&changes),
                timestamp: Utc::now(),
                operation,
                entity,
                payload,
                status: ChangeStatus::Pending,
                error_message: None,
            };
            changes.push(change.clone());
            let evicted = enforce_capacity(&mut changes, self.capacity);
            let at_risk: Vec<PendingChange> = evicted.into_iter().filter(|entry| entry.is_pending()).collect();
            let persisted = self.write_all(&changes);
            if !persisted {
                tracing::warn!(change_id = %change.id, "queued change could not be persisted");
            }
            EnqueueOutcome {
                change,
                at_risk,
                persisted,
            }
        };

        tracing::info!(
            change_id = %outcome.change.id,
            operation = outcome.change.operation.as_str(),
            entity = outcome.change.entity.as_str(),
            "change queued"
        );
        self.bus.publish(Notification::ChangeQueued {
            id: outcome.change.id.clone(),
        });
        if !outcome.at_risk.is_empty() {
            tracing::warn!(count = outcome.at_risk.len(), "pending changes evicted to restore queue cap");
            self.bus.publish(Notification::ChangesAtRisk {
                changes: outcome.at_risk.clone(),
            });
        }
        outcome
    }

    /// Insertion-ordered listing, optionally filtered by status.
    pub fn list_by_status(&self, status: Option<ChangeStatus>) -> Vec<PendingChange> {
        let changes = self.read_all();
        match status {
            Some(status) => changes.into_iter().filter(|change| change.status == status).collect(),
            None => changes,
        }
    }

    pub fn get(&self, id: &str) -> Option<PendingChange> {
        self.read_all().into_iter().find(|change| change.id == id)
    }

    /// Returns false when the id is unknown or the change already settled.
    pub fn mark_completed(&self, id: &str) -> bool {
        self.settle(id, ChangeStatus::Completed, None)
    }

    pub fn mark_error(&self, id: &str, message: impl Into<String>) -> bool {
        self.settle(id, ChangeStatus::Error, Some(message.into()))
    }

    fn settle(&self, id: &str, status: ChangeStatus, message: Option<String>) -> bool {
        let _guard = self.guard();
        let mut changes = self.read_all();
        let Some(change) = changes.iter_mut().find(|change| change.id == id) else {
            tracing::debug!(change_id = %id, "status update for unknown change ignored");
            return false;
        };
        if !change.is_pending() {
            tracing::debug!(
                change_id = %id,
                current = change.status.as_str(),
                requested = status.as_str(),
                "change already settled"
            );
            return false;
        }
        change.status = status;
        change.error_message = message;
        self.write_all(&changes)
    }

    /// Removes every `Completed` entry. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let _guard = self.guard();
        let mut changes = self.read_all();
        let before = changes.len();
        changes.retain(|change| change.status != ChangeStatus::Completed);
        let removed = before - changes.len();
        if removed > 0 {
            self.write_all(&changes);
            tracing::info!(removed, remaining = changes.len(), "pruned completed changes");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read_all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let _guard = self.guard();
        self.store.remove(QUEUE_KEY);
    }
}

fn generate_change_id(existing: &[PendingChange]) -> String {
    loop {
        let id = format!("{}-{:08x}", Utc::now().timestamp_millis(), rand::random::<u32>());
        if !existing.iter().any(|change| change.id == id) {
            return id;
        }
    }
}

fn remove_oldest_with_status(changes: &mut Vec<PendingChange>, status: ChangeStatus) -> Option<PendingChange> {
    let index = changes
        .iter()
        .enumerate()
        .filter(|(_, change)| change.status == status)
        .min_by_key(|(index, change)| (change.timestamp, *index))
        .map(|(index, _)| index)?;
    Some(changes.remove(index))
}

/// Drops the oldest `Completed` entries while the queue is longer than `floor`.
pub(crate) fn trim_completed(changes: &mut Vec<PendingChange>, floor: usize) -> usize {
    let mut removed = 0;
    while changes.len() > floor {
        if remove_oldest_with_status(changes, ChangeStatus::Completed).is_none() {
            break;
        }
        removed += 1;
    }
    removed
}

/// Restores `capacity` evicting `Completed`, then `Error`, then `Pending`, oldest first.
pub(crate) fn enforce_capacity(changes: &mut Vec<PendingChange>, capacity: usize) -> Vec<PendingChange> {
    let mut evicted = Vec::new();
    for status in [ChangeStatus::Completed, ChangeStatus::Error, ChangeStatus::Pending] {
        while changes.len() > capacity {
            match remove_oldest_with_status(changes, status) {
                Some(change) => evicted.push(change),
                None => break,
            }
        }
    }
    evicted
}
