//! Subscriber snapshot comparison keyed by subscriber id

use std::collections::{HashMap, HashSet};

use super::model::{SubscriberId, SubscriberRecord};

/// Partition of the difference between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Ids only in the old snapshot
    pub deleted: Vec<SubscriberRecord>,
    /// Ids only in the new snapshot
    pub added: Vec<SubscriberRecord>,
    /// Ids in both with any field changed; carries the new record
    pub modified: Vec<SubscriberRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.added.is_empty() && self.modified.is_empty()
    }
}

/// Compare two snapshots by id.
///
/// `None` stands for "no snapshot": everything on the other side is added or
/// deleted. Output order follows the input order of the side each record comes
/// from. Ids must be unique within each snapshot (see [`has_unique_ids`]).
pub fn compare(old: Option<&[SubscriberRecord]>, new: Option<&[SubscriberRecord]>) -> ChangeSet {
    match (old, new) {
        (None, None) => ChangeSet::default(),
        (None, Some(new)) => ChangeSet {
            added: new.to_vec(),
            ..Default::default()
        },
        (Some(old), None) => ChangeSet {
            deleted: old.to_vec(),
            ..Default::default()
        },
        (Some(old), Some(new)) => {
            debug_assert!(has_unique_ids(old) && has_unique_ids(new));

            let old_by_id: HashMap<SubscriberId, &SubscriberRecord> =
                old.iter().map(|r| (r.id, r)).collect();
            let new_ids: HashSet<SubscriberId> = new.iter().map(|r| r.id).collect();

            let mut changes = ChangeSet::default();
            for record in old {
                if !new_ids.contains(&record.id) {
                    changes.deleted.push(record.clone());
                }
            }
            for record in new {
                match old_by_id.get(&record.id) {
                    None => changes.added.push(record.clone()),
                    Some(previous) if *previous != record => changes.modified.push(record.clone()),
                    Some(_) => {}
                }
            }
            changes
        }
    }
}

/// First id that appears more than once, if any
pub fn duplicate_id(records: &[SubscriberRecord]) -> Option<SubscriberId> {
    let mut seen = HashSet::with_capacity(records.len());
    records.iter().map(|r| r.id).find(|id| !seen.insert(*id))
}

pub fn has_unique_ids(records: &[SubscriberRecord]) -> bool {
    duplicate_id(records).is_none()
}
