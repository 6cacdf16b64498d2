use std::collections::{HashMap, HashSet};

use crate::store::types::ImageRecord;

/// The difference between the local working set and the remote persisted
/// set, partitioned into the three phases the engine executes.
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    /// Local items with no remote counterpart. Applied second.
    pub to_add: Vec<ImageRecord>,
    /// Remote items no longer present locally. Applied first.
    pub to_remove: Vec<ImageRecord>,
    /// Items present on both sides whose local state differs. Applied last.
    pub to_update: Vec<ImageRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_update.is_empty()
    }

    /// Total number of engine steps this change set will take.
    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len() + self.to_update.len()
    }
}

/// Diff `local` against `original` (the last known remote state).
///
/// Identity is the remote document id: a local item without one is always
/// an add, never a match. A matched pair becomes an update when the order
/// differs, when the local item carries a file (a pending re-upload), or
/// when the two-column flag differs. Unchanged pairs are dropped.
///
/// Adds and updates keep the order of `local`; removals keep the order of
/// `original`.
pub fn compute_change_set(local: &[ImageRecord], original: &[ImageRecord]) -> ChangeSet {
    let original_by_id: HashMap<&str, &ImageRecord> = original
        .iter()
        .filter_map(|img| img.id.as_deref().map(|id| (id, img)))
        .collect();

    let mut change_set = ChangeSet::default();

    for image in local {
        match image.id.as_deref().and_then(|id| original_by_id.get(id)) {
            None => change_set.to_add.push(image.clone()),
            Some(existing) => {
                let wants_update = image.order != existing.order
                    || image.file.is_some()
                    || image.span_two_columns != existing.span_two_columns;
                if wants_update {
                    change_set.to_update.push(image.clone());
                }
            }
        }
    }

    let local_ids: HashSet<&str> = local.iter().filter_map(|img| img.id.as_deref()).collect();

    for image in original {
        let gone = match image.id.as_deref() {
            Some(id) => !local_ids.contains(id),
            // A persisted record without an id cannot be addressed for
            // deletion; leave it alone.
            None => false,
        };
        if gone {
            change_set.to_remove.push(image.clone());
        }
    }

    change_set
}
