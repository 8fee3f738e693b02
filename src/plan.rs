use std::collections::HashMap;
use tracing::debug;
use crate::{
    dns::difference,
    endpoint::{Endpoint, RecordType},
};

/// A set of record changes to apply to a provider.
///
/// `update_old[i]` and `update_new[i]` describe the same record set before
/// and after the change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub create: Vec<Endpoint>,
    pub update_old: Vec<Endpoint>,
    pub update_new: Vec<Endpoint>,
    pub delete: Vec<Endpoint>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update_new.is_empty() && self.delete.is_empty()
    }

    pub fn updates(&self) -> impl Iterator<Item = (&Endpoint, &Endpoint)> {
        self.update_old.iter().zip(self.update_new.iter())
    }
}

/// Computes the changes that turn `current` into `desired`.
///
/// Record sets are matched by canonical name and type. Duplicate keys on
/// either side are merged.
pub fn calculate(current: &[Endpoint], desired: &[Endpoint]) -> Changes {
    let current = merge(current);
    let desired = merge(desired);

    let mut index: HashMap<(String, RecordType), &Endpoint> = current.iter()
        .map(|e| (e.key(), e))
        .collect();
    let mut changes = Changes::default();

    for want in &desired {
        let Some(have) = index.remove(&want.key()) else {
            changes.create.push(want.clone());
            continue;
        };

        let have_targets = have.comparable_targets();
        let want_targets = want.comparable_targets();
        let diff = difference(&have_targets, &want_targets);
        let ttl_changed = want.ttl.is_some() && want.ttl != have.ttl;

        debug!(
            name = %want.dns_name,
            record_type = %want.record_type,
            add = diff.add.len(),
            remove = diff.remove.len(),
            leave = diff.leave.len(),
            ttl_changed,
            "compared record set"
        );

        if !diff.is_unchanged() || ttl_changed {
            changes.update_old.push(have.clone());
            changes.update_new.push(want.clone());
        }
    }

    changes.delete = current.iter()
        .filter(|e| index.contains_key(&e.key()))
        .cloned()
        .collect();

    changes
}

/// Collapses endpoints sharing a key into one, keeping first-seen order.
fn merge(endpoints: &[Endpoint]) -> Vec<Endpoint> {
    let mut positions: HashMap<(String, RecordType), usize> = HashMap::new();
    let mut merged: Vec<Endpoint> = Vec::with_capacity(endpoints.len());

    for e in endpoints {
        match positions.get(&e.key()) {
            Some(&i) => {
                let into = &mut merged[i];
                for t in &e.targets {
                    if !into.targets.contains(t) {
                        into.targets.push(t.clone());
                    }
                }
                if into.ttl.is_none() {
                    into.ttl = e.ttl;
                }
                for (k, v) in &e.provider_specific {
                    into.provider_specific.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            None => {
                positions.insert(e.key(), merged.len());
                merged.push(e.clone());
            }
        }
    }

    merged
}
