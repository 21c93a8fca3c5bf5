use crate::errors::ClusterViewError;
use crate::filter::{self, Filterable, ViewFilter};
use crate::model::{
    locate, ClusterSnapshot, Entity, Guest, GuestKey, Node, NodeDetails, NodeKey, Task,
};
use std::collections::{BTreeSet, HashMap};

/// Original list in server order plus the indices of rows passing the view
/// filter. The filtered side is only ever rebuilt from the original.
#[derive(Debug, Clone)]
pub struct SnapshotPair<E> {
    original: Vec<E>,
    filtered: Vec<usize>,
}

impl<E> Default for SnapshotPair<E> {
    fn default() -> Self {
        Self {
            original: Vec::new(),
            filtered: Vec::new(),
        }
    }
}

impl<E: Entity + Filterable> SnapshotPair<E> {
    pub fn original(&self) -> &[E] {
        &self.original
    }

    pub fn filtered(&self) -> impl ExactSizeIterator<Item = &E> + '_ {
        self.filtered.iter().map(|&idx| &self.original[idx])
    }

    pub fn filtered_len(&self) -> usize {
        self.filtered.len()
    }

    pub fn filtered_at(&self, row: usize) -> Option<&E> {
        self.filtered.get(row).map(|&idx| &self.original[idx])
    }

    pub fn filtered_cloned(&self) -> Vec<E> {
        self.filtered().cloned().collect()
    }

    pub fn get(&self, key: &E::Key) -> Option<&E> {
        locate(&self.original, key).map(|idx| &self.original[idx])
    }

    pub fn refilter(&mut self, filter: &ViewFilter) {
        self.filtered = filter::apply(&self.original, filter);
    }

    /// Swaps in a new original list, carrying omitted fields forward from the
    /// prior entity with the same identity. `hold` runs after carry-forward
    /// and may pin further fields from the prior value.
    fn replace_with<F>(&mut self, mut fresh: Vec<E>, filter: &ViewFilter, mut hold: F)
    where
        F: FnMut(&mut E, &E),
    {
        let exact: HashMap<E::Key, usize> = self
            .original
            .iter()
            .enumerate()
            .map(|(idx, item)| (item.key(), idx))
            .collect();
        for item in &mut fresh {
            let key = item.key();
            let prior = exact
                .get(&key)
                .copied()
                .or_else(|| locate(&self.original, &key));
            if let Some(prior) = prior.map(|idx| &self.original[idx]) {
                item.carry_forward(prior);
                hold(item, prior);
            }
        }
        self.original = fresh;
        self.refilter(filter);
    }

    fn patch(&mut self, key: &E::Key, mut fresh: E, filter: &ViewFilter) -> Result<(), ClusterViewError> {
        let idx = locate(&self.original, key)
            .ok_or_else(|| ClusterViewError::NotFound(key.to_string()))?;
        fresh.carry_forward(&self.original[idx]);
        self.original[idx] = fresh;
        self.refilter(filter);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Applied,
    /// A newer fetch was already applied; the payload was dropped.
    Stale,
}

/// Authoritative cluster inventory. Owned by the engine's writer thread.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    nodes: SnapshotPair<Node>,
    guests: SnapshotPair<Guest>,
    tasks: SnapshotPair<Task>,
    revision: u64,
    applied_seq: u64,
    loaded: bool,
}

/// Filters in force for each view when the store rebuilds its filtered lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveFilters {
    pub nodes: ViewFilter,
    pub guests: ViewFilter,
    pub tasks: ViewFilter,
}

impl EntityStore {
    pub fn nodes(&self) -> &SnapshotPair<Node> {
        &self.nodes
    }

    pub fn guests(&self) -> &SnapshotPair<Guest> {
        &self.guests
    }

    pub fn tasks(&self) -> &SnapshotPair<Task> {
        &self.tasks
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn applied_seq(&self) -> u64 {
        self.applied_seq
    }

    /// True once any full snapshot has been applied.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Applies a full fetch started at `seq`. Guests in `frozen` keep their
    /// prior status and uptime so an operation watching them still sees the
    /// pre-refresh values.
    pub fn replace_snapshot(
        &mut self,
        seq: u64,
        snapshot: ClusterSnapshot,
        filters: &ActiveFilters,
        frozen: &BTreeSet<GuestKey>,
    ) -> ReplaceOutcome {
        if seq < self.applied_seq {
            return ReplaceOutcome::Stale;
        }
        self.applied_seq = seq;
        self.loaded = true;
        self.nodes.replace_with(snapshot.nodes, &filters.nodes, |_, _| {});
        self.replace_guests(snapshot.guests, &filters.guests, frozen);
        self.tasks.replace_with(snapshot.tasks, &filters.tasks, |_, _| {});
        self.revision += 1;
        ReplaceOutcome::Applied
    }

    pub fn replace_tasks(&mut self, tasks: Vec<Task>, filter: &ViewFilter) {
        self.tasks.replace_with(tasks, filter, |_, _| {});
        self.revision += 1;
    }

    fn replace_guests(
        &mut self,
        guests: Vec<Guest>,
        filter: &ViewFilter,
        frozen: &BTreeSet<GuestKey>,
    ) {
        self.guests.replace_with(guests, filter, |fresh, prior| {
            if frozen.contains(&prior.key()) {
                fresh.status.clone_from(&prior.status);
                fresh.uptime = prior.uptime;
            }
        });
    }

    pub fn patch_guest(
        &mut self,
        key: &GuestKey,
        mut guest: Guest,
        filter: &ViewFilter,
    ) -> Result<(), ClusterViewError> {
        if guest.profile.is_empty() {
            guest.profile.clone_from(&key.profile);
        }
        self.guests.patch(key, guest, filter)?;
        self.revision += 1;
        Ok(())
    }

    pub fn patch_node(
        &mut self,
        key: &NodeKey,
        mut node: Node,
        filter: &ViewFilter,
    ) -> Result<(), ClusterViewError> {
        if node.profile.is_empty() {
            node.profile.clone_from(&key.profile);
        }
        self.nodes.patch(key, node, filter)?;
        self.revision += 1;
        Ok(())
    }

    /// Merges detail fields fetched once per node into the current entry.
    pub fn patch_node_details(
        &mut self,
        key: &NodeKey,
        details: NodeDetails,
        filter: &ViewFilter,
    ) -> Result<(), ClusterViewError> {
        let current = self
            .nodes
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterViewError::NotFound(key.to_string()))?;
        let mut node = current;
        node.details = details;
        self.patch_node(key, node, filter)
    }

    pub fn refilter(&mut self, filters: &ActiveFilters) {
        self.nodes.refilter(&filters.nodes);
        self.guests.refilter(&filters.guests);
        self.tasks.refilter(&filters.tasks);
    }
}
