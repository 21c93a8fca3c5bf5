use crate::filter::ViewFilter;
use crate::model::{locate, Entity, ViewKind};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cursor {
    Row(usize),
    /// Focus sits on the empty-state placeholder.
    Empty,
}

impl Cursor {
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Row(idx) => Some(idx),
            Self::Empty => None,
        }
    }

    pub fn for_len(idx: usize, len: usize) -> Self {
        if len == 0 {
            Self::Empty
        } else {
            Self::Row(idx.min(len - 1))
        }
    }

    /// Moves by `delta` rows, clamped to the list.
    pub fn step(self, delta: isize, len: usize) -> Self {
        let current = self.index().unwrap_or(0);
        let next = if delta.is_negative() {
            current.saturating_sub(delta.unsigned_abs())
        } else {
            current.saturating_add(delta.unsigned_abs())
        };
        Self::for_len(next, len)
    }
}

/// Identity of the focused row before a mutation, resolved against the rows
/// after it. Falls back to the first row, or the placeholder when empty.
pub fn reconcile<'a, E, I>(focused: Option<&E::Key>, rows: I) -> Cursor
where
    E: Entity + 'a,
    I: IntoIterator<Item = &'a E>,
    I::IntoIter: ExactSizeIterator,
{
    let rows = rows.into_iter();
    let len = rows.len();
    if len == 0 {
        return Cursor::Empty;
    }
    match focused.and_then(|key| locate(rows, key)) {
        Some(idx) => Cursor::Row(idx),
        None => Cursor::Row(0),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchState {
    pub filter: ViewFilter,
    pub selected_index: usize,
}

/// Per-view search records, created on first filter activation.
#[derive(Debug, Clone, Default)]
pub struct SearchStates {
    states: BTreeMap<ViewKind, SearchState>,
}

impl SearchStates {
    pub fn get(&self, kind: ViewKind) -> Option<&SearchState> {
        self.states.get(&kind)
    }

    pub fn activate(&mut self, kind: ViewKind) -> &mut SearchState {
        self.states.entry(kind).or_default()
    }

    pub fn filter(&self, kind: ViewKind) -> ViewFilter {
        self.states
            .get(&kind)
            .map(|state| state.filter.clone())
            .unwrap_or_default()
    }

    pub fn clear(&mut self, kind: ViewKind) -> bool {
        self.states.remove(&kind).is_some()
    }

    pub fn record_selection(&mut self, kind: ViewKind, cursor: Cursor) {
        if let Some(state) = self.states.get_mut(&kind) {
            state.selected_index = cursor.index().unwrap_or(0);
        }
    }

    pub fn filters(&self) -> BTreeMap<ViewKind, ViewFilter> {
        ViewKind::ALL
            .into_iter()
            .map(|kind| (kind, self.filter(kind)))
            .collect()
    }
}
