use crate::model::{Guest, Node, Task};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const ANY: &str = "Any";

/// Attributes a structured predicate can constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    Status,
    Kind,
    Node,
    Tags,
}

pub trait Filterable {
    /// Display fields the free-text filter searches, in a fixed order.
    fn search_fields(&self) -> Vec<String>;

    /// Value for a structured facet; `None` when the entity has no such
    /// attribute, which never satisfies an active constraint.
    fn facet(&self, facet: Facet) -> Option<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredFilter {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub tag_contains: String,
}

impl StructuredFilter {
    pub fn is_empty(&self) -> bool {
        self.constraints().next().is_none()
    }

    fn constraints(&self) -> impl Iterator<Item = (Facet, &str)> {
        [
            (Facet::Status, self.status.as_str()),
            (Facet::Kind, self.kind.as_str()),
            (Facet::Node, self.node.as_str()),
            (Facet::Tags, self.tag_contains.as_str()),
        ]
        .into_iter()
        .filter_map(|(facet, value)| constraint(value).map(|value| (facet, value)))
    }

    pub fn matches<E: Filterable + ?Sized>(&self, entity: &E) -> bool {
        self.constraints().all(|(facet, wanted)| {
            let Some(actual) = entity.facet(facet) else {
                return false;
            };
            match facet {
                Facet::Tags => contains_ignore_case(&actual, wanted),
                _ => actual.eq_ignore_ascii_case(wanted),
            }
        })
    }
}

/// Text plus structured predicates for one logical view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewFilter {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub structured: StructuredFilter,
}

impl ViewFilter {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured: StructuredFilter::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.structured.is_empty()
    }

    /// Number of active criteria, text included.
    pub fn active_criteria(&self) -> usize {
        usize::from(!self.text.trim().is_empty()) + self.structured.constraints().count()
    }

    pub fn matches<E: Filterable + ?Sized>(&self, entity: &E) -> bool {
        matches_text(entity, &self.text) && self.structured.matches(entity)
    }
}

fn constraint(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case(ANY) {
        None
    } else {
        Some(value)
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

pub fn matches_text<E: Filterable + ?Sized>(entity: &E, text: &str) -> bool {
    let needle = text.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    entity
        .search_fields()
        .iter()
        .any(|field| field.to_lowercase().contains(&needle))
}

/// Indices into `original` that pass `filter`, in their original order.
pub fn apply<E: Filterable>(original: &[E], filter: &ViewFilter) -> Vec<usize> {
    original
        .iter()
        .enumerate()
        .filter(|(_, entity)| filter.matches(*entity))
        .map(|(idx, _)| idx)
        .collect()
}

pub fn distinct_statuses(guests: &[Guest]) -> Vec<String> {
    guests
        .iter()
        .map(|guest| guest.status.to_lowercase())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Next option after `current` in `Any, options...`, wrapping back to `Any`.
pub fn cycle_option(current: &str, options: &[String]) -> String {
    let Some(current) = constraint(current) else {
        return options.first().cloned().unwrap_or_default();
    };
    match options
        .iter()
        .position(|option| option.eq_ignore_ascii_case(current))
    {
        Some(idx) if idx + 1 < options.len() => options[idx + 1].clone(),
        _ => String::new(),
    }
}

impl Filterable for Node {
    fn search_fields(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.ip.clone(),
            self.status().to_string(),
            self.profile.clone(),
        ]
    }

    fn facet(&self, facet: Facet) -> Option<String> {
        match facet {
            Facet::Status => Some(self.status().to_string()),
            Facet::Node => Some(self.name.clone()),
            Facet::Kind | Facet::Tags => None,
        }
    }
}

impl Filterable for Guest {
    fn search_fields(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.vmid.to_string(),
            self.guest_type.as_str().to_string(),
            self.status.clone(),
            self.node.clone(),
            self.tags.clone(),
            self.profile.clone(),
        ]
    }

    fn facet(&self, facet: Facet) -> Option<String> {
        match facet {
            Facet::Status => Some(self.status.clone()),
            Facet::Kind => Some(self.guest_type.as_str().to_string()),
            Facet::Node => Some(self.node.clone()),
            Facet::Tags => Some(self.tags.clone()),
        }
    }
}

impl Filterable for Task {
    fn search_fields(&self) -> Vec<String> {
        vec![
            self.upid.to_string(),
            self.task_type.clone(),
            self.status.clone(),
            self.node.clone(),
            self.user.clone(),
            self.vmid.map(|id| id.to_string()).unwrap_or_default(),
        ]
    }

    fn facet(&self, facet: Facet) -> Option<String> {
        match facet {
            Facet::Status => Some(self.status.clone()),
            Facet::Kind => Some(self.task_type.clone()),
            Facet::Node => Some(self.node.clone()),
            Facet::Tags => None,
        }
    }
}
