use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_STOPPED: &str = "stopped";

/// The three logical views the dashboard keeps filter and cursor state for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
    Nodes,
    Guests,
    Tasks,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [ViewKind::Nodes, ViewKind::Guests, ViewKind::Tasks];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nodes => "nodes",
            Self::Guests => "guests",
            Self::Tasks => "tasks",
        }
    }

    pub fn next(self) -> Self {
        match self {
            Self::Nodes => Self::Guests,
            Self::Guests => Self::Tasks,
            Self::Tasks => Self::Nodes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    Qemu,
    Lxc,
}

impl GuestType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Lxc => "lxc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub profile: String,
    pub name: String,
}

impl NodeKey {
    pub fn new(profile: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.profile.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.profile, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GuestKey {
    pub profile: String,
    pub node: String,
    pub vmid: u32,
}

impl GuestKey {
    pub fn new(profile: impl Into<String>, node: impl Into<String>, vmid: u32) -> Self {
        Self {
            profile: profile.into(),
            node: node.into(),
            vmid,
        }
    }

    /// Same guest on another node: the key a migration is expected to produce.
    pub fn moved_to(&self, node: impl Into<String>) -> Self {
        Self {
            profile: self.profile.clone(),
            node: node.into(),
            vmid: self.vmid,
        }
    }
}

impl fmt::Display for GuestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.profile.is_empty() {
            write!(f, "{}/{}", self.node, self.vmid)
        } else {
            write!(f, "{}/{}/{}", self.profile, self.node, self.vmid)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Upid(pub String);

impl Upid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity and reconciliation hooks shared by everything the store holds.
pub trait Entity: Clone + fmt::Debug {
    type Key: Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display;

    fn key(&self) -> Self::Key;

    /// True when `self` is the entity `key` referred to before its exact key
    /// changed (a guest migrated to another node keeps its lineage).
    fn continues(&self, _key: &Self::Key) -> bool {
        false
    }

    /// Copies fields the lightweight refresh payload omits from the prior
    /// version of the same entity.
    fn carry_forward(&mut self, _previous: &Self) {}
}

/// Exact key first, then a unique lineage match. Ambiguous lineage is "gone".
pub fn locate<'a, E, I>(items: I, key: &E::Key) -> Option<usize>
where
    E: Entity + 'a,
    I: IntoIterator<Item = &'a E>,
{
    let mut lineage = None;
    let mut lineage_matches = 0usize;
    for (idx, item) in items.into_iter().enumerate() {
        if item.key() == *key {
            return Some(idx);
        }
        if item.continues(key) {
            lineage_matches += 1;
            lineage.get_or_insert(idx);
        }
    }
    if lineage_matches == 1 {
        lineage
    } else {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDetails {
    pub version: Option<String>,
    pub kernel_version: Option<String>,
    pub cpu_model: Option<String>,
    pub load_avg: Option<Vec<String>>,
    pub cgroup_mode: Option<u32>,
    pub level: Option<String>,
}

impl NodeDetails {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub profile: String,
    pub name: String,
    pub online: bool,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub cpu_count: u32,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub memory_total: u64,
    #[serde(default)]
    pub storage_used: u64,
    #[serde(default)]
    pub storage_total: u64,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub details: NodeDetails,
}

impl Node {
    pub fn new(profile: impl Into<String>, name: impl Into<String>, online: bool) -> Self {
        Self {
            profile: profile.into(),
            name: name.into(),
            online,
            ip: String::new(),
            cpu_usage: 0.0,
            cpu_count: 0,
            memory_used: 0,
            memory_total: 0,
            storage_used: 0,
            storage_total: 0,
            uptime: 0,
            details: NodeDetails::default(),
        }
    }

    pub fn status(&self) -> &'static str {
        if self.online {
            "online"
        } else {
            "offline"
        }
    }
}

impl Entity for Node {
    type Key = NodeKey;

    fn key(&self) -> NodeKey {
        NodeKey::new(self.profile.clone(), self.name.clone())
    }

    fn carry_forward(&mut self, previous: &Self) {
        let details = &mut self.details;
        let prior = &previous.details;
        if details.version.is_none() {
            details.version.clone_from(&prior.version);
        }
        if details.kernel_version.is_none() {
            details.kernel_version.clone_from(&prior.kernel_version);
        }
        if details.cpu_model.is_none() {
            details.cpu_model.clone_from(&prior.cpu_model);
        }
        if details.load_avg.is_none() {
            details.load_avg.clone_from(&prior.load_avg);
        }
        if details.cgroup_mode.is_none() {
            details.cgroup_mode = prior.cgroup_mode;
        }
        if details.level.is_none() {
            details.level.clone_from(&prior.level);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guest {
    #[serde(default)]
    pub profile: String,
    pub node: String,
    pub vmid: u32,
    pub name: String,
    pub guest_type: GuestType,
    pub status: String,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub max_mem: u64,
    /// Semicolon separated, as the cluster reports them.
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent_running: Option<bool>,
}

impl Guest {
    pub fn new(
        profile: impl Into<String>,
        node: impl Into<String>,
        vmid: u32,
        name: impl Into<String>,
        guest_type: GuestType,
        status: impl Into<String>,
    ) -> Self {
        Self {
            profile: profile.into(),
            node: node.into(),
            vmid,
            name: name.into(),
            guest_type,
            status: status.into(),
            uptime: 0,
            cpu: 0.0,
            mem: 0,
            max_mem: 0,
            tags: String::new(),
            ip: None,
            description: None,
            agent_running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_RUNNING)
    }

    pub fn tag_list(&self) -> impl Iterator<Item = &str> {
        self.tags
            .split([';', ','])
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
    }
}

impl Entity for Guest {
    type Key = GuestKey;

    fn key(&self) -> GuestKey {
        GuestKey::new(self.profile.clone(), self.node.clone(), self.vmid)
    }

    fn continues(&self, key: &GuestKey) -> bool {
        self.profile == key.profile && self.vmid == key.vmid
    }

    fn carry_forward(&mut self, previous: &Self) {
        if self.ip.is_none() {
            self.ip.clone_from(&previous.ip);
        }
        if self.description.is_none() {
            self.description.clone_from(&previous.description);
        }
        if self.agent_running.is_none() {
            self.agent_running = previous.agent_running;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub upid: Upid,
    #[serde(default)]
    pub profile: String,
    pub node: String,
    pub task_type: String,
    pub status: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub start_time: u64,
    #[serde(default)]
    pub end_time: Option<u64>,
}

impl Task {
    pub fn is_running(&self) -> bool {
        self.end_time.is_none() && self.status.eq_ignore_ascii_case(STATUS_RUNNING)
    }
}

impl Entity for Task {
    type Key = Upid;

    fn key(&self) -> Upid {
        self.upid.clone()
    }
}

/// Everything one full fetch returns, in server order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub guests: Vec<Guest>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest(node: &str, vmid: u32) -> Guest {
        Guest::new("p1", node, vmid, format!("vm-{vmid}"), GuestType::Qemu, "running")
    }

    #[test]
    fn locate_prefers_exact_key_then_unique_lineage() {
        let guests = vec![guest("n1", 100), guest("n2", 101)];
        assert_eq!(locate(&guests, &GuestKey::new("p1", "n2", 101)), Some(1));
        assert_eq!(locate(&guests, &GuestKey::new("p1", "n9", 100)), Some(0));
        assert_eq!(locate(&guests, &GuestKey::new("p2", "n1", 100)), None);

        let rows: Vec<&Guest> = guests.iter().rev().collect();
        assert_eq!(locate(rows.iter().copied(), &GuestKey::new("p1", "n9", 100)), Some(1));
    }

    #[test]
    fn ambiguous_lineage_is_not_a_match() {
        let guests = vec![guest("n1", 100), guest("n2", 100)];
        assert_eq!(locate(&guests, &GuestKey::new("p1", "n3", 100)), None);
        assert_eq!(locate(&guests, &GuestKey::new("p1", "n2", 100)), Some(1));
    }

    #[test]
    fn node_carry_forward_only_fills_missing_details() {
        let mut previous = Node::new("", "pve1", true);
        previous.details.version = Some("8.2".to_string());
        previous.details.kernel_version = Some("6.8".to_string());

        let mut fresh = Node::new("", "pve1", true);
        fresh.details.kernel_version = Some("6.9".to_string());
        fresh.carry_forward(&previous);

        assert_eq!(fresh.details.version.as_deref(), Some("8.2"));
        assert_eq!(fresh.details.kernel_version.as_deref(), Some("6.9"));
    }

    #[test]
    fn tags_split_on_semicolons_and_commas() {
        let mut g = guest("n1", 1);
        g.tags = "prod; web,,db".to_string();
        assert_eq!(g.tag_list().collect::<Vec<_>>(), vec!["prod", "web", "db"]);
    }
}
