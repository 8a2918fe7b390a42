//! Agent registry — known participants and how to reach them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::identity::PeerId;

/// A known participant in the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Network address of the node hosting the agent, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: BTreeSet::new(),
            metadata: serde_json::Map::new(),
            address: None,
            last_seen: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Whether this agent has every one of `required`.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Mark the agent as seen now.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Build an entry from registration metadata. A `capabilities` array in
    /// the metadata becomes the capability set.
    pub fn from_registration(
        agent_id: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let capabilities = metadata
            .get("capabilities")
            .and_then(|c| c.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            agent_id: agent_id.to_string(),
            capabilities,
            metadata,
            address: None,
            last_seen: Utc::now(),
        }
    }
}

/// The agent registry of one topology instance, plus the connection each
/// reachable agent is routed through.
///
/// Agents without a route are hosted in-process by the owning node.
#[derive(Debug, Default)]
pub struct AgentDirectory {
    agents: HashMap<String, AgentInfo>,
    routes: HashMap<String, PeerId>,
}

/// Shared handle used by a topology and its transport resolver.
pub type SharedDirectory = Arc<parking_lot::RwLock<AgentDirectory>>;

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedDirectory {
        Arc::new(parking_lot::RwLock::new(Self::new()))
    }

    /// Insert a new agent. Fails if the id is already registered.
    pub fn register(&mut self, info: AgentInfo, route: Option<PeerId>) -> Result<(), NetworkError> {
        if self.agents.contains_key(&info.agent_id) {
            return Err(NetworkError::DuplicateAgent(info.agent_id));
        }
        self.upsert(info, route);
        Ok(())
    }

    /// Insert or replace an agent (re-announce).
    pub fn upsert(&mut self, info: AgentInfo, route: Option<PeerId>) {
        match route {
            Some(peer) => {
                self.routes.insert(info.agent_id.clone(), peer);
            }
            None => {
                self.routes.remove(&info.agent_id);
            }
        }
        self.agents.insert(info.agent_id.clone(), info);
    }

    /// Drop an agent and its route, local or remote.
    pub fn remove(&mut self, agent_id: &str) -> Option<AgentInfo> {
        self.routes.remove(agent_id);
        self.agents.remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentInfo> {
        self.agents.get(agent_id)
    }

    /// Whether the agent is known at all, local or remote.
    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// The connection `agent_id` is reached through, if any.
    pub fn route(&self, agent_id: &str) -> Option<&PeerId> {
        self.routes.get(agent_id)
    }

    /// Whether the agent is registered and hosted in-process.
    pub fn is_local(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id) && !self.routes.contains_key(agent_id)
    }

    /// Agents hosted in-process, i.e. those without a route.
    pub fn local_agents(&self) -> Vec<AgentInfo> {
        self.agents
            .values()
            .filter(|a| !self.routes.contains_key(&a.agent_id))
            .cloned()
            .collect()
    }

    /// Ids of every agent routed through `peer_id`.
    pub fn agents_via(&self, peer_id: &PeerId) -> Vec<String> {
        self.routes
            .iter()
            .filter(|(_, p)| *p == peer_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove every agent routed through `peer_id`.
    pub fn remove_via(&mut self, peer_id: &PeerId) -> Vec<AgentInfo> {
        self.agents_via(peer_id)
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect()
    }

    /// Refresh `last_seen` for one agent. Unknown ids are ignored.
    pub fn touch(&mut self, agent_id: &str) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.touch();
        }
    }

    /// Agents whose capability set is a superset of `capabilities`.
    /// An empty filter matches everyone.
    pub fn discover(&self, capabilities: &[String]) -> Vec<AgentInfo> {
        let mut found: Vec<AgentInfo> = self
            .agents
            .values()
            .filter(|a| a.has_capabilities(capabilities))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        found
    }

    /// Remove routed (remote) agents not seen since `cutoff`.
    pub fn prune_stale(&mut self, cutoff: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .agents
            .values()
            .filter(|a| self.routes.contains_key(&a.agent_id) && a.last_seen < cutoff)
            .map(|a| a.agent_id.clone())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn clear(&mut self) {
        self.agents.clear();
        self.routes.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let mut dir = AgentDirectory::new();
        dir.register(AgentInfo::new("alice"), None).unwrap();
        let err = dir.register(AgentInfo::new("alice"), None).unwrap_err();
        assert!(matches!(err, NetworkError::DuplicateAgent(id) if id == "alice"));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_upsert_replaces_entry() {
        let mut dir = AgentDirectory::new();
        dir.upsert(AgentInfo::new("bob").with_capabilities(["x"]), Some(PeerId::from_string("p1")));
        dir.upsert(AgentInfo::new("bob").with_capabilities(["y"]), Some(PeerId::from_string("p2")));

        assert_eq!(dir.len(), 1);
        assert!(dir.get("bob").unwrap().capabilities.contains("y"));
        assert_eq!(dir.route("bob"), Some(&PeerId::from_string("p2")));
    }

    #[test]
    fn test_uniqueness_across_operations() {
        let mut dir = AgentDirectory::new();
        for round in 0..3 {
            let _ = dir.register(AgentInfo::new("a"), None);
            dir.upsert(AgentInfo::new("a"), Some(PeerId::from_string(format!("p{round}"))));
            let _ = dir.register(AgentInfo::new("b"), None);
            dir.remove("b");
        }
        assert_eq!(dir.discover(&[]).iter().filter(|a| a.agent_id == "a").count(), 1);
        assert!(!dir.contains("b"));
    }

    #[test]
    fn test_discover_is_and_filter() {
        let mut dir = AgentDirectory::new();
        dir.register(AgentInfo::new("only-x").with_capabilities(["x"]), None).unwrap();
        dir.register(AgentInfo::new("x-and-y").with_capabilities(["x", "y"]), None).unwrap();
        dir.register(AgentInfo::new("xyz").with_capabilities(["x", "y", "z"]), None).unwrap();

        let found: Vec<String> = dir
            .discover(&caps(&["x", "y"]))
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        assert_eq!(found, vec!["x-and-y".to_string(), "xyz".to_string()]);
        assert_eq!(dir.discover(&[]).len(), 3);
    }

    #[test]
    fn test_local_vs_routed() {
        let mut dir = AgentDirectory::new();
        let peer = PeerId::from_string("peer-1");
        dir.register(AgentInfo::new("local"), None).unwrap();
        dir.register(AgentInfo::new("remote-1"), Some(peer.clone())).unwrap();
        dir.register(AgentInfo::new("remote-2"), Some(peer.clone())).unwrap();

        assert!(dir.is_local("local"));
        assert!(!dir.is_local("remote-1"));
        assert_eq!(dir.local_agents().len(), 1);

        let mut removed: Vec<String> = dir.remove_via(&peer).into_iter().map(|a| a.agent_id).collect();
        removed.sort();
        assert_eq!(removed, vec!["remote-1".to_string(), "remote-2".to_string()]);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_prune_only_touches_remote_agents() {
        let mut dir = AgentDirectory::new();
        let mut old_local = AgentInfo::new("local");
        old_local.last_seen = Utc::now() - chrono::Duration::minutes(10);
        let mut old_remote = AgentInfo::new("remote");
        old_remote.last_seen = Utc::now() - chrono::Duration::minutes(10);

        dir.register(old_local, None).unwrap();
        dir.register(old_remote, Some(PeerId::from_string("p"))).unwrap();

        let pruned = dir.prune_stale(Utc::now() - chrono::Duration::minutes(1));
        assert_eq!(pruned, vec!["remote".to_string()]);
        assert!(dir.contains("local"));
    }

    #[test]
    fn test_from_registration_reads_capabilities() {
        let meta = serde_json::json!({"capabilities": ["chat", "search"], "name": "Alice"});
        let info = AgentInfo::from_registration("alice", meta.as_object().cloned().unwrap());
        assert!(info.has_capabilities(&caps(&["chat", "search"])));
        assert_eq!(info.metadata["name"], "Alice");
    }
}
