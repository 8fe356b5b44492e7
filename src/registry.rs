//! Agent registry — which agents exist, what they can do, how busy they are.
//!
//! The persisted record (`agents.json`) is rewritten atomically after every
//! mutation; reads go through an in-memory cache populated at load time and
//! kept in sync by every mutator. Workload is never a shadow counter: it is
//! computed by counting live task documents in the agent's workspace, so
//! capacity stays consistent with on-disk reality even after a crash.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{CapacityError, Error, RegistryError, VaultError};
use crate::task::descriptor;
use crate::vault::{Location, Vault};

/// Agent availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Unresponsive,
}

/// A worker capable of executing tasks of certain types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier; duplicate registrations are rejected.
    pub id: String,
    /// Capability tags this agent declares.
    pub capabilities: BTreeSet<String>,
    /// Overall concurrent task ceiling.
    pub max_concurrent_tasks: usize,
    /// Optional per-task-type ceilings.
    #[serde(default)]
    pub type_limits: HashMap<String, usize>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
        max_concurrent_tasks: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            max_concurrent_tasks,
            type_limits: HashMap::new(),
            status: AgentStatus::Active,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn with_type_limit(mut self, task_type: impl Into<String>, limit: usize) -> Self {
        self.type_limits.insert(task_type.into(), limit);
        self
    }
}

/// Source of truth for agent membership, capability, and capacity.
pub struct AgentRegistry {
    vault: Arc<Vault>,
    agents: RwLock<HashMap<String, Agent>>,
    /// Per-agent exclusive sections for check-then-reserve.
    reserve_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentRegistry {
    /// Load the registry from the vault, or start empty if no record exists.
    pub async fn load(vault: Arc<Vault>) -> Result<Self, RegistryError> {
        let path = vault.registry_path();
        let agents = if path.exists() {
            let content = vault.read_doc(&path).await?;
            let list: Vec<Agent> = serde_json::from_str(&content)
                .map_err(|e| RegistryError::Persist(e.to_string()))?;
            list.into_iter().map(|a| (a.id.clone(), a)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            vault,
            agents: RwLock::new(agents),
            reserve_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Atomically rewrite the persisted record from the current cache.
    async fn persist(&self, agents: &HashMap<String, Agent>) -> Result<(), RegistryError> {
        let mut list: Vec<&Agent> = agents.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| RegistryError::Persist(e.to_string()))?;
        self.vault
            .write_atomic(&self.vault.registry_path(), &json)
            .await?;
        Ok(())
    }

    /// Register a new agent and provision its workspace.
    pub async fn register(&self, agent: Agent) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.id) {
            return Err(RegistryError::DuplicateAgent { id: agent.id });
        }
        self.vault.provision_agent_workspace(&agent.id).await?;
        tracing::info!(agent = %agent.id, capabilities = ?agent.capabilities, "Registered agent");
        agents.insert(agent.id.clone(), agent);
        self.persist(&agents).await
    }

    /// Remove an agent. Refused while it still holds in-flight tasks.
    pub async fn deregister(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        if !agents.contains_key(agent_id) {
            return Err(RegistryError::UnknownAgent {
                id: agent_id.to_string(),
            });
        }
        let in_flight = self.workspace_docs(agent_id).await?.len();
        if in_flight > 0 {
            return Err(RegistryError::AgentBusy {
                id: agent_id.to_string(),
                in_flight,
            });
        }
        agents.remove(agent_id);
        tracing::info!(agent = %agent_id, "Deregistered agent");
        self.persist(&agents).await
    }

    /// Record a heartbeat; an unresponsive agent transitions back to active.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent {
                id: agent_id.to_string(),
            })?;
        agent.last_heartbeat = Utc::now();
        if agent.status == AgentStatus::Unresponsive {
            agent.status = AgentStatus::Active;
            tracing::info!(agent = %agent_id, "Agent responsive again");
        }
        self.persist(&agents).await
    }

    /// Mark active agents with stale heartbeats unresponsive.
    ///
    /// Returns the ids that changed.
    pub async fn mark_stale_unresponsive(
        &self,
        timeout: Duration,
    ) -> Result<Vec<String>, RegistryError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut agents = self.agents.write().await;
        let mut changed = Vec::new();
        for agent in agents.values_mut() {
            if agent.status == AgentStatus::Active && agent.last_heartbeat < cutoff {
                agent.status = AgentStatus::Unresponsive;
                changed.push(agent.id.clone());
            }
        }
        if !changed.is_empty() {
            tracing::warn!(agents = ?changed, "Heartbeat timeout, marked unresponsive");
            self.persist(&agents).await?;
        }
        Ok(changed)
    }

    /// Snapshot of all active agents.
    pub async fn list_active(&self) -> Vec<Agent> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.status == AgentStatus::Active)
            .cloned()
            .collect()
    }

    /// All agents whose capability set contains the tag.
    pub async fn find_by_capability(&self, tag: &str) -> Vec<Agent> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.capabilities.contains(tag))
            .cloned()
            .collect()
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    async fn workspace_docs(&self, agent_id: &str) -> Result<Vec<PathBuf>, VaultError> {
        self.vault
            .list_docs(&Location::InProgress(agent_id.to_string()))
            .await
    }

    /// Count of task documents currently owned by the agent.
    pub async fn current_workload(&self, agent_id: &str) -> Result<usize, RegistryError> {
        if !self.agents.read().await.contains_key(agent_id) {
            return Err(RegistryError::UnknownAgent {
                id: agent_id.to_string(),
            });
        }
        Ok(self.workspace_docs(agent_id).await?.len())
    }

    /// Count of owned tasks of one type, read from their frontmatter.
    async fn workload_for_type(
        &self,
        agent_id: &str,
        task_type: &str,
    ) -> Result<usize, RegistryError> {
        let mut count = 0;
        for path in self.workspace_docs(agent_id).await? {
            let Ok(content) = self.vault.read_doc(&path).await else {
                continue; // raced with a relocation
            };
            if let Ok(header) = descriptor::parse_header(&content)
                && header.get("type").and_then(|v| v.as_str()) == Some(task_type)
            {
                count += 1;
            }
        }
        Ok(count)
    }

    /// True iff the agent's overall workload is below its ceiling.
    pub async fn has_capacity(&self, agent_id: &str) -> Result<bool, RegistryError> {
        let max = self
            .get(agent_id)
            .await
            .ok_or_else(|| RegistryError::UnknownAgent {
                id: agent_id.to_string(),
            })?
            .max_concurrent_tasks;
        Ok(self.current_workload(agent_id).await? < max)
    }

    /// True iff overall capacity holds and any per-type ceiling also holds.
    pub async fn has_capacity_for_type(
        &self,
        agent_id: &str,
        task_type: Option<&str>,
    ) -> Result<bool, RegistryError> {
        Ok(self.check_capacity(agent_id, task_type).await?.is_ok())
    }

    /// Capacity check that reports which constraint failed.
    async fn check_capacity(
        &self,
        agent_id: &str,
        task_type: Option<&str>,
    ) -> Result<std::result::Result<(), CapacityError>, RegistryError> {
        let agent = self
            .get(agent_id)
            .await
            .ok_or_else(|| RegistryError::UnknownAgent {
                id: agent_id.to_string(),
            })?;

        if self.current_workload(agent_id).await? >= agent.max_concurrent_tasks {
            return Ok(Err(CapacityError::AgentFull {
                id: agent.id,
                max: agent.max_concurrent_tasks,
            }));
        }

        if let Some(task_type) = task_type
            && let Some(&limit) = agent.type_limits.get(task_type)
            && self.workload_for_type(agent_id, task_type).await? >= limit
        {
            return Ok(Err(CapacityError::TypeCeilingReached {
                id: agent.id,
                task_type: task_type.to_string(),
                limit,
            }));
        }

        Ok(Ok(()))
    }

    /// Check capacity and, in the same exclusive section, relocate the task
    /// document into the agent's workspace.
    ///
    /// The per-agent lock makes check-then-reserve atomic: two concurrent
    /// reservations against an agent with room for one cannot both succeed.
    pub async fn reserve(
        &self,
        agent_id: &str,
        task_path: &Path,
        task_type: Option<&str>,
    ) -> Result<PathBuf, Error> {
        let lock = {
            let mut locks = self.reserve_locks.lock().await;
            Arc::clone(
                locks
                    .entry(agent_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = lock.lock().await;

        self.check_capacity(agent_id, task_type)
            .await
            .map_err(Error::Registry)?
            .map_err(Error::Capacity)?;

        let dest = self
            .vault
            .relocate(task_path, &Location::InProgress(agent_id.to_string()))
            .await
            .map_err(Error::Vault)?;
        tracing::info!(agent = %agent_id, task = %dest.display(), "Reserved task");
        Ok(dest)
    }
}
