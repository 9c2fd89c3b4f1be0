use crate::config::AgentEntryConfig;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// Resolves roles and project membership for role- and project-based delivery.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Role of an agent, or `None` when the agent is unknown to the directory.
    async fn resolve_role(&self, agent_id: &str) -> Result<Option<String>>;

    /// Agents associated with a project, in any order.
    async fn members_of_project(&self, project_id: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
struct Roster {
    roles: HashMap<String, String>,
    projects: HashMap<String, BTreeSet<String>>,
}

/// Directory backed by an in-memory roster, seeded from `[[agents]]` config.
#[derive(Debug, Default)]
pub struct StaticAgentDirectory {
    roster: RwLock<Roster>,
}

impl StaticAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(agents: &[AgentEntryConfig]) -> Self {
        let directory = Self::new();
        for agent in agents {
            directory.set_role(&agent.id, &agent.role);
            for project in &agent.projects {
                directory.assign_project(&agent.id, project);
            }
        }
        directory
    }

    pub fn set_role(&self, agent_id: &str, role: &str) {
        self.roster
            .write()
            .roles
            .insert(agent_id.to_string(), role.to_string());
    }

    pub fn assign_project(&self, agent_id: &str, project_id: &str) {
        self.roster
            .write()
            .projects
            .entry(project_id.to_string())
            .or_default()
            .insert(agent_id.to_string());
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn resolve_role(&self, agent_id: &str) -> Result<Option<String>> {
        Ok(self.roster.read().roles.get(agent_id).cloned())
    }

    async fn members_of_project(&self, project_id: &str) -> Result<Vec<String>> {
        Ok(self
            .roster
            .read()
            .projects
            .get(project_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roster_from_config_resolves_roles_and_projects() {
        let directory = StaticAgentDirectory::from_config(&[
            AgentEntryConfig {
                id: "dev-1".into(),
                role: "developer".into(),
                projects: vec!["hotel".into(), "billing".into()],
                queue: None,
            },
            AgentEntryConfig {
                id: "qa-1".into(),
                role: "qa".into(),
                projects: vec!["hotel".into()],
                queue: None,
            },
        ]);

        assert_eq!(
            directory.resolve_role("dev-1").await.expect("role").as_deref(),
            Some("developer")
        );
        assert!(directory.resolve_role("ghost").await.expect("role").is_none());
        assert_eq!(
            directory.members_of_project("hotel").await.expect("members"),
            vec!["dev-1".to_string(), "qa-1".to_string()]
        );
        assert!(directory
            .members_of_project("unknown")
            .await
            .expect("members")
            .is_empty());
    }
}
