//! Persistence boundary: this crate defines no CRUD routes of its own. It
//! only consumes `Camera` and `Agent` records from a persistence layer and
//! writes back `status` and `heartbeat` timestamps.
//!
//! This module defines the trait the Orchestrator polls through and an
//! in-memory implementation used by tests and by the integration harness; a
//! real deployment backs `Store` with whatever document database the
//! surrounding platform already runs (schema and migrations for that store
//! are out of scope here).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::model::{Agent, AgentStatus, Camera, CameraStatus};

#[async_trait]
pub trait Store: Send + Sync {
    async fn active_cameras(&self) -> Result<Vec<Camera>>;
    async fn eligible_agents(&self) -> Result<Vec<Agent>>;
    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()>;
    async fn heartbeat_agent(&self, agent_id: &str) -> Result<()>;
}

/// In-memory store backing a standalone run or test harness: cameras/agents
/// read fresh from their maps on each poll tick, no persistence across
/// restarts.
#[derive(Default)]
pub struct InMemoryStore {
    cameras: RwLock<HashMap<String, Camera>>,
    agents: RwLock<HashMap<String, Agent>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn upsert_camera(&self, camera: Camera) {
        self.cameras.write().insert(camera.camera_id.clone(), camera);
    }

    pub fn upsert_agent(&self, agent: Agent) {
        self.agents.write().insert(agent.agent_id.clone(), agent);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn active_cameras(&self) -> Result<Vec<Camera>> {
        Ok(self
            .cameras
            .read()
            .values()
            .filter(|c| c.status == CameraStatus::Active)
            .cloned()
            .collect())
    }

    async fn eligible_agents(&self) -> Result<Vec<Agent>> {
        Ok(self
            .agents
            .read()
            .values()
            .filter(|a| {
                matches!(
                    a.status,
                    AgentStatus::Pending | AgentStatus::Running
                )
            })
            .cloned()
            .collect())
    }

    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        if let Some(agent) = self.agents.write().get_mut(agent_id) {
            agent.status = status;
        }
        Ok(())
    }

    async fn heartbeat_agent(&self, agent_id: &str) -> Result<()> {
        if let Some(agent) = self.agents.write().get_mut(agent_id) {
            agent.last_heartbeat = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MatchMode, RunMode};
    use chrono::Duration;

    fn sample_agent(id: &str, status: AgentStatus) -> Agent {
        let now = Utc::now();
        Agent {
            agent_id: id.to_string(),
            camera_id: "cam-1".to_string(),
            owner_user_id: "u1".to_string(),
            model: "yolov8n".to_string(),
            fps: 5,
            run_mode: RunMode::Continuous,
            patrol_interval_seconds: None,
            patrol_window_seconds: None,
            rules: vec![],
            start_time: now - Duration::seconds(10),
            end_time: now + Duration::hours(1),
            status,
            last_heartbeat: None,
        }
    }

    #[tokio::test]
    async fn eligible_agents_excludes_completed_and_cancelled() {
        let store = InMemoryStore::new();
        store.upsert_agent(sample_agent("a1", AgentStatus::Pending));
        store.upsert_agent(sample_agent("a2", AgentStatus::Completed));
        store.upsert_agent(sample_agent("a3", AgentStatus::Cancelled));
        let eligible = store.eligible_agents().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].agent_id, "a1");
        let _ = MatchMode::Any;
    }

    #[tokio::test]
    async fn heartbeat_updates_timestamp() {
        let store = InMemoryStore::new();
        store.upsert_agent(sample_agent("a1", AgentStatus::Running));
        store.heartbeat_agent("a1").await.unwrap();
        let agents = store.eligible_agents().await.unwrap();
        assert!(agents[0].last_heartbeat.is_some());
    }
}
