//! Reconciliation loop: poll the store every `poll_interval`, diff desired
//! vs. running, start/stop/reap accordingly. Never holds a lock across I/O —
//! each tick reads the store, then mutates only its own local registries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::WebRtcConfig;
use crate::db::Store;
use crate::detection::{self, DetectionWorkerHandle};
use crate::event_session::EventSessionManager;
use crate::frame_hub::{self, FrameHubHandle};
use crate::frame_store::FrameStore;
use crate::model::AgentStatus;
use crate::webrtc::{self, PeerKind, WebRtcPeerHandle};

pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub webrtc: WebRtcConfig,
    pub signaling_url: String,
    pub default_fps: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            webrtc: WebRtcConfig::default(),
            signaling_url: "ws://127.0.0.1:9000/signaling".to_string(),
            default_fps: 5,
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    frame_store: Arc<FrameStore>,
    sessions: Arc<EventSessionManager>,
    config: OrchestratorConfig,
    frame_hubs: HashMap<String, FrameHubHandle>,
    workers: HashMap<String, DetectionWorkerHandle>,
    camera_peers: HashMap<String, WebRtcPeerHandle>,
    agent_peers: HashMap<String, WebRtcPeerHandle>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        frame_store: Arc<FrameStore>,
        sessions: Arc<EventSessionManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            frame_store,
            sessions,
            config,
            frame_hubs: HashMap::new(),
            workers: HashMap::new(),
            camera_peers: HashMap::new(),
            agent_peers: HashMap::new(),
        }
    }

    /// Runs until `stop` resolves. Each tick is a single reconciliation pass.
    pub async fn run(mut self, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        warn!(error = %err, "reconciliation tick failed");
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        self.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    async fn reconcile(&mut self) -> anyhow::Result<()> {
        self.reconcile_cameras().await?;
        self.reconcile_agents().await?;
        self.reap_dead_hubs();
        Ok(())
    }

    async fn reconcile_cameras(&mut self) -> anyhow::Result<()> {
        let cameras = self.store.active_cameras().await?;
        let active_ids: std::collections::HashSet<String> =
            cameras.iter().map(|c| c.camera_id.clone()).collect();

        for camera in &cameras {
            if !self.frame_hubs.contains_key(&camera.camera_id) {
                info!(camera_id = %camera.camera_id, "starting frame hub");
                let handle = frame_hub::spawn(
                    camera.camera_id.clone(),
                    camera.stream_url.clone(),
                    self.frame_store.clone(),
                );
                self.frame_hubs.insert(camera.camera_id.clone(), handle);
            }
            if !self.camera_peers.contains_key(&camera.camera_id) {
                let peer = webrtc::spawn(
                    PeerKind::Camera {
                        camera_id: camera.camera_id.clone(),
                        owner_user_id: camera.owner_user_id.clone(),
                    },
                    self.config.signaling_url.clone(),
                    self.config.webrtc.clone(),
                    self.frame_store.clone(),
                    self.config.default_fps,
                );
                self.camera_peers.insert(camera.camera_id.clone(), peer);
            }
        }

        let stale: Vec<String> = self
            .frame_hubs
            .keys()
            .filter(|id| !active_ids.contains(*id))
            .cloned()
            .collect();
        for camera_id in stale {
            if let Some(handle) = self.frame_hubs.remove(&camera_id) {
                info!(camera_id = %camera_id, "stopping frame hub");
                handle.stop().await;
            }
        }

        let stale_peers: Vec<String> = self
            .camera_peers
            .keys()
            .filter(|id| !active_ids.contains(*id))
            .cloned()
            .collect();
        for camera_id in stale_peers {
            if let Some(peer) = self.camera_peers.remove(&camera_id) {
                info!(camera_id = %camera_id, "stopping camera webrtc peer");
                peer.stop().await;
            }
        }

        Ok(())
    }

    async fn reconcile_agents(&mut self) -> anyhow::Result<()> {
        let agents = self.store.eligible_agents().await?;
        let now = Utc::now();
        let mut eligible_ids = std::collections::HashSet::new();

        for mut agent in agents {
            if agent.is_expired(now) {
                if agent.status != AgentStatus::Completed {
                    self.store
                        .set_agent_status(&agent.agent_id, AgentStatus::Completed)
                        .await?;
                }
                continue;
            }
            if !agent.is_in_window(now) {
                // not yet started, stays PENDING
                continue;
            }

            eligible_ids.insert(agent.agent_id.clone());

            if !self.workers.contains_key(&agent.agent_id) {
                agent.status = AgentStatus::Running;
                self.store
                    .set_agent_status(&agent.agent_id, AgentStatus::Running)
                    .await?;
                info!(agent_id = %agent.agent_id, "starting detection worker");
                let agent_id = agent.agent_id.clone();
                let camera_id = agent.camera_id.clone();
                let owner_user_id = agent.owner_user_id.clone();
                let fps = agent.fps;
                let handle = detection::spawn(
                    agent,
                    self.frame_store.clone(),
                    self.sessions.clone(),
                    self.store.clone(),
                );
                self.workers.insert(handle.agent_id.clone(), handle);

                let peer = webrtc::spawn(
                    PeerKind::Agent {
                        camera_id,
                        agent_id: agent_id.clone(),
                        owner_user_id,
                    },
                    self.config.signaling_url.clone(),
                    self.config.webrtc.clone(),
                    self.frame_store.clone(),
                    fps,
                );
                self.agent_peers.insert(agent_id, peer);
            }
        }

        let stale: Vec<String> = self
            .workers
            .keys()
            .filter(|id| !eligible_ids.contains(*id))
            .cloned()
            .collect();
        for agent_id in stale {
            if let Some(handle) = self.workers.remove(&agent_id) {
                info!(agent_id = %agent_id, "stopping detection worker (no longer eligible)");
                handle.stop().await;
            }
            if let Some(peer) = self.agent_peers.remove(&agent_id) {
                peer.stop().await;
            }
        }

        Ok(())
    }

    /// If a FrameHub or worker task died unexpectedly, drop its handle so the
    /// next tick restarts it: a FrameHub or worker that dies unexpectedly
    /// gets restarted on the following reconciliation pass.
    fn reap_dead_hubs(&mut self) {
        self.frame_hubs.retain(|id, handle| {
            if handle.is_finished() {
                warn!(camera_id = %id, "frame hub exited unexpectedly, will restart next tick");
                false
            } else {
                true
            }
        });
        self.workers.retain(|id, handle| {
            if handle.is_finished() {
                warn!(agent_id = %id, "detection worker exited unexpectedly, will restart next tick");
                false
            } else {
                true
            }
        });
    }

    async fn shutdown(mut self) {
        info!("orchestrator shutting down, stopping all tasks");
        for (_, handle) in self.frame_hubs.drain() {
            handle.stop().await;
        }
        for (_, handle) in self.workers.drain() {
            handle.stop().await;
        }
        for (_, peer) in self.camera_peers.drain() {
            peer.stop().await;
        }
        for (_, peer) in self.agent_peers.drain() {
            peer.stop().await;
        }
        self.sessions.flush_all().await;
    }
}
