//! Per-agent detection worker: one task per running agent, pacing frame
//! pulls to the agent's configured FPS and driving each tick through model
//! inference and rule evaluation.

pub mod annotate;
mod model;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

pub use model::{ModelRunner, NullModelRunner};

use crate::db::Store;
use crate::event_session::{EventContext, EventSessionManager};
use crate::frame_store::FrameStore;
use crate::model::{Agent, Detections, Rule, RunMode};
use crate::rules::{self, RuleEngineState};

const MAX_SKIP_BACKOFF: Duration = Duration::from_millis(50);

pub struct DetectionWorkerHandle {
    pub agent_id: String,
    stop_tx: tokio::sync::watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl DetectionWorkerHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(1), self.join)
            .await
            .is_err()
        {
            warn!(agent_id = %self.agent_id, "detection worker join timed out, abandoning");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub fn spawn(
    agent: Agent,
    frame_store: Arc<FrameStore>,
    sessions: Arc<EventSessionManager>,
    store: Arc<dyn Store>,
) -> DetectionWorkerHandle {
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let agent_id = agent.agent_id.clone();
    let join = tokio::spawn(run_worker(
        agent,
        frame_store,
        sessions,
        store,
        Arc::new(NullModelRunner),
        stop_rx,
    ));
    DetectionWorkerHandle {
        agent_id,
        stop_tx,
        join,
    }
}

fn target_classes(rules: &[Rule]) -> (HashSet<String>, bool) {
    let mut classes = HashSet::new();
    let mut needs_skeleton = false;
    for rule in rules {
        match rule {
            Rule::ClassPresence { classes: c, .. } => classes.extend(c.iter().cloned()),
            Rule::CountAtLeast { class, .. } | Rule::ClassCount { class, .. } => {
                classes.insert(class.clone());
            }
            Rule::AccidentPresence { .. } => {
                classes.insert("person".to_string());
                needs_skeleton = true;
            }
        }
    }
    (classes, needs_skeleton)
}

async fn run_worker(
    agent: Agent,
    frame_store: Arc<FrameStore>,
    sessions: Arc<EventSessionManager>,
    store: Arc<dyn Store>,
    model_runner: Arc<dyn ModelRunner>,
    mut stop_rx: tokio::sync::watch::Receiver<bool>,
) {
    let ctx = EventContext {
        agent_id: agent.agent_id.clone(),
        agent_name: None,
        camera_id: agent.camera_id.clone(),
        owner_user_id: agent.owner_user_id.clone(),
        device_id: None,
    };
    let (target_classes, needs_skeleton) = target_classes(&agent.rules);
    let mut rule_state = RuleEngineState::new();
    let mut last_seen: u64 = 0;
    let mut next_tick = Instant::now();
    let tick_interval = Duration::from_secs_f64(1.0 / agent.fps.max(1) as f64);

    info!(agent_id = %agent.agent_id, mode = ?agent.run_mode, "detection worker started");

    match agent.run_mode {
        RunMode::Continuous => loop {
            if *stop_rx.borrow() || Utc::now() >= agent.end_time {
                break;
            }
            if run_tick(
                &agent,
                &ctx,
                &frame_store,
                &sessions,
                &store,
                model_runner.as_ref(),
                &target_classes,
                needs_skeleton,
                &mut rule_state,
                &mut last_seen,
                &mut next_tick,
                tick_interval,
                &mut stop_rx,
            )
            .await
            {
                break;
            }
        },
        RunMode::Patrol => {
            let interval = Duration::from_secs(agent.patrol_interval_seconds.unwrap_or(60));
            let window = Duration::from_secs(agent.patrol_window_seconds.unwrap_or(10));
            'patrol: loop {
                if *stop_rx.borrow() || Utc::now() >= agent.end_time {
                    break;
                }
                if sleep_with_heartbeat(interval, &agent.agent_id, &store, &mut stop_rx).await {
                    break;
                }

                // per-window rule state reset: drops duration-gate progress
                // across windows
                rule_state.reset();
                last_seen = 0;
                next_tick = Instant::now();
                let window_deadline = Instant::now() + window;

                while Instant::now() < window_deadline {
                    if *stop_rx.borrow() || Utc::now() >= agent.end_time {
                        break 'patrol;
                    }
                    if run_tick(
                        &agent,
                        &ctx,
                        &frame_store,
                        &sessions,
                        &store,
                        model_runner.as_ref(),
                        &target_classes,
                        needs_skeleton,
                        &mut rule_state,
                        &mut last_seen,
                        &mut next_tick,
                        tick_interval,
                        &mut stop_rx,
                    )
                    .await
                    {
                        break 'patrol;
                    }
                }
            }
        }
    }

    let final_status = if Utc::now() >= agent.end_time {
        crate::model::AgentStatus::Completed
    } else {
        crate::model::AgentStatus::Cancelled
    };
    let _ = store.set_agent_status(&agent.agent_id, final_status).await;
    info!(agent_id = %agent.agent_id, "detection worker stopped");
}

/// Sleeps for `duration`, heartbeating partway through so long patrol
/// intervals still show liveness. Returns `true` if stop was requested.
async fn sleep_with_heartbeat(
    duration: Duration,
    agent_id: &str,
    store: &Arc<dyn Store>,
    stop_rx: &mut tokio::sync::watch::Receiver<bool>,
) -> bool {
    let heartbeat_every = Duration::from_secs(10).min(duration);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        let step = remaining.min(heartbeat_every);
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return true;
                }
            }
        }
        let _ = store.heartbeat_agent(agent_id).await;
        remaining = remaining.saturating_sub(step);
    }
    false
}

/// One detection tick. Returns `true` if the worker should stop.
#[allow(clippy::too_many_arguments)]
async fn run_tick(
    agent: &Agent,
    ctx: &EventContext,
    frame_store: &Arc<FrameStore>,
    sessions: &Arc<EventSessionManager>,
    store: &Arc<dyn Store>,
    model_runner: &dyn ModelRunner,
    target_classes: &HashSet<String>,
    needs_skeleton: bool,
    rule_state: &mut RuleEngineState,
    last_seen: &mut u64,
    next_tick: &mut Instant,
    tick_interval: Duration,
    stop_rx: &mut tokio::sync::watch::Receiver<bool>,
) -> bool {
    let now = Instant::now();
    if now < *next_tick {
        tokio::select! {
            _ = tokio::time::sleep(*next_tick - now) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return true;
                }
            }
        }
    }
    // drift-compensating pacer
    *next_tick = (*next_tick + tick_interval).max(Instant::now());

    let Some(frame) = frame_store.get(&agent.camera_id) else {
        tokio::time::sleep(MAX_SKIP_BACKOFF).await;
        return false;
    };
    if let Some(message) = &frame.error {
        debug!(agent_id = %agent.agent_id, camera_id = %agent.camera_id, error = %message, "ingest broken, skipping tick");
        tokio::time::sleep(MAX_SKIP_BACKOFF).await;
        return false;
    }
    if frame.width == 0 || frame.height == 0 {
        tokio::time::sleep(MAX_SKIP_BACKOFF).await;
        return false;
    }
    if frame.frame_index == *last_seen {
        tokio::time::sleep(MAX_SKIP_BACKOFF).await;
        return false;
    }
    let skipped = frame.frame_index.saturating_sub(*last_seen).saturating_sub(1);
    if skipped > 0 {
        debug!(agent_id = %agent.agent_id, skipped, "skipped frames since last tick");
    }
    *last_seen = frame.frame_index;

    let mut detections = Detections::empty(DateTime::<Utc>::from(frame.produced_at));
    match model_runner.run(&agent.model, &frame) {
        Ok(d) => detections = d,
        Err(err) => {
            warn!(agent_id = %agent.agent_id, error = %err, "model invocation failed, skipping frame");
        }
    }
    let _ = &mut detections;

    if !target_classes.is_empty() {
        let annotated = annotate::annotate(&frame, &detections, target_classes, needs_skeleton);
        frame_store.put(format!("{}:{}", agent.camera_id, agent.agent_id), annotated);
    }

    let now_utc = Utc::now();
    let outcome = rules::evaluate(&agent.rules, &detections, rule_state, now_utc);

    if let Some(primary) = outcome.primary {
        let summary: Vec<String> = primary
            .matched_indices
            .iter()
            .filter_map(|&i| detections.classes.get(i).cloned())
            .collect();
        sessions
            .handle_event_frame(
                ctx.clone(),
                primary.rule_index,
                primary.label,
                frame.as_ref().clone(),
                summary,
                agent.fps,
                now_utc,
            )
            .await;
    }

    let _ = store.heartbeat_agent(&agent.agent_id).await;
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn target_classes_collects_every_rule_kind() {
        let rules = vec![
            Rule::ClassPresence {
                r#match: crate::model::MatchMode::Any,
                classes: HashSet::from(["dog".to_string()]),
                duration_s: None,
                label: None,
            },
            Rule::AccidentPresence { label: None },
        ];
        let (classes, needs_skeleton) = target_classes(&rules);
        assert!(classes.contains("dog"));
        assert!(classes.contains("person"));
        assert!(needs_skeleton);
    }
}
