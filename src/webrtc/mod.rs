//! WebRTC fan-out: one signaling peer per active camera (raw frames) and per
//! active agent (annotated frames), each independently reconnecting to an
//! external signaling relay. The relay, not this process, is what viewers
//! connect to — each peer here dials out and feeds a `webrtc-rs` track from
//! FrameStore reads.

pub mod signaling;
pub mod track;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::config::WebRtcConfig;
use crate::error::PublisherError;
use crate::frame_store::FrameStore;
use signaling::SignalingEnvelope;

/// Which FrameStore key and client identity a peer publishes under: the
/// signaling relay sees `camera:{user_id}:{camera_id}` or
/// `agent:{user_id}:{camera_id}:{agent_id}`.
#[derive(Debug, Clone)]
pub enum PeerKind {
    Camera {
        camera_id: String,
        owner_user_id: String,
    },
    Agent {
        camera_id: String,
        agent_id: String,
        owner_user_id: String,
    },
}

impl PeerKind {
    fn client_identity(&self) -> String {
        match self {
            PeerKind::Camera {
                camera_id,
                owner_user_id,
            } => format!("camera:{owner_user_id}:{camera_id}"),
            PeerKind::Agent {
                camera_id,
                agent_id,
                owner_user_id,
            } => format!("agent:{owner_user_id}:{camera_id}:{agent_id}"),
        }
    }

    /// FrameStore key this peer's track reads from: the camera's raw frame
    /// for a camera peer, the agent's annotated frame for an agent peer.
    fn store_key(&self) -> String {
        match self {
            PeerKind::Camera { camera_id, .. } => camera_id.clone(),
            PeerKind::Agent {
                camera_id,
                agent_id,
                ..
            } => format!("{camera_id}:{agent_id}"),
        }
    }
}

/// Handle the Orchestrator (or a publisher registry it owns) holds for one
/// running signaling peer.
pub struct WebRtcPeerHandle {
    stop_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl WebRtcPeerHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(5), self.join)
            .await
            .is_err()
        {
            warn!("webrtc peer join timed out, abandoning");
        }
    }
}

#[derive(Default)]
struct IceTally {
    host: AtomicU64,
    srflx: AtomicU64,
    relay: AtomicU64,
}

impl IceTally {
    fn record(&self, candidate: &RTCIceCandidate) {
        use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
        match candidate.typ {
            RTCIceCandidateType::Host => self.host.fetch_add(1, Ordering::Relaxed),
            RTCIceCandidateType::Srflx => self.srflx.fetch_add(1, Ordering::Relaxed),
            RTCIceCandidateType::Relay => self.relay.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    fn summary(&self) -> (u64, u64, u64) {
        (
            self.host.load(Ordering::Relaxed),
            self.srflx.load(Ordering::Relaxed),
            self.relay.load(Ordering::Relaxed),
        )
    }
}

/// Spawns the reconnect-forever task for one camera or agent stream. Peers
/// are independent: one failing never affects another.
pub fn spawn(
    kind: PeerKind,
    signaling_url: String,
    webrtc_cfg: WebRtcConfig,
    frame_store: Arc<FrameStore>,
    fps: u32,
) -> WebRtcPeerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let join = tokio::spawn(run_peer_loop(
        kind,
        signaling_url,
        webrtc_cfg,
        frame_store,
        fps,
        stop_rx,
    ));
    WebRtcPeerHandle { stop_tx, join }
}

async fn run_peer_loop(
    kind: PeerKind,
    signaling_url: String,
    webrtc_cfg: WebRtcConfig,
    frame_store: Arc<FrameStore>,
    fps: u32,
    mut stop_rx: watch::Receiver<bool>,
) {
    let identity = kind.client_identity();
    let reconnect_delay = Duration::from_secs(webrtc_cfg.reconnect_delay_secs.max(1));

    loop {
        if *stop_rx.borrow() {
            return;
        }

        match run_one_connection(&kind, &identity, &signaling_url, &webrtc_cfg, &frame_store, fps, &mut stop_rx).await
        {
            Ok(()) => {}
            Err(err) => {
                warn!(identity = %identity, error = %err, "webrtc peer connection ended, reconnecting");
            }
        }

        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_one_connection(
    kind: &PeerKind,
    identity: &str,
    signaling_url: &str,
    webrtc_cfg: &WebRtcConfig,
    frame_store: &Arc<FrameStore>,
    fps: u32,
    stop_rx: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut socket = signaling::connect(signaling_url)
        .await
        .map_err(PublisherError::Signaling)?;

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let mut ice_servers = vec![RTCIceServer {
        urls: vec![webrtc_cfg.stun_server.clone()],
        ..Default::default()
    }];
    if let Some(turn) = &webrtc_cfg.turn_server {
        ice_servers.push(RTCIceServer {
            urls: vec![turn.clone()],
            ..Default::default()
        });
    }
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    let peer = Arc::new(api.new_peer_connection(config).await?);

    let tally = Arc::new(IceTally::default());
    let tally_for_handler = Arc::clone(&tally);
    peer.on_ice_candidate(Box::new(move |candidate| {
        let tally = Arc::clone(&tally_for_handler);
        if let Some(candidate) = &candidate {
            tally.record(candidate);
        }
        Box::pin(async {})
    }));

    let identity_for_state = identity.to_string();
    let tally_for_state = Arc::clone(&tally);
    peer.on_ice_connection_state_change(Box::new(move |state| {
        if state == RTCIceConnectionState::Completed {
            let (host, srflx, relay) = tally_for_state.summary();
            info!(
                identity = %identity_for_state,
                host, srflx, relay,
                "ice gathering complete"
            );
        }
        Box::pin(async {})
    }));

    let track = track::new_track(&kind.store_key(), identity);
    peer.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let (feeder_stop_tx, feeder_stop_rx) = watch::channel(false);
    let feeder = tokio::spawn(track::run_track_feeder(
        track,
        Arc::clone(frame_store),
        kind.store_key(),
        fps,
        feeder_stop_rx,
    ));

    let offer = peer.create_offer(None).await?;
    peer.set_local_description(offer.clone()).await?;
    signaling::send(
        &mut socket,
        &SignalingEnvelope::Offer {
            from: identity.to_string(),
            to: None,
            sdp: offer,
        },
    )
    .await?;

    let result = drive_connection(&peer, &mut socket, stop_rx).await;

    let _ = feeder_stop_tx.send(true);
    let _ = feeder.await;
    let _ = peer.close().await;
    result
}

/// Reads signaling messages and peer-connection-state changes until the
/// connection closes, fails, or stop is requested.
async fn drive_connection(
    peer: &Arc<RTCPeerConnection>,
    socket: &mut signaling::SignalingSocket,
    stop_rx: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (state_tx, mut state_rx) = tokio::sync::mpsc::unbounded_channel();
    peer.on_peer_connection_state_change(Box::new(move |state| {
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return Ok(());
                }
            }
            Some(state) = state_rx.recv() => {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                        | RTCPeerConnectionState::Disconnected
                ) {
                    anyhow::bail!("peer connection entered state {state:?}");
                }
            }
            envelope = signaling::recv(socket) => {
                match envelope? {
                    None => anyhow::bail!("signaling socket closed"),
                    Some(SignalingEnvelope::Answer { sdp, .. }) => {
                        peer.set_remote_description(sdp).await?;
                    }
                    Some(SignalingEnvelope::Ice { candidate, .. }) => {
                        apply_remote_candidate(peer, candidate).await?;
                    }
                    Some(SignalingEnvelope::Offer { .. }) => {
                        // This peer only ever originates offers; an inbound
                        // offer on the same socket would mean the relay is
                        // routing a renegotiation we don't yet support.
                        warn!("ignoring unexpected inbound offer");
                    }
                }
            }
        }
    }
}

async fn apply_remote_candidate(
    peer: &Arc<RTCPeerConnection>,
    candidate: RTCIceCandidateInit,
) -> anyhow::Result<()> {
    peer.add_ice_candidate(candidate).await?;
    Ok(())
}

// Re-exported so callers constructing offers don't need to reach into the
// `webrtc` crate directly for the description type.
pub type SessionDescription = RTCSessionDescription;
