//! Signaling envelope shape and the outbound WS connection helper. Rather
//! than accepting inbound signaling connections, a publisher here dials out
//! to an external relay and identifies itself, since the relay — not this
//! process — is what viewers connect to.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub type SignalingSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingEnvelope {
    Offer {
        from: String,
        to: Option<String>,
        sdp: RTCSessionDescription,
    },
    Answer {
        from: String,
        to: String,
        sdp: RTCSessionDescription,
    },
    Ice {
        from: String,
        to: String,
        candidate: RTCIceCandidateInit,
    },
}

/// Dials the relay and sends no identity frame of its own — the relay reads
/// `from`/`to` off each envelope instead of a separate registration step,
/// matching the relay's minimal `{type, from, to, ...}` contract.
pub async fn connect(url: &str) -> Result<SignalingSocket> {
    let (socket, _response) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("failed to connect to signaling relay at {url}"))?;
    Ok(socket)
}

pub async fn send(socket: &mut SignalingSocket, envelope: &SignalingEnvelope) -> Result<()> {
    let text = serde_json::to_string(envelope).context("failed to serialize signaling envelope")?;
    socket
        .send(Message::Text(text.into()))
        .await
        .context("failed to send signaling message")
}

pub async fn recv(socket: &mut SignalingSocket) -> Result<Option<SignalingEnvelope>> {
    loop {
        match socket.next().await {
            None => return Ok(None),
            Some(Err(err)) => return Err(err).context("signaling socket error"),
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<SignalingEnvelope>(&text) {
                    Ok(envelope) => return Ok(Some(envelope)),
                    Err(err) => {
                        tracing::warn!(error = %err, "ignoring malformed signaling envelope");
                        continue;
                    }
                }
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue, // binary/ping/pong frames carry no signaling payload here
        }
    }
}
