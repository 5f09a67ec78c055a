use thiserror::Error;

/// Errors raised while decoding or publishing frames for one camera ingest.
#[derive(Debug, Error)]
pub enum FrameHubError {
    #[error("failed to open RTSP source {url}: {source}")]
    Open {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("decode error on {camera_id}: {source}")]
    Decode {
        camera_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors surfaced while parsing an agent's rule configuration. A rule that
/// fails to parse is skipped and logged rather than rejecting the whole
/// agent document.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("unknown rule type: {0}")]
    UnknownType(String),
    #[error("rule {index} missing required field: {field}")]
    MissingField { index: usize, field: &'static str },
}

/// Errors from the event-session state machine and encode pipeline.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("encode queue full for session {session_id}, chunk {chunk_number} dropped")]
    QueueFull {
        session_id: String,
        chunk_number: u32,
    },
    #[error("chunk {chunk_number} for session {session_id} exceeded bus size limit ({size} bytes)")]
    ChunkTooLarge {
        session_id: String,
        chunk_number: u32,
        size: usize,
    },
    #[error("encoder subprocess failed: {0}")]
    EncoderFailed(#[source] anyhow::Error),
}

/// Errors from the WebRTC and fMP4/WS fan-out publishers.
#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("signaling connection failed: {0}")]
    Signaling(#[source] anyhow::Error),
    #[error("no annotated frame available within {0:?}")]
    NoFrameAvailable(std::time::Duration),
    #[error("encoder subprocess could not start: {0}")]
    EncoderStart(#[source] anyhow::Error),
    #[error("malformed mp4 box stream: {0}")]
    MalformedBoxStream(String),
}
