//! Edge video-analytics agent: RTSP ingest, per-agent detection workers,
//! rule-driven event chunking, and WebRTC/fragmented-MP4 fan-out.
//!
//! The binary entry point (`main.rs`) is a thin wiring layer over the
//! modules below; tests exercise those modules directly rather than
//! spawning the compiled binary.

pub mod bus;
pub mod config;
pub mod db;
pub mod detection;
pub mod error;
pub mod event_session;
pub mod frame_hub;
pub mod frame_store;
pub mod model;
pub mod orchestrator;
pub mod rules;
pub mod web;
pub mod webrtc;
pub mod ws_fmp4;
