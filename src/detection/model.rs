//! Model invocation boundary. Model internals (weights, tensor runtime,
//! pre/post-processing) are out of scope for this crate — "run each
//! configured model" is an external capability the worker drives, not
//! something it implements.

use chrono::{DateTime, Utc};

use crate::frame_store::FrameEnvelope;
use crate::model::Detections;

pub trait ModelRunner: Send + Sync {
    fn run(&self, model: &str, frame: &FrameEnvelope) -> anyhow::Result<Detections>;
}

/// Always returns an empty detection set. Lets the rest of the pipeline
/// (annotation, rule evaluation, session bookkeeping) be exercised without a
/// real inference backend; a deployment swaps this for a runner backed by
/// whatever model server the platform already operates.
pub struct NullModelRunner;

impl ModelRunner for NullModelRunner {
    fn run(&self, _model: &str, frame: &FrameEnvelope) -> anyhow::Result<Detections> {
        Ok(Detections::empty(system_time_to_utc(frame.produced_at)))
    }
}

fn system_time_to_utc(t: std::time::SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}
