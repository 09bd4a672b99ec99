//! Per-camera frame distribution.
//!
//! Both sinks hold exactly one frame per camera with overwrite semantics:
//! a write replaces the previous frame, nothing is queued, and consumers may
//! skip frames. Each camera's cells have a single writer (its worker) and any
//! number of readers.
//!
//! - `PullSink`: readers poll `read` at their own cadence.
//! - `PushSink`: a continuous-stream transport calls `request_next` whenever
//!   it is ready for more data.

mod cell;
mod pull;
mod push;

pub use cell::FrameCell;
pub use pull::PullSink;
pub use push::PushSink;

#[cfg(test)]
pub(crate) fn test_frame(camera_id: &str, sequence: u64) -> std::sync::Arc<crate::AnnotatedFrame> {
    std::sync::Arc::new(
        crate::AnnotatedFrame::new(
            camera_id.into(),
            sequence,
            2,
            1,
            vec![sequence as u8; 6],
            0,
            std::time::Instant::now(),
        )
        .expect("valid test frame"),
    )
}
